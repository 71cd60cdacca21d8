//! Per-backend default connection settings.
//!
//! The table ships built in and can be overridden by a `dbconfig.toml`. Host,
//! port and connect options may hold `$$DBHOSTNAME$$`, `$$DBPORT$$` and
//! `$$DBOPTIONS$$` placeholders which are resolved per platform when default
//! parameters are built.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::DatabaseType;
use crate::config::ConfigStore;

/// Oldest defaults file version this build understands.
pub const ENGINE_DEFAULTS_VERSION: u32 = 1;

pub const DEFAULTS_FILE_NAME: &str = "dbconfig.toml";

pub const HOST_PLACEHOLDER: &str = "$$DBHOSTNAME$$";
pub const PORT_PLACEHOLDER: &str = "$$DBPORT$$";
pub const OPTIONS_PLACEHOLDER: &str = "$$DBOPTIONS$$";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub connect_options: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDefaults {
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub database: BTreeMap<String, EngineSettings>,
}

impl EngineDefaults {
    /// Defaults compiled into the application.
    pub fn builtin() -> Self {
        let mut database = BTreeMap::new();

        database.insert(
            DatabaseType::Sqlite.as_str().to_string(),
            EngineSettings {
                port: "-1".to_string(),
                ..EngineSettings::default()
            },
        );

        database.insert(
            DatabaseType::Mysql.as_str().to_string(),
            EngineSettings {
                database_name: super::INTERNAL_DATABASE_NAME.to_string(),
                user_name: "root".to_string(),
                password: String::new(),
                host_name: HOST_PLACEHOLDER.to_string(),
                port: PORT_PLACEHOLDER.to_string(),
                connect_options: OPTIONS_PLACEHOLDER.to_string(),
            },
        );

        Self {
            version: ENGINE_DEFAULTS_VERSION,
            database,
        }
    }

    /// Load a defaults file, refusing files older than `min_version`.
    pub fn load(path: &Path, min_version: u32) -> Result<Self> {
        if !path.exists() {
            bail!(
                "Could not open the database defaults file {}. It is installed with the \
                 application and is required to run it.",
                path.display()
            );
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read database defaults file {}", path.display()))?;

        Self::parse(&content, min_version)
            .with_context(|| format!("Invalid database defaults file {}", path.display()))
    }

    /// `dbconfig.toml` in the Clepho config directory.
    pub fn default_path() -> PathBuf {
        ConfigStore::config_dir().join(DEFAULTS_FILE_NAME)
    }

    /// The table at [`EngineDefaults::default_path`], or the built-in one.
    pub fn installed() -> Self {
        Self::load_or_builtin(&Self::default_path())
    }

    /// Load `path` if it exists. A missing file silently falls back to the
    /// built-in table; an unreadable or outdated one falls back with a warning.
    pub fn load_or_builtin(path: &Path) -> Self {
        if !path.exists() {
            return Self::builtin();
        }

        match Self::load(path, ENGINE_DEFAULTS_VERSION) {
            Ok(defaults) => {
                tracing::debug!("Using database defaults from {}", path.display());
                defaults
            }
            Err(e) => {
                tracing::warn!("Ignoring database defaults file: {:#}", e);
                Self::builtin()
            }
        }
    }

    pub fn parse(content: &str, min_version: u32) -> Result<Self> {
        let defaults: EngineDefaults = toml::from_str(content)?;

        tracing::debug!(
            "Checking defaults version => expected: {} found: {}",
            min_version,
            defaults.version
        );

        if defaults.version < min_version {
            bail!(
                "An old version of the database defaults is installed (version {}, need {}). \
                 Please install the version released with this application.",
                defaults.version,
                min_version
            );
        }

        Ok(defaults)
    }

    /// Settings for `database_type`, empty if the table has no entry.
    pub fn settings(&self, database_type: DatabaseType) -> EngineSettings {
        self.database
            .get(database_type.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_has_both_backends() {
        let defaults = EngineDefaults::builtin();
        assert_eq!(defaults.settings(DatabaseType::Mysql).user_name, "root");
        assert_eq!(defaults.settings(DatabaseType::Mysql).port, PORT_PLACEHOLDER);
        assert_eq!(defaults.settings(DatabaseType::Sqlite).port, "-1");
    }

    #[test]
    fn test_parse_file_overrides() {
        let defaults = EngineDefaults::parse(
            r#"
            version = 2

            [database.mysql]
            database_name = "catalog"
            user_name = "admin"
            host_name = "$$DBHOSTNAME$$"
            port = "$$DBPORT$$"
            "#,
            ENGINE_DEFAULTS_VERSION,
        )
        .unwrap();

        let mysql = defaults.settings(DatabaseType::Mysql);
        assert_eq!(mysql.database_name, "catalog");
        assert_eq!(mysql.user_name, "admin");
        assert_eq!(mysql.connect_options, "");
        assert_eq!(defaults.settings(DatabaseType::Sqlite), EngineSettings::default());
    }

    #[test]
    fn test_old_version_rejected() {
        let result = EngineDefaults::parse("version = 0", ENGINE_DEFAULTS_VERSION);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("old version"));
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = EngineDefaults::load(&dir.path().join("dbconfig.toml"), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULTS_FILE_NAME);

        let missing = EngineDefaults::load_or_builtin(&path);
        assert_eq!(missing.settings(DatabaseType::Mysql).user_name, "root");

        std::fs::write(
            &path,
            "version = 1\n\n[database.mysql]\ndatabase_name = \"catalog\"\nuser_name = \"admin\"\n",
        )
        .unwrap();
        let loaded = EngineDefaults::load_or_builtin(&path);
        assert_eq!(loaded.settings(DatabaseType::Mysql).user_name, "admin");

        std::fs::write(&path, "version = 0\n").unwrap();
        let outdated = EngineDefaults::load_or_builtin(&path);
        assert_eq!(outdated.settings(DatabaseType::Mysql).user_name, "root");
    }
}
