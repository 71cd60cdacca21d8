//! Persistent configuration file.
//!
//! The file is TOML made of named sections (`[database]`, `[album_settings]`).
//! A [`ConfigStore`] is loaded once and handed to whatever needs to read or
//! write settings; nothing reaches for a global instance.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

/// Section holding the database connection parameters.
pub const DATABASE_GROUP: &str = "database";

/// Section holding path entries written by older releases.
pub const ALBUM_SETTINGS_GROUP: &str = "album_settings";

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    sections: BTreeMap<String, Table>,
}

impl ConfigStore {
    /// A store with no backing file. `save` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load the store from `path`. A missing file yields an empty store that
    /// will be created on the first `save`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut store = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let sections: BTreeMap<String, Table> = toml::from_str(content)?;
        Ok(Self { path: None, sections })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(&self.sections)?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn section(&self, name: &str) -> ConfigSection<'_> {
        ConfigSection {
            table: self.sections.get(name),
        }
    }

    pub fn section_mut(&mut self, name: &str) -> ConfigSectionMut<'_> {
        ConfigSectionMut {
            table: self.sections.entry(name.to_string()).or_default(),
        }
    }

    /// Default config file location, honouring `CLEPHO_CONFIG`.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CLEPHO_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clepho")
    }
}

/// Read-only view of one section. A missing section reads as empty.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSection<'a> {
    table: Option<&'a Table>,
}

impl ConfigSection<'_> {
    pub fn has_key(&self, key: &str) -> bool {
        self.table.is_some_and(|t| t.contains_key(key))
    }

    pub fn read_string(&self, key: &str) -> Option<String> {
        match self.table?.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn read_string_or(&self, key: &str, default: &str) -> String {
        self.read_string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn read_bool(&self, key: &str, default: bool) -> bool {
        match self.table.and_then(|t| t.get(key)) {
            Some(Value::Boolean(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => default,
        }
    }

    pub fn read_i64(&self, key: &str) -> Option<i64> {
        match self.table?.get(key)? {
            Value::Integer(i) => Some(*i),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Mutable view of one section, created on demand.
#[derive(Debug)]
pub struct ConfigSectionMut<'a> {
    table: &'a mut Table,
}

impl ConfigSectionMut<'_> {
    pub fn write_string(&mut self, key: &str, value: impl Into<String>) {
        self.table.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn write_bool(&mut self, key: &str, value: bool) {
        self.table.insert(key.to_string(), Value::Boolean(value));
    }

    pub fn write_i64(&mut self, key: &str, value: i64) {
        self.table.insert(key.to_string(), Value::Integer(value));
    }

    /// Remove `key`, returning whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.table.remove(key).is_some()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_section_reads_empty() {
        let store = ConfigStore::in_memory();
        let section = store.section(DATABASE_GROUP);
        assert!(!section.has_key("database_type"));
        assert_eq!(section.read_string("database_type"), None);
        assert!(section.read_bool("wal_mode", true));
    }

    #[test]
    fn test_write_then_read() {
        let mut store = ConfigStore::in_memory();
        {
            let mut section = store.section_mut(DATABASE_GROUP);
            section.write_string("database_type", "mysql");
            section.write_i64("port", 3307);
            section.write_bool("internal_server", true);
        }

        let section = store.section(DATABASE_GROUP);
        assert_eq!(section.read_string("database_type").as_deref(), Some("mysql"));
        assert_eq!(section.read_i64("port"), Some(3307));
        assert!(section.read_bool("internal_server", false));
    }

    #[test]
    fn test_delete_entry() {
        let mut store = ConfigStore::in_memory();
        store.section_mut(DATABASE_GROUP).write_string("password", "secret");
        assert!(store.section_mut(DATABASE_GROUP).delete("password"));
        assert!(!store.section_mut(DATABASE_GROUP).delete("password"));
        assert!(!store.section(DATABASE_GROUP).has_key("password"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut store = ConfigStore::load_from(&path).unwrap();
        store
            .section_mut(ALBUM_SETTINGS_GROUP)
            .write_string("album_path", "/photos");
        store.save().unwrap();

        let reloaded = ConfigStore::load_from(&path).unwrap();
        assert_eq!(
            reloaded
                .section(ALBUM_SETTINGS_GROUP)
                .read_string("album_path")
                .as_deref(),
            Some("/photos")
        );
    }

    #[test]
    fn test_parse_lenient_values() {
        let store = ConfigStore::parse(
            r#"
            [database]
            port = "3307"
            wal_mode = "true"
            "#,
        )
        .unwrap();

        let section = store.section(DATABASE_GROUP);
        assert_eq!(section.read_i64("port"), Some(3307));
        assert!(section.read_bool("wal_mode", false));
    }
}
