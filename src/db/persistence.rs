//! Reading and writing [`ConnectionParameters`] in the config file, including
//! migration from the path entries older releases kept in `[album_settings]`.

use anyhow::Result;
use std::path::Path;

use super::crypto::{decrypt_password, encrypt_password};
use super::parameters::{
    default_admin_cmd, default_init_cmd, default_server_cmd, default_upgrade_cmd,
    server_private_path, ConnectionParameters, DatabaseType, LogicalDatabase,
};
use crate::config::{ConfigStore, ALBUM_SETTINGS_GROUP, DATABASE_GROUP};

// ============================================================================
// Config keys
// ============================================================================

const KEY_DATABASE_TYPE: &str = "database_type";
const KEY_DATABASE_NAME: &str = "database_name";
const KEY_DATABASE_NAME_THUMBNAILS: &str = "database_name_thumbnails";
const KEY_DATABASE_NAME_FACE: &str = "database_name_face";
const KEY_DATABASE_NAME_SIMILARITY: &str = "database_name_similarity";
const KEY_HOSTNAME: &str = "hostname";
const KEY_PORT: &str = "port";
const KEY_USERNAME: &str = "username";
const KEY_PASSWORD: &str = "password";
const KEY_ENCRYPTED_PASSWORD: &str = "encrypted_password";
const KEY_CONNECT_OPTIONS: &str = "connect_options";
const KEY_WAL_MODE: &str = "wal_mode";
const KEY_INTERNAL_SERVER: &str = "internal_server";
const KEY_INTERNAL_SERVER_PATH: &str = "internal_server_path";
const KEY_INIT_COMMAND: &str = "internal_server_init_command";
const KEY_ADMIN_COMMAND: &str = "internal_server_admin_command";
const KEY_SERVER_COMMAND: &str = "internal_server_server_command";
const KEY_UPGRADE_COMMAND: &str = "internal_server_upgrade_command";
const KEY_USE_MARIADB: &str = "internal_server_use_mariadb";

const LEGACY_DATABASE_FILE_PATH: &str = "database_file_path";
const LEGACY_ALBUM_PATH: &str = "album_path";

// ============================================================================
// Legacy migration
// ============================================================================

/// Legacy path entries gathered before migration. `None` means the key is
/// absent, which is different from present but empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacySnapshot {
    pub database_file_path: Option<String>,
    pub album_path: Option<String>,
    pub suggested_path: Option<String>,
}

impl LegacySnapshot {
    pub fn from_store(store: &ConfigStore, suggested_path: Option<&str>) -> Self {
        let section = store.section(ALBUM_SETTINGS_GROUP);
        Self {
            database_file_path: section.read_string(LEGACY_DATABASE_FILE_PATH),
            album_path: section.read_string(LEGACY_ALBUM_PATH),
            suggested_path: suggested_path.map(str::to_string),
        }
    }
}

/// One source of a legacy database location.
#[derive(Debug, Clone, Copy)]
pub struct MigrationRule {
    pub name: &'static str,
    pub source: fn(&LegacySnapshot) -> Option<&str>,
}

fn database_file_path(snapshot: &LegacySnapshot) -> Option<&str> {
    snapshot.database_file_path.as_deref()
}

fn album_path(snapshot: &LegacySnapshot) -> Option<&str> {
    snapshot.album_path.as_deref()
}

fn suggested_path(snapshot: &LegacySnapshot) -> Option<&str> {
    snapshot.suggested_path.as_deref()
}

/// Checked in order; the first rule whose source is present decides.
pub const MIGRATION_RULES: &[MigrationRule] = &[
    MigrationRule {
        name: "database_file_path",
        source: database_file_path,
    },
    MigrationRule {
        name: "album_path",
        source: album_path,
    },
    MigrationRule {
        name: "suggested_path",
        source: suggested_path,
    },
];

/// SQLite parameters for the first legacy location found, if any.
pub fn migrate_legacy(snapshot: &LegacySnapshot) -> Option<ConnectionParameters> {
    let (rule, path) = MIGRATION_RULES
        .iter()
        .find_map(|rule| (rule.source)(snapshot).map(|path| (rule, path)))?;

    if path.is_empty() {
        tracing::debug!("Legacy entry {} is empty, nothing to migrate", rule.name);
        return None;
    }

    tracing::info!("Migrating database location from legacy {}: {}", rule.name, path);

    let file = LogicalDatabase::Core.sqlite_file(path);
    Some(ConnectionParameters::for_sqlite(&file))
}

// ============================================================================
// Load / save
// ============================================================================

impl ConnectionParameters {
    /// Parameters from the `[database]` section.
    pub fn load_from_config(store: &ConfigStore) -> Self {
        Self::load_from_group(store, DATABASE_GROUP)
    }

    pub fn load_from_group(store: &ConfigStore, group: &str) -> Self {
        let section = store.section(group);
        let mut params = ConnectionParameters {
            database_type: section
                .read_string(KEY_DATABASE_TYPE)
                .and_then(|s| DatabaseType::from_str(&s)),
            ..ConnectionParameters::default()
        };

        params.database_name_core = section.read_string_or(KEY_DATABASE_NAME, "");
        params.database_name_thumbnails = section.read_string_or(KEY_DATABASE_NAME_THUMBNAILS, "");
        params.database_name_face = section.read_string_or(KEY_DATABASE_NAME_FACE, "");
        params.database_name_similarity = section.read_string_or(KEY_DATABASE_NAME_SIMILARITY, "");

        if params.is_sqlite() {
            params.wal_mode = section.read_bool(KEY_WAL_MODE, false);
        }

        params.host_name = section.read_string_or(KEY_HOSTNAME, "");
        params.port = section
            .read_i64(KEY_PORT)
            .and_then(|p| u16::try_from(p).ok());
        params.user_name = section.read_string_or(KEY_USERNAME, "");

        params.password = match section.read_string(KEY_ENCRYPTED_PASSWORD) {
            Some(encrypted) if !encrypted.is_empty() => match decrypt_password(&encrypted) {
                Ok(password) => password,
                Err(e) => {
                    tracing::warn!("Could not decrypt the stored database password: {}", e);
                    String::new()
                }
            },
            _ => section.read_string_or(KEY_PASSWORD, ""),
        };

        params.connect_options = section.read_string_or(KEY_CONNECT_OPTIONS, "");
        params.internal_server = section.read_bool(KEY_INTERNAL_SERVER, false);

        if params.is_mysql() {
            let use_mariadb = section.read_bool(KEY_USE_MARIADB, false);
            let private_path = server_private_path().to_string_lossy().to_string();

            params.internal_server_path = section.read_string_or(KEY_INTERNAL_SERVER_PATH, &private_path);
            params.internal_server_init_cmd =
                section.read_string_or(KEY_INIT_COMMAND, default_init_cmd(use_mariadb));
            params.internal_server_admin_cmd =
                section.read_string_or(KEY_ADMIN_COMMAND, default_admin_cmd(use_mariadb));
            params.internal_server_server_cmd =
                section.read_string_or(KEY_SERVER_COMMAND, default_server_cmd(use_mariadb));
            params.internal_server_upgrade_cmd =
                section.read_string_or(KEY_UPGRADE_COMMAND, default_upgrade_cmd(use_mariadb));
        } else {
            params.internal_server_path = section.read_string_or(KEY_INTERNAL_SERVER_PATH, "");
            params.internal_server_init_cmd = section.read_string_or(KEY_INIT_COMMAND, "");
            params.internal_server_admin_cmd = section.read_string_or(KEY_ADMIN_COMMAND, "");
            params.internal_server_server_cmd = section.read_string_or(KEY_SERVER_COMMAND, "");
            params.internal_server_upgrade_cmd = section.read_string_or(KEY_UPGRADE_COMMAND, "");
        }

        if params.is_sqlite() && !params.database_name_core.is_empty() {
            let core = params.database_name_core.clone();
            params.set_database_path(LogicalDatabase::Core, &core);

            // Older files only stored the core location
            let core_dir = Path::new(&params.database_name_core)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            for db in [
                LogicalDatabase::Thumbnails,
                LogicalDatabase::Faces,
                LogicalDatabase::Similarity,
            ] {
                let stored = params.database_name(db).to_string();
                let location = if stored.is_empty() {
                    core_dir.join(db.sqlite_file_name()).to_string_lossy().to_string()
                } else {
                    stored
                };
                params.set_database_path(db, &location);
            }
        }

        if params.database_type.is_none() {
            if let Some(migrated) = migrate_legacy(&LegacySnapshot::from_store(store, None)) {
                return migrated;
            }
        }

        params
    }

    /// Write to the `[database]` section.
    pub fn save_to_config(&self, store: &mut ConfigStore) -> Result<()> {
        self.save_to_group(store, DATABASE_GROUP)
    }

    /// Write every field to `group`. The password is stored encrypted and any
    /// plaintext entry left by older releases is removed.
    pub fn save_to_group(&self, store: &mut ConfigStore, group: &str) -> Result<()> {
        let encrypted = encrypt_password(&self.password)?;
        let mut section = store.section_mut(group);

        section.write_string(
            KEY_DATABASE_TYPE,
            self.database_type.map(|t| t.as_str()).unwrap_or(""),
        );
        section.write_string(KEY_DATABASE_NAME, self.database_name_or_dir(LogicalDatabase::Core));
        section.write_string(
            KEY_DATABASE_NAME_THUMBNAILS,
            self.database_name_or_dir(LogicalDatabase::Thumbnails),
        );
        section.write_string(
            KEY_DATABASE_NAME_FACE,
            self.database_name_or_dir(LogicalDatabase::Faces),
        );
        section.write_string(
            KEY_DATABASE_NAME_SIMILARITY,
            self.database_name_or_dir(LogicalDatabase::Similarity),
        );
        section.write_string(KEY_HOSTNAME, self.host_name.as_str());

        match self.port {
            Some(port) => section.write_i64(KEY_PORT, i64::from(port)),
            None => {
                section.delete(KEY_PORT);
            }
        }

        section.write_string(KEY_USERNAME, self.user_name.as_str());
        section.write_string(KEY_ENCRYPTED_PASSWORD, encrypted);
        section.delete(KEY_PASSWORD);
        section.write_string(KEY_CONNECT_OPTIONS, self.connect_options.as_str());
        section.write_bool(KEY_WAL_MODE, self.wal_mode);
        section.write_bool(KEY_INTERNAL_SERVER, self.internal_server);
        section.write_string(KEY_INTERNAL_SERVER_PATH, self.internal_server_path.as_str());
        section.write_string(KEY_INIT_COMMAND, self.internal_server_init_cmd.as_str());
        section.write_string(KEY_ADMIN_COMMAND, self.internal_server_admin_cmd.as_str());
        section.write_string(KEY_SERVER_COMMAND, self.internal_server_server_cmd.as_str());
        section.write_string(KEY_UPGRADE_COMMAND, self.internal_server_upgrade_cmd.as_str());

        Ok(())
    }

    /// Fix up parameters after loading.
    ///
    /// An internal MySQL server always uses fixed connection settings. When no
    /// type is configured at all, the legacy path entries (or
    /// `suggested_path`) are migrated to an SQLite setup.
    pub fn legacy_and_default_checks(&mut self, store: &ConfigStore, suggested_path: Option<&str>) {
        if self.is_mysql() && self.internal_server {
            self.apply_internal_server_defaults(cfg!(unix), &server_private_path());
        }

        if self.database_type.is_none() {
            if let Some(migrated) = migrate_legacy(&LegacySnapshot::from_store(store, suggested_path)) {
                *self = migrated;
            }
        }
    }

    /// Delete the legacy path entries. Returns whether anything was removed.
    pub fn remove_legacy_config(store: &mut ConfigStore) -> bool {
        let mut section = store.section_mut(ALBUM_SETTINGS_GROUP);
        let removed_file = section.delete(LEGACY_DATABASE_FILE_PATH);
        let removed_album = section.delete(LEGACY_ALBUM_PATH);
        removed_file || removed_album
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = format!("{}/", dir.path().display());

        let mut params = ConnectionParameters::for_sqlite_default_file(&db_dir);
        params.wal_mode = true;

        let mut store = ConfigStore::in_memory();
        params.save_to_config(&mut store).unwrap();

        let section = store.section(DATABASE_GROUP);
        assert!(!section.has_key(KEY_PASSWORD));
        assert!(!section.has_key(KEY_PORT));
        assert_eq!(section.read_string(KEY_DATABASE_NAME).unwrap(), db_dir);

        let loaded = ConnectionParameters::load_from_config(&store);
        assert_eq!(loaded.database_type, Some(DatabaseType::Sqlite));
        assert_eq!(loaded.database_name_core, params.database_name_core);
        assert_eq!(loaded.database_name_thumbnails, params.database_name_thumbnails);
        assert_eq!(loaded.database_name_face, params.database_name_face);
        assert_eq!(loaded.database_name_similarity, params.database_name_similarity);
        assert!(loaded.wal_mode);
    }

    #[test]
    fn test_sqlite_save_load_custom_file_name() {
        let params = ConnectionParameters::for_sqlite("/photos/db/myclepho.db");
        assert_eq!(params.database_name_thumbnails, "/photos/db/thumbnails-clepho.db");

        let mut store = ConfigStore::in_memory();
        params.save_to_config(&mut store).unwrap();
        assert_eq!(
            store.section(DATABASE_GROUP).read_string(KEY_DATABASE_NAME).unwrap(),
            "/photos/db/myclepho.db"
        );
        assert_eq!(
            store
                .section(DATABASE_GROUP)
                .read_string(KEY_DATABASE_NAME_THUMBNAILS)
                .unwrap(),
            "/photos/db/"
        );

        let loaded = ConnectionParameters::load_from_config(&store);
        assert_eq!(loaded.database_name_core, "/photos/db/myclepho.db");
        assert_eq!(loaded.database_name_thumbnails, params.database_name_thumbnails);
        assert_eq!(loaded.database_name_face, params.database_name_face);
        assert_eq!(loaded.database_name_similarity, params.database_name_similarity);
    }

    #[test]
    fn test_password_stored_encrypted() {
        let mut params = ConnectionParameters::new(DatabaseType::Mysql);
        params.database_name_core = "catalog".to_string();
        params.host_name = "db.example.org".to_string();
        params.port = Some(3306);
        params.user_name = "clepho".to_string();
        params.password = "s3cr3t".to_string();

        let mut store = ConfigStore::in_memory();
        store.section_mut(DATABASE_GROUP).write_string(KEY_PASSWORD, "old");
        params.save_to_config(&mut store).unwrap();

        let text = store.to_toml_string().unwrap();
        assert!(!text.contains("s3cr3t"));
        assert!(!store.section(DATABASE_GROUP).has_key(KEY_PASSWORD));

        let loaded = ConnectionParameters::load_from_config(&store);
        assert_eq!(loaded.password, "s3cr3t");
        assert_eq!(loaded.port, Some(3306));
        assert_eq!(loaded.host_name, "db.example.org");
    }

    #[test]
    fn test_legacy_plaintext_password() {
        let store = ConfigStore::parse(
            r#"
            [database]
            database_type = "mysql"
            database_name = "catalog"
            password = "plain"
            "#,
        )
        .unwrap();

        let loaded = ConnectionParameters::load_from_config(&store);
        assert_eq!(loaded.password, "plain");
    }

    #[test]
    fn test_mysql_missing_commands_default() {
        let store = ConfigStore::parse(
            r#"
            [database]
            database_type = "mysql"
            internal_server = true
            internal_server_use_mariadb = true
            internal_server_server_command = "/opt/bin/mariadbd"
            "#,
        )
        .unwrap();

        let loaded = ConnectionParameters::load_from_config(&store);
        assert!(loaded.internal_server);
        assert_eq!(loaded.internal_server_server_cmd, "/opt/bin/mariadbd");
        assert_eq!(loaded.internal_server_init_cmd, "mariadb-install-db");
        assert_eq!(loaded.internal_server_admin_cmd, "mariadb-admin");
        assert!(!loaded.internal_server_path.is_empty());
    }

    #[test]
    fn test_migration_rule_order() {
        let snapshot = LegacySnapshot {
            database_file_path: Some("/new/place/".to_string()),
            album_path: Some("/old/place/".to_string()),
            suggested_path: Some("/suggested/".to_string()),
        };
        let params = migrate_legacy(&snapshot).unwrap();
        assert_eq!(params.database_name_core, "/new/place/clepho.db");

        let snapshot = LegacySnapshot {
            album_path: Some("/old/place/".to_string()),
            suggested_path: Some("/suggested/".to_string()),
            ..LegacySnapshot::default()
        };
        assert_eq!(
            migrate_legacy(&snapshot).unwrap().database_name_core,
            "/old/place/clepho.db"
        );

        let snapshot = LegacySnapshot {
            suggested_path: Some("/suggested/".to_string()),
            ..LegacySnapshot::default()
        };
        assert_eq!(
            migrate_legacy(&snapshot).unwrap().database_name_similarity,
            "/suggested/similarity.db"
        );

        assert!(migrate_legacy(&LegacySnapshot::default()).is_none());
    }

    #[test]
    fn test_empty_legacy_entry_stops_migration() {
        let snapshot = LegacySnapshot {
            database_file_path: Some(String::new()),
            album_path: Some("/old/place/".to_string()),
            suggested_path: None,
        };
        assert!(migrate_legacy(&snapshot).is_none());
    }

    #[test]
    fn test_load_without_type_migrates() {
        let store = ConfigStore::parse(
            r#"
            [album_settings]
            album_path = "/photos/"
            "#,
        )
        .unwrap();

        let loaded = ConnectionParameters::load_from_config(&store);
        assert_eq!(loaded.database_type, Some(DatabaseType::Sqlite));
        assert_eq!(loaded.database_name_core, "/photos/clepho.db");
    }

    #[test]
    fn test_legacy_and_default_checks_resets_internal_server() {
        let mut params = ConnectionParameters::new(DatabaseType::Mysql);
        params.internal_server = true;
        params.database_name_core = "custom".to_string();
        params.user_name = "someone".to_string();
        params.password = "pw".to_string();

        params.legacy_and_default_checks(&ConfigStore::in_memory(), None);
        assert_eq!(params.database_name_core, "clepho");
        assert_eq!(params.database_name_face, "clepho");
        assert_eq!(params.user_name, "root");
        assert!(params.password.is_empty());
    }

    #[test]
    fn test_legacy_and_default_checks_suggested_path() {
        let mut params = ConnectionParameters::default();
        params.legacy_and_default_checks(&ConfigStore::in_memory(), Some("/suggested/"));
        assert!(params.is_sqlite());
        assert_eq!(params.database_name_core, "/suggested/clepho.db");
    }

    #[test]
    fn test_remove_legacy_config() {
        let mut store = ConfigStore::parse(
            r#"
            [album_settings]
            database_file_path = "/a/"
            album_path = "/b/"
            other = "kept"
            "#,
        )
        .unwrap();

        assert!(ConnectionParameters::remove_legacy_config(&mut store));
        let section = store.section(ALBUM_SETTINGS_GROUP);
        assert!(!section.has_key(LEGACY_DATABASE_FILE_PATH));
        assert!(!section.has_key(LEGACY_ALBUM_PATH));
        assert!(section.has_key("other"));
        assert!(!ConnectionParameters::remove_legacy_config(&mut store));
    }
}
