use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use super::engine::{EngineDefaults, HOST_PLACEHOLDER, OPTIONS_PLACEHOLDER, PORT_PLACEHOLDER};

/// Schema name used for every logical database on the internal server.
pub const INTERNAL_DATABASE_NAME: &str = "clepho";

/// Preferred TCP port of the internal server where UNIX sockets are unavailable.
pub const INTERNAL_SERVER_PORT: u16 = 3307;

pub const SOCKET_FILE_NAME: &str = "mysql.socket";

/// Database backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// One local file per logical database.
    Sqlite,
    /// Schemas on a MySQL/MariaDB server.
    Mysql,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Mysql => "mysql",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(DatabaseType::Sqlite),
            "mysql" => Some(DatabaseType::Mysql),
            _ => None,
        }
    }

    pub fn is_client_server(&self) -> bool {
        matches!(self, DatabaseType::Mysql)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four catalogs sharing one physical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalDatabase {
    Core,
    Thumbnails,
    Faces,
    Similarity,
}

impl LogicalDatabase {
    pub const ALL: [LogicalDatabase; 4] = [
        LogicalDatabase::Core,
        LogicalDatabase::Thumbnails,
        LogicalDatabase::Faces,
        LogicalDatabase::Similarity,
    ];

    /// File name of this database inside an SQLite database directory.
    pub fn sqlite_file_name(&self) -> &'static str {
        match self {
            LogicalDatabase::Core => "clepho.db",
            LogicalDatabase::Thumbnails => "thumbnails-clepho.db",
            LogicalDatabase::Faces => "recognition.db",
            LogicalDatabase::Similarity => "similarity.db",
        }
    }

    /// Resolve a folder or file to the database file. Folders get the
    /// default file name appended.
    pub fn sqlite_file(&self, folder_or_file: &str) -> String {
        let looks_like_dir = folder_or_file.ends_with('/')
            || folder_or_file.ends_with(MAIN_SEPARATOR)
            || Path::new(folder_or_file).is_dir();

        if looks_like_dir {
            clean_path(&Path::new(folder_or_file).join(self.sqlite_file_name()).to_string_lossy())
        } else {
            clean_path(folder_or_file)
        }
    }

    /// Strip the default file name, keeping the trailing separator, so the
    /// config stores the containing directory.
    pub fn sqlite_directory(&self, path: &str) -> String {
        let name = self.sqlite_file_name();
        if Path::new(path).file_name() != Some(OsStr::new(name)) {
            return path.to_string();
        }

        match path.strip_suffix(name) {
            Some(dir) => dir.to_string(),
            None => path.to_string(),
        }
    }
}

/// Base directory for everything the internal server owns.
pub fn server_private_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("clepho")
}

fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let cleaned: PathBuf = Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    if cleaned.as_os_str().is_empty() {
        ".".to_string()
    } else {
        cleaned.to_string_lossy().to_string()
    }
}

/// How to reach one physical database store.
///
/// For SQLite the four database names are file paths; host, port and
/// credentials are ignored. For MySQL they are schema names.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionParameters {
    pub database_type: Option<DatabaseType>,
    pub database_name_core: String,
    pub database_name_thumbnails: String,
    pub database_name_face: String,
    pub database_name_similarity: String,
    pub connect_options: String,
    pub host_name: String,
    pub port: Option<u16>,
    pub wal_mode: bool,
    pub internal_server: bool,
    pub user_name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub internal_server_path: String,
    pub internal_server_init_cmd: String,
    pub internal_server_admin_cmd: String,
    pub internal_server_server_cmd: String,
    pub internal_server_upgrade_cmd: String,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            database_type: None,
            database_name_core: String::new(),
            database_name_thumbnails: String::new(),
            database_name_face: String::new(),
            database_name_similarity: String::new(),
            connect_options: String::new(),
            host_name: String::new(),
            port: None,
            wal_mode: false,
            internal_server: false,
            user_name: String::new(),
            password: String::new(),
            internal_server_path: String::new(),
            internal_server_init_cmd: String::new(),
            internal_server_admin_cmd: String::new(),
            internal_server_server_cmd: String::new(),
            internal_server_upgrade_cmd: String::new(),
        }
    }
}

impl ConnectionParameters {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type: Some(database_type),
            ..Self::default()
        }
    }

    /// Default parameters for `database_type` on this platform, from the
    /// installed defaults table.
    pub fn defaults_for(database_type: DatabaseType) -> Self {
        Self::defaults_with(
            database_type,
            &EngineDefaults::installed(),
            cfg!(unix),
            false,
            &server_private_path(),
        )
    }

    /// Default parameters built from an explicit defaults table.
    ///
    /// `unix_sockets` selects the transport placeholders: a socket under the
    /// private `db_misc` directory, or `localhost` on the fixed TCP port.
    pub fn defaults_with(
        database_type: DatabaseType,
        engine: &EngineDefaults,
        unix_sockets: bool,
        use_mariadb: bool,
        private_path: &Path,
    ) -> Self {
        let settings = engine.settings(database_type);
        let is_mysql = database_type == DatabaseType::Mysql;

        let mut params = Self::new(database_type);
        params.database_name_core = settings.database_name.clone();
        params.database_name_thumbnails = settings.database_name.clone();
        params.database_name_face = settings.database_name.clone();
        params.database_name_similarity = settings.database_name;
        params.user_name = settings.user_name;
        params.password = settings.password;
        params.wal_mode = false;
        params.internal_server = is_mysql;

        if is_mysql {
            params.internal_server_path = private_path.to_string_lossy().to_string();
            params.set_default_helper_commands(use_mariadb);
        }

        let (host, port, options) = if unix_sockets {
            let socket = private_path.join("db_misc").join(SOCKET_FILE_NAME);
            (
                String::new(),
                "-1".to_string(),
                if is_mysql {
                    format!("UNIX_SOCKET={}", socket.display())
                } else {
                    String::new()
                },
            )
        } else if is_mysql {
            ("localhost".to_string(), INTERNAL_SERVER_PORT.to_string(), String::new())
        } else {
            (String::new(), "-1".to_string(), String::new())
        };

        params.host_name = settings.host_name.replace(HOST_PLACEHOLDER, &host);
        params.port = settings
            .port
            .replace(PORT_PLACEHOLDER, &port)
            .trim()
            .parse::<u16>()
            .ok();
        params.connect_options = settings.connect_options.replace(OPTIONS_PLACEHOLDER, &options);

        tracing::debug!("Connect options: {}", params.connect_options);

        params
    }

    /// SQLite parameters with all four databases next to `database_file`.
    pub fn for_sqlite(database_file: &str) -> Self {
        let mut params = Self::new(DatabaseType::Sqlite);
        params.set_database_path(LogicalDatabase::Core, database_file);

        let dir = Path::new(&params.database_name_core)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        for db in [
            LogicalDatabase::Thumbnails,
            LogicalDatabase::Faces,
            LogicalDatabase::Similarity,
        ] {
            let file = dir.join(db.sqlite_file_name());
            params.set_database_path(db, &file.to_string_lossy());
        }

        params
    }

    /// SQLite parameters using the default file names inside `directory`.
    pub fn for_sqlite_default_file(directory: &str) -> Self {
        let file = Path::new(directory).join(LogicalDatabase::Core.sqlite_file_name());
        Self::for_sqlite(&clean_path(&file.to_string_lossy()))
    }

    pub fn is_sqlite(&self) -> bool {
        self.database_type == Some(DatabaseType::Sqlite)
    }

    pub fn is_mysql(&self) -> bool {
        self.database_type == Some(DatabaseType::Mysql)
    }

    pub fn is_valid(&self) -> bool {
        self.database_type.is_some() && !self.database_name_core.is_empty()
    }

    /// Core database file, empty unless this is SQLite.
    pub fn sqlite_database_file(&self) -> &str {
        if self.is_sqlite() {
            &self.database_name_core
        } else {
            ""
        }
    }

    pub fn database_name(&self, db: LogicalDatabase) -> &str {
        match db {
            LogicalDatabase::Core => &self.database_name_core,
            LogicalDatabase::Thumbnails => &self.database_name_thumbnails,
            LogicalDatabase::Faces => &self.database_name_face,
            LogicalDatabase::Similarity => &self.database_name_similarity,
        }
    }

    fn database_name_mut(&mut self, db: LogicalDatabase) -> &mut String {
        match db {
            LogicalDatabase::Core => &mut self.database_name_core,
            LogicalDatabase::Thumbnails => &mut self.database_name_thumbnails,
            LogicalDatabase::Faces => &mut self.database_name_face,
            LogicalDatabase::Similarity => &mut self.database_name_similarity,
        }
    }

    /// Set a database identifier. For SQLite a folder resolves to the default
    /// file inside it; otherwise the value is a schema name.
    pub fn set_database_path(&mut self, db: LogicalDatabase, folder_or_file_or_name: &str) {
        let value = if self.is_sqlite() {
            db.sqlite_file(folder_or_file_or_name)
        } else {
            folder_or_file_or_name.to_string()
        };

        *self.database_name_mut(db) = value;
    }

    /// Identifier as written to the config file: the containing directory for
    /// SQLite files with the default name, the name itself otherwise.
    pub fn database_name_or_dir(&self, db: LogicalDatabase) -> String {
        if self.is_sqlite() {
            db.sqlite_directory(self.database_name(db))
        } else {
            self.database_name(db).to_string()
        }
    }

    /// Parameters addressing `db` as the core database. Everything else is shared.
    pub fn derive(&self, db: LogicalDatabase) -> Self {
        let mut params = self.clone();
        params.database_name_core = self.database_name(db).to_string();
        params
    }

    pub fn thumbnail_parameters(&self) -> Self {
        self.derive(LogicalDatabase::Thumbnails)
    }

    pub fn face_parameters(&self) -> Self {
        self.derive(LogicalDatabase::Faces)
    }

    pub fn similarity_parameters(&self) -> Self {
        self.derive(LogicalDatabase::Similarity)
    }

    /// Cleaned internal server data path.
    pub fn internal_server_data_path(&self) -> PathBuf {
        PathBuf::from(clean_path(&self.internal_server_path))
    }

    pub fn set_default_helper_commands(&mut self, use_mariadb: bool) {
        self.internal_server_init_cmd = default_init_cmd(use_mariadb).to_string();
        self.internal_server_admin_cmd = default_admin_cmd(use_mariadb).to_string();
        self.internal_server_server_cmd = default_server_cmd(use_mariadb).to_string();
        self.internal_server_upgrade_cmd = default_upgrade_cmd(use_mariadb).to_string();
    }

    /// Reset connection settings to what the internal server expects.
    pub fn apply_internal_server_defaults(&mut self, unix_sockets: bool, private_path: &Path) {
        self.database_name_core = INTERNAL_DATABASE_NAME.to_string();
        self.database_name_thumbnails = INTERNAL_DATABASE_NAME.to_string();
        self.database_name_face = INTERNAL_DATABASE_NAME.to_string();
        self.database_name_similarity = INTERNAL_DATABASE_NAME.to_string();
        self.internal_server = true;
        self.user_name = "root".to_string();
        self.password.clear();

        if unix_sockets {
            let socket = private_path.join("db_misc").join(SOCKET_FILE_NAME);
            self.host_name.clear();
            self.port = None;
            self.connect_options = format!("UNIX_SOCKET={}", socket.display());
        } else {
            self.host_name = "localhost".to_string();
            self.port = Some(INTERNAL_SERVER_PORT);
            self.connect_options.clear();
        }
    }

    /// Stable hash of everything that identifies the physical store.
    ///
    /// Two parameter sets with the same fingerprint talk to the same store.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Md5::new();

        hasher.update(self.database_type.map(|t| t.as_str()).unwrap_or("").as_bytes());
        hasher.update(self.database_name_core.as_bytes());
        hasher.update(self.database_name_thumbnails.as_bytes());
        hasher.update(self.database_name_face.as_bytes());
        hasher.update(self.database_name_similarity.as_bytes());
        hasher.update(self.connect_options.as_bytes());
        hasher.update(self.host_name.as_bytes());
        hasher.update(self.port.map(i32::from).unwrap_or(-1).to_le_bytes());
        hasher.update(self.user_name.as_bytes());
        hasher.update(self.password.as_bytes());
        hasher.update([u8::from(self.internal_server)]);
        hasher.update(self.internal_server_path.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

pub(crate) fn default_init_cmd(use_mariadb: bool) -> &'static str {
    if use_mariadb {
        "mariadb-install-db"
    } else {
        "mysql_install_db"
    }
}

pub(crate) fn default_admin_cmd(use_mariadb: bool) -> &'static str {
    if use_mariadb {
        "mariadb-admin"
    } else {
        "mysqladmin"
    }
}

pub(crate) fn default_server_cmd(use_mariadb: bool) -> &'static str {
    if use_mariadb {
        "mariadbd"
    } else {
        "mysqld"
    }
}

pub(crate) fn default_upgrade_cmd(use_mariadb: bool) -> &'static str {
    if use_mariadb {
        "mariadb-upgrade"
    } else {
        "mysql_upgrade"
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("database_type", &self.database_type)
            .field("database_name_core", &self.database_name_core)
            .field("database_name_thumbnails", &self.database_name_thumbnails)
            .field("database_name_face", &self.database_name_face)
            .field("database_name_similarity", &self.database_name_similarity)
            .field("connect_options", &self.connect_options)
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("wal_mode", &self.wal_mode)
            .field("internal_server", &self.internal_server)
            .field("internal_server_path", &self.internal_server_path)
            .field("internal_server_init_cmd", &self.internal_server_init_cmd)
            .field("internal_server_admin_cmd", &self.internal_server_admin_cmd)
            .field("internal_server_server_cmd", &self.internal_server_server_cmd)
            .field("internal_server_upgrade_cmd", &self.internal_server_upgrade_cmd)
            .field("user_name", &self.user_name)
            .field("password", &"X".repeat(self.password.chars().count()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mysql_params() -> ConnectionParameters {
        ConnectionParameters::defaults_with(
            DatabaseType::Mysql,
            &EngineDefaults::builtin(),
            true,
            false,
            Path::new("/home/user/.local/share/clepho"),
        )
    }

    #[test]
    fn test_mysql_defaults_unix_socket() {
        let params = mysql_params();
        assert!(params.internal_server);
        assert_eq!(params.database_name_core, INTERNAL_DATABASE_NAME);
        assert_eq!(params.database_name_similarity, INTERNAL_DATABASE_NAME);
        assert_eq!(params.host_name, "");
        assert_eq!(params.port, None);
        assert_eq!(
            params.connect_options,
            "UNIX_SOCKET=/home/user/.local/share/clepho/db_misc/mysql.socket"
        );
        assert_eq!(params.internal_server_server_cmd, "mysqld");
        assert_eq!(params.internal_server_path, "/home/user/.local/share/clepho");
    }

    #[test]
    fn test_mysql_defaults_tcp() {
        let params = ConnectionParameters::defaults_with(
            DatabaseType::Mysql,
            &EngineDefaults::builtin(),
            false,
            true,
            Path::new("/data/clepho"),
        );
        assert_eq!(params.host_name, "localhost");
        assert_eq!(params.port, Some(INTERNAL_SERVER_PORT));
        assert_eq!(params.connect_options, "");
        assert_eq!(params.internal_server_init_cmd, "mariadb-install-db");
        assert_eq!(params.internal_server_admin_cmd, "mariadb-admin");
        assert_eq!(params.internal_server_upgrade_cmd, "mariadb-upgrade");
    }

    #[test]
    fn test_sqlite_defaults() {
        let params = ConnectionParameters::defaults_for(DatabaseType::Sqlite);
        assert!(params.is_sqlite());
        assert!(!params.internal_server);
        assert_eq!(params.port, None);
        assert!(params.internal_server_server_cmd.is_empty());
        // No file chosen yet.
        assert!(!params.is_valid());
    }

    #[test]
    fn test_for_sqlite_derives_all_files() {
        let params = ConnectionParameters::for_sqlite("/photos/db/clepho.db");
        assert_eq!(params.database_name_core, "/photos/db/clepho.db");
        assert_eq!(params.database_name_thumbnails, "/photos/db/thumbnails-clepho.db");
        assert_eq!(params.database_name_face, "/photos/db/recognition.db");
        assert_eq!(params.database_name_similarity, "/photos/db/similarity.db");
        assert!(params.is_valid());
        assert_eq!(params.sqlite_database_file(), "/photos/db/clepho.db");
    }

    #[test]
    fn test_for_sqlite_default_file() {
        let params = ConnectionParameters::for_sqlite_default_file("/photos/db/");
        assert_eq!(params.database_name_core, "/photos/db/clepho.db");
        assert_eq!(params.database_name_face, "/photos/db/recognition.db");
    }

    #[test]
    fn test_sqlite_directory_strips_known_name() {
        assert_eq!(
            LogicalDatabase::Core.sqlite_directory("/photos/db/clepho.db"),
            "/photos/db/"
        );
        assert_eq!(
            LogicalDatabase::Core.sqlite_directory("/photos/db/custom.db"),
            "/photos/db/custom.db"
        );
        assert_eq!(
            LogicalDatabase::Core.sqlite_directory("/photos/db/myclepho.db"),
            "/photos/db/myclepho.db"
        );
        assert_eq!(
            LogicalDatabase::Faces.sqlite_directory("/photos/db/facerecognition.db"),
            "/photos/db/facerecognition.db"
        );
        assert_eq!(
            LogicalDatabase::Core.sqlite_file("/photos/db/"),
            "/photos/db/clepho.db"
        );
    }

    #[test]
    fn test_validity() {
        let mut params = ConnectionParameters::default();
        assert!(!params.is_valid());

        params.database_type = Some(DatabaseType::Sqlite);
        assert!(!params.is_valid());

        params.database_name_core = "/tmp/clepho.db".to_string();
        assert!(params.is_valid());
    }

    #[test]
    fn test_derive_replaces_core_only() {
        let mut params = ConnectionParameters::for_sqlite("/photos/db/clepho.db");
        params.wal_mode = true;

        let thumbs = params.thumbnail_parameters();
        assert_eq!(thumbs.database_name_core, "/photos/db/thumbnails-clepho.db");
        assert_eq!(thumbs.database_name_thumbnails, params.database_name_thumbnails);
        assert!(thumbs.wal_mode);

        assert_eq!(
            params.face_parameters().database_name_core,
            "/photos/db/recognition.db"
        );
        assert_eq!(
            params.similarity_parameters().database_name_core,
            "/photos/db/similarity.db"
        );
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = mysql_params();
        let b = mysql_params();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 32);

        let mut c = a.clone();
        c.connect_options = "UNIX_SOCKET=/elsewhere/mysql.socket".to_string();
        assert_ne!(a.fingerprint(), c.fingerprint());

        let mut d = a.clone();
        d.port = Some(3308);
        assert_ne!(a.fingerprint(), d.fingerprint());

        // Helper tool paths do not change which store is addressed.
        let mut e = a.clone();
        e.internal_server_server_cmd = "/opt/mysql/bin/mysqld".to_string();
        assert_eq!(a.fingerprint(), e.fingerprint());
    }

    #[test]
    fn test_apply_internal_server_defaults() {
        let mut params = ConnectionParameters::new(DatabaseType::Mysql);
        params.database_name_core = "other".to_string();
        params.password = "pw".to_string();
        params.host_name = "db.example.org".to_string();

        params.apply_internal_server_defaults(true, Path::new("/srv/clepho"));
        assert_eq!(params.database_name_core, INTERNAL_DATABASE_NAME);
        assert_eq!(params.user_name, "root");
        assert!(params.password.is_empty());
        assert!(params.host_name.is_empty());
        assert_eq!(params.connect_options, "UNIX_SOCKET=/srv/clepho/db_misc/mysql.socket");

        params.apply_internal_server_defaults(false, Path::new("/srv/clepho"));
        assert_eq!(params.host_name, "localhost");
        assert_eq!(params.port, Some(INTERNAL_SERVER_PORT));
        assert!(params.connect_options.is_empty());
    }

    #[test]
    fn test_debug_masks_password() {
        let mut params = mysql_params();
        params.password = "hunter2".to_string();
        let printed = format!("{:?}", params);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("XXXXXXX"));
    }

    #[test]
    fn test_serialize_skips_password() {
        let mut params = mysql_params();
        params.password = "hunter2".to_string();
        let json = serde_json::to_string(&params).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"database_type\":\"mysql\""));
    }
}
