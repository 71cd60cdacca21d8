//! Connection parameters for the catalog databases.
//!
//! One [`ConnectionParameters`] value describes a physical store shared by up
//! to four logical databases. For SQLite each logical database is its own
//! file; for MySQL they are schema names on the same server, normally all the
//! same when the internal server is used.

mod crypto;
mod engine;
mod parameters;
mod persistence;
mod query;

pub use crypto::{decrypt_password, encrypt_password};
pub use engine::{EngineDefaults, EngineSettings, DEFAULTS_FILE_NAME, ENGINE_DEFAULTS_VERSION};
pub use parameters::{
    server_private_path, ConnectionParameters, DatabaseType, LogicalDatabase, INTERNAL_DATABASE_NAME,
    INTERNAL_SERVER_PORT, SOCKET_FILE_NAME,
};
pub use persistence::{migrate_legacy, LegacySnapshot, MigrationRule, MIGRATION_RULES};
pub use query::URL_QUERY_KEYS;
