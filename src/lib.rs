//! Internal database server support for Clepho.
//!
//! Two halves live here:
//!
//! - [`db`] describes how to reach the catalog databases (core, thumbnails,
//!   faces, similarity): defaults, persistence in the config file, a URL form
//!   for handing parameters to another process, and a fingerprint.
//! - [`server`] supervises a locally managed MySQL/MariaDB daemon: it prepares
//!   directories and configuration, initializes and starts the daemon, makes
//!   sure the schema exists and shuts everything down again.

pub mod config;
pub mod db;
pub mod logging;
pub mod server;

pub use config::ConfigStore;
pub use db::{ConnectionParameters, DatabaseType, LogicalDatabase};
pub use server::{ServerState, Supervisor, SupervisorError, SupervisorOptions};
