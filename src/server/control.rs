//! Administrative connection to the running server.
//!
//! The supervisor only needs to know when the server accepts connections and
//! to make sure the catalog schema exists. Both go through
//! [`ControlConnector`] so the driver can be swapped.

use std::time::Duration;

use anyhow::Result;

use super::error::SupervisorError;
use super::transport::Endpoint;

pub trait ControlConnection {
    fn use_database(&mut self, name: &str) -> Result<()>;

    fn create_database(&mut self, name: &str) -> Result<()>;
}

pub trait ControlConnector: Send {
    /// Open a connection without selecting a database.
    fn connect(&self, endpoint: &Endpoint, user: &str) -> Result<Box<dyn ControlConnection>>;
}

/// How often and how long to retry the first connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 120,
            interval: Duration::from_millis(500),
        }
    }
}

/// Why no connection could be made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub attempts: u32,
    pub daemon_exited: bool,
    pub last_error: String,
}

/// Retry `connector` according to `policy`.
///
/// Between attempts `pause` is called with the poll interval; it waits on the
/// daemon and returns `true` if the daemon exited, which ends the loop. There
/// is no pause after the last attempt.
pub fn wait_for_connection<F>(
    connector: &dyn ControlConnector,
    endpoint: &Endpoint,
    user: &str,
    policy: PollPolicy,
    mut pause: F,
) -> Result<Box<dyn ControlConnection>, ConnectFailure>
where
    F: FnMut(Duration) -> bool,
{
    let mut last_error = String::new();

    for attempt in 1..=policy.attempts {
        match connector.connect(endpoint, user) {
            Ok(connection) => {
                tracing::debug!("Connected to {} after {} attempts", endpoint, attempt);
                return Ok(connection);
            }
            Err(e) => {
                tracing::debug!("Connection attempt {} to {} failed: {}", attempt, endpoint, e);
                last_error = e.to_string();
            }
        }

        if attempt < policy.attempts && pause(policy.interval) {
            return Err(ConnectFailure {
                attempts: attempt,
                daemon_exited: true,
                last_error,
            });
        }
    }

    Err(ConnectFailure {
        attempts: policy.attempts,
        daemon_exited: false,
        last_error,
    })
}

/// Select `schema`, creating it first if it does not exist.
pub fn ensure_schema(
    connection: &mut dyn ControlConnection,
    schema: &str,
) -> Result<(), SupervisorError> {
    let use_error = match connection.use_database(schema) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    tracing::debug!("Failed to use database {}: {}", schema, use_error);
    tracing::debug!("Trying to create database now");

    match connection.create_database(schema) {
        Ok(()) => {
            tracing::info!("Database {} was successfully created", schema);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Failed to create database {}: {}", schema, e);
            Err(SupervisorError::Schema {
                schema: schema.to_string(),
                message: e.to_string(),
            })
        }
    }
}

// ============================================================================
// MySQL driver
// ============================================================================

#[cfg(feature = "mysql")]
pub use driver::MysqlConnector;

#[cfg(feature = "mysql")]
mod driver {
    use anyhow::Result;
    use mysql::prelude::Queryable;
    use mysql::{Conn, OptsBuilder};

    use super::{ControlConnection, ControlConnector};
    use crate::server::transport::Endpoint;

    fn quote_identifier(name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct MysqlConnector;

    impl ControlConnector for MysqlConnector {
        fn connect(&self, endpoint: &Endpoint, user: &str) -> Result<Box<dyn ControlConnection>> {
            let builder = OptsBuilder::new().user(Some(user)).prefer_socket(true);

            let builder = match endpoint {
                Endpoint::UnixSocket(path) => builder.socket(Some(path.to_string_lossy())),
                Endpoint::Tcp { host, port } => {
                    builder.ip_or_hostname(Some(host.as_str())).tcp_port(*port)
                }
            };

            let conn = Conn::new(builder)?;
            Ok(Box::new(MysqlControl { conn }))
        }
    }

    struct MysqlControl {
        conn: Conn,
    }

    impl ControlConnection for MysqlControl {
        fn use_database(&mut self, name: &str) -> Result<()> {
            self.conn.query_drop(format!("USE {}", quote_identifier(name)))?;
            Ok(())
        }

        fn create_database(&mut self, name: &str) -> Result<()> {
            self.conn
                .query_drop(format!("CREATE DATABASE {}", quote_identifier(name)))?;
            self.use_database(name)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_quote_identifier() {
            assert_eq!(quote_identifier("clepho"), "`clepho`");
            assert_eq!(quote_identifier("a`b"), "`a``b`");
        }
    }
}
