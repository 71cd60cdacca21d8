//! How clients reach the internal server: a UNIX socket where the platform
//! has them, a loopback TCP port otherwise.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

use crate::db::INTERNAL_SERVER_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    UnixSocket(PathBuf),
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::UnixSocket(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

pub trait Transport: Send + fmt::Debug {
    /// Settle the endpoint before the daemon starts.
    fn bind(&mut self) -> io::Result<()>;

    /// Arguments for the server daemon.
    fn server_args(&self) -> Vec<String>;

    /// Arguments for the admin and upgrade helpers.
    fn admin_args(&self) -> Vec<String>;

    fn endpoint(&self) -> Endpoint;
}

#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    socket: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    fn socket_arg(&self) -> String {
        format!("--socket={}", self.socket.display())
    }
}

impl Transport for UnixSocketTransport {
    fn bind(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn server_args(&self) -> Vec<String> {
        vec![self.socket_arg()]
    }

    fn admin_args(&self) -> Vec<String> {
        vec![self.socket_arg()]
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::UnixSocket(self.socket.clone())
    }
}

/// Loopback TCP transport.
///
/// `bind` probes the preferred port and falls back to an ephemeral one. The
/// probe listener is closed before the daemon starts, so another process can
/// take the port in between; the daemon then fails to start and reports it.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    preferred_port: u16,
    port: u16,
}

impl TcpTransport {
    pub fn new(preferred_port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            preferred_port,
            port: preferred_port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(INTERNAL_SERVER_PORT)
    }
}

impl Transport for TcpTransport {
    fn bind(&mut self) -> io::Result<()> {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, self.preferred_port)) {
            Ok(_listener) => {
                self.port = self.preferred_port;
            }
            Err(e) => {
                tracing::warn!(
                    "Port {} not free for the MySQL server: {}",
                    self.preferred_port,
                    e
                );
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
                self.port = listener.local_addr()?.port();
                tracing::warn!("Now using the free port: {}", self.port);
            }
        }
        Ok(())
    }

    fn server_args(&self) -> Vec<String> {
        vec![
            "--skip-networking=0".to_string(),
            format!("--port={}", self.port),
        ]
    }

    fn admin_args(&self) -> Vec<String> {
        vec![format!("--port={}", self.port)]
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Transport for this platform, with the socket at `socket_path` where used.
pub fn platform_transport(socket_path: &Path) -> Box<dyn Transport> {
    if cfg!(unix) {
        Box::new(UnixSocketTransport::new(socket_path))
    } else {
        Box::new(TcpTransport::default())
    }
}
