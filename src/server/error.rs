//! Errors returned by the server supervisor.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`SupervisorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotSupported,
    Configuration,
    Directory,
    Process,
    ConnectionTimeout,
    Schema,
}

/// What a helper or daemon process left behind when it failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessDiagnostics {
    pub program: String,
    pub arguments: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub process_error: Option<String>,
}

impl fmt::Display for ProcessDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Executable: {}", self.program)?;
        writeln!(f, "Arguments: {}", self.arguments.join(", "))?;
        match self.exit_code {
            Some(code) => writeln!(f, "Exit code: {}", code)?,
            None => writeln!(f, "Exit code: none")?,
        }
        if let Some(error) = &self.process_error {
            writeln!(f, "Process error: {}", error)?;
        }
        writeln!(f, "Stdout: {}", self.stdout.trim_end())?;
        write!(f, "Stderr: {}", self.stderr.trim_end())
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{message}")]
    NotSupported { message: String },

    #[error("{message}")]
    Configuration { message: String },

    #[error("Cannot create directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{message}\n{diagnostics}")]
    Process {
        message: String,
        diagnostics: ProcessDiagnostics,
    },

    #[error("{message} ({attempts} attempts)\n{diagnostics}")]
    ConnectionTimeout {
        message: String,
        attempts: u32,
        daemon_exited: bool,
        diagnostics: ProcessDiagnostics,
    },

    #[error("Failed to use or create database '{schema}': {message}")]
    Schema { schema: String, message: String },
}

impl SupervisorError {
    pub fn not_supported(message: impl Into<String>) -> Self {
        SupervisorError::NotSupported {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        SupervisorError::Configuration {
            message: message.into(),
        }
    }

    pub fn process(message: impl Into<String>, diagnostics: ProcessDiagnostics) -> Self {
        SupervisorError::Process {
            message: message.into(),
            diagnostics,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::NotSupported { .. } => ErrorKind::NotSupported,
            SupervisorError::Configuration { .. } => ErrorKind::Configuration,
            SupervisorError::Directory { .. } => ErrorKind::Directory,
            SupervisorError::Process { .. } => ErrorKind::Process,
            SupervisorError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            SupervisorError::Schema { .. } => ErrorKind::Schema,
        }
    }

    /// Whether the server failed to start, as opposed to not being applicable.
    pub fn is_start_failure(&self) -> bool {
        self.kind() != ErrorKind::NotSupported
    }

    pub fn diagnostics(&self) -> Option<&ProcessDiagnostics> {
        match self {
            SupervisorError::Process { diagnostics, .. }
            | SupervisorError::ConnectionTimeout { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_display() {
        let err = SupervisorError::process(
            "Could not start database initializer.",
            ProcessDiagnostics {
                program: "/usr/bin/mysql_install_db".to_string(),
                arguments: vec!["--datadir=/tmp/db_data".to_string()],
                exit_code: Some(1),
                stdout: "FAKE_ERROR_OUTPUT\n".to_string(),
                stderr: String::new(),
                process_error: None,
            },
        );

        let text = err.to_string();
        assert!(text.starts_with("Could not start database initializer."));
        assert!(text.contains("Exit code: 1"));
        assert!(text.contains("Stdout: FAKE_ERROR_OUTPUT"));
        assert!(text.contains("--datadir=/tmp/db_data"));
        assert_eq!(err.kind(), ErrorKind::Process);
        assert!(err.is_start_failure());
    }

    #[test]
    fn test_not_supported_is_not_start_failure() {
        let err = SupervisorError::not_supported("SQLite has no server");
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(!err.is_start_failure());
        assert!(err.diagnostics().is_none());
    }

    #[test]
    fn test_directory_error_names_path() {
        let err = SupervisorError::Directory {
            path: PathBuf::from("/nonexistent/db_misc"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("/nonexistent/db_misc"));
        assert_eq!(err.kind(), ErrorKind::Directory);
    }
}
