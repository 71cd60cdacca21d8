//! Supervisor for the internal MySQL/MariaDB server.
//!
//! [`Supervisor::start_server`] runs the bootstrap stages in order and stops
//! at the first failure:
//!
//! 1. check the backend is a server database
//! 2. check helper paths and create directories
//! 3. write `mysql.conf` from the templates
//! 4. rotate the error log
//! 5. initialize the data directory on first use
//! 6. start the daemon
//! 7. wait until it accepts connections
//! 8. run the upgrade helper
//! 9. make sure the catalog schema exists
//!
//! Once running, a monitor thread logs liveness until
//! [`Supervisor::stop_server`] shuts the daemon down.

mod config_file;
mod control;
mod error;
mod layout;
mod process;
mod transport;


pub use config_file::{rotate_logs, synthesize_config, MAX_OLD_LOG_SIZE};
#[cfg(feature = "mysql")]
pub use control::MysqlConnector;
pub use control::{
    ensure_schema, wait_for_connection, ConnectFailure, ControlConnection, ControlConnector,
    PollPolicy,
};
pub use error::{ErrorKind, ProcessDiagnostics, SupervisorError};
pub use layout::{locate_template, ServerLayout, GLOBAL_TEMPLATE, LOCAL_TEMPLATE};
pub use process::{run_helper, run_helper_timeout, CommandLine, DaemonProcess, HelperOutput};
pub use transport::{platform_transport, Endpoint, TcpTransport, Transport, UnixSocketTransport};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::db::{server_private_path, ConnectionParameters, DatabaseType, INTERNAL_DATABASE_NAME};

#[cfg(test)]
pub(crate) static PROCESS_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

// ============================================================================
// State and events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    NotRunning,
    Stopped,
}

impl ServerState {
    fn as_u8(self) -> u8 {
        match self {
            ServerState::Created => 0,
            ServerState::Running => 1,
            ServerState::NotRunning => 2,
            ServerState::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Running,
            2 => ServerState::NotRunning,
            3 => ServerState::Stopped,
            _ => ServerState::Created,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Running => "running",
            ServerState::NotRunning => "not running",
            ServerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn get(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ServerState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Bootstrap stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ValidateBackendSupport,
    CheckDirectories,
    SynthesizeConfig,
    RotateLogs,
    InitializeStore,
    StartServerProcess,
    WaitForConnection,
    UpgradeStore,
    EnsureSchema,
}

impl Stage {
    pub fn display_name(&self) -> &'static str {
        match self {
            Stage::ValidateBackendSupport => "Validate backend support",
            Stage::CheckDirectories => "Check directories",
            Stage::SynthesizeConfig => "Synthesize configuration",
            Stage::RotateLogs => "Rotate logs",
            Stage::InitializeStore => "Initialize store",
            Stage::StartServerProcess => "Start server process",
            Stage::WaitForConnection => "Wait for connection",
            Stage::UpgradeStore => "Upgrade store",
            Stage::EnsureSchema => "Ensure schema",
        }
    }
}

/// Update messages sent to an observer while the supervisor works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUpdate {
    /// A bootstrap stage was entered.
    Stage(Stage),
    /// A long-running helper started.
    Busy { message: String },
    /// The long-running helper finished.
    Idle,
    /// Periodic liveness report.
    Alive { seconds: u64 },
    /// The daemon was shut down.
    Stopped,
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Schema holding every logical database on the internal server.
    pub schema_name: String,
    /// Extra `--basedir` for the init helper and the daemon.
    pub basedir: Option<PathBuf>,
    pub poll: PollPolicy,
    /// How long the daemon must survive after spawning to count as started.
    pub startup_grace: Duration,
    /// Budget for the admin shutdown helper and the daemon exit together.
    pub shutdown_timeout: Duration,
    pub monitor_tick: Duration,
    pub liveness_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            schema_name: INTERNAL_DATABASE_NAME.to_string(),
            basedir: None,
            poll: PollPolicy::default(),
            startup_grace: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(30),
            monitor_tick: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(30),
        }
    }
}

struct Monitor {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Owns the internal server daemon from start to stop.
///
/// Two supervisors must not share a data directory; callers keying on
/// [`ConnectionParameters::fingerprint`] keep at most one per store.
pub struct Supervisor {
    params: ConnectionParameters,
    layout: ServerLayout,
    options: SupervisorOptions,
    transport: Option<Box<dyn Transport>>,
    connector: Box<dyn ControlConnector>,
    state: SharedState,
    daemon: Option<DaemonProcess>,
    monitor: Option<Monitor>,
    updates: Option<mpsc::Sender<ServerUpdate>>,
}

impl Supervisor {
    pub fn new(params: ConnectionParameters, connector: Box<dyn ControlConnector>) -> Self {
        tracing::debug!("{:?}", params);

        let layout = ServerLayout::new(&params, &server_private_path());

        Self {
            params,
            layout,
            options: SupervisorOptions::default(),
            transport: None,
            connector,
            state: SharedState::default(),
            daemon: None,
            monitor: None,
            updates: None,
        }
    }

    pub fn with_layout(mut self, layout: ServerLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_updates(mut self, sender: mpsc::Sender<ServerUpdate>) -> Self {
        self.updates = Some(sender);
        self
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn layout(&self) -> &ServerLayout {
        &self.layout
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.daemon.is_some() && self.state() == ServerState::Running
    }

    /// Where clients reach the server once it runs.
    pub fn endpoint(&mut self) -> Endpoint {
        self.transport().endpoint()
    }

    fn transport(&mut self) -> &mut dyn Transport {
        let socket = self.layout.socket_path();
        &mut **self
            .transport
            .get_or_insert_with(|| platform_transport(&socket))
    }

    fn notify(&self, update: ServerUpdate) {
        if let Some(sender) = &self.updates {
            let _ = sender.send(update);
        }
    }

    fn enter(&self, stage: Stage) {
        tracing::debug!("Database server stage: {}", stage.display_name());
        self.notify(ServerUpdate::Stage(stage));
    }

    /// Bring the server up. Calling it again after it has run is an error.
    pub fn start_server(&mut self) -> Result<(), SupervisorError> {
        if self.state() != ServerState::Created {
            return Err(SupervisorError::configuration(format!(
                "Database server was already started (state: {})",
                self.state().name()
            )));
        }

        match self.run_stages() {
            Ok(()) => {
                self.state.set(ServerState::Running);
                self.spawn_monitor();
                tracing::info!("Database server is running");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotSupported => {
                tracing::debug!("This database type is not supported: {}", e);
                Err(e)
            }
            Err(e) => {
                tracing::error!("Cannot start internal database server: {}", e);
                self.state.set(ServerState::NotRunning);

                if let Some(mut daemon) = self.daemon.take() {
                    if let Err(kill_error) = daemon.kill_and_wait() {
                        tracing::warn!("Failed to kill database server: {}", kill_error);
                    }
                    daemon.release();
                }
                Err(e)
            }
        }
    }

    fn run_stages(&mut self) -> Result<(), SupervisorError> {
        self.enter(Stage::ValidateBackendSupport);
        self.validate_backend()?;

        self.enter(Stage::CheckDirectories);
        self.check_directories()?;

        self.enter(Stage::SynthesizeConfig);
        synthesize_config(&self.layout)?;

        self.enter(Stage::RotateLogs);
        rotate_logs(&self.layout);

        self.enter(Stage::InitializeStore);
        self.initialize_store()?;

        self.enter(Stage::StartServerProcess);
        self.start_daemon()?;

        self.enter(Stage::WaitForConnection);
        self.connect()?;

        self.enter(Stage::UpgradeStore);
        self.upgrade_store()?;

        self.enter(Stage::EnsureSchema);
        let mut connection = self.connect()?;
        ensure_schema(connection.as_mut(), &self.options.schema_name)
    }

    fn validate_backend(&self) -> Result<(), SupervisorError> {
        match self.params.database_type {
            Some(DatabaseType::Mysql) => Ok(()),
            other => Err(SupervisorError::not_supported(format!(
                "The internal server does not support the database type '{}'",
                other.map(|t| t.as_str()).unwrap_or("")
            ))),
        }
    }

    fn check_directories(&self) -> Result<(), SupervisorError> {
        let helpers = [
            ("upgrade", &self.params.internal_server_upgrade_cmd),
            ("server", &self.params.internal_server_server_cmd),
            ("administration", &self.params.internal_server_admin_cmd),
            ("initialization", &self.params.internal_server_init_cmd),
        ];

        for (name, path) in helpers {
            if path.is_empty() {
                tracing::error!("No path to mysql {} command set in configuration file", name);
                return Err(SupervisorError::configuration(format!(
                    "No path to mysql {} command set in configuration file",
                    name
                )));
            }
        }

        for dir in [
            &self.layout.data_dir,
            &self.layout.misc_dir,
            &self.layout.file_data_dir,
        ] {
            create_dir(dir)?;
        }

        Ok(())
    }

    fn run_busy_helper(
        &self,
        command: &CommandLine,
        busy_message: &str,
        failure_message: &str,
    ) -> Result<(), SupervisorError> {
        self.notify(ServerUpdate::Busy {
            message: busy_message.to_string(),
        });
        let result = run_helper(command);
        self.notify(ServerUpdate::Idle);

        match result {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(SupervisorError::process(failure_message, output.diagnostics)),
            Err(diagnostics) => Err(SupervisorError::process(failure_message, diagnostics)),
        }
    }

    fn initialize_store(&self) -> Result<(), SupervisorError> {
        if self.layout.init_marker().exists() {
            tracing::debug!("Database data directory is already initialized");
            return Ok(());
        }

        let mut command = CommandLine::new(&self.params.internal_server_init_cmd);
        if let Some(global) = &self.layout.global_config {
            command = command.path_arg("defaults-file", global);
        }
        if let Some(basedir) = &self.options.basedir {
            command = command.path_arg("basedir", basedir);
        }
        command = command.path_arg("datadir", &self.layout.data_dir);

        tracing::info!("Initializing database data directory: {}", command);

        self.run_busy_helper(
            &command,
            "The internal MySQL database is initializing, please wait...",
            "Could not start database initializer.",
        )
    }

    fn start_daemon(&mut self) -> Result<(), SupervisorError> {
        self.transport().bind().map_err(|e| {
            SupervisorError::configuration(format!("Cannot prepare server endpoint: {}", e))
        })?;

        let mut command = CommandLine::new(&self.params.internal_server_server_cmd)
            .path_arg("defaults-file", &self.layout.actual_config)
            .path_arg("datadir", &self.layout.data_dir);
        if let Some(basedir) = &self.options.basedir {
            command = command.path_arg("basedir", basedir);
        }
        command = command.args(self.transport().server_args());

        tracing::info!("Database server: {}", command);

        let mut daemon = DaemonProcess::spawn(command)
            .map_err(|d| SupervisorError::process("Could not start database server.", d))?;

        match daemon.wait_timeout(self.options.startup_grace) {
            Ok(None) => {
                self.daemon = Some(daemon);
                Ok(())
            }
            Ok(Some(_)) => {
                let diagnostics = daemon.diagnostics();
                daemon.release();
                Err(SupervisorError::process(
                    "Could not start database server.",
                    diagnostics,
                ))
            }
            Err(e) => {
                let mut diagnostics = daemon.diagnostics();
                diagnostics.process_error = Some(e.to_string());
                self.daemon = Some(daemon);
                Err(SupervisorError::process(
                    "Could not start database server.",
                    diagnostics,
                ))
            }
        }
    }

    fn connect(&mut self) -> Result<Box<dyn ControlConnection>, SupervisorError> {
        let endpoint = self.endpoint();
        let policy = self.options.poll;
        let connector = self.connector.as_ref();
        let daemon = &mut self.daemon;

        let result = wait_for_connection(connector, &endpoint, "root", policy, |interval| {
            match daemon.as_mut() {
                Some(daemon) => matches!(daemon.wait_timeout(interval), Ok(Some(_))),
                None => {
                    thread::sleep(interval);
                    false
                }
            }
        });

        result.map_err(|failure| {
            let message = if failure.daemon_exited {
                "Database process exited unexpectedly during initial connection.".to_string()
            } else {
                format!(
                    "Could not connect to database after trying for {} seconds: {}",
                    (policy.interval * policy.attempts).as_secs(),
                    failure.last_error
                )
            };

            let diagnostics = self
                .daemon
                .as_mut()
                .map(|d| d.diagnostics())
                .unwrap_or_default();

            SupervisorError::ConnectionTimeout {
                message,
                attempts: failure.attempts,
                daemon_exited: failure.daemon_exited,
                diagnostics,
            }
        })
    }

    fn upgrade_store(&mut self) -> Result<(), SupervisorError> {
        let command = CommandLine::new(&self.params.internal_server_upgrade_cmd)
            .args(self.transport().admin_args());

        tracing::info!("Upgrade database: {}", command);

        self.run_busy_helper(
            &command,
            "A MySQL database upgrade is in progress, please wait...",
            "Could not upgrade database.",
        )
    }

    fn spawn_monitor(&mut self) {
        let state = self.state.clone();
        let updates = self.updates.clone();
        let tick = self.options.monitor_tick;
        let liveness = self.options.liveness_interval;
        let (done_tx, done_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let report = |seconds: u64| {
                tracing::debug!("Running {} seconds...", seconds);
                if let Some(sender) = &updates {
                    let _ = sender.send(ServerUpdate::Alive { seconds });
                }
            };

            report(0);
            let mut last_report = Instant::now();

            while state.get() == ServerState::Running {
                if last_report.elapsed() >= liveness {
                    report(started.elapsed().as_secs());
                    last_report = Instant::now();
                }
                thread::sleep(tick);
            }

            tracing::debug!("Shutting down database server monitor");
            let _ = done_tx.send(());
        });

        self.monitor = Some(Monitor {
            handle,
            done: done_rx,
        });
    }

    /// Shut the daemon down and wait until it and the monitor are gone.
    /// Does nothing if no daemon is running.
    pub fn stop_server(&mut self) -> Result<(), SupervisorError> {
        let Some(mut daemon) = self.daemon.take() else {
            return Ok(());
        };

        let command = CommandLine::new(&self.params.internal_server_admin_cmd)
            .args(["-u", "root", "shutdown"])
            .args(self.transport().admin_args());

        tracing::info!("Send stop to database server: {}", command);

        let deadline = Instant::now() + self.options.shutdown_timeout;

        match run_helper_timeout(&command, self.options.shutdown_timeout) {
            Ok(output) if !output.success() => {
                tracing::debug!("Admin shutdown returned non-zero:\n{}", output.diagnostics);
            }
            Ok(_) => {}
            Err(diagnostics) => {
                tracing::warn!("Could not run admin shutdown:\n{}", diagnostics);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match daemon.wait_timeout(remaining) {
            Ok(Some(status)) => {
                tracing::debug!("Database server exited with {}", status);
            }
            Ok(None) | Err(_) => {
                tracing::warn!("Database process will be killed now");
                if let Err(e) = daemon.kill_and_wait() {
                    tracing::warn!("Failed to kill database server: {}", e);
                }
            }
        }
        daemon.release();

        self.state.set(ServerState::Stopped);

        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.done.recv();
            let _ = monitor.handle.join();
        }

        tracing::info!("Database server stopped");
        self.notify(ServerUpdate::Stopped);
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.daemon.is_some() {
            tracing::warn!("Database server still running on drop, stopping it");
            let _ = self.stop_server();
        }
    }
}

fn create_dir(dir: &Path) -> Result<(), SupervisorError> {
    if dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|source| {
        tracing::error!("Cannot create directory {}", dir.display());
        SupervisorError::Directory {
            path: dir.to_path_buf(),
            source,
        }
    })
}
