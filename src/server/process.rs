//! Helper tool invocation and the daemon child process.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::ProcessDiagnostics;

const WAIT_POLL: Duration = Duration::from_millis(25);
const READER_GRACE: Duration = Duration::from_millis(500);

/// Program plus arguments, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `--name=path` argument.
    pub fn path_arg(self, name: &str, path: &Path) -> Self {
        let arg = format!("--{}={}", name, path.display());
        self.arg(arg)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    fn diagnostics(&self) -> ProcessDiagnostics {
        ProcessDiagnostics {
            program: self.program.clone(),
            arguments: self.args.clone(),
            ..ProcessDiagnostics::default()
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Result of running a helper to completion.
#[derive(Debug)]
pub struct HelperOutput {
    pub status: ExitStatus,
    pub diagnostics: ProcessDiagnostics,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run a helper and wait for it, capturing its output.
///
/// A helper that cannot be launched yields diagnostics with `process_error`
/// set and no exit code.
pub fn run_helper(command: &CommandLine) -> Result<HelperOutput, ProcessDiagnostics> {
    tracing::debug!("Running helper: {}", command);

    let output = command
        .command()
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ProcessDiagnostics {
            process_error: Some(e.to_string()),
            ..command.diagnostics()
        })?;

    let diagnostics = ProcessDiagnostics {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        ..command.diagnostics()
    };

    Ok(HelperOutput {
        status: output.status,
        diagnostics,
    })
}

/// Like [`run_helper`], but kill the helper if it is still running after
/// `timeout`. A killed helper yields diagnostics with `process_error` set.
pub fn run_helper_timeout(
    command: &CommandLine,
    timeout: Duration,
) -> Result<HelperOutput, ProcessDiagnostics> {
    let mut process = DaemonProcess::spawn(command.clone())?;

    let waited = process.wait_timeout(timeout);
    let result = match waited {
        Ok(Some(status)) => Ok(HelperOutput {
            status,
            diagnostics: process.diagnostics(),
        }),
        Ok(None) => {
            tracing::warn!("Helper still running after {:?}, killing it: {}", timeout, command);
            let _ = process.kill_and_wait();
            let mut diagnostics = process.diagnostics();
            diagnostics.process_error = Some(format!("Timed out after {:?}", timeout));
            Err(diagnostics)
        }
        Err(e) => {
            let _ = process.kill_and_wait();
            let mut diagnostics = process.diagnostics();
            diagnostics.process_error = Some(e.to_string());
            Err(diagnostics)
        }
    };

    process.release();
    result
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn drain<R: Read + Send + 'static>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn snapshot(buffer: &SharedBuffer) -> String {
    match buffer.lock() {
        Ok(buf) => String::from_utf8_lossy(&buf).to_string(),
        Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).to_string(),
    }
}

/// The long-running database daemon.
///
/// Stdout and stderr are drained by two background threads so the daemon
/// never blocks on a full pipe.
#[derive(Debug)]
pub struct DaemonProcess {
    command: CommandLine,
    child: Child,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl DaemonProcess {
    pub fn spawn(command: CommandLine) -> Result<Self, ProcessDiagnostics> {
        tracing::debug!("Starting daemon: {}", command);

        let mut child = command
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProcessDiagnostics {
                process_error: Some(e.to_string()),
                ..command.diagnostics()
            })?;

        let stdout: SharedBuffer = Arc::default();
        let stderr: SharedBuffer = Arc::default();
        let mut readers = Vec::with_capacity(2);

        if let Some(out) = child.stdout.take() {
            readers.push(drain::<ChildStdout>(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(drain::<ChildStderr>(err, Arc::clone(&stderr)));
        }

        Ok(Self {
            command,
            child,
            stdout,
            stderr,
            readers,
            exit_status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait()?;
        }
        Ok(self.exit_status)
    }

    /// Wait up to `timeout` for the daemon to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL.min(deadline - now));
        }
    }

    pub fn kill_and_wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        self.child.kill()?;
        let status = self.child.wait()?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Output captured so far plus the exit code if the daemon has exited.
    pub fn diagnostics(&mut self) -> ProcessDiagnostics {
        let status = self.try_wait().ok().flatten();

        if status.is_some() {
            self.join_readers(READER_GRACE);
        }

        ProcessDiagnostics {
            exit_code: status.and_then(|s| s.code()),
            stdout: snapshot(&self.stdout),
            stderr: snapshot(&self.stderr),
            ..self.command.diagnostics()
        }
    }

    /// Join the output readers, giving them up to `grace` to reach end of
    /// file. A reader still blocked after that has its pipe held open by some
    /// grandchild and is left detached.
    fn join_readers(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !self.readers.iter().all(|h| h.is_finished()) {
            thread::sleep(WAIT_POLL);
        }

        let (finished, pending): (Vec<_>, Vec<_>) =
            self.readers.drain(..).partition(|h| h.is_finished());

        for handle in finished {
            let _ = handle.join();
        }
        self.readers = pending;
    }

    /// Drop the handle after the daemon exited, logging leftover output.
    pub fn release(mut self) {
        self.join_readers(READER_GRACE);

        let stderr = snapshot(&self.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!("Database server stderr: {}", stderr.trim_end());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::PROCESS_TEST_LOCK;

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::new("mysqladmin")
            .args(["-u", "root", "shutdown"])
            .path_arg("socket", Path::new("/tmp/db_misc/mysql.socket"));
        assert_eq!(
            cmd.to_string(),
            "mysqladmin -u root shutdown --socket=/tmp/db_misc/mysql.socket"
        );
        assert_eq!(cmd.arguments().len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_helper_captures_output() {
        let _lock = PROCESS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = CommandLine::new("/bin/sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_helper(&cmd).unwrap();
        assert!(!output.success());
        assert_eq!(output.diagnostics.exit_code, Some(3));
        assert_eq!(output.diagnostics.stdout, "out\n");
        assert_eq!(output.diagnostics.stderr, "err\n");
    }

    #[test]
    fn test_run_helper_missing_program() {
        let _lock = PROCESS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = CommandLine::new("/nonexistent/clepho/mysql_install_db");
        let diagnostics = run_helper(&cmd).unwrap_err();
        assert!(diagnostics.process_error.is_some());
        assert_eq!(diagnostics.exit_code, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_helper_timeout_kills_hung_helper() {
        let _lock = PROCESS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = CommandLine::new("/bin/sh").args(["-c", "echo waiting; exec sleep 30"]);
        let started = Instant::now();
        let diagnostics = run_helper_timeout(&cmd, Duration::from_millis(300)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(diagnostics.process_error.unwrap().starts_with("Timed out"));
        assert_eq!(diagnostics.stdout, "waiting\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_helper_timeout_finished() {
        let _lock = PROCESS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = CommandLine::new("/bin/sh").args(["-c", "echo done; exit 0"]);
        let output = run_helper_timeout(&cmd, Duration::from_secs(5)).unwrap();
        assert!(output.success());
        assert_eq!(output.diagnostics.exit_code, Some(0));
        assert_eq!(output.diagnostics.stdout, "done\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_daemon_exit_and_output() {
        let _lock = PROCESS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = CommandLine::new("/bin/sh").args(["-c", "echo started; exit 7"]);
        let mut daemon = DaemonProcess::spawn(cmd).unwrap();
        let status = daemon.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(7));

        let diagnostics = daemon.diagnostics();
        assert_eq!(diagnostics.exit_code, Some(7));
        assert_eq!(diagnostics.stdout, "started\n");
        daemon.release();
    }

    #[cfg(unix)]
    #[test]
    fn test_daemon_kill() {
        let _lock = PROCESS_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = CommandLine::new("/bin/sh").args(["-c", "exec sleep 30"]);
        let mut daemon = DaemonProcess::spawn(cmd).unwrap();
        assert!(daemon
            .wait_timeout(Duration::from_millis(100))
            .unwrap()
            .is_none());

        let status = daemon.kill_and_wait().unwrap();
        assert!(!status.success());
        assert!(daemon.try_wait().unwrap().is_some());
        daemon.release();
    }
}
