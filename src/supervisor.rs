//! Lifecycle of the external router process
//!
//! The supervisor owns at most one child. A freshly spawned child must
//! survive a short settle delay to count as running; if it dies inside that
//! window its exit code and stderr are returned as a start failure. After a
//! successful start the pipes are drained into the log by background tasks.

use crate::error::{ManagerError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound for reading stderr of a child that died while settling
const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// State of the router process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process, none expected
    Stopped,
    /// Spawned, waiting out the settle delay
    Starting,
    /// Survived the settle delay
    Running,
    /// Died on its own
    Exited,
}

enum LogDir {
    Temporary(tempfile::TempDir),
    Custom(PathBuf),
}

impl LogDir {
    fn path(&self) -> &Path {
        match self {
            LogDir::Temporary(dir) => dir.path(),
            LogDir::Custom(path) => path,
        }
    }
}

pub struct Supervisor {
    child: Option<Child>,
    state_tx: watch::Sender<ProcessState>,
    command: Option<String>,
    started_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    log_dir: LogDir,
    settle_delay: Duration,
    stop_timeout: Duration,
}

impl Supervisor {
    /// Create a stopped supervisor logging into a fresh temporary directory
    pub fn new(settle_delay: Duration, stop_timeout: Duration) -> Result<Self> {
        let log_dir = tempfile::Builder::new()
            .prefix("mavlink-router-logs-")
            .tempdir()
            .map_err(|e| ManagerError::io("temporary log directory", e))?;
        let (state_tx, _) = watch::channel(ProcessState::Stopped);

        Ok(Self {
            child: None,
            state_tx,
            command: None,
            started_at: None,
            exit_code: None,
            log_dir: LogDir::Temporary(log_dir),
            settle_delay,
            stop_timeout,
        })
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    /// Watch state changes without taking the supervisor lock
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.path()
    }

    /// Use an existing directory for router logs
    pub fn set_log_dir(&mut self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(ManagerError::validation(format!(
                "log directory '{}' does not exist",
                path.display()
            )));
        }
        self.log_dir = LogDir::Custom(path.to_path_buf());
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Last command that was spawned
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn set_state(&self, state: ProcessState) {
        self.state_tx.send_replace(state);
    }

    /// Spawn `command` and wait out the settle delay.
    ///
    /// Any previous child is stopped first.
    pub async fn start(&mut self, command: &str) -> Result<()> {
        if self.child.is_some() {
            self.exit().await;
        }

        let argv = shell_words::split(command)
            .map_err(|e| ManagerError::internal(format!("unparsable command '{}': {}", command, e)))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ManagerError::internal("empty router command"))?;

        info!(%command, "Starting router");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        self.command = Some(command.to_string());
        self.exit_code = None;

        let mut child = cmd.spawn().map_err(|e| {
            self.set_state(ProcessState::Exited);
            ManagerError::StartFailure {
                code: None,
                stderr: format!("failed to spawn '{}': {}", program, e),
            }
        })?;

        self.started_at = Some(Utc::now());
        self.set_state(ProcessState::Starting);
        let pid = child.id().unwrap_or(0);
        debug!(pid, settle_ms = self.settle_delay.as_millis(), "Router spawned, settling");

        tokio::time::sleep(self.settle_delay).await;

        match child.try_wait() {
            Ok(None) => {
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(forward_output(stdout, pid, "stdout"));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_output(stderr, pid, "stderr"));
                }
                self.child = Some(child);
                self.set_state(ProcessState::Running);
                info!(pid, "Router running");
                Ok(())
            }
            Ok(Some(status)) => {
                let stderr = match child.stderr.take() {
                    Some(pipe) => read_remaining(pipe).await,
                    None => String::new(),
                };
                self.exit_code = status.code();
                self.set_state(ProcessState::Exited);
                warn!(pid, code = ?status.code(), %stderr, "Router exited while starting");
                Err(ManagerError::StartFailure {
                    code: status.code(),
                    stderr,
                })
            }
            Err(e) => {
                let _ = child.start_kill();
                self.set_state(ProcessState::Exited);
                Err(ManagerError::internal(format!(
                    "cannot query router process: {}",
                    e
                )))
            }
        }
    }

    /// Refresh the state from the child, noticing an unexpected exit
    pub fn poll(&mut self) -> ProcessState {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(code = ?status.code(), "Router exited");
                    self.exit_code = status.code();
                    self.child = None;
                    self.set_state(ProcessState::Exited);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Cannot query router process"),
            }
        }
        self.state()
    }

    /// Stop the child if there is one. Idempotent.
    pub async fn exit(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.stop_timeout).await;
        }
        self.set_state(ProcessState::Stopped);
    }

    /// Stop the current child, then start `command`
    pub async fn restart(&mut self, command: &str) -> Result<()> {
        self.exit().await;
        self.start(command).await
    }
}

/// SIGTERM, then SIGKILL once `timeout` has passed
async fn terminate(child: &mut Child, timeout: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    info!(pid, "Stopping router");

    #[cfg(unix)]
    // SAFETY: plain signal delivery to a pid we spawned and have not reaped
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, ?status, "Router exited");
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for router to exit");
        }
        Err(_) => {
            warn!(
                pid,
                timeout_secs = timeout.as_secs(),
                "Router did not stop in time, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

async fn read_remaining<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(STDERR_READ_TIMEOUT, pipe.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

async fn forward_output<R: AsyncRead + Unpin>(pipe: R, pid: u32, stream: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid, stream, "{}", line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(Duration::from_millis(200), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_exit() {
        let mut supervisor = supervisor();
        assert_eq!(supervisor.state(), ProcessState::Stopped);

        supervisor.start("sleep 30").await.unwrap();
        assert_eq!(supervisor.state(), ProcessState::Running);
        assert!(supervisor.pid().is_some());
        assert_eq!(supervisor.command(), Some("sleep 30"));
        assert!(supervisor.started_at().is_some());

        supervisor.exit().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(supervisor.pid().is_none());

        // Idempotent
        supervisor.exit().await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_start_failure_reports_stderr() {
        let mut supervisor = supervisor();
        let err = supervisor
            .start("sh -c 'echo no such device >&2; exit 3'")
            .await
            .unwrap_err();

        match err {
            ManagerError::StartFailure { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "no such device");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(supervisor.state(), ProcessState::Exited);
        assert_eq!(supervisor.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_failure() {
        let mut supervisor = supervisor();
        let err = supervisor
            .start("/nonexistent/mavlink-routerd --log /tmp")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::StartFailure { code: None, .. }));
    }

    #[tokio::test]
    async fn test_poll_notices_exit() {
        let mut supervisor = supervisor();
        supervisor.start("sleep 30").await.unwrap();
        let pid = supervisor.pid().unwrap();

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(supervisor.poll(), ProcessState::Exited);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_restart_replaces_child() {
        let mut supervisor = supervisor();
        supervisor.start("sleep 30").await.unwrap();
        let first = supervisor.pid().unwrap();

        supervisor.restart("sleep 31").await.unwrap();
        let second = supervisor.pid().unwrap();
        assert_ne!(first, second);
        assert_eq!(supervisor.command(), Some("sleep 31"));

        // The first child is gone
        let alive = unsafe { libc::kill(first as i32, 0) } == 0;
        assert!(!alive);

        supervisor.exit().await;
    }

    #[tokio::test]
    async fn test_sigterm_ignored_falls_back_to_kill() {
        let mut supervisor =
            Supervisor::new(Duration::from_millis(200), Duration::from_millis(300)).unwrap();
        supervisor
            .start("sh -c \"trap '' TERM; while true; do sleep 1; done\"")
            .await
            .unwrap();

        let started = std::time::Instant::now();
        supervisor.exit().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_log_dir_override() {
        let mut supervisor = supervisor();
        assert!(supervisor.log_dir().is_dir());

        let err = supervisor
            .set_log_dir(Path::new("/nonexistent/logs"))
            .unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));

        let tmp = tempfile::TempDir::new().unwrap();
        supervisor.set_log_dir(tmp.path()).unwrap();
        assert_eq!(supervisor.log_dir(), tmp.path());
    }

    #[test]
    fn test_process_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcessState::Running).unwrap(),
            "\"running\""
        );
    }
}
