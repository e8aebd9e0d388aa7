//! Authorization client for the embedded controller
//!
//! Each request spawns the controller executable with the park flag and the
//! plate, captures bounded stdout/stderr and classifies the result. The
//! controller runs in its own process group; the whole group is killed when
//! the watchdog deadline passes or the request is dropped.

use crate::domain::types::{AuthorizationOutcome, PlateIdentifier};
use crate::infra::config::Config;
use crate::io::wire::{self, Verdict, MAX_RESPONSE_LEN};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant as Deadline;
use tracing::{debug, error, info, warn};

/// Decision authority consulted for each recognized plate
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Ask for a decision, waiting at most `deadline`. Produces exactly one outcome.
    ///
    /// The deadline covers time spent queued behind an earlier request.
    async fn request_authorization(
        &self,
        plate: &PlateIdentifier,
        deadline: Duration,
    ) -> AuthorizationOutcome;
}

/// Log spawn failure (cold path)
#[cold]
fn log_spawn_failed(binary: &std::path::Path, e: &std::io::Error) {
    error!(binary = %binary.display(), error = %e, "controller_spawn_failed");
}

/// SIGKILL every process in the controller's group
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = %pgid, error = %e, "controller_group_kill_failed"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Owns the controller's process group; anything still in it dies on drop,
/// including when the request future is aborted
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    /// Forget the group once its leader has been reaped; the id may be reused
    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Completed child process output
struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Authorization client backed by a controller executable
pub struct ProcessAuthorizer {
    binary: PathBuf,
    park_flag: String,
    /// Serializes access to the controller so responses are attributable
    in_flight: Mutex<()>,
}

impl ProcessAuthorizer {
    pub fn new(binary: impl Into<PathBuf>, park_flag: impl Into<String>) -> Self {
        Self { binary: binary.into(), park_flag: park_flag.into(), in_flight: Mutex::new(()) }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.controller_binary(), config.controller_park_flag())
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    fn spawn(&self, plate: &PlateIdentifier) -> std::io::Result<Child> {
        let mut command = Command::new(&self.binary);
        command
            .args(wire::request_args(&self.park_flag, plate))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command.spawn()
    }

    /// Wait for the child to finish, reading both pipes concurrently
    async fn collect(child: &mut Child) -> std::io::Result<Captured> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout, stderr) = tokio::try_join!(read_capped(stdout), read_capped(stderr))?;
        let status = child.wait().await?;

        Ok(Captured { status, stdout, stderr })
    }

    /// Kill the controller's process group and reap the child
    async fn terminate(child: &mut Child, group: &mut ProcessGroup, plate: &PlateIdentifier) {
        let pid = child.id();
        group.kill();
        match child.kill().await {
            Ok(()) => {
                warn!(plate = %plate, pid = ?pid, "controller_watchdog_killed");
            }
            Err(e) => {
                // Already exited between the deadline and the kill
                debug!(plate = %plate, pid = ?pid, error = %e, "controller_watchdog_kill_failed");
                let _ = child.wait().await;
            }
        }
    }

    fn classify(&self, plate: &PlateIdentifier, captured: &Captured) -> AuthorizationOutcome {
        if !captured.status.success() {
            error!(
                plate = %plate,
                exit_code = ?captured.status.code(),
                stderr = %String::from_utf8_lossy(&captured.stderr).trim(),
                "controller_exit_failure"
            );
            return AuthorizationOutcome::ControllerUnavailable;
        }

        for line in wire::diagnostics(&captured.stdout) {
            debug!(plate = %plate, line = %line, "controller_diagnostic");
        }

        match wire::parse_response(&captured.stdout, plate) {
            Ok(Verdict::Approved) => AuthorizationOutcome::Authorized,
            Ok(Verdict::Denied { reason }) => {
                info!(plate = %plate, reason = ?reason, "controller_denied");
                AuthorizationOutcome::Denied
            }
            Err(e) => {
                error!(
                    plate = %plate,
                    kind = %e.as_str(),
                    detail = ?e,
                    "controller_protocol_error"
                );
                AuthorizationOutcome::MalformedResponse
            }
        }
    }
}

#[async_trait]
impl Authorizer for ProcessAuthorizer {
    async fn request_authorization(
        &self,
        plate: &PlateIdentifier,
        deadline: Duration,
    ) -> AuthorizationOutcome {
        let start = Instant::now();
        let expires = Deadline::now() + deadline;

        let Ok(_permit) = tokio::time::timeout_at(expires, self.in_flight.lock()).await else {
            warn!(plate = %plate, "controller_busy_past_deadline");
            return AuthorizationOutcome::Timeout;
        };

        info!(plate = %plate, binary = %self.binary.display(), "controller_request");

        let mut child = match self.spawn(plate) {
            Ok(child) => child,
            Err(e) => {
                log_spawn_failed(&self.binary, &e);
                return AuthorizationOutcome::ControllerUnavailable;
            }
        };
        let mut group = ProcessGroup::of(&child);

        let result = tokio::time::timeout_at(expires, Self::collect(&mut child)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(captured)) => {
                group.release();
                self.classify(plate, &captured)
            }
            Ok(Err(e)) => {
                error!(plate = %plate, error = %e, "controller_io_error");
                Self::terminate(&mut child, &mut group, plate).await;
                AuthorizationOutcome::ControllerUnavailable
            }
            Err(_) => {
                Self::terminate(&mut child, &mut group, plate).await;
                AuthorizationOutcome::Timeout
            }
        };

        debug!(plate = %plate, outcome = %outcome, elapsed_ms = %elapsed_ms, "controller_response");
        outcome
    }
}

/// Read a pipe to EOF, keeping at most `MAX_RESPONSE_LEN + 1` bytes
///
/// Excess output is drained and discarded so the child never blocks on a
/// full pipe; the extra byte lets the parser detect the overflow.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };

    let mut kept = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        let room = (MAX_RESPONSE_LEN + 1).saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}
