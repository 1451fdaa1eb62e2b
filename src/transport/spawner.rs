//! Provider process spawning and termination.
//!
//! Providers are launched with:
//! - stdin/stdout piped as the session's duplex stream, stderr piped and
//!   drained into `tracing` at `DEBUG`;
//! - `kill_on_drop(true)` so a dropped session never leaks its child;
//! - unless `inherit_env` is set, `env_clear()` plus [`ALLOWED_ENV_VARS`],
//!   so credentials held by the host process are not visible to providers.
//!
//! Shutdown is "graceful terminate with escalation": interrupt, wait up to a
//! grace period, then force-kill.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::transport::Transport;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by providers when `inherit_env` is off.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "TMPDIR",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the provider described by `config` and wire its stdio into a
/// [`Transport`].
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn …")` if the executable cannot start.
/// - `AppError::Spawn("failed to capture …")` if a pipe is missing.
pub fn spawn_provider(server: &str, config: &ServerConfig) -> Result<Transport> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    if !config.inherit_env {
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
    }
    cmd.envs(&config.env);

    if let Some(dir) = &config.workdir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn '{}': {err}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture provider stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture provider stdout".into()))?;
    if let Some(stderr) = child.stderr.take() {
        drain_stderr(server.to_owned(), stderr);
    }

    info!(
        server,
        pid = child.id().unwrap_or(0),
        command = %config.command,
        "provider process spawned"
    );

    Ok(Transport {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        process: Some(ChildProcess {
            server: server.to_owned(),
            child,
        }),
    })
}

/// Re-emit provider stderr lines as `DEBUG` events until EOF.
fn drain_stderr(server: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(server = %server, %line, "provider stderr"),
                Ok(None) => break,
                Err(err) => {
                    debug!(server = %server, %err, "provider stderr read failed");
                    break;
                }
            }
        }
    });
}

// ── Process handle ───────────────────────────────────────────────────────────

/// How a provider process ended during [`ChildProcess::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before termination began.
    AlreadyExited(Option<i32>),
    /// The process exited within the grace period.
    Exited(Option<i32>),
    /// The grace period elapsed and the process was force-killed.
    Killed,
}

/// Owned handle on a spawned provider process.
#[derive(Debug)]
pub struct ChildProcess {
    server: String,
    child: Child,
}

impl ChildProcess {
    /// OS process id, while the process has not been reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Run the escalation sequence: interrupt, wait up to `grace`, force-kill.
    ///
    /// Never fails: errors while signalling or waiting are logged and the
    /// sequence proceeds to the next step.
    pub async fn terminate(&mut self, grace: Duration) -> Termination {
        let server = self.server.as_str();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(server, ?status, "provider already exited");
                return Termination::AlreadyExited(status.code());
            }
            Ok(None) => {}
            Err(err) => warn!(server, %err, "failed to poll provider status"),
        }

        self.interrupt();

        info!(server, ?grace, "waiting for provider to exit");
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(server, status = %describe(status), "provider exited gracefully");
                Termination::Exited(status.code())
            }
            Ok(Err(err)) => {
                warn!(server, %err, "error waiting for provider, forcing kill");
                self.force_kill().await;
                Termination::Killed
            }
            Err(_) => {
                warn!(server, "provider did not exit within grace period, forcing kill");
                self.force_kill().await;
                Termination::Killed
            }
        }
    }

    async fn force_kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            warn!(server = %self.server, %err, "failed to force-kill provider");
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGINT) {
            debug!(server = %self.server, %err, "failed to interrupt provider");
        }
    }

    // No portable interrupt outside unix; the grace period relies on the
    // provider exiting on stdin EOF.
    #[cfg(not(unix))]
    fn interrupt(&self) {}
}

fn describe(status: ExitStatus) -> String {
    status.code().map_or_else(
        || "terminated by signal".to_owned(),
        |c| format!("exited with code {c}"),
    )
}
