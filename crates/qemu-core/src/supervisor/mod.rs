//! Process Supervisor (spec §4.1) — owns the QEMU child process.
//!
//! Grounded in the teacher's `qemu::vm_instance::Vm` (SIGTERM-then-SIGKILL
//! escalation via `nix::sys::signal::kill`, PID-file recovery) generalized
//! to an async child handle with a log-pipe reader, per the daemon-style
//! supervisor pattern used elsewhere in the pack (`tokio::process::Command`
//! + `BufReader::lines()` over merged stdout/stderr).

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::{DriverError, Result};

/// The fatal marker line on QEMU's log pipe (spec §6).
pub const FATAL_LOG_MARKER: &str = "key event queue full";

pub struct SpawnOptions {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub pid_file: PathBuf,
}

/// A live QEMU child process plus its log stream.
///
/// The `Child` itself is handed to a background task that awaits its exit
/// and reaps it; `Supervised` only keeps the pid and the two notification
/// channels, so liveness checks never race a double-reap.
pub struct Supervised {
    pid: i32,
    pid_file: PathBuf,
    /// Receives each line read from the child's merged stdout/stderr.
    pub log_lines: mpsc::UnboundedReceiver<String>,
    /// Fires once, with the exit status, when the child has been reaped.
    pub exited: mpsc::UnboundedReceiver<std::process::ExitStatus>,
}

pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }

    /// Spawn QEMU with stdin closed, stdout piped, stderr merged into
    /// stdout, and write the PID file atomically before returning.
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<Supervised> {
        if opts.argv.is_empty() {
            return Err(DriverError::Config("empty argv".into()));
        }

        let mut cmd = Command::new(&opts.argv[0]);
        cmd.args(&opts.argv[1..])
            .envs(opts.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{}: {}", opts.argv[0], e)))?;

        let pid = child
            .id()
            .ok_or_else(|| DriverError::Spawn("qemu exited before pid was observed".into()))?
            as i32;

        write_pid_file_atomic(&opts.pid_file, pid)?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let (log_tx, log_lines) = mpsc::unbounded_channel();
        spawn_line_reader(stdout, log_tx.clone());
        spawn_line_reader(stderr, log_tx);

        let (exit_tx, exited) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Ok(status) = child.wait().await {
                let _ = exit_tx.send(status);
            }
        });

        tracing::info!(pid, argv = ?opts.argv, "spawned qemu");

        Ok(Supervised {
            pid,
            pid_file: opts.pid_file,
            log_lines,
            exited,
        })
    }

    /// Graceful-then-forced shutdown with a two-stage escalation window.
    pub async fn stop(&self, supervised: &Supervised, graceful_timeout: Duration) -> Result<()> {
        let pid = supervised.pid;

        tracing::info!(pid, "sending SIGTERM");
        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| DriverError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        if wait_until_dead(pid, graceful_timeout).await {
            let _ = std::fs::remove_file(&supervised.pid_file);
            return Ok(());
        }

        tracing::warn!(pid, "did not stop gracefully, escalating to SIGKILL");
        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| DriverError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        if wait_until_dead(pid, Duration::from_secs(1)).await {
            let _ = std::fs::remove_file(&supervised.pid_file);
            return Ok(());
        }

        Err(DriverError::StillRunning)
    }

    pub fn is_running(&self, supervised: &Supervised) -> bool {
        kill(Pid::from_raw(supervised.pid), None).is_ok()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervised {
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

async fn wait_until_dead(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if kill(Pid::from_raw(pid), None).is_err() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains(FATAL_LOG_MARKER) {
                tracing::error!(%line, "fatal marker observed on qemu log pipe");
            } else {
                tracing::debug!(%line, "qemu log");
            }
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Write the PID file via a temp-file-then-rename so a concurrent reader
/// never observes a partially written file.
fn write_pid_file_atomic(path: &Path, pid: i32) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, pid.to_string())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.pid");
        write_pid_file_atomic(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "4242");
        assert!(!path.with_extension("tmp").exists());
    }
}
