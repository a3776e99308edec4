//! Driver Bridge (spec §4.6) — the parent-side proxy. Owns the backend
//! child process and marshals commands across a duplex line-delimited JSON
//! pipe keyed by monotonic tokens, plus signal-aware teardown.
//!
//! This is the process boundary: library code below (`qemu_core`) returns
//! `thiserror`-typed `DriverError`s, but everything here is expressed in
//! `anyhow::Result`, matching the teacher's split between `thiserror` in
//! library crates and `anyhow` in binary-adjacent orchestration code.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use crate::protocol::{CommandFrame, ResponseBody, ResponseFrame, TokenCounter};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;

pub struct DriverBridge {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    tokens: TokenCounter,
    pending: PendingMap,
}

impl DriverBridge {
    /// Spawn the backend child binary, putting it in its own process group
    /// so the bridge can collect orphaned grandchildren (spec §4.6:
    /// "session-wide orphan-collection so any subprocess reaped by the
    /// backend is logged, not lost") without being confused for its own exit.
    pub fn spawn(child_binary: &Path) -> Result<Self> {
        use tokio::process::unix::CommandExt as _;

        let mut cmd = tokio::process::Command::new(child_binary);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let mut child = cmd.spawn().with_context(|| format!("failed to spawn {}", child_binary.display()))?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        spawn_response_reader(stdout, pending.clone());
        spawn_stderr_logger(stderr);
        spawn_orphan_reaper();

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            tokens: TokenCounter::new(),
            pending,
        })
    }

    /// Issue a command and await its matching response, by token (the
    /// backend is not required to answer in issue order).
    pub async fn send_command(&self, cmd: &str, arguments: Option<serde_json::Value>) -> Result<ResponseBody> {
        let token = self.tokens.next();
        let frame = CommandFrame { cmd: cmd.to_string(), arguments, token };
        let mut payload = serde_json::to_vec(&frame)?;
        payload.push(b'\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(token, tx);
        }

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard.as_mut().ok_or_else(|| anyhow!("backend child's stdin is already closed"))?;
        stdin.write_all(&payload).await.context("writing command frame to backend child")?;
        drop(stdin_guard);

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => bail!("backend child closed before answering token {token}"),
            Err(_) => {
                self.pending.lock().await.remove(&token);
                bail!("command {cmd} (token {token}) timed out")
            }
        }
    }

    /// Stop sequence (spec §4.6): send `stop_vm`, drain, close pipes, then
    /// a bounded-attempt kill (graceful signal, then force).
    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.send_command("stop_vm", None).await {
            tracing::warn!(error = %e, "stop_vm did not complete cleanly");
        }

        // Drop stdin to close the parent's write end; the child observes
        // EOF on its request pipe and exits its event loop.
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(_status)) => return Ok(()),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for backend child"),
            Err(_) => tracing::warn!("backend child did not exit gracefully, escalating"),
        }

        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        }
        if tokio::time::timeout(FORCE_STOP_TIMEOUT, child.wait()).await.is_ok() {
            return Ok(());
        }

        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
        }
        child.wait().await.context("waiting for backend child after SIGKILL")?;
        Ok(())
    }

    /// Run until INT/TERM/HUP/ALRM, then `stop_vm`, mark the test failed,
    /// and exit non-zero (spec §4.6).
    pub async fn run_signal_guard(self: Arc<Self>) -> ! {
        use tokio::signal::unix::{signal, SignalKind};

        let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        let mut alrm = signal(SignalKind::alarm()).expect("install SIGALRM handler");

        let which = tokio::select! {
            _ = int.recv() => "SIGINT",
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
            _ = alrm.recv() => "SIGALRM",
        };

        tracing::error!(signal = which, "received signal, stopping vm and marking test failed");
        if let Err(e) = self.stop().await {
            tracing::error!(error = %e, "stop_vm during signal teardown failed");
        }
        std::process::exit(1);
    }
}

fn spawn_response_reader(stdout: tokio::process::ChildStdout, pending: PendingMap) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let frame: ResponseFrame = match serde_json::from_str(&line) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(error = %e, %line, "malformed response frame from backend child");
                            continue;
                        }
                    };
                    let waiter = pending.lock().await.remove(&frame.token);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(frame.rsp);
                        }
                        None => tracing::warn!(token = frame.token, "response for unknown or already-resolved token"),
                    }
                }
                Ok(None) => {
                    tracing::warn!("backend child closed its response pipe");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading backend child response pipe");
                    break;
                }
            }
        }
    });
}

fn spawn_stderr_logger(stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(%line, "backend child log");
        }
    });
}

/// Periodically reap any grandchild the backend process group leaves
/// behind, logging what was collected rather than letting it zombie.
fn spawn_orphan_reaper() {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            loop {
                match nix::sys::wait::waitpid(
                    nix::unistd::Pid::from_raw(-1),
                    Some(nix::sys::wait::WaitPidFlag::WNOHANG),
                ) {
                    Ok(nix::sys::wait::WaitStatus::StillAlive) => break,
                    Ok(status) => tracing::info!(?status, "collected orphaned subprocess"),
                    Err(_) => break,
                }
            }
        }
    });
}
