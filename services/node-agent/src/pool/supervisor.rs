//! Supervision of one microVM process.
//!
//! The child runs in its own process group. A supervisor task owns the
//! `Child`, forwards its output to the log, and publishes the exit through a
//! watch channel that the pool's health checks read. Killing signals the
//! whole group so helper processes do not outlive the VM.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Handle to a supervised VM process.
#[derive(Debug)]
pub struct VmProcess {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl VmProcess {
    /// Spawn `command` in a new process group and start supervising it.
    pub fn spawn(mut command: Command, vm_id: &str) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, vm_id.to_string(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, vm_id.to_string(), true));
        }

        let (exit_tx, exited) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, pid, vm_id.to_string(), exit_tx, kill_rx));

        Ok(Self {
            pid,
            exited,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    /// OS process id, if the process was still running at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has exited.
    ///
    /// A lost supervisor counts as exited.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow() || self.exited.has_changed().is_err()
    }

    /// Receiver that flips to `true` when the process ends.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }

    /// Kill the process group and wait up to `grace` for the exit.
    pub async fn kill(&self, grace: Duration) {
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }

        let mut exited = self.exited.clone();
        let wait = exited.wait_for(|done| *done);
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(pid = ?self.pid, "VM process did not exit within grace period");
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    vm_id: String,
    exit_tx: watch::Sender<bool>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(vm_id = %vm_id, status = %status, "VM process exited"),
                Err(e) => warn!(vm_id = %vm_id, error = %e, "Failed to wait for VM process"),
            }
        }
        _ = kill_rx => {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            // Reap the leader; fall back to a direct kill if the group signal failed.
            if let Err(e) = child.kill().await {
                debug!(vm_id = %vm_id, error = %e, "Direct kill after group signal");
            }
            info!(vm_id = %vm_id, "VM process killed");
        }
    }

    let _ = exit_tx.send(true);
}

fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created by `process_group(0)`.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid = pgid, error = %std::io::Error::last_os_error(), "Process group kill failed");
    }
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R, vm_id: String, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if is_stderr {
            warn!(vm_id = %vm_id, line = %line, "Firecracker stderr");
        } else {
            info!(vm_id = %vm_id, line = %line, "Firecracker stdout");
        }
    }
}
