//! Relay process handles and liveness probing
//!
//! A relay's own bookkeeping is not trusted to tell whether it is still
//! running. [`RelayProcess::is_alive`] asks the kernel about the pid every
//! time, and a supervisor task reaps the child so an exited relay cannot
//! linger as a zombie that would still answer the probe.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{RelayError, Result};

/// Capability handle to a running relay
pub trait RelayHandle: Send + Sync + std::fmt::Debug {
    /// OS process id, if the relay is backed by a process
    fn pid(&self) -> Option<u32>;

    /// Whether the relay is still running and controllable
    fn is_alive(&self) -> bool;

    /// Ask the relay to stop (SIGTERM); does not wait
    fn terminate(&self);

    /// Stop the relay forcefully (SIGKILL); does not wait
    fn kill(&self);
}

/// Result of probing the process table for a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
    /// The probe itself failed (e.g. EPERM)
    Indeterminate(Errno),
}

impl Liveness {
    /// Only a positive answer counts as alive
    pub fn is_alive(self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// Probe the process table for `pid` with a null signal
pub fn probe(pid: u32) -> Liveness {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Liveness::Indeterminate(Errno::EINVAL),
    };

    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Gone,
        Err(errno) => Liveness::Indeterminate(errno),
    }
}

/// A relay running as a child process in its own process group
#[derive(Debug)]
pub struct RelayProcess {
    pid: u32,
    /// Set by the supervisor once the child has been reaped
    exited: Arc<AtomicBool>,
}

impl RelayProcess {
    /// Spawn `command` detached from the caller
    ///
    /// Returns as soon as the process exists; nothing is known yet about
    /// whether it will manage to serve. Must be called inside a tokio runtime.
    pub fn spawn(mut command: Command) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|e| RelayError::ProcessLaunch(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| RelayError::ProcessLaunch("process exited during spawn".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, "[relay] {}", line);
                }
            });
        }

        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = exited.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(pid, %status, "Relay process exited"),
                Err(e) => tracing::warn!(pid, "Failed to wait on relay process: {}", e),
            }
            exited_flag.store(true, Ordering::SeqCst);
        });

        tracing::info!(pid, "Relay process spawned");
        Ok(Self { pid, exited })
    }

    fn signal_group(&self, signal: Signal) {
        // The pid may already belong to someone else once reaped
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        if let Err(errno) = killpg(Pid::from_raw(raw), signal) {
            if errno != Errno::ESRCH {
                tracing::warn!(pid = self.pid, %signal, "Failed to signal relay: {}", errno);
            }
        }
    }
}

impl RelayHandle for RelayProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return false;
        }
        match probe(self.pid) {
            Liveness::Alive => true,
            Liveness::Gone => false,
            Liveness::Indeterminate(errno) => {
                tracing::warn!(pid = self.pid, "Liveness probe failed ({}), treating relay as dead", errno);
                false
            }
        }
    }

    fn terminate(&self) {
        tracing::debug!(pid = self.pid, "Terminating relay");
        self.signal_group(Signal::SIGTERM);
    }

    fn kill(&self) {
        self.signal_group(Signal::SIGKILL);
    }
}
