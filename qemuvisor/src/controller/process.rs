//! Emulator process ownership: reaping and signal delivery.
//!
//! A single reaper task owns the [`Child`]. Everyone else reaches the process
//! through [`ProcessControl`], which forwards signals to the reaper. Because the
//! reaper is also the only one that waits on the child, a signal is never sent
//! to a pid that has already been reaped (and possibly reused).

use std::fmt;
use std::process::ExitStatus;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How the emulator process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited normally with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Waiting on the process failed; it is treated as gone.
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(sig)) => ExitOutcome::Signaled(sig),
            (None, None) => ExitOutcome::WaitFailed(status.to_string()),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }

    /// Message for a non-successful outcome.
    pub fn error_message(&self) -> Option<String> {
        if self.success() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit status: {}", code),
            ExitOutcome::Signaled(sig) => {
                let name = Signal::try_from(*sig)
                    .map(|s| s.as_str())
                    .unwrap_or("unknown");
                write!(f, "killed by signal {} ({})", sig, name)
            }
            ExitOutcome::WaitFailed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

enum Control {
    Signal {
        signal: Signal,
        ack: Option<oneshot::Sender<bool>>,
    },
}

/// Handle for signalling a reaper-owned process.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: u32,
    tx: mpsc::UnboundedSender<Control>,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Signal { signal, .. } => write!(f, "Signal({})", signal),
        }
    }
}

impl ProcessControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Deliver `signal` and wait for the reaper's verdict.
    ///
    /// Returns `true` if the signal reached a process that had not been reaped.
    pub async fn signal(&self, signal: Signal) -> bool {
        let (ack, verdict) = oneshot::channel();
        if self
            .tx
            .send(Control::Signal {
                signal,
                ack: Some(ack),
            })
            .is_err()
        {
            return false;
        }
        verdict.await.unwrap_or(false)
    }

    /// Fire-and-forget variant usable from synchronous contexts such as `Drop`.
    pub fn signal_nowait(&self, signal: Signal) {
        let _ = self.tx.send(Control::Signal { signal, ack: None });
    }
}

fn deliver(pid: u32, sig: Signal) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            tracing::debug!(pid, signal = %sig, "Signal delivered");
            true
        }
        Err(e) => {
            tracing::debug!(pid, signal = %sig, error = %e, "Signal delivery failed");
            false
        }
    }
}

/// Hand `child` to a reaper task.
///
/// `on_exit` runs exactly once, from the reaper, as soon as the process has
/// been waited on.
pub fn spawn_reaper<F>(mut child: Child, pid: u32, on_exit: F) -> (ProcessControl, JoinHandle<()>)
where
    F: FnOnce(ExitOutcome) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Control>();

    let handle = tokio::spawn(async move {
        let outcome = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => ExitOutcome::from_status(status),
                        Err(e) => {
                            tracing::warn!(pid, error = %e, "Failed to wait on emulator");
                            ExitOutcome::WaitFailed(e.to_string())
                        }
                    };
                }
                Some(control) = rx.recv() => {
                    match control {
                        Control::Signal { signal, ack } => {
                            let delivered = deliver(pid, signal);
                            if let Some(ack) = ack {
                                let _ = ack.send(delivered);
                            }
                        }
                    }
                }
            }
        };

        tracing::info!(pid, outcome = %outcome, "Emulator exited");
        on_exit(outcome);

        // Late requests are answered as undelivered.
        rx.close();
        while let Some(Control::Signal { ack, .. }) = rx.recv().await {
            if let Some(ack) = ack {
                let _ = ack.send(false);
            }
        }
    });

    (ProcessControl { pid, tx }, handle)
}
