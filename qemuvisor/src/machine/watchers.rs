//! Background monitors: kernel panic detection and run timeout.
//!
//! Both hold only a weak reference to the machine. They exit quietly once the
//! owner has dropped it or once another path has started the shutdown.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::TerminationCause;
use super::supervisor::MachineInner;

/// Start the panic watcher.
///
/// Polls captured stdout for the panic signature. On the first match it lets
/// the console settle, attributes the death to the panic and stops the machine.
pub(crate) fn start_panic_watcher(machine: Weak<MachineInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some((poll, settle, signature)) = machine.upgrade().map(|m| {
            (
                m.options.panic_poll,
                m.options.panic_settle,
                m.options.panic_signature.clone().into_bytes(),
            )
        }) else {
            return;
        };

        loop {
            tokio::time::sleep(poll).await;

            let Some(inner) = machine.upgrade() else {
                debug!("Machine dropped, panic watcher exiting");
                return;
            };

            let (stop_requested, died) = {
                let state = inner.state.lock();
                (state.stop_requested, state.died)
            };
            if stop_requested {
                debug!("Shutdown in progress, panic watcher exiting");
                return;
            }

            if died {
                // Output written just before exit may still be in the pipe.
                inner.stdout.wait_closed(settle).await;
                if inner.stdout.contains(&signature) {
                    warn!("Kernel panic found in output of exited machine");
                    inner.state.lock().record_cause(TerminationCause::KernelPanic);
                }
                return;
            }

            if !inner.stdout.contains(&signature) {
                continue;
            }

            warn!(
                pid = ?inner.state.lock().pid,
                "Kernel panic detected, stopping machine"
            );
            drop(inner);
            tokio::time::sleep(settle).await;

            let Some(inner) = machine.upgrade() else {
                return;
            };
            let should_stop = {
                let mut state = inner.state.lock();
                state.record_cause(TerminationCause::KernelPanic);
                !state.stop_requested && !state.died
            };
            if should_stop {
                inner.stop().await;
            }
            return;
        }
    })
}

/// Start the timeout enforcer.
///
/// One-shot: after `timeout` elapses, marks the machine as timed out and stops
/// it if it is still running and nobody else is stopping it.
pub(crate) fn start_timeout_enforcer(
    machine: Weak<MachineInner>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let Some(inner) = machine.upgrade() else {
            return;
        };

        {
            let mut state = inner.state.lock();
            if state.died || state.stop_requested {
                return;
            }
            state.record_cause(TerminationCause::Timeout);
        }

        info!(timeout_ms = timeout.as_millis(), "Machine timed out, stopping");
        inner.stop().await;
    })
}
