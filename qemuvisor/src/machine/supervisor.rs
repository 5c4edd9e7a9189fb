//! Supervisor: owns one emulator process for its whole lifetime.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::watch;

use super::state::{EscalationStep, MachineInfo, MachineState, MachineStatus};
use super::watchers;
use crate::controller::{
    ExitOutcome, OutputBuffer, ProcessControl, SpawnedEmulator, StreamKind, spawn_capture,
    spawn_emulator, spawn_reaper,
};
use crate::errors::{QemuError, QemuResult, RemoteError};
use crate::net::PortAllocator;
use crate::remote::{self, OpenSshClient};
use crate::runtime::constants::emulator;
use crate::runtime::options::{MachineConfig, SupervisorOptions};
use crate::vmm::EmulatorCommand;

/// State shared between the [`Supervisor`] and its background tasks.
///
/// Only the supervisor holds a strong reference; monitors and the reaper hold
/// `Weak` handles and give up once it is gone.
pub(crate) struct MachineInner {
    pub(crate) config: MachineConfig,
    pub(crate) options: SupervisorOptions,
    binary: PathBuf,

    pub(crate) state: Mutex<MachineState>,
    pub(crate) stdout: Arc<OutputBuffer>,
    pub(crate) stderr: Arc<OutputBuffer>,

    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    control: Mutex<Option<ProcessControl>>,
    exited: watch::Sender<bool>,

    /// Held by `start()` from `Starting` until the process is spawned.
    launch_gate: tokio::sync::Mutex<()>,

    /// Serializes the shutdown protocol. `true` once escalation has run.
    stop_gate: tokio::sync::Mutex<bool>,
}

impl MachineInner {
    fn record_exit(&self, outcome: ExitOutcome) {
        self.state.lock().record_exit(outcome);
        self.exited.send_replace(true);
    }

    fn died(&self) -> bool {
        self.state.lock().died
    }

    /// Wait until the reaper has recorded an exit. `false` on timeout.
    pub(crate) async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exited.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await,
            Ok(Ok(_))
        )
    }

    /// Shutdown protocol.
    ///
    /// Quit escape on stdin, then SIGTERM, then SIGKILL, each step only if the
    /// previous one did not produce an exit. Concurrent callers queue on the
    /// gate; only the first one escalates, the rest wait for the exit.
    /// A stop racing `start()` waits for the spawn and then escalates.
    pub(crate) async fn stop(&self) {
        drop(self.launch_gate.lock().await);
        {
            let mut state = self.state.lock();
            if state.pid.is_none() {
                return;
            }
            state.stop_requested = true;
        }

        let mut escalated = self.stop_gate.lock().await;
        let died = self.died();
        if *escalated || died {
            self.wait_for_exit(self.options.kill_reap).await;
            return self.close_stdin().await;
        }
        *escalated = true;

        let step = self.options.stop_step;

        self.send_quit().await;
        if self.wait_for_exit(step).await {
            tracing::debug!("Emulator quit on request");
            return self.close_stdin().await;
        }

        self.signal(EscalationStep::Terminate, Signal::SIGTERM).await;
        if self.wait_for_exit(step).await {
            return self.close_stdin().await;
        }

        self.signal(EscalationStep::Kill, Signal::SIGKILL).await;
        if !self.wait_for_exit(self.options.kill_reap).await {
            tracing::error!(
                pid = ?self.state.lock().pid,
                "Emulator not reaped after SIGKILL"
            );
        }
        self.close_stdin().await;
    }

    async fn send_quit(&self) {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return;
        };

        let result = async {
            pipe.write_all(&emulator::QUIT_SEQUENCE).await?;
            pipe.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.state.lock().escalation.push(EscalationStep::QuitSequence);
                tracing::debug!("Quit sequence sent");
            }
            Err(e) => tracing::debug!(error = %e, "Failed to write quit sequence"),
        }
    }

    async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Send `signal` through the reaper. Recorded only if it reached a live process.
    async fn signal(&self, step: EscalationStep, signal: Signal) -> bool {
        let Some(control) = self.control.lock().clone() else {
            return false;
        };

        let delivered = control.signal(signal).await;
        if delivered {
            self.state.lock().escalation.push(step);
            tracing::info!(pid = control.pid(), %signal, "Escalated emulator shutdown");
        }
        delivered
    }
}

/// Supervisor for a single emulator process.
///
/// Created from a validated [`MachineConfig`]. `start()` spawns the emulator
/// and its monitors; `stop()` tears it down. Dropping a live supervisor kills
/// the emulator.
pub struct Supervisor {
    inner: Arc<MachineInner>,
}

impl Supervisor {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// Validate `config` and create a supervisor with default options.
    pub fn new(config: MachineConfig) -> QemuResult<Self> {
        Self::with_options(config, SupervisorOptions::default())
    }

    /// Validate `config` and create a supervisor with explicit timings.
    ///
    /// Fails with a configuration error before anything is spawned.
    pub fn with_options(config: MachineConfig, options: SupervisorOptions) -> QemuResult<Self> {
        let binary = config.validate()?;
        tracing::debug!(
            arch = %config.arch,
            binary = %binary.display(),
            image = %config.image.name,
            "Machine configured"
        );

        let (exited, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(MachineInner {
                config,
                options,
                binary,
                state: Mutex::new(MachineState::new()),
                stdout: Arc::new(OutputBuffer::new()),
                stderr: Arc::new(OutputBuffer::new()),
                stdin: tokio::sync::Mutex::new(None),
                control: Mutex::new(None),
                exited,
                launch_gate: tokio::sync::Mutex::new(()),
                stop_gate: tokio::sync::Mutex::new(false),
            }),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Launch the emulator.
    ///
    /// Returns without waiting for the guest to boot. If the process exits
    /// within the startup grace interval, returns
    /// [`QemuError::ImmediateExit`] carrying its stderr; the monitors are
    /// attached either way. A `stop()` issued meanwhile is honored once the
    /// process exists, and `start()` then returns `Ok`.
    pub async fn start(&self) -> QemuResult<()> {
        let launching = self.inner.launch_gate.lock().await;
        {
            let mut state = self.inner.state.lock();
            if !state.status.can_start() {
                return Err(QemuError::InvalidState(format!(
                    "Machine is {}, cannot start",
                    state.status
                )));
            }
            state.transition_to(MachineStatus::Starting)?;
        }

        let addr = match self.launch().await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self
                    .inner
                    .state
                    .lock()
                    .transition_to(MachineStatus::Configured);
                return Err(e);
            }
        };
        drop(launching);

        let weak = Arc::downgrade(&self.inner);
        watchers::start_panic_watcher(weak.clone());
        if let Some(timeout) = self.inner.config.effective_timeout() {
            watchers::start_timeout_enforcer(weak, timeout);
        }

        tokio::time::sleep(self.inner.options.startup_grace).await;

        let (died, stop_requested, outcome) = {
            let state = self.inner.state.lock();
            (state.died, state.stop_requested, state.exit.clone())
        };
        if stop_requested {
            tracing::debug!(%addr, "Stop requested during startup");
            return Ok(());
        }
        if died {
            self.inner.stderr.wait_closed(self.inner.options.kill_reap).await;
            let status = outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let stderr = self.inner.stderr.to_string_lossy().trim().to_string();
            tracing::error!(%status, %stderr, "Emulator died immediately");
            return Err(QemuError::ImmediateExit { status, stderr });
        }

        tracing::info!(
            pid = ?self.pid(),
            %addr,
            arch = %self.inner.config.arch,
            "Machine started"
        );
        Ok(())
    }

    /// Reserve a forwarding address, spawn the emulator and attach its
    /// capture tasks and reaper.
    async fn launch(&self) -> QemuResult<SocketAddrV4> {
        let inner = &self.inner;

        let budget = inner.options.port_budget;
        let addr = tokio::task::spawn_blocking(move || PortAllocator::new().budget(budget).allocate())
            .await
            .map_err(|e| QemuError::Internal(format!("port allocation task failed: {}", e)))??;

        let command = EmulatorCommand::new(inner.binary.clone(), &inner.config, addr);
        let SpawnedEmulator {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        } = spawn_emulator(&command)?;

        spawn_capture(stdout, inner.stdout.clone(), StreamKind::Stdout);
        spawn_capture(stderr, inner.stderr.clone(), StreamKind::Stderr);
        *inner.stdin.lock().await = Some(stdin);

        inner.state.lock().mark_live(pid, addr)?;

        let weak = Arc::downgrade(inner);
        let (control, _reaper) = spawn_reaper(child, pid, move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.record_exit(outcome);
            }
        });
        *inner.control.lock() = Some(control);

        Ok(addr)
    }

    /// Stop the emulator, escalating from the quit sequence to SIGKILL.
    ///
    /// Safe to call concurrently and repeatedly; a machine that was never
    /// started or has already exited is not signalled again.
    pub async fn stop(&self) {
        self.inner.stop().await;
        self.inner.state.lock().mark_reaped();
    }

    /// Block until the emulator has exited or `timeout` elapses.
    ///
    /// Returns `true` if the exit was observed.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        if self.inner.state.lock().pid.is_none() {
            return false;
        }
        let exited = self.inner.wait_for_exit(timeout).await;
        if exited {
            self.inner.state.lock().mark_reaped();
        }
        exited
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &MachineConfig {
        &self.inner.config
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    pub fn status(&self) -> MachineStatus {
        self.inner.state.lock().status
    }

    /// Process exited on its own or was killed.
    pub fn died(&self) -> bool {
        self.inner.died()
    }

    pub fn killed_by_timeout(&self) -> bool {
        self.inner.state.lock().killed_by_timeout()
    }

    pub fn kernel_panic_detected(&self) -> bool {
        self.inner.state.lock().kernel_panic_detected()
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.inner.state.lock().exit.clone()
    }

    /// Recorded exit error, if the process did not exit cleanly.
    pub fn exit_error(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .exit
            .as_ref()
            .and_then(ExitOutcome::error_message)
    }

    /// Pid of the running emulator. `None` before start and after exit.
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.lock().live_pid()
    }

    /// Host address:port forwarded to the guest's ssh port.
    pub fn addr(&self) -> Option<SocketAddrV4> {
        self.inner.state.lock().addr
    }

    /// Captured stdout so far (lossy UTF-8).
    pub fn stdout(&self) -> String {
        self.inner.stdout.to_string_lossy()
    }

    /// Captured stderr so far (lossy UTF-8).
    pub fn stderr(&self) -> String {
        self.inner.stderr.to_string_lossy()
    }

    pub fn stdout_buffer(&self) -> &OutputBuffer {
        &self.inner.stdout
    }

    pub fn stderr_buffer(&self) -> &OutputBuffer {
        &self.inner.stderr
    }

    /// Shutdown steps performed so far, in order.
    pub fn escalation(&self) -> Vec<EscalationStep> {
        self.inner.state.lock().escalation.clone()
    }

    /// Ready-to-paste ssh command for the forwarded port.
    pub fn ssh_command(&self) -> Option<String> {
        self.addr().map(remote::ssh_command)
    }

    /// Remote command client bound to the forwarded port.
    pub fn remote(&self) -> QemuResult<OpenSshClient> {
        self.addr()
            .map(OpenSshClient::new)
            .ok_or_else(|| RemoteError::NotRunning.into())
    }

    pub fn info(&self) -> MachineInfo {
        let state = self.inner.state.lock();
        let config = &self.inner.config;
        MachineInfo {
            name: config.image.name.clone(),
            arch: config.arch,
            cpus: config.cpus,
            memory_mib: config.memory_mib,
            status: state.status,
            pid: state.pid,
            addr: state.addr,
            died: state.died,
            killed_by_timeout: state.killed_by_timeout(),
            kernel_panic_detected: state.kernel_panic_detected(),
            exit: state.exit.clone(),
            escalation: state.escalation.clone(),
            started_at: state.started_at,
            exited_at: state.exited_at,
            stdout_bytes: self.inner.stdout.len(),
            stderr_bytes: self.inner.stderr.len(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let live_pid = {
            let state = self.inner.state.lock();
            if state.status.is_live() { state.pid } else { None }
        };
        if let Some(pid) = live_pid
            && let Some(control) = self.inner.control.lock().as_ref()
        {
            tracing::warn!(pid, "Supervisor dropped while emulator running, killing");
            control.signal_nowait(Signal::SIGKILL);
        }
    }
}
