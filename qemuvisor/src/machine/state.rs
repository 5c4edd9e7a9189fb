//! Machine lifecycle status and state machine.
//!
//! Defines the possible states of a supervised machine, valid transitions
//! between them, and the terminal flags derived from them.

use std::net::SocketAddrV4;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::controller::ExitOutcome;
use crate::errors::{QemuError, QemuResult};
use crate::runtime::options::Arch;

/// Lifecycle status of a machine.
///
/// ```text
/// new()     → Configured (validated, nothing spawned)
/// start()   → Starting → Live
/// exit      → Died | KernelPanic | TimedOut
/// observed  → Reaped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    /// Configuration validated, no process yet.
    Configured,

    /// Port reserved and process being spawned (transient).
    Starting,

    /// Process running, monitors attached.
    Live,

    /// Process exited on its own or was stopped by the caller.
    Died,

    /// Process was stopped after a guest kernel panic.
    KernelPanic,

    /// Process was stopped by the timeout enforcer.
    TimedOut,

    /// Exit has been observed by the owner. Terminal.
    Reaped,
}

impl MachineStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, MachineStatus::Live)
    }

    /// Process has exited (whether or not the owner observed it).
    pub fn is_exited(&self) -> bool {
        matches!(
            self,
            MachineStatus::Died
                | MachineStatus::KernelPanic
                | MachineStatus::TimedOut
                | MachineStatus::Reaped
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(self, MachineStatus::Configured)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: MachineStatus) -> bool {
        use MachineStatus::*;
        matches!(
            (self, target),
            // Configured → Starting (start called)
            (Configured, Starting) |
            // Starting → Live (spawned) or back to Configured (failed before spawn)
            (Starting, Live) |
            (Starting, Configured) |
            // Live → exit, attributed to its cause
            (Live, Died) |
            (Live, KernelPanic) |
            (Live, TimedOut) |
            // A panic found in output after a self-exit still attributes the death
            (Died, KernelPanic) |
            // Exit observed by the owner
            (Died, Reaped) |
            (KernelPanic, Reaped) |
            (TimedOut, Reaped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Configured => "configured",
            MachineStatus::Starting => "starting",
            MachineStatus::Live => "live",
            MachineStatus::Died => "died",
            MachineStatus::KernelPanic => "kernel_panic",
            MachineStatus::TimedOut => "timed_out",
            MachineStatus::Reaped => "reaped",
        }
    }
}

impl std::str::FromStr for MachineStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configured" => Ok(MachineStatus::Configured),
            "starting" => Ok(MachineStatus::Starting),
            "live" => Ok(MachineStatus::Live),
            "died" => Ok(MachineStatus::Died),
            "kernel_panic" => Ok(MachineStatus::KernelPanic),
            "timed_out" => Ok(MachineStatus::TimedOut),
            "reaped" => Ok(MachineStatus::Reaped),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a monitor shut the machine down. The first recorded cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    Timeout,
    KernelPanic,
}

impl TerminationCause {
    fn status(&self) -> MachineStatus {
        match self {
            TerminationCause::Timeout => MachineStatus::TimedOut,
            TerminationCause::KernelPanic => MachineStatus::KernelPanic,
        }
    }
}

/// A shutdown step that was actually performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStep {
    /// Quit escape written to the emulator's stdin.
    QuitSequence,
    /// SIGTERM sent.
    Terminate,
    /// SIGKILL sent.
    Kill,
}

/// Mutable supervisor state, guarded by a single lock.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub status: MachineStatus,
    pub pid: Option<u32>,
    pub addr: Option<SocketAddrV4>,
    pub cause: Option<TerminationCause>,
    /// Process has exited (on its own or killed).
    pub died: bool,
    pub exit: Option<ExitOutcome>,
    /// Set once any path has entered the shutdown protocol.
    pub stop_requested: bool,
    pub escalation: Vec<EscalationStep>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            status: MachineStatus::Configured,
            pid: None,
            addr: None,
            cause: None,
            died: false,
            exit: None,
            stop_requested: false,
            escalation: Vec::new(),
            started_at: None,
            exited_at: None,
        }
    }

    /// Attempt state transition with validation.
    pub fn transition_to(&mut self, new_status: MachineStatus) -> QemuResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(QemuError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            )));
        }

        tracing::debug!(from = %self.status, to = %new_status, "Machine status change");
        self.status = new_status;
        Ok(())
    }

    /// Record the process as spawned and running.
    pub fn mark_live(&mut self, pid: u32, addr: SocketAddrV4) -> QemuResult<()> {
        self.transition_to(MachineStatus::Live)?;
        self.pid = Some(pid);
        self.addr = Some(addr);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Attribute the death to `cause` unless one is already recorded.
    ///
    /// Returns `true` if this call set the cause.
    pub fn record_cause(&mut self, cause: TerminationCause) -> bool {
        if self.cause.is_some() {
            return false;
        }
        self.cause = Some(cause);

        // Exit already recorded: reattribute the status if allowed.
        if self.died && self.status.can_transition_to(cause.status()) {
            self.status = cause.status();
        }
        true
    }

    /// Record the reaper's verdict. Called exactly once per process.
    pub fn record_exit(&mut self, outcome: ExitOutcome) {
        let target = self
            .cause
            .map(|c| c.status())
            .unwrap_or(MachineStatus::Died);

        if let Err(e) = self.transition_to(target) {
            tracing::warn!(error = %e, "Unexpected exit transition");
        }
        self.died = true;
        self.exit = Some(outcome);
        self.exited_at = Some(Utc::now());
    }

    /// Move an exited machine to `Reaped`. No-op otherwise.
    pub fn mark_reaped(&mut self) {
        if self.died && self.status.can_transition_to(MachineStatus::Reaped) {
            self.status = MachineStatus::Reaped;
        }
    }

    pub fn killed_by_timeout(&self) -> bool {
        self.cause == Some(TerminationCause::Timeout)
    }

    pub fn kernel_panic_detected(&self) -> bool {
        self.cause == Some(TerminationCause::KernelPanic)
    }

    /// Pid of a process that has not exited yet.
    pub fn live_pid(&self) -> Option<u32> {
        if self.died { None } else { self.pid }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of a machine for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct MachineInfo {
    pub name: String,
    pub arch: Arch,
    pub cpus: u32,
    pub memory_mib: u32,
    pub status: MachineStatus,
    pub pid: Option<u32>,
    pub addr: Option<SocketAddrV4>,
    pub died: bool,
    pub killed_by_timeout: bool,
    pub kernel_panic_detected: bool,
    pub exit: Option<ExitOutcome>,
    pub escalation: Vec<EscalationStep>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn live_state() -> MachineState {
        let mut state = MachineState::new();
        state.transition_to(MachineStatus::Starting).unwrap();
        state
            .mark_live(4242, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 20000))
            .unwrap();
        state
    }

    #[test]
    fn test_valid_transitions() {
        use MachineStatus::*;

        assert!(Configured.can_transition_to(Starting));
        assert!(!Configured.can_transition_to(Live));

        assert!(Starting.can_transition_to(Live));
        assert!(Starting.can_transition_to(Configured));
        assert!(!Starting.can_transition_to(Died));

        assert!(Live.can_transition_to(Died));
        assert!(Live.can_transition_to(KernelPanic));
        assert!(Live.can_transition_to(TimedOut));
        assert!(!Live.can_transition_to(Reaped));
        assert!(!Live.can_transition_to(Configured));

        assert!(Died.can_transition_to(Reaped));
        assert!(TimedOut.can_transition_to(Reaped));
        assert!(!TimedOut.can_transition_to(KernelPanic));
        assert!(!Reaped.can_transition_to(Live));
        assert!(!Reaped.can_transition_to(Starting));
    }

    #[test]
    fn test_status_roundtrip_str() {
        use MachineStatus::*;
        for status in [Configured, Starting, Live, Died, KernelPanic, TimedOut, Reaped] {
            assert_eq!(status.as_str().parse::<MachineStatus>(), Ok(status));
        }
        assert!("running".parse::<MachineStatus>().is_err());
    }

    #[test]
    fn test_invalid_transition_is_error() {
        let mut state = MachineState::new();
        let err = state.transition_to(MachineStatus::Live).unwrap_err();
        assert!(err.to_string().contains("configured to live"));
        assert_eq!(state.status, MachineStatus::Configured);
    }

    #[test]
    fn test_plain_exit() {
        let mut state = live_state();
        assert_eq!(state.live_pid(), Some(4242));

        state.record_exit(ExitOutcome::Exited(0));
        assert_eq!(state.status, MachineStatus::Died);
        assert!(state.died);
        assert!(!state.killed_by_timeout());
        assert!(!state.kernel_panic_detected());
        assert_eq!(state.live_pid(), None);
        assert!(state.exited_at.is_some());
    }

    #[test]
    fn test_cause_recorded_before_exit() {
        let mut state = live_state();
        assert!(state.record_cause(TerminationCause::Timeout));
        state.record_exit(ExitOutcome::Signaled(15));

        assert_eq!(state.status, MachineStatus::TimedOut);
        assert!(state.killed_by_timeout());
        assert!(!state.kernel_panic_detected());
    }

    #[test]
    fn test_first_cause_wins() {
        let mut state = live_state();
        assert!(state.record_cause(TerminationCause::KernelPanic));
        assert!(!state.record_cause(TerminationCause::Timeout));

        assert!(state.kernel_panic_detected());
        assert!(!state.killed_by_timeout());
    }

    #[test]
    fn test_panic_after_self_exit_reattributes() {
        let mut state = live_state();
        state.record_exit(ExitOutcome::Exited(0));
        assert!(state.record_cause(TerminationCause::KernelPanic));
        assert_eq!(state.status, MachineStatus::KernelPanic);
    }

    #[test]
    fn test_reaped_only_after_exit() {
        let mut state = live_state();
        state.mark_reaped();
        assert_eq!(state.status, MachineStatus::Live);

        state.record_exit(ExitOutcome::Exited(0));
        state.mark_reaped();
        assert_eq!(state.status, MachineStatus::Reaped);
        assert!(state.status.is_exited());
    }
}
