//! Machine lifecycle: state machine, supervisor and background monitors.

mod state;
mod supervisor;
mod watchers;

pub use state::{EscalationStep, MachineInfo, MachineState, MachineStatus, TerminationCause};
pub use supervisor::Supervisor;
