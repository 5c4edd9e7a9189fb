//! Emulator invocation: acceleration detection and argument construction.

use std::net::SocketAddrV4;
use std::path::PathBuf;

pub mod args;
pub mod host_check;

pub use args::build_args;
pub use host_check::{Acceleration, detect_acceleration};

use crate::runtime::options::MachineConfig;

/// Concrete process invocation for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub acceleration: Acceleration,
}

impl EmulatorCommand {
    /// Resolve the invocation for `config`, probing the host for acceleration.
    pub fn new(binary: PathBuf, config: &MachineConfig, forward: SocketAddrV4) -> Self {
        let acceleration = detect_acceleration(config.arch);
        Self {
            args: build_args(config, forward, acceleration),
            binary,
            acceleration,
        }
    }
}
