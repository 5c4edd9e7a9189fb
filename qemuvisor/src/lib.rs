//! qemuvisor: supervise a QEMU emulator process for automated kernel testing.
//!
//! A [`Supervisor`] validates a [`MachineConfig`], reserves a loopback
//! address:port forwarded to the guest's ssh port, launches
//! `qemu-system-<arch>`, captures its console output, watches for guest kernel
//! panics and an optional run timeout, and tears the process down with an
//! escalating quit → SIGTERM → SIGKILL sequence.
//!
//! ```ignore
//! let config = MachineConfig::new(Arch::X86_64, MachineImage::new("bzImage", kernel), disk)
//!     .timeout(Duration::from_secs(60));
//! let machine = Supervisor::new(config)?;
//! machine.start().await?;
//! let output = machine.remote()?.run_command("root", "uname -a").await?;
//! machine.stop().await;
//! assert!(!machine.kernel_panic_detected());
//! ```

pub mod controller;
pub mod errors;
pub mod machine;
pub mod net;
pub mod remote;
pub mod runtime;
pub mod util;
pub mod vmm;

pub use controller::{CaptureState, ExitOutcome, OutputBuffer};
pub use errors::{QemuError, QemuResult};
pub use machine::{EscalationStep, MachineInfo, MachineStatus, Supervisor, TerminationCause};
pub use net::{AddressStrategy, PortAllocator};
pub use remote::{OpenSshClient, RemoteExecutor};
pub use runtime::options::{Arch, MachineConfig, MachineImage, SupervisorOptions};
pub use util::init_logging;
pub use vmm::Acceleration;
