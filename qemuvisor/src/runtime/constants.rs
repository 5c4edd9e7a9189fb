//! Constants for the supervisor
//!
//! Centralized location for hardcoded timings, ranges, device paths and
//! magic strings exchanged with the emulator.

use std::time::Duration;

/// Emulator invocation.
pub mod emulator {
    /// Binary name prefix; the architecture tag is appended.
    pub const BINARY_PREFIX: &str = "qemu-system-";

    /// Kernel command line: root on the first disk, serial console, verbose logging.
    pub const KERNEL_APPEND: &str = "root=/dev/sda ignore_loglevel console=ttyS0 rw";

    /// Virtual NIC and its user-mode netdev id.
    pub const NET_DEVICE: &str = "e1000,netdev=n1";
    pub const NETDEV_ID: &str = "n1";

    /// Guest port the forwarded host address maps to (sshd).
    pub const GUEST_SSH_PORT: u16 = 22;

    /// Monitor escape: Ctrl-A (SOH) followed by `x` quits the emulator.
    pub const QUIT_SEQUENCE: [u8; 2] = [0x01, b'x'];
}

/// Host acceleration.
pub mod accel {
    /// KVM device node.
    pub const KVM_DEVICE: &str = "/dev/kvm";
}

/// Guest console markers.
pub mod console {
    /// Substring that identifies a guest kernel panic in stdout.
    pub const PANIC_SIGNATURE: &str = "Kernel panic";
}

/// Forwarding address ranges.
pub mod ports {
    use std::net::Ipv4Addr;

    /// Ports synthesized when random loopback addresses are available.
    pub const LOOPBACK_PORT_MIN: u16 = 10000;
    pub const LOOPBACK_PORT_MAX: u16 = 49999;

    /// Ports synthesized on the canonical loopback address.
    pub const CANONICAL_PORT_MIN: u16 = 1024;
    pub const CANONICAL_PORT_MAX: u16 = 65535;

    pub const CANONICAL_LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;
}

/// Machine resource defaults
pub mod vm_defaults {
    /// Default number of CPUs
    pub const DEFAULT_CPUS: u32 = 1;

    /// Default memory in MiB
    pub const DEFAULT_MEMORY_MIB: u32 = 512;
}

/// Supervisor timings.
pub mod timing {
    use super::Duration;

    /// Sleep after spawn to catch instant-death failures.
    pub const STARTUP_GRACE: Duration = Duration::from_millis(100);

    /// Wait between shutdown escalation steps.
    pub const STOP_STEP: Duration = Duration::from_millis(100);

    /// Upper bound on waiting for the reaper after SIGKILL.
    pub const KILL_REAP: Duration = Duration::from_secs(1);

    /// Panic watcher poll period.
    pub const PANIC_POLL: Duration = Duration::from_secs(1);

    /// Delay after a panic match so the trace can flush.
    pub const PANIC_SETTLE: Duration = Duration::from_secs(1);

    /// Budget for finding a free address:port.
    pub const PORT_ALLOCATION_BUDGET: Duration = Duration::from_secs(1);
}

pub mod envs {
    /// Log filter read by `util::init_logging`.
    pub const RUST_LOG: &str = "RUST_LOG";
}
