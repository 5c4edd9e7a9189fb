//! Hardware acceleration detection for the emulator.
//!
//! Unlike a hard requirement check, a missing accelerator is not an error:
//! the emulator falls back to software translation and only the
//! acceleration flag is left out of the invocation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::runtime::constants::accel;
use crate::runtime::options::Arch;

/// Accelerator the emulator should be asked to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceleration {
    /// Linux KVM (`-enable-kvm`).
    Kvm,
    /// macOS Hypervisor.framework (`-accel hvf -cpu host`).
    Hvf,
    /// Pure software emulation (TCG).
    None,
}

/// Host properties that decide the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFacts<'a> {
    pub kvm_device: bool,
    pub os: &'a str,
    pub host_arch: &'a str,
}

impl HostFacts<'static> {
    /// Probe the running host.
    pub fn probe() -> Self {
        Self {
            kvm_device: kvm_exists(),
            os: std::env::consts::OS,
            host_arch: std::env::consts::ARCH,
        }
    }
}

impl Acceleration {
    /// Pick the accelerator for `arch` given the host facts.
    ///
    /// KVM wins for x86 guests whenever the device node exists. Otherwise
    /// macOS hosts use hvf when the guest architecture is the host's own.
    pub fn select(arch: Arch, host: &HostFacts<'_>) -> Self {
        if arch.is_x86() && host.kvm_device {
            return Acceleration::Kvm;
        }

        if host.os == "macos" && host.host_arch == arch.as_str() {
            return Acceleration::Hvf;
        }

        Acceleration::None
    }
}

/// Detect the accelerator for `arch` on this host.
pub fn detect_acceleration(arch: Arch) -> Acceleration {
    let host = HostFacts::probe();
    let acceleration = Acceleration::select(arch, &host);
    tracing::debug!(
        %arch,
        kvm_device = host.kvm_device,
        os = host.os,
        ?acceleration,
        "Selected emulator acceleration"
    );
    acceleration
}

/// Whether the KVM device node is present.
pub fn kvm_exists() -> bool {
    Path::new(accel::KVM_DEVICE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux(kvm_device: bool) -> HostFacts<'static> {
        HostFacts {
            kvm_device,
            os: "linux",
            host_arch: "x86_64",
        }
    }

    #[test]
    fn test_kvm_selected_for_x86_when_device_present() {
        assert_eq!(Acceleration::select(Arch::X86_64, &linux(true)), Acceleration::Kvm);
        assert_eq!(Acceleration::select(Arch::I386, &linux(true)), Acceleration::Kvm);
    }

    #[test]
    fn test_no_acceleration_without_device() {
        assert_eq!(Acceleration::select(Arch::X86_64, &linux(false)), Acceleration::None);
    }

    #[test]
    fn test_hvf_on_matching_macos_host() {
        let host = HostFacts {
            kvm_device: false,
            os: "macos",
            host_arch: "x86_64",
        };
        assert_eq!(Acceleration::select(Arch::X86_64, &host), Acceleration::Hvf);
        assert_eq!(Acceleration::select(Arch::I386, &host), Acceleration::None);
    }

    #[test]
    fn test_no_hvf_on_foreign_macos_host() {
        let host = HostFacts {
            kvm_device: false,
            os: "macos",
            host_arch: "aarch64",
        };
        assert_eq!(Acceleration::select(Arch::X86_64, &host), Acceleration::None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_probe_matches_device_node() {
        // Result depends on whether /dev/kvm exists in the test environment
        let host = HostFacts::probe();
        assert_eq!(host.kvm_device, Path::new("/dev/kvm").exists());
        assert_eq!(host.os, "linux");
    }
}
