//! Configuration for supervised machines.

use crate::errors::{ConfigError, QemuResult};
use crate::runtime::constants::{console, emulator, timing, vm_defaults};
use crate::util::find_binary;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Architecture
// ============================================================================

/// Guest architecture. The tag doubles as the `qemu-system-<tag>` suffix.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "i386")]
    I386,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I386 => "i386",
        }
    }

    /// Emulator binary name for this architecture.
    pub fn emulator_binary(&self) -> String {
        format!("{}{}", emulator::BINARY_PREFIX, self.as_str())
    }

    pub fn is_x86(&self) -> bool {
        matches!(self, Arch::X86_64 | Arch::I386)
    }
}

impl FromStr for Arch {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "i386" | "x86" => Ok(Arch::I386),
            _ => Err(ConfigError::UnsupportedArch(s.to_string())),
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Machine Image
// ============================================================================

/// Bootable kernel (and optional initrd) supplied by the caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineImage {
    /// Identifying name, used in logs.
    pub name: String,
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
}

impl MachineImage {
    pub fn new(name: impl Into<String>, kernel_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kernel_path: kernel_path.into(),
            initrd_path: None,
        }
    }

    pub fn with_initrd(mut self, initrd_path: impl Into<PathBuf>) -> Self {
        self.initrd_path = Some(initrd_path.into());
        self
    }
}

// ============================================================================
// Machine Config
// ============================================================================

/// Everything needed to launch one machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineConfig {
    pub arch: Arch,
    pub image: MachineImage,
    pub disk_path: PathBuf,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,

    /// Debugger endpoint passed to `-gdb` (e.g. `tcp::1234`).
    #[serde(default)]
    pub debug: Option<String>,

    /// Run timeout; the machine is stopped once it elapses.
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Explicit emulator binary. Overrides the `PATH` lookup.
    #[serde(default)]
    pub emulator: Option<PathBuf>,
}

fn default_cpus() -> u32 {
    vm_defaults::DEFAULT_CPUS
}

fn default_memory_mib() -> u32 {
    vm_defaults::DEFAULT_MEMORY_MIB
}

impl MachineConfig {
    pub fn new(arch: Arch, image: MachineImage, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            arch,
            image,
            disk_path: disk_path.into(),
            cpus: default_cpus(),
            memory_mib: default_memory_mib(),
            debug: None,
            timeout: None,
            emulator: None,
        }
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Enable the gdb stub on `endpoint`.
    pub fn debug(mut self, endpoint: impl Into<String>) -> Self {
        self.debug = Some(endpoint.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn emulator(mut self, path: impl Into<PathBuf>) -> Self {
        self.emulator = Some(path.into());
        self
    }

    /// Timeout only counts when it is nonzero.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    /// Validate resources and paths, returning the resolved emulator binary.
    ///
    /// Order: emulator binary, resources, kernel, initrd, disk. Nothing is
    /// spawned here.
    pub fn validate(&self) -> QemuResult<PathBuf> {
        let binary = match &self.emulator {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => {
                return Err(ConfigError::BinaryNotFound {
                    binary: path.display().to_string(),
                    searched: "explicit path".to_string(),
                }
                .into());
            }
            None => find_binary(&self.arch.emulator_binary())?,
        };

        if self.cpus == 0 {
            return Err(ConfigError::InvalidResources("cpus must be at least 1".into()).into());
        }
        if self.memory_mib == 0 {
            return Err(
                ConfigError::InvalidResources("memory_mib must be at least 1".into()).into(),
            );
        }

        check_readable(&self.image.kernel_path)
            .map_err(|e| ConfigError::kernel(&self.image.kernel_path, e))?;
        if let Some(initrd) = &self.image.initrd_path {
            check_readable(initrd).map_err(|e| ConfigError::initrd(initrd, e))?;
        }
        check_readable(&self.disk_path).map_err(|e| ConfigError::disk(&self.disk_path, e))?;

        Ok(binary)
    }
}

fn check_readable(path: &Path) -> std::io::Result<()> {
    std::fs::File::open(path).map(|_| ())
}

// ============================================================================
// Supervisor Options
// ============================================================================

/// Timing and matching knobs for the supervisor and its monitors.
///
/// Defaults match the emulator's expected behavior; tests shorten them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorOptions {
    #[serde(default = "default_startup_grace")]
    pub startup_grace: Duration,

    #[serde(default = "default_stop_step")]
    pub stop_step: Duration,

    #[serde(default = "default_kill_reap")]
    pub kill_reap: Duration,

    #[serde(default = "default_panic_poll")]
    pub panic_poll: Duration,

    #[serde(default = "default_panic_settle")]
    pub panic_settle: Duration,

    #[serde(default = "default_port_budget")]
    pub port_budget: Duration,

    /// Plain substring; no anchoring.
    #[serde(default = "default_panic_signature")]
    pub panic_signature: String,
}

fn default_startup_grace() -> Duration {
    timing::STARTUP_GRACE
}

fn default_stop_step() -> Duration {
    timing::STOP_STEP
}

fn default_kill_reap() -> Duration {
    timing::KILL_REAP
}

fn default_panic_poll() -> Duration {
    timing::PANIC_POLL
}

fn default_panic_settle() -> Duration {
    timing::PANIC_SETTLE
}

fn default_port_budget() -> Duration {
    timing::PORT_ALLOCATION_BUDGET
}

fn default_panic_signature() -> String {
    console::PANIC_SIGNATURE.to_string()
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_grace: default_startup_grace(),
            stop_step: default_stop_step(),
            kill_reap: default_kill_reap(),
            panic_poll: default_panic_poll(),
            panic_settle: default_panic_settle(),
            port_budget: default_port_budget(),
            panic_signature: default_panic_signature(),
        }
    }
}
