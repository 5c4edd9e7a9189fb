//! Shared fixtures for qemuvisor integration tests.
//!
//! Tests never need a real emulator: [`FakeEmulator`] writes a `/bin/sh`
//! script named `qemu-system-x86_64` into a temp dir together with dummy
//! kernel and disk files, and the script acts out one [`Scenario`].

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Once;
use qemuvisor::{Arch, MachineConfig, MachineImage, Supervisor, SupervisorOptions};
use tempfile::TempDir;

/// Line the panicking scenario prints.
pub const PANIC_LINE: &str =
    "[    0.512345] Kernel panic - not syncing: VFS: Unable to mount root fs on unknown-block(0,0)";

/// Message the immediately-dying scenario prints to stderr.
pub const IMMEDIATE_EXIT_STDERR: &str =
    "qemu-system-x86_64: -hda disk.img: Could not open 'disk.img': Permission denied";

/// Behavior acted out by the fake emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Prints boot text and exits 0 on the two-byte quit escape.
    Responsive,
    /// Prints boot text then blocks, ignoring stdin. Dies on SIGTERM.
    Unresponsive,
    /// Like `Unresponsive` but ignores SIGTERM too.
    IgnoresTerm,
    /// Prints a kernel panic after a short boot, then hangs.
    Panicking,
    /// Writes to stderr and exits 1 right away.
    DiesImmediately,
    /// Prints a line every 50ms forever.
    Chatty,
}

impl Scenario {
    fn body(&self) -> String {
        match self {
            Scenario::Responsive => "echo 'SeaBIOS (version 1.16.2)'\n\
                 echo 'Booting from ROM...'\n\
                 dd bs=1 count=2 >/dev/null 2>&1\n\
                 exit 0"
                .to_string(),
            Scenario::Unresponsive => "echo 'Booting from ROM...'\n\
                 exec sleep 600"
                .to_string(),
            Scenario::IgnoresTerm => "trap '' TERM\n\
                 echo 'Booting from ROM...'\n\
                 while :; do sleep 0.1; done"
                .to_string(),
            Scenario::Panicking => format!(
                "echo '[    0.000000] Linux version 6.1.0'\n\
                 sleep 0.3\n\
                 echo '{}'\n\
                 exec sleep 600",
                PANIC_LINE
            ),
            Scenario::DiesImmediately => {
                format!("echo \"{}\" >&2\nexit 1", IMMEDIATE_EXIT_STDERR)
            }
            Scenario::Chatty => "while :; do echo '[ tick ]'; sleep 0.05; done".to_string(),
        }
    }
}

// ============================================================================
// FAKE EMULATOR
// ============================================================================

/// Temp dir holding a fake emulator, kernel and disk. Removed on drop.
pub struct FakeEmulator {
    dir: TempDir,
    pub emulator: PathBuf,
    pub kernel: PathBuf,
    pub disk: PathBuf,
}

impl FakeEmulator {
    pub fn new(scenario: Scenario) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let emulator = dir.path().join(Arch::X86_64.emulator_binary());
        let kernel = dir.path().join("bzImage");
        let disk = dir.path().join("disk.img");

        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$(dirname \"$0\")/args.txt\"\n{}\n",
            scenario.body()
        );
        write_executable(&emulator, &script);
        std::fs::write(&kernel, b"fake kernel").expect("Failed to write kernel");
        std::fs::write(&disk, b"fake disk").expect("Failed to write disk");

        Self {
            dir,
            emulator,
            kernel,
            disk,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// 1 CPU, 512 MiB x86_64 machine pointing at the fake emulator.
    pub fn config(&self) -> MachineConfig {
        MachineConfig::new(
            Arch::X86_64,
            MachineImage::new("bzImage", &self.kernel),
            &self.disk,
        )
        .emulator(&self.emulator)
    }

    /// Supervisor with [`fast_options`].
    pub fn supervisor(&self) -> Supervisor {
        self.supervisor_with(self.config())
    }

    pub fn supervisor_with(&self, config: MachineConfig) -> Supervisor {
        Supervisor::with_options(config, fast_options()).expect("Failed to create supervisor")
    }

    /// Arguments the emulator was invoked with, one per entry.
    ///
    /// `None` if the emulator never ran.
    pub fn recorded_args(&self) -> Option<Vec<String>> {
        std::fs::read_to_string(self.dir.path().join("args.txt"))
            .ok()
            .map(|s| s.lines().map(str::to_string).collect())
    }
}

fn write_executable(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, contents).expect("Failed to write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod script");
}

// ============================================================================
// OPTIONS AND HELPERS
// ============================================================================

/// Default escalation timings with a fast panic watcher.
pub fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        panic_poll: Duration::from_millis(50),
        panic_settle: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Whether a process with `pid` still exists.
pub fn process_exists(pid: u32) -> bool {
    qemuvisor::util::is_process_alive(pid)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Call `stop()` from `n` concurrent futures and wait for all of them.
pub async fn stop_concurrently(supervisor: &Supervisor, n: usize) {
    futures::future::join_all((0..n).map(|_| supervisor.stop())).await;
}

/// Install a test subscriber once per binary. Honors `RUST_LOG`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = qemuvisor::init_logging(None);
    });
}
