use std::path::{Path, PathBuf};

use crate::errors::{ConfigError, QemuResult};
use crate::runtime::constants::envs;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod process;

pub use process::is_process_alive;

/// Find an executable on the host's `PATH`.
///
/// # Arguments
/// * `binary_name` - Name of the binary to find (e.g., "qemu-system-x86_64")
///
/// # Returns
/// * `Ok(PathBuf)` - Path to the first executable match
/// * `Err(...)` - Binary not found in any `PATH` entry
pub fn find_binary(binary_name: &str) -> QemuResult<PathBuf> {
    let candidates: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default();

    for dir in &candidates {
        let candidate = dir.join(binary_name);
        tracing::trace!("Finding binary {:?} in path: {:?}", binary_name, candidate);
        if is_executable(&candidate) {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate);
        }
    }

    let searched = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");

    Err(ConfigError::BinaryNotFound {
        binary: binary_name.to_string(),
        searched,
    }
    .into())
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Install the process-wide tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). With `log_dir`, output goes to a
/// daily rolling file through a non-blocking writer and the returned guard must be
/// kept alive to flush it. Repeated calls are no-ops.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_env(envs::RUST_LOG)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "qemuvisor.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            register_to_tracing(non_blocking, env_filter);
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true).with_thread_ids(false))
                .try_init();
            None
        }
    }
}

fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}
