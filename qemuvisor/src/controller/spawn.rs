//! Emulator subprocess spawning.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::errors::LaunchError;
use crate::vmm::EmulatorCommand;

/// A freshly spawned emulator with its three standard streams detached from
/// the [`Child`] handle.
pub(crate) struct SpawnedEmulator {
    pub child: Child,
    pub pid: u32,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawns the emulator with all standard streams piped.
///
/// # Arguments
/// * `command` - Resolved binary and argument list
///
/// # Returns
/// * `Ok(SpawnedEmulator)` - Running process and its pipes
/// * `Err(...)` - Spawn failed, or a pipe was missing (the child is killed on drop)
pub(crate) fn spawn_emulator(command: &EmulatorCommand) -> Result<SpawnedEmulator, LaunchError> {
    let mut cmd = Command::new(&command.binary);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(
        binary = %command.binary.display(),
        args = ?command.args,
        "Spawning emulator"
    );

    let mut child = cmd.spawn().map_err(|e| {
        tracing::error!(
            "Failed to spawn emulator at {}: {}",
            command.binary.display(),
            e
        );
        LaunchError::Spawn {
            binary: command.binary.clone(),
            source: e,
        }
    })?;

    let pid = child.id().ok_or(LaunchError::NoPid)?;
    let stdin = child.stdin.take().ok_or(LaunchError::Pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(LaunchError::Pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(LaunchError::Pipe("stderr"))?;

    tracing::info!(pid, binary = %command.binary.display(), "Emulator spawned");

    Ok(SpawnedEmulator {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}
