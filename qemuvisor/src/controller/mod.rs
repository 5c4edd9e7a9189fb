//! Emulator process management.
//!
//! Spawning with piped standard streams, capture of stdout/stderr into
//! growable buffers, and a reaper task that owns the child so that signal
//! delivery and reaping never race.

mod log_stream;
mod process;
mod spawn;

pub use log_stream::{CaptureState, OutputBuffer, StreamKind};
pub use process::ExitOutcome;

pub(crate) use log_stream::spawn_capture;
pub(crate) use process::{ProcessControl, spawn_reaper};
pub(crate) use spawn::{SpawnedEmulator, spawn_emulator};
