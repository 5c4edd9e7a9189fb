//! Output capture from the emulator's stdout/stderr.
//!
//! Each stream gets a dedicated task that drains the pipe in chunks and appends
//! them to a shared [`OutputBuffer`]. Buffers only grow; readers may take a
//! snapshot at any time and see everything appended so far.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Read size per pipe read.
const CHUNK_SIZE: usize = 1024;

/// Which standard stream a capture drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Completion state of a capture task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    /// Still reading.
    Open,
    /// Reached end-of-stream.
    Closed,
    /// Aborted on a read error.
    Failed(String),
}

/// Growable byte accumulator shared between a capture task and its readers.
#[derive(Debug)]
pub struct OutputBuffer {
    data: RwLock<Vec<u8>>,
    state: watch::Sender<CaptureState>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(CaptureState::Open);
        Self {
            data: RwLock::new(Vec::new()),
            state,
        }
    }

    pub fn append(&self, bytes: &[u8]) {
        self.data.write().extend_from_slice(bytes);
    }

    /// Copy of everything captured so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data.read()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plain substring search over the captured bytes.
    pub fn contains(&self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.data
            .read()
            .windows(needle.len())
            .any(|window| window == needle)
    }

    pub fn state(&self) -> CaptureState {
        self.state.borrow().clone()
    }

    /// Wait until the capture leaves [`CaptureState::Open`].
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s != CaptureState::Open))
            .await
            .is_ok()
    }

    fn finish(&self, state: CaptureState) {
        self.state.send_replace(state);
    }
}

/// Strips ANSI escape codes from a string.
///
/// Guest consoles emit color codes; they are removed before mirroring to tracing.
fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.next() == Some('[') {
                for next_char in chars.by_ref() {
                    if next_char == 'm' {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

fn mirror(kind: StreamKind, bytes: &[u8]) {
    let text = || strip_ansi_codes(&String::from_utf8_lossy(bytes));
    match kind {
        StreamKind::Stdout if tracing::enabled!(target: "qemu:stdout", tracing::Level::TRACE) => {
            tracing::trace!(target: "qemu:stdout", "{}", text().trim_end())
        }
        StreamKind::Stderr if tracing::enabled!(target: "qemu:stderr", tracing::Level::TRACE) => {
            tracing::trace!(target: "qemu:stderr", "{}", text().trim_end())
        }
        _ => {}
    }
}

/// Drain `reader` into `buffer` until end-of-stream.
///
/// Returns the number of bytes captured. Any read error other than an
/// interrupted read stops the loop and is returned.
pub async fn capture<R>(mut reader: R, buffer: &OutputBuffer, kind: StreamKind) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return Ok(total),
            Ok(n) => {
                buffer.append(&chunk[..n]);
                mirror(kind, &chunk[..n]);
                total += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Spawn a capture task for one stream.
///
/// The task's outcome is published through the buffer's [`CaptureState`];
/// it never propagates to the caller.
pub fn spawn_capture<R>(reader: R, buffer: Arc<OutputBuffer>, kind: StreamKind) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match capture(reader, &buffer, kind).await {
            Ok(total) => {
                tracing::debug!(stream = kind.as_str(), bytes = total, "Pipe closed, capture exiting");
                buffer.finish(CaptureState::Closed);
            }
            Err(e) => {
                tracing::warn!(stream = kind.as_str(), error = %e, "Failed to read from pipe");
                buffer.finish(CaptureState::Failed(e.to_string()));
            }
        }
    })
}
