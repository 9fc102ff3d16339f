//! Host console sink for guest output
//!
//! Every vCPU runner of a VM holds a clone of the same [`OutputSink`]. Each
//! [`OutputSink::write`] happens under one lock, so output from concurrent
//! hypercalls never interleaves within a call.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

/// Shared, mutex-guarded byte sink
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    /// Create a sink writing to `writer`
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink writing to the process's standard output
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Sink that records everything written, plus a handle to read it back
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (Self::new(captured.clone()), captured)
    }

    /// Write `bytes` as one atomic unit with respect to other writers, then flush
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        trace!("Console TX: {} bytes", bytes.len());
        let mut out = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(bytes)?;
        out.flush()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// In-memory buffer behind [`OutputSink::capture`]
#[derive(Clone, Default, Debug)]
pub struct CapturedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    /// Everything written so far
    pub fn bytes(&self) -> Vec<u8> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Everything written so far as UTF-8, replacing invalid sequences
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
