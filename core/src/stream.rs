//! Body streams handed out by a [`Connection`](crate::Connection).
//!
//! Streams refer to their transfer weakly: once the connection drops its
//! handle, a stream still held by the caller reports `Error::Closed`
//! instead of keeping the resource alive. Clones share one closed flag.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::debug;

use crate::engine::StreamingMode;
use crate::error::{Error, Result};
use crate::handle::TransferHandle;

#[derive(Debug)]
struct InputInner {
    handle: Weak<TransferHandle>,
    closed: AtomicBool,
}

/// Response body reader.
#[derive(Debug, Clone)]
pub struct InputStream {
    inner: Arc<InputInner>,
}

impl InputStream {
    pub(crate) fn new(handle: &Arc<TransferHandle>) -> Self {
        Self {
            inner: Arc::new(InputInner {
                handle: Arc::downgrade(handle),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Read up to `buf.len()` bytes; 0 means the body has ended.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let handle = self.inner.handle.upgrade().ok_or(Error::Closed)?;
        handle.read(buf)
    }

    /// Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether both values refer to the same stream.
    pub fn is_same(&self, other: &InputStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl io::Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl io::Read for &InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

#[derive(Debug)]
struct OutputInner {
    handle: Weak<TransferHandle>,
    mode: StreamingMode,
    written: AtomicU64,
    closed: AtomicBool,
    finished: AtomicBool,
    discarded: AtomicBool,
    redirected: OnceLock<String>,
}

/// Request body writer. Closing it finishes the body and waits for the
/// response head.
#[derive(Debug, Clone)]
pub struct OutputStream {
    inner: Arc<OutputInner>,
}

impl OutputStream {
    pub(crate) fn new(handle: &Arc<TransferHandle>, mode: StreamingMode) -> Self {
        Self {
            inner: Arc::new(OutputInner {
                handle: Arc::downgrade(handle),
                mode,
                written: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                discarded: AtomicBool::new(false),
                redirected: OnceLock::new(),
            }),
        }
    }

    /// Write some of `buf`, returning how much the engine accepted.
    ///
    /// In fixed-length mode a write that would exceed the declared length is
    /// refused before anything is sent.
    pub fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let written = self.inner.written.load(Ordering::SeqCst);
        if let Some(declared) = self.inner.mode.declared_length() {
            if written + buf.len() as u64 > declared {
                return Err(Error::Protocol(format!(
                    "expected {declared} bytes but received {}",
                    written + buf.len() as u64
                )));
            }
        }
        let handle = self.inner.handle.upgrade().ok_or(Error::Closed)?;
        let result = handle.write(buf);
        let n = match &result {
            Ok(n) => *n,
            Err(Error::Interrupted { transferred }) => *transferred,
            Err(_) => 0,
        };
        self.inner.written.fetch_add(n as u64, Ordering::SeqCst);
        result
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.inner.written.load(Ordering::SeqCst)
    }

    /// Finish the request body.
    ///
    /// Writing is refused from the first call on. A call that fails leaves
    /// the body unfinished and can be repeated. Once the body is finished,
    /// later calls do nothing.
    pub fn close(&self) -> Result<()> {
        if self.is_finished() || self.inner.discarded.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(declared) = self.inner.mode.declared_length() {
            let written = self.written();
            if written != declared {
                return Err(Error::Protocol(format!(
                    "expected {declared} bytes but received {written}"
                )));
            }
        }
        let handle = self.inner.handle.upgrade().ok_or(Error::Closed)?;
        if let Some(url) = handle.finish_output()? {
            let _ = self.inner.redirected.set(url);
        }
        self.inner.finished.store(true, Ordering::SeqCst);
        debug!(resource = %handle.id(), written = self.written(), "request body finished");
        Ok(())
    }

    /// Mark closed without finishing the body.
    pub(crate) fn discard(&self) {
        self.inner.discarded.store(true, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// The final URL when the engine followed redirects after the body.
    pub(crate) fn redirected(&self) -> Option<&str> {
        self.inner.redirected.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the body was completed successfully.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub fn is_same(&self, other: &OutputStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl io::Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.is_closed() {
            return Err(Error::Closed.into());
        }
        Ok(())
    }
}

impl io::Write for &OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.is_closed() {
            return Err(Error::Closed.into());
        }
        Ok(())
    }
}
