//! Mock transport for testing
//!
//! Clones share one buffer set, so a test can hold a handle for
//! injecting chassis replies while the link owns another. Fault flags
//! let tests script write failures and stalls to drive the degraded
//! path.

use super::Transport;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// In-memory transport standing in for the chassis UART
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
    stall_writes: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockTransportInner {
                read_buffer: VecDeque::new(),
                write_buffer: Vec::new(),
                fail_reads: false,
                fail_writes: false,
                stall_writes: false,
            })),
        }
    }

    /// Queue bytes for the link to read
    pub fn inject_read(&self, data: &[u8]) {
        self.inner.lock().read_buffer.extend(data);
    }

    /// Copy of everything written so far
    pub fn get_written(&self) -> Vec<u8> {
        self.inner.lock().write_buffer.clone()
    }

    /// Drain and return everything written so far
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().write_buffer)
    }

    pub fn clear_written(&self) {
        self.inner.lock().write_buffer.clear();
    }

    /// Make subsequent reads fail with an I/O error
    pub fn fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Make subsequent writes fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Make subsequent writes accept zero bytes without failing
    pub fn stall_writes(&self, stall: bool) {
        self.inner.lock().stall_writes = stall;
    }
}

fn injected_fault(what: &str) -> crate::Error {
    crate::Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("injected {} fault", what),
    ))
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.fail_reads {
            return Err(injected_fault("read"));
        }
        let available = inner.read_buffer.len().min(buffer.len());
        for slot in buffer.iter_mut().take(available) {
            if let Some(b) = inner.read_buffer.pop_front() {
                *slot = b;
            }
        }
        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(injected_fault("write"));
        }
        if inner.stall_writes {
            return Ok(0);
        }
        inner.write_buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}
