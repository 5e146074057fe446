//! Shared serial link with supervised reconnection
//!
//! One `Link` is shared by the dispatch writer and the reader thread.
//! A transport fault degrades the link: in-progress calls fail, later
//! calls fail fast, and a background supervisor reopens the device with
//! exponential backoff until the link is up again. Commands are never
//! queued across an outage.

mod serial;
#[allow(dead_code)] // Only exercised by tests
pub mod mock;

pub use serial::SerialTransport;

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Transport trait for chassis communication
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read (0 on poll timeout)
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes
    fn flush(&mut self) -> Result<()>;
}

/// Factory invoked by the supervisor each time the link needs (re)opening
pub type TransportOpener = Box<dyn Fn() -> Result<Box<dyn Transport>> + Send + Sync>;

/// First reconnect delay after a fault
const RECONNECT_INITIAL: Duration = Duration::from_millis(250);
/// Reconnect delay ceiling
const RECONNECT_MAX: Duration = Duration::from_secs(5);
/// Supervisor liveness poll while idle
const SUPERVISOR_POLL: Duration = Duration::from_millis(500);

const STATE_UP: u8 = 0;
const STATE_DEGRADED: u8 = 1;

/// Health of the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Degraded,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Degraded => "degraded",
        }
    }
}

/// Counters exposed through the status endpoint
#[derive(Debug, Clone)]
pub struct LinkStats {
    pub state: LinkState,
    pub frames_tx: u64,
    pub bytes_rx: u64,
    pub corrupt_frames: u64,
    pub reconnects: u64,
    pub telemetry_fresh: bool,
}

struct LinkInner {
    transport: Mutex<Option<Box<dyn Transport>>>,
    opener: TransportOpener,
    state: AtomicU8,
    shutdown: AtomicBool,
    // Set true when the supervisor should attempt a reopen
    wake: Mutex<bool>,
    wake_cv: Condvar,
    write_timeout: Duration,
    read_staleness: Duration,
    last_rx: Mutex<Option<Instant>>,
    frames_tx: AtomicU64,
    bytes_rx: AtomicU64,
    corrupt_frames: AtomicU64,
    reconnects: AtomicU64,
}

impl LinkInner {
    /// Mark the link degraded and wake the supervisor. The caller drops
    /// its transport handle itself, under the transport lock.
    fn degrade(&self, reason: &str) {
        self.state.store(STATE_DEGRADED, Ordering::Relaxed);
        log::warn!("Link degraded: {}", reason);
        let mut pending = self.wake.lock();
        *pending = true;
        self.wake_cv.notify_one();
    }
}

/// Handle to the supervised serial link
///
/// Cheap to clone; all clones observe the same transport and state.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    /// Open a link over whatever the opener produces
    ///
    /// The opener is retained for reconnection, so it must yield a fresh
    /// transport on every call.
    pub fn open(
        opener: TransportOpener,
        write_timeout: Duration,
        read_staleness: Duration,
    ) -> Result<Link> {
        let transport = (opener)().map_err(|e| Error::LinkUnavailable(e.to_string()))?;
        let inner = Arc::new(LinkInner {
            transport: Mutex::new(Some(transport)),
            opener,
            state: AtomicU8::new(STATE_UP),
            shutdown: AtomicBool::new(false),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            write_timeout,
            read_staleness,
            last_rx: Mutex::new(None),
            frames_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            corrupt_frames: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("link-supervisor".into())
            .spawn(move || supervisor_loop(weak))?;

        Ok(Link { inner })
    }

    /// Open a link over a serial device
    pub fn open_serial(
        device: &str,
        baud: u32,
        write_timeout: Duration,
        read_staleness: Duration,
    ) -> Result<Link> {
        let device = device.to_string();
        let opener: TransportOpener = Box::new(move || {
            let t = SerialTransport::open(&device, baud)?;
            Ok(Box::new(t) as Box<dyn Transport>)
        });
        Self::open(opener, write_timeout, read_staleness)
    }

    pub fn state(&self) -> LinkState {
        if self.inner.state.load(Ordering::Relaxed) == STATE_UP {
            LinkState::Up
        } else {
            LinkState::Degraded
        }
    }

    /// Write one complete frame, bounded by the write deadline
    ///
    /// Fails fast while the link is degraded. Any transport fault or a
    /// missed deadline degrades the link.
    pub fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if self.state() == LinkState::Degraded {
            return Err(Error::LinkDegraded);
        }

        let deadline = Instant::now() + self.inner.write_timeout;
        let mut guard = self.inner.transport.lock();
        let mut written = 0;
        while written < bytes.len() {
            if Instant::now() >= deadline {
                *guard = None;
                self.inner.degrade("write deadline exceeded");
                return Err(Error::LinkWriteTimeout);
            }
            let res = match guard.as_mut() {
                Some(t) => t.write(&bytes[written..]),
                None => return Err(Error::LinkDegraded),
            };
            match res {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(n) => written += n,
                Err(e) => {
                    *guard = None;
                    self.inner.degrade(&format!("write failed: {}", e));
                    return Err(Error::LinkDegraded);
                }
            }
        }
        let flushed = match guard.as_mut() {
            Some(t) => t.flush(),
            None => return Err(Error::LinkDegraded),
        };
        if let Err(e) = flushed {
            *guard = None;
            self.inner.degrade(&format!("flush failed: {}", e));
            return Err(Error::LinkDegraded);
        }
        self.inner.frames_tx.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read whatever bytes are available (returns 0 on poll timeout)
    pub fn read_chunk(&self, buf: &mut [u8]) -> Result<usize> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if self.state() == LinkState::Degraded {
            return Err(Error::LinkDegraded);
        }

        let mut guard = self.inner.transport.lock();
        let res = match guard.as_mut() {
            Some(t) => t.read(buf),
            None => return Err(Error::LinkDegraded),
        };
        match res {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.inner.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                *self.inner.last_rx.lock() = Some(Instant::now());
                Ok(n)
            }
            Err(e) => {
                *guard = None;
                self.inner.degrade(&format!("read failed: {}", e));
                Err(Error::LinkDegraded)
            }
        }
    }

    /// True while telemetry has been seen within the staleness window
    pub fn telemetry_fresh(&self) -> bool {
        self.inner
            .last_rx
            .lock()
            .map(|at| at.elapsed() <= self.inner.read_staleness)
            .unwrap_or(false)
    }

    /// Account corrupt frames detected by the decoder
    pub fn note_corrupt(&self, count: u64) {
        self.inner.corrupt_frames.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            state: self.state(),
            frames_tx: self.inner.frames_tx.load(Ordering::Relaxed),
            bytes_rx: self.inner.bytes_rx.load(Ordering::Relaxed),
            corrupt_frames: self.inner.corrupt_frames.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            telemetry_fresh: self.telemetry_fresh(),
        }
    }

    /// Release the device and stop the supervisor. Safe to call twice.
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        *self.inner.transport.lock() = None;
        let mut pending = self.inner.wake.lock();
        *pending = true;
        self.inner.wake_cv.notify_one();
        log::debug!("Link closed");
    }
}

/// Reopens the transport after faults, with exponential backoff.
///
/// Holds only a weak handle so the link can be dropped while the
/// supervisor sleeps; each pass re-upgrades and exits once the link is
/// gone or shut down.
fn supervisor_loop(weak: Weak<LinkInner>) {
    log::debug!("Link supervisor started");
    let mut backoff = RECONNECT_INITIAL;
    loop {
        let Some(inner) = weak.upgrade() else { break };
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let degraded_pending = {
            let mut pending = inner.wake.lock();
            if !*pending {
                let _ = inner.wake_cv.wait_for(&mut pending, SUPERVISOR_POLL);
            }
            let signalled = *pending;
            *pending = false;
            signalled
        };
        if !degraded_pending {
            continue;
        }
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match (inner.opener)() {
            Ok(t) => {
                *inner.transport.lock() = Some(t);
                *inner.last_rx.lock() = None;
                inner.state.store(STATE_UP, Ordering::Relaxed);
                inner.reconnects.fetch_add(1, Ordering::Relaxed);
                backoff = RECONNECT_INITIAL;
                log::info!("Link restored after reconnect");
            }
            Err(e) => {
                log::warn!("Reconnect failed: {}; next attempt in {:?}", e, backoff);
                let mut pending = inner.wake.lock();
                *pending = true;
                let _ = inner.wake_cv.wait_for(&mut pending, backoff);
                drop(pending);
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
    log::debug!("Link supervisor exiting");
}
