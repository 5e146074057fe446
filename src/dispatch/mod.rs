//! Command dispatch
//!
//! All outbound traffic funnels through one writer thread, so frames
//! never interleave on the wire and the chassis sees at most one
//! unacknowledged command at a time. Submitters block on a bounded
//! queue, then on a per-command reply channel until the reader thread
//! resolves the matching ack or the deadline passes. Emergency stop
//! jumps the queue and interrupts the writer's in-flight wait; the
//! preempted command keeps waiting for its ack off to the side.

mod session;

pub use session::{SessionCounts, SessionId, SessionKind, SessionRegistry};

use crate::error::{Error, Result};
use crate::link::{Link, LinkState};
use crate::protocol::{Command, CorrId, TxFrame};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Extra slack on top of the ack deadline before a submitter gives up
/// on the writer's reply; covers scheduling, not the chassis.
const REPLY_GRACE: Duration = Duration::from_millis(100);

/// Writer wakeup slice while idle or waiting out a deadline
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Acknowledgement from the chassis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub corr: CorrId,
    pub status: u8,
}

/// Table matching inbound acks to waiting commands
///
/// The writer registers a correlation id before transmitting; the
/// reader resolves it when the ack frame arrives.
#[derive(Clone)]
pub struct PendingAcks {
    inner: Arc<Mutex<HashMap<CorrId, Sender<Ack>>>>,
}

impl PendingAcks {
    fn new() -> Self {
        PendingAcks {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn register(&self, corr: CorrId, tx: Sender<Ack>) {
        self.inner.lock().insert(corr, tx);
    }

    /// Deliver an ack; returns false when nothing was waiting for it
    pub fn resolve(&self, corr: CorrId, status: u8) -> bool {
        let Some(tx) = self.inner.lock().remove(&corr) else {
            return false;
        };
        let _ = tx.send(Ack { corr, status });
        true
    }

    fn remove(&self, corr: CorrId) {
        self.inner.lock().remove(&corr);
    }
}

struct QueueEntry {
    bytes: Vec<u8>,
    corr: CorrId,
    preempt: bool,
    reply_tx: Sender<Result<Ack>>,
    cancelled: Arc<AtomicBool>,
    deadline: Instant,
}

/// A transmitted command still waiting for its ack after being preempted
struct InFlight {
    corr: CorrId,
    reply_tx: Sender<Result<Ack>>,
    flight_rx: Receiver<Ack>,
    deadline: Instant,
}

struct DispatchInner {
    queue: Mutex<VecDeque<QueueEntry>>,
    queue_cv: Condvar,
    queue_depth: usize,
    preempt_tx: Sender<()>,
    pending: PendingAcks,
    link: Link,
    sessions: Arc<SessionRegistry>,
    ack_timeout: Duration,
    shutdown: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle for submitting commands to the chassis
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Dispatcher {
    /// Spawn the writer thread and return the submission handle
    pub fn start(
        link: Link,
        sessions: Arc<SessionRegistry>,
        ack_timeout: Duration,
        queue_depth: usize,
    ) -> Result<Dispatcher> {
        let (preempt_tx, preempt_rx) = bounded(1);
        let inner = Arc::new(DispatchInner {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            queue_depth,
            preempt_tx,
            pending: PendingAcks::new(),
            link,
            sessions,
            ack_timeout,
            shutdown: AtomicBool::new(false),
            writer: Mutex::new(None),
        });

        let writer_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("dispatch-writer".into())
            .spawn(move || writer_loop(&writer_inner, &preempt_rx))?;
        *inner.writer.lock() = Some(handle);

        Ok(Dispatcher { inner })
    }

    /// Ack table handle for the reader thread
    pub fn pending(&self) -> PendingAcks {
        self.inner.pending.clone()
    }

    /// Submit a command and block until it is acked, rejected, or timed out
    ///
    /// Motion commands must name a live session that is allowed to move
    /// the chassis. A command that times out is never retransmitted; a
    /// late ack for it is dropped by the reader. A deadline that expires
    /// while the link has gone silent reports `LinkReadTimeout` rather
    /// than `CommandTimeout`.
    pub fn submit(&self, cmd: Command, session: Option<SessionId>) -> Result<Ack> {
        if cmd.kind().is_motion() {
            let sid = session.ok_or_else(|| {
                Error::BadRequest("motion commands require a session".into())
            })?;
            self.inner.sessions.authorize_motion(sid)?;
        }
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if self.inner.link.state() == LinkState::Degraded {
            return Err(Error::LinkDegraded);
        }

        let corr = cmd.corr();
        let mut tx = TxFrame::new();
        tx.encode_command(&cmd);

        let (reply_tx, reply_rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = QueueEntry {
            bytes: tx.as_bytes().to_vec(),
            corr,
            preempt: cmd.kind().is_preempt(),
            reply_tx,
            cancelled: Arc::clone(&cancelled),
            deadline: Instant::now() + self.inner.ack_timeout,
        };
        log::debug!("Submitting {} command, corr {}", cmd.kind(), corr);
        self.enqueue(entry)?;

        match reply_rx.recv_timeout(self.inner.ack_timeout + REPLY_GRACE) {
            Ok(Ok(ack)) if ack.status == 0 => Ok(ack),
            Ok(Ok(ack)) => Err(Error::Rejected(ack.status)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                // The writer missed the deadline as well; make sure the
                // entry cannot be transmitted late and nothing leaks.
                cancelled.store(true, Ordering::Relaxed);
                self.inner.pending.remove(corr);
                Err(Error::CommandTimeout(corr))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Shutdown),
        }
    }

    fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut q = self.inner.queue.lock();
        if entry.preempt {
            q.push_front(entry);
            // Token may already be pending; the queue front carries the
            // actual work either way.
            let _ = self.inner.preempt_tx.try_send(());
        } else {
            while q.len() >= self.inner.queue_depth {
                if self.inner.shutdown.load(Ordering::Relaxed) {
                    return Err(Error::Shutdown);
                }
                if Instant::now() >= entry.deadline {
                    return Err(Error::CommandTimeout(entry.corr));
                }
                let _ = self.inner.queue_cv.wait_for(&mut q, WRITER_POLL);
            }
            q.push_back(entry);
        }
        drop(q);
        self.inner.queue_cv.notify_all();
        Ok(())
    }

    /// Stop the writer and fail all queued and in-flight commands
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.queue_cv.notify_all();
        let _ = self.inner.preempt_tx.try_send(());
        let handle = self.inner.writer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log::debug!("Dispatcher stopped");
    }
}

fn writer_loop(inner: &DispatchInner, preempt_rx: &Receiver<()>) {
    log::debug!("Dispatch writer started");
    let mut parked: Vec<InFlight> = Vec::new();

    loop {
        reap_parked(&mut parked, inner);
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let entry = {
            let mut q = inner.queue.lock();
            if q.is_empty() {
                let _ = inner.queue_cv.wait_for(&mut q, WRITER_POLL);
            }
            q.pop_front()
        };
        let Some(entry) = entry else { continue };
        // A slot opened up for blocked submitters
        inner.queue_cv.notify_all();

        if entry.cancelled.load(Ordering::Relaxed) {
            continue;
        }
        transmit(inner, preempt_rx, entry, &mut parked);
    }

    // Fail everything still waiting so no submitter blocks into shutdown
    let drained: Vec<QueueEntry> = inner.queue.lock().drain(..).collect();
    for entry in drained {
        let _ = entry.reply_tx.send(Err(Error::Shutdown));
    }
    for flight in parked.drain(..) {
        inner.pending.remove(flight.corr);
        let _ = flight.reply_tx.send(Err(Error::Shutdown));
    }
    log::debug!("Dispatch writer exiting");
}

/// Write one frame and wait for its resolution
///
/// The pending entry is registered before the write so an ack cannot
/// race past the table. An emergency stop arriving mid-wait parks the
/// current command and is transmitted immediately.
fn transmit(
    inner: &DispatchInner,
    preempt_rx: &Receiver<()>,
    entry: QueueEntry,
    parked: &mut Vec<InFlight>,
) {
    let (flight_tx, flight_rx) = bounded(1);
    inner.pending.register(entry.corr, flight_tx);
    if let Err(e) = inner.link.write_frame(&entry.bytes) {
        inner.pending.remove(entry.corr);
        let _ = entry.reply_tx.send(Err(e));
        return;
    }

    let current = InFlight {
        corr: entry.corr,
        reply_tx: entry.reply_tx,
        flight_rx,
        deadline: entry.deadline,
    };
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            inner.pending.remove(current.corr);
            let _ = current.reply_tx.send(Err(Error::Shutdown));
            return;
        }
        let now = Instant::now();
        if now >= current.deadline {
            inner.pending.remove(current.corr);
            let _ = current.reply_tx.send(Err(timeout_error(inner, current.corr)));
            return;
        }
        let wait = (current.deadline - now).min(WRITER_POLL);
        crossbeam_channel::select! {
            recv(current.flight_rx) -> msg => {
                match msg {
                    Ok(ack) => {
                        let _ = current.reply_tx.send(Ok(ack));
                    }
                    // Sender dropped: the submitter timed out and
                    // removed the entry itself.
                    Err(_) => {}
                }
                return;
            }
            recv(preempt_rx) -> _ => {
                let halt = {
                    let mut q = inner.queue.lock();
                    if q.front().map(|e| e.preempt).unwrap_or(false) {
                        q.pop_front()
                    } else {
                        None
                    }
                };
                let Some(halt) = halt else { continue };
                inner.queue_cv.notify_all();
                log::warn!(
                    "Emergency stop preempting in-flight command, corr {}",
                    current.corr
                );
                parked.push(current);
                if !halt.cancelled.load(Ordering::Relaxed) {
                    transmit(inner, preempt_rx, halt, parked);
                }
                return;
            }
            default(wait) => {}
        }
    }
}

/// Collect acks, deadlines, and abandonments for preempted commands
fn reap_parked(parked: &mut Vec<InFlight>, inner: &DispatchInner) {
    parked.retain_mut(|flight| match flight.flight_rx.try_recv() {
        Ok(ack) => {
            let _ = flight.reply_tx.send(Ok(ack));
            false
        }
        Err(TryRecvError::Disconnected) => false,
        Err(TryRecvError::Empty) => {
            if Instant::now() >= flight.deadline {
                inner.pending.remove(flight.corr);
                let _ = flight.reply_tx.send(Err(timeout_error(inner, flight.corr)));
                false
            } else {
                true
            }
        }
    });
}

/// A missed ack on a wire that has gone silent is a link fault, not a
/// fault of the one command. Telemetry flows continuously whenever the
/// chassis is alive, so staleness tells the two apart.
fn timeout_error(inner: &DispatchInner, corr: CorrId) -> Error {
    if inner.link.telemetry_fresh() {
        Error::CommandTimeout(corr)
    } else {
        Error::LinkReadTimeout
    }
}
