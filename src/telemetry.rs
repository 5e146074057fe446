//! Telemetry hub
//!
//! Fans chassis feedback out to HTTP consumers. The hub keeps the
//! newest snapshot, a bounded history ring, and one pending slot per
//! subscriber. Slow subscribers never block the reader thread: a new
//! snapshot simply replaces the one they had not collected yet.

use crate::protocol::{from_milli, TelemetryFrame};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Normalized motor feedback, commanded and measured
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorFeedback {
    pub left_target: f64,
    pub left_actual: f64,
    pub right_target: f64,
    pub right_actual: f64,
}

/// Camera mast orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MastPose {
    pub pan_deg: u8,
    pub tilt_deg: u8,
}

/// One published telemetry observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonic sequence number, one per chassis frame
    pub seq: u64,
    /// Microseconds since the Unix epoch when the frame was decoded
    pub observed_at_us: u64,
    pub battery_mv: u16,
    pub battery_pct: u8,
    pub motors: MotorFeedback,
    pub mast: MastPose,
    pub fault_flags: u8,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

struct SubscriberSlot {
    id: u64,
    pending: Option<Arc<Snapshot>>,
}

struct HubState {
    latest: Option<Arc<Snapshot>>,
    history: VecDeque<Arc<Snapshot>>,
    slots: Vec<SubscriberSlot>,
    next_slot: u64,
    next_seq: u64,
    shutdown: bool,
}

struct HubInner {
    state: Mutex<HubState>,
    cv: Condvar,
    history_capacity: usize,
}

/// Shared telemetry fan-out point
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl TelemetryHub {
    pub fn new(history_capacity: usize) -> Self {
        TelemetryHub {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    latest: None,
                    history: VecDeque::with_capacity(history_capacity),
                    slots: Vec::new(),
                    next_slot: 1,
                    next_seq: 0,
                    shutdown: false,
                }),
                cv: Condvar::new(),
                history_capacity,
            }),
        }
    }

    /// Publish a decoded chassis frame to all consumers
    pub fn on_frame(&self, frame: &TelemetryFrame) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let snap = Arc::new(Snapshot {
            seq,
            observed_at_us: now_micros(),
            battery_mv: frame.battery_mv,
            battery_pct: frame.battery_pct.min(100),
            motors: MotorFeedback {
                left_target: from_milli(frame.left_target),
                left_actual: from_milli(frame.left_actual),
                right_target: from_milli(frame.right_target),
                right_actual: from_milli(frame.right_actual),
            },
            mast: MastPose {
                pan_deg: frame.pan_deg,
                tilt_deg: frame.tilt_deg,
            },
            fault_flags: frame.fault_flags,
        });
        state.latest = Some(Arc::clone(&snap));
        state.history.push_back(Arc::clone(&snap));
        while state.history.len() > self.inner.history_capacity {
            state.history.pop_front();
        }
        for slot in &mut state.slots {
            slot.pending = Some(Arc::clone(&snap));
        }
        drop(state);
        self.inner.cv.notify_all();
    }

    /// Most recent snapshot, if any telemetry has arrived
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner.state.lock().latest.clone()
    }

    /// Retained snapshots, oldest first
    pub fn history(&self) -> Vec<Arc<Snapshot>> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    /// Total frames published since startup
    pub fn frames_seen(&self) -> u64 {
        self.inner.state.lock().next_seq
    }

    /// Register a consumer; it starts out holding the current latest
    /// snapshot so late joiners see state immediately.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.inner.state.lock();
        let id = state.next_slot;
        state.next_slot += 1;
        let seeded = state.latest.clone();
        state.slots.push(SubscriberSlot {
            id,
            pending: seeded,
        });
        Subscription {
            hub: self.clone(),
            slot_id: id,
        }
    }

    /// Wake all subscribers and refuse further publishes
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        drop(state);
        self.inner.cv.notify_all();
    }
}

/// One consumer's view of the telemetry feed
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    hub: TelemetryHub,
    slot_id: u64,
}

impl Subscription {
    /// Wait up to `timeout` for a snapshot newer than the last one taken
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Arc<Snapshot>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.hub.inner.state.lock();
        loop {
            match state.slots.iter_mut().find(|s| s.id == self.slot_id) {
                Some(slot) => {
                    if let Some(snap) = slot.pending.take() {
                        return Some(snap);
                    }
                }
                None => return None,
            }
            if state.shutdown {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = self.hub.inner.cv.wait_for(&mut state, deadline - now);
        }
    }

    /// True once the hub has shut down
    pub fn is_shutdown(&self) -> bool {
        self.hub.inner.state.lock().shutdown
    }
}

impl Iterator for Subscription {
    type Item = Arc<Snapshot>;

    /// Block until the next snapshot, ending at hub shutdown
    fn next(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            if let Some(snap) = self.recv_timeout(Duration::from_millis(500)) {
                return Some(snap);
            }
            if self.is_shutdown() {
                return None;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.hub.inner.state.lock();
        state.slots.retain(|s| s.id != self.slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(left_target: i16) -> TelemetryFrame {
        TelemetryFrame {
            battery_mv: 12000,
            battery_pct: 80,
            left_target,
            left_actual: left_target,
            right_target: -left_target,
            right_actual: -left_target,
            pan_deg: 90,
            tilt_deg: 45,
            fault_flags: 0,
        }
    }

    #[test]
    fn test_latest_and_normalization() {
        let hub = TelemetryHub::new(8);
        assert!(hub.latest().is_none());

        hub.on_frame(&frame(500));
        let snap = hub.latest().unwrap();
        assert_eq!(snap.seq, 0);
        assert_eq!(snap.motors.left_target, 0.5);
        assert_eq!(snap.motors.right_target, -0.5);
        assert_eq!(snap.battery_pct, 80);
        assert_eq!(snap.mast.pan_deg, 90);
    }

    #[test]
    fn test_battery_percent_clamped() {
        let hub = TelemetryHub::new(8);
        let mut f = frame(0);
        f.battery_pct = 255;
        hub.on_frame(&f);
        assert_eq!(hub.latest().unwrap().battery_pct, 100);
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let hub = TelemetryHub::new(3);
        for i in 0..5 {
            hub.on_frame(&frame(i * 10));
        }
        let history = hub.history();
        assert_eq!(history.len(), 3);
        let seqs: Vec<u64> = history.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(hub.frames_seen(), 5);
    }

    #[test]
    fn test_subscriber_receives_and_coalesces() {
        let hub = TelemetryHub::new(8);
        let mut sub = hub.subscribe();

        hub.on_frame(&frame(100));
        hub.on_frame(&frame(200));
        hub.on_frame(&frame(300));

        // Slow consumer sees only the newest pending snapshot
        let snap = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(snap.motors.left_target, 0.3);
        assert!(sub.recv_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_new_subscriber_is_seeded_with_latest() {
        let hub = TelemetryHub::new(8);
        hub.on_frame(&frame(250));

        let mut sub = hub.subscribe();
        let snap = sub.recv_timeout(Duration::from_millis(20)).unwrap();
        assert_eq!(snap.motors.left_target, 0.25);
    }

    #[test]
    fn test_shutdown_wakes_blocked_subscriber() {
        let hub = TelemetryHub::new(8);
        let mut sub = hub.subscribe();

        let publisher = hub.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            publisher.shutdown();
        });

        let started = Instant::now();
        assert!(sub.recv_timeout(Duration::from_secs(5)).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sub.is_shutdown());
        waker.join().unwrap();
    }

    #[test]
    fn test_drop_unregisters_slot() {
        let hub = TelemetryHub::new(8);
        let sub = hub.subscribe();
        assert_eq!(hub.inner.state.lock().slots.len(), 1);
        drop(sub);
        assert_eq!(hub.inner.state.lock().slots.len(), 0);
    }

    #[test]
    fn test_publish_after_shutdown_is_ignored() {
        let hub = TelemetryHub::new(8);
        hub.on_frame(&frame(100));
        hub.shutdown();
        hub.on_frame(&frame(200));
        assert_eq!(hub.latest().unwrap().motors.left_target, 0.1);
        assert_eq!(hub.frames_seen(), 1);
    }
}
