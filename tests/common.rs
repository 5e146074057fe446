//! Test utilities: a scripted chassis on the far side of a mock link.
//!
//! `ChassisSim` plays the firmware: it decodes every frame the daemon
//! writes, acknowledges it after a configurable delay, and answers
//! status requests with a canned telemetry frame. `Rig` assembles the
//! full daemon on top of the shared mock transport.

#![allow(dead_code)]

use parking_lot::Mutex;
use roverd::app::RoverApp;
use roverd::config::AppConfig;
use roverd::link::mock::MockTransport;
use roverd::link::{Link, Transport, TransportOpener};
use roverd::protocol::{Decoder, Frame, TelemetryFrame, TxFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
pub const STALENESS: Duration = Duration::from_millis(500);

/// Scripted firmware side of the link
pub struct ChassisSim {
    seen: Arc<Mutex<Vec<Frame>>>,
    respond: Arc<AtomicBool>,
    ack_delay: Arc<Mutex<Duration>>,
    telemetry: Arc<Mutex<TelemetryFrame>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChassisSim {
    pub fn start(mock: MockTransport) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(AtomicBool::new(true));
        let ack_delay = Arc::new(Mutex::new(Duration::ZERO));
        let telemetry = Arc::new(Mutex::new(TelemetryFrame::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let t_seen = Arc::clone(&seen);
        let t_respond = Arc::clone(&respond);
        let t_delay = Arc::clone(&ack_delay);
        let t_telemetry = Arc::clone(&telemetry);
        let t_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let mut decoder = Decoder::new();
            while !t_shutdown.load(Ordering::SeqCst) {
                let written = mock.take_written();
                if written.is_empty() {
                    thread::sleep(Duration::from_millis(2));
                    continue;
                }
                decoder.push(&written);
                while let Some(frame) = decoder.next_frame() {
                    t_seen.lock().push(frame.clone());
                    if !t_respond.load(Ordering::SeqCst) {
                        continue;
                    }
                    let delay = *t_delay.lock();
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    let mut tx = TxFrame::new();
                    match frame {
                        Frame::SetVelocity { corr, .. }
                        | Frame::SetServo { corr, .. }
                        | Frame::Halt { corr } => {
                            tx.set_ack(corr, 0);
                            mock.inject_read(tx.as_bytes());
                        }
                        Frame::RequestStatus { corr } => {
                            tx.set_ack(corr, 0);
                            mock.inject_read(tx.as_bytes());
                            let mut report = TxFrame::new();
                            report.set_telemetry(corr, &t_telemetry.lock());
                            mock.inject_read(report.as_bytes());
                        }
                        _ => {}
                    }
                }
            }
        });

        ChassisSim {
            seen,
            respond,
            ack_delay,
            telemetry,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Every frame decoded off the wire, in arrival order
    pub fn seen(&self) -> Vec<Frame> {
        self.seen.lock().clone()
    }

    /// Stop acknowledging (timeouts) or resume
    pub fn set_respond(&self, respond: bool) {
        self.respond.store(respond, Ordering::SeqCst);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock() = delay;
    }

    /// Telemetry frame returned for status requests
    pub fn set_telemetry(&self, frame: TelemetryFrame) {
        *self.telemetry.lock() = frame;
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChassisSim {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Daemon plus simulated chassis; the app drops (and sends its final
/// halt) before the chassis thread stops.
pub struct Rig {
    pub app: RoverApp,
    pub chassis: ChassisSim,
    pub mock: MockTransport,
}

pub fn rig_with_config(mut config: AppConfig) -> Rig {
    let mock = MockTransport::new();
    let opener_mock = mock.clone();
    let opener: TransportOpener =
        Box::new(move || Ok(Box::new(opener_mock.clone()) as Box<dyn Transport>));
    let link = Link::open(opener, WRITE_TIMEOUT, STALENESS).expect("open mock link");

    config.session.idle_timeout_ms = 5_000;
    config.dispatch.queue_depth = 8;

    let app = RoverApp::with_link(config, link).expect("assemble app");
    let chassis = ChassisSim::start(mock.clone());
    Rig { app, chassis, mock }
}

pub fn rig_with_ack(ack_ms: u64) -> Rig {
    let mut config = AppConfig::rover_defaults();
    config.timeouts.ack_ms = ack_ms;
    rig_with_config(config)
}

pub fn rig() -> Rig {
    rig_with_ack(600)
}

/// Poll `check` until it holds or `limit` passes
pub fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
