//! Daemon assembly and lifecycle
//!
//! [`RoverApp`] owns every long-lived component: the serial link, the
//! telemetry hub, the session registry, the dispatcher and the reader
//! thread. `main.rs` builds one from config and drives it until the
//! shutdown flag flips; integration tests build one over a mock
//! transport instead.

use crate::config::AppConfig;
use crate::dispatch::{Dispatcher, PendingAcks, SessionRegistry};
use crate::error::{Error, Result};
use crate::http::{ApiContext, HttpServer};
use crate::link::{Link, LinkState};
use crate::protocol::{Command, Decoder, Frame};
use crate::telemetry::TelemetryHub;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Main loop poll period; bounds signal response latency
const MAIN_POLL: Duration = Duration::from_millis(100);

/// How often the main loop logs link and session counters
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Reader backoff when the transport has no bytes
const READ_IDLE: Duration = Duration::from_millis(2);

/// Reader backoff while the link is degraded
const DEGRADED_IDLE: Duration = Duration::from_millis(100);

pub struct RoverApp {
    config: AppConfig,
    link: Link,
    hub: TelemetryHub,
    sessions: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    reader_shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    stopped: bool,
}

impl RoverApp {
    /// Build the full stack on the configured serial device.
    ///
    /// Fails if the device cannot be opened; after this first open the
    /// link supervisor owns reconnection.
    pub fn new(config: AppConfig) -> Result<RoverApp> {
        let link = Link::open_serial(
            &config.link.device,
            config.link.baud,
            config.timeouts.write(),
            config.timeouts.read_staleness(),
        )?;
        Self::assemble(config, link)
    }

    /// Build the full stack on an already-open link (tests use this
    /// with a mock transport).
    pub fn with_link(config: AppConfig, link: Link) -> Result<RoverApp> {
        Self::assemble(config, link)
    }

    fn assemble(config: AppConfig, link: Link) -> Result<RoverApp> {
        let hub = TelemetryHub::new(config.telemetry.history_capacity);
        let sessions = Arc::new(SessionRegistry::new(config.session.idle_timeout()));
        let dispatcher = Dispatcher::start(
            link.clone(),
            Arc::clone(&sessions),
            config.timeouts.ack(),
            config.dispatch.queue_depth,
        )?;

        let reader_shutdown = Arc::new(AtomicBool::new(false));
        let reader = spawn_link_reader(
            link.clone(),
            hub.clone(),
            dispatcher.pending(),
            Arc::clone(&reader_shutdown),
        )?;

        Ok(RoverApp {
            config,
            link,
            hub,
            sessions,
            dispatcher,
            reader_shutdown,
            reader: Some(reader),
            stopped: false,
        })
    }

    /// Handler context for the HTTP layer
    pub fn api_context(&self) -> ApiContext {
        ApiContext {
            dispatcher: self.dispatcher.clone(),
            sessions: Arc::clone(&self.sessions),
            hub: self.hub.clone(),
            link: self.link.clone(),
            drive: self.config.drive.clone(),
            protocol: self.config.link.protocol,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn hub(&self) -> TelemetryHub {
        self.hub.clone()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    pub fn link(&self) -> Link {
        self.link.clone()
    }

    /// Serve until `running` goes false, then shut everything down.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        let mut server = HttpServer::start(&self.config.http.bind_addr, self.api_context())?;
        log::info!("Rover controller running. Press Ctrl-C to stop.");

        let mut last_stats = Instant::now();
        while running.load(Ordering::Relaxed) {
            thread::sleep(MAIN_POLL);
            let now = Instant::now();
            if now.duration_since(last_stats) >= STATS_INTERVAL {
                self.log_statistics();
                last_stats = now;
            }
        }

        log::info!("Shutting down...");
        server.stop();
        self.stop_all();
        Ok(())
    }

    fn log_statistics(&self) {
        let stats = self.link.stats();
        let counts = self.sessions.counts();
        log::info!(
            "Link {}: {} frames tx, {} bytes rx, {} corrupt, {} reconnects | {} sessions | {} telemetry frames",
            stats.state.as_str(),
            stats.frames_tx,
            stats.bytes_rx,
            stats.corrupt_frames,
            stats.reconnects,
            counts.live,
            self.hub.frames_seen(),
        );
    }

    /// Tear down in dependency order: final halt while the reader can
    /// still resolve its ack, then dispatcher, hub, reader, link.
    pub fn stop_all(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if self.link.state() == LinkState::Up {
            match self.dispatcher.submit(Command::halt(), None) {
                Ok(_) => log::info!("Final halt acknowledged"),
                Err(e) => log::warn!("Final halt not confirmed: {}", e),
            }
        }

        self.dispatcher.shutdown();
        self.hub.shutdown();
        self.reader_shutdown.store(true, Ordering::SeqCst);
        self.link.close();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        log::info!("Rover controller stopped");
    }
}

impl Drop for RoverApp {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Spawn the reader thread that drains the link into the decoder.
///
/// Acks are resolved against the pending table; telemetry goes to the
/// hub; anything else from the chassis is logged and dropped. The
/// decoder's corrupt count is folded into the link stats as it grows.
pub fn spawn_link_reader(
    link: Link,
    hub: TelemetryHub,
    pending: PendingAcks,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new().name("link-reader".into()).spawn(move || {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 256];
        let mut corrupt_seen = 0u64;

        while !shutdown.load(Ordering::SeqCst) {
            match link.read_chunk(&mut buf) {
                Ok(0) => thread::sleep(READ_IDLE),
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    while let Some(frame) = decoder.next_frame() {
                        handle_frame(frame, &hub, &pending);
                    }
                    let corrupt = decoder.corrupt_frames();
                    if corrupt > corrupt_seen {
                        link.note_corrupt(corrupt - corrupt_seen);
                        corrupt_seen = corrupt;
                    }
                }
                Err(Error::Shutdown) => break,
                Err(Error::LinkDegraded) => thread::sleep(DEGRADED_IDLE),
                Err(e) => {
                    log::warn!("Link read error: {}", e);
                    thread::sleep(DEGRADED_IDLE);
                }
            }
        }
        log::debug!("Reader thread exiting");
    })?;
    Ok(handle)
}

fn handle_frame(frame: Frame, hub: &TelemetryHub, pending: &PendingAcks) {
    match frame {
        Frame::Ack { corr, status } => {
            if !pending.resolve(corr, status) {
                log::trace!("Dropping ack for abandoned correlation id {}", corr);
            }
        }
        Frame::Telemetry { data, .. } => hub.on_frame(&data),
        other => {
            log::debug!("Unexpected frame from chassis: {:?}", other);
        }
    }
}
