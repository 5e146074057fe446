//! API handlers
//!
//! Thin translation layer: JSON bodies in, dispatcher and registries
//! underneath, JSON bodies out. Handlers return `Result<HttpResponse>`
//! and the router converts errors through the shared taxonomy.

use super::request::Request;
use super::response::HttpResponse;
use crate::config::DriveConfig;
use crate::dispatch::{Dispatcher, SessionKind, SessionRegistry};
use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::{Command, ProtocolVersion};
use crate::telemetry::{Snapshot, TelemetryHub};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Longest drive a single request may ask for
const MAX_DRIVE_SECS: f64 = 30.0;

/// Everything a connection thread needs to serve the API
#[derive(Clone)]
pub struct ApiContext {
    pub dispatcher: Dispatcher,
    pub sessions: Arc<SessionRegistry>,
    pub hub: TelemetryHub,
    pub link: Link,
    pub drive: DriveConfig,
    pub protocol: ProtocolVersion,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub linear: f64,
    pub angular: f64,
    pub session: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DriveDirection {
    Forward,
    Backward,
}

#[derive(Debug, Deserialize)]
pub struct DriveRequest {
    pub direction: DriveDirection,
    pub distance_cm: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    pub session: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TurnDirection {
    Left,
    Right,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub direction: TurnDirection,
    #[serde(default)]
    pub speed: Option<f64>,
    pub session: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServoRequest {
    pub channel: u8,
    pub angle: u8,
    pub session: u64,
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    status: &'static str,
    corr: u16,
}

impl CommandAccepted {
    fn new(corr: u16) -> Self {
        CommandAccepted { status: "ok", corr }
    }
}

#[derive(Debug, Serialize)]
struct SessionGranted {
    status: &'static str,
    id: u64,
    exclusive: bool,
}

#[derive(Debug, Serialize)]
struct DriveCompleted {
    status: &'static str,
    corr: u16,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct LinkHealth {
    state: &'static str,
    frames_tx: u64,
    bytes_rx: u64,
    corrupt_frames: u64,
    reconnects: u64,
    telemetry_fresh: bool,
}

#[derive(Debug, Serialize)]
struct SessionHealth {
    live: usize,
    exclusive_held: bool,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
    link: LinkHealth,
    sessions: SessionHealth,
    telemetry: Option<Snapshot>,
}

#[derive(Debug, Serialize)]
struct HistoryBody {
    status: &'static str,
    count: usize,
    history: Vec<Snapshot>,
}

#[derive(Debug, Serialize)]
struct IdentifyBody {
    status: &'static str,
    name: &'static str,
    version: &'static str,
    protocol: &'static str,
    link: &'static str,
}

/// GET /
pub fn identify(ctx: &ApiContext) -> HttpResponse {
    HttpResponse::json(
        200,
        &IdentifyBody {
            status: "ok",
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            protocol: ctx.protocol.as_str(),
            link: ctx.link.state().as_str(),
        },
    )
}

/// POST /api/session
///
/// Empty body grants a shared session.
pub fn acquire_session(ctx: &ApiContext, req: &Request) -> Result<HttpResponse> {
    let wants_exclusive = if req.body.is_empty() {
        false
    } else {
        let body: SessionRequest = req.json_body()?;
        body.exclusive
    };
    let kind = if wants_exclusive {
        SessionKind::Exclusive
    } else {
        SessionKind::Shared
    };
    let id = ctx.sessions.acquire(kind)?;
    Ok(HttpResponse::json(
        200,
        &SessionGranted {
            status: "ok",
            id,
            exclusive: wants_exclusive,
        },
    ))
}

/// DELETE /api/session/{id}
pub fn release_session(ctx: &ApiContext, id: u64) -> Result<HttpResponse> {
    ctx.sessions.release(id)?;
    #[derive(Serialize)]
    struct Released {
        status: &'static str,
        id: u64,
    }
    Ok(HttpResponse::json(200, &Released { status: "ok", id }))
}

/// POST /api/move
pub fn do_move(ctx: &ApiContext, req: &MoveRequest) -> Result<HttpResponse> {
    let cmd = Command::set_velocity(req.linear, req.angular)?;
    let ack = ctx.dispatcher.submit(cmd, Some(req.session))?;
    Ok(HttpResponse::json(200, &CommandAccepted::new(ack.corr)))
}

/// POST /api/turn
pub fn do_turn(ctx: &ApiContext, req: &TurnRequest) -> Result<HttpResponse> {
    let speed = effective_speed(req.speed, &ctx.drive)?;
    let angular = match req.direction {
        TurnDirection::Left => speed,
        TurnDirection::Right => -speed,
    };
    let cmd = Command::set_velocity(0.0, angular)?;
    let ack = ctx.dispatcher.submit(cmd, Some(req.session))?;
    Ok(HttpResponse::json(200, &CommandAccepted::new(ack.corr)))
}

/// POST /api/servo
pub fn do_servo(ctx: &ApiContext, req: &ServoRequest) -> Result<HttpResponse> {
    let cmd = Command::set_servo(req.channel, req.angle)?;
    let ack = ctx.dispatcher.submit(cmd, Some(req.session))?;
    Ok(HttpResponse::json(200, &CommandAccepted::new(ack.corr)))
}

/// POST /api/stop
///
/// Deliberately sessionless: anyone may stop the rover, any time.
pub fn do_stop(ctx: &ApiContext) -> Result<HttpResponse> {
    let ack = ctx.dispatcher.submit(Command::halt(), None)?;
    Ok(HttpResponse::json(200, &CommandAccepted::new(ack.corr)))
}

/// POST /api/drive
///
/// Distance-based composite: drive at the requested speed for the
/// computed duration, then command zero velocity. The zero-velocity leg
/// must not be skipped, so a failure there falls back to emergency stop.
pub fn do_drive(ctx: &ApiContext, req: &DriveRequest) -> Result<HttpResponse> {
    let speed = effective_speed(req.speed, &ctx.drive)?;
    if !req.distance_cm.is_finite() || req.distance_cm <= 0.0 {
        return Err(Error::BadRequest("distance_cm must be positive".into()));
    }
    let secs = drive_seconds(req.distance_cm, speed, &ctx.drive);
    if secs > MAX_DRIVE_SECS {
        return Err(Error::BadRequest(format!(
            "drive of {:.1}s exceeds the {:.0}s limit",
            secs, MAX_DRIVE_SECS
        )));
    }

    let signed = match req.direction {
        DriveDirection::Forward => speed,
        DriveDirection::Backward => -speed,
    };
    let cmd = Command::set_velocity(signed, 0.0)?;
    let ack = ctx.dispatcher.submit(cmd, Some(req.session))?;

    thread::sleep(Duration::from_secs_f64(secs));

    let stop = Command::set_velocity(0.0, 0.0)?;
    match ctx.dispatcher.submit(stop, Some(req.session)) {
        Ok(_) => Ok(HttpResponse::json(
            200,
            &DriveCompleted {
                status: "ok",
                corr: ack.corr,
                duration_ms: (secs * 1000.0) as u64,
            },
        )),
        Err(e) => {
            log::error!(
                "Failed to end timed drive cleanly ({}), sending emergency stop",
                e
            );
            let _ = ctx.dispatcher.submit(Command::halt(), None);
            Err(e)
        }
    }
}

/// GET /api/status
pub fn status(ctx: &ApiContext) -> HttpResponse {
    let stats = ctx.link.stats();
    let counts = ctx.sessions.counts();
    HttpResponse::json(
        200,
        &StatusBody {
            status: "ok",
            link: LinkHealth {
                state: stats.state.as_str(),
                frames_tx: stats.frames_tx,
                bytes_rx: stats.bytes_rx,
                corrupt_frames: stats.corrupt_frames,
                reconnects: stats.reconnects,
                telemetry_fresh: stats.telemetry_fresh,
            },
            sessions: SessionHealth {
                live: counts.live,
                exclusive_held: counts.exclusive_held,
            },
            telemetry: ctx.hub.latest().map(|snap| (*snap).clone()),
        },
    )
}

/// GET /api/history
pub fn history(ctx: &ApiContext) -> HttpResponse {
    let history: Vec<Snapshot> = ctx
        .hub
        .history()
        .iter()
        .map(|snap| (**snap).clone())
        .collect();
    HttpResponse::json(
        200,
        &HistoryBody {
            status: "ok",
            count: history.len(),
            history,
        },
    )
}

/// Resolve and validate the normalized speed for drive/turn requests
fn effective_speed(speed: Option<f64>, cfg: &DriveConfig) -> Result<f64> {
    let speed = speed.unwrap_or(cfg.default_speed);
    if !speed.is_finite() || speed <= 0.0 || speed > 1.0 {
        return Err(Error::BadRequest(format!(
            "speed {} outside (0.0, 1.0]",
            speed
        )));
    }
    Ok(speed)
}

/// Seconds needed to cover `distance_cm` at a normalized speed
///
/// Calibration says the rover covers `speed_cm_per_s` centimeters per
/// second at `default_speed`; ground speed scales linearly from there.
pub(crate) fn drive_seconds(distance_cm: f64, speed: f64, cfg: &DriveConfig) -> f64 {
    let ground_speed = cfg.speed_cm_per_s * (speed / cfg.default_speed);
    distance_cm / ground_speed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_cfg() -> DriveConfig {
        DriveConfig {
            speed_cm_per_s: 10.0,
            default_speed: 0.3,
        }
    }

    #[test]
    fn test_drive_seconds_at_default_speed() {
        // 50cm at the calibrated 10cm/s takes 5s
        let secs = drive_seconds(50.0, 0.3, &drive_cfg());
        assert!((secs - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_drive_seconds_scales_with_speed() {
        // Doubling the normalized speed halves the duration
        let slow = drive_seconds(30.0, 0.3, &drive_cfg());
        let fast = drive_seconds(30.0, 0.6, &drive_cfg());
        assert!((slow / fast - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_effective_speed_validation() {
        let cfg = drive_cfg();
        assert_eq!(effective_speed(None, &cfg).unwrap(), 0.3);
        assert_eq!(effective_speed(Some(1.0), &cfg).unwrap(), 1.0);
        assert!(effective_speed(Some(0.0), &cfg).is_err());
        assert!(effective_speed(Some(-0.5), &cfg).is_err());
        assert!(effective_speed(Some(1.2), &cfg).is_err());
        assert!(effective_speed(Some(f64::NAN), &cfg).is_err());
    }
}
