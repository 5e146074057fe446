//! Embedded HTTP server
//!
//! A small hand-rolled HTTP/1.1 server: one nonblocking accept loop plus
//! a thread per connection with keep-alive. Routing lands on the handlers
//! in [`api`]; `/api/stream` switches the connection into NDJSON telemetry
//! streaming and never returns to request handling.

pub mod api;
mod request;
mod response;

pub use api::ApiContext;

use crate::error::Error;
use request::{read_request, ReadOutcome, Request};
use response::{error_response, write_response, ErrorBody, HttpResponse};
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval of the nonblocking accept loop
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Read timeout on connection sockets; bounds shutdown latency
const CONN_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Write timeout on connection sockets; a stalled peer is dropped
const CONN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the telemetry stream waits per snapshot before probing
const STREAM_POLL: Duration = Duration::from_secs(1);

/// Paths the router knows about, for the 404 / 405 distinction
const KNOWN_PATHS: &[&str] = &[
    "/",
    "/api/status",
    "/api/history",
    "/api/session",
    "/api/move",
    "/api/drive",
    "/api/turn",
    "/api/servo",
    "/api/stop",
    "/api/stream",
];

/// Listening HTTP server; dropping it stops the accept loop.
pub struct HttpServer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind `addr` and start serving `ctx` in background threads.
    pub fn start(addr: &str, ctx: ApiContext) -> crate::error::Result<HttpServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("http-server".into())
            .spawn(move || accept_loop(listener, ctx, accept_shutdown))?;

        log::info!("HTTP API listening on {}", local_addr);
        Ok(HttpServer {
            shutdown,
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Idempotent; live connections notice
    /// the shutdown flag within their next read timeout.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, ctx: ApiContext, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("Connection from {}", peer);
                let conn_ctx = ctx.clone();
                let conn_shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name("http-conn".into())
                    .spawn(move || handle_connection(stream, conn_ctx, conn_shutdown));
                if let Err(e) = spawned {
                    log::warn!("Failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                thread::sleep(CONN_READ_TIMEOUT);
            }
        }
    }
    log::info!("HTTP server stopped");
}

fn handle_connection(mut stream: TcpStream, ctx: ApiContext, shutdown: Arc<AtomicBool>) {
    if stream.set_read_timeout(Some(CONN_READ_TIMEOUT)).is_err()
        || stream.set_write_timeout(Some(CONN_WRITE_TIMEOUT)).is_err()
    {
        return;
    }
    let read_half = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            log::debug!("Failed to clone connection socket: {}", e);
            return;
        }
    };
    let mut reader = BufReader::new(read_half);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let req = match read_request(&mut reader) {
            Ok(ReadOutcome::Request(req)) => req,
            Ok(ReadOutcome::Idle) => continue,
            Ok(ReadOutcome::Disconnected) => break,
            Err(e @ Error::BadRequest(_)) => {
                let resp = error_response(&e).with_close();
                let _ = write_response(&mut stream, &resp);
                break;
            }
            Err(e) => {
                log::debug!("Connection read error: {}", e);
                break;
            }
        };

        log::debug!("{} {}", req.method, req.path);
        if req.method == "GET" && req.path == "/api/stream" {
            if let Err(e) = stream_telemetry(&mut stream, &ctx, &shutdown) {
                log::debug!("Telemetry stream ended: {}", e);
            }
            break;
        }

        let resp = dispatch_request(&ctx, &req);
        let close = resp.closes() || req.wants_close();
        if write_response(&mut stream, &resp).is_err() {
            break;
        }
        if close {
            break;
        }
    }
}

/// Route one request to its handler and fold errors into the taxonomy.
fn dispatch_request(ctx: &ApiContext, req: &Request) -> HttpResponse {
    let result = match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/") => Ok(api::identify(ctx)),
        ("GET", "/api/status") => Ok(api::status(ctx)),
        ("GET", "/api/history") => Ok(api::history(ctx)),
        ("POST", "/api/session") => api::acquire_session(ctx, req),
        ("POST", "/api/move") => req
            .json_body()
            .and_then(|body: api::MoveRequest| api::do_move(ctx, &body)),
        ("POST", "/api/drive") => req
            .json_body()
            .and_then(|body: api::DriveRequest| api::do_drive(ctx, &body)),
        ("POST", "/api/turn") => req
            .json_body()
            .and_then(|body: api::TurnRequest| api::do_turn(ctx, &body)),
        ("POST", "/api/servo") => req
            .json_body()
            .and_then(|body: api::ServoRequest| api::do_servo(ctx, &body)),
        ("POST", "/api/stop") => api::do_stop(ctx),
        ("DELETE", path) if path.starts_with("/api/session/") => match session_id_from_path(path) {
            Some(id) => api::release_session(ctx, id),
            None => Err(Error::BadRequest("session id must be numeric".into())),
        },
        (_, path) if KNOWN_PATHS.contains(&path) || path.starts_with("/api/session/") => {
            return HttpResponse::json(
                405,
                &ErrorBody::new("method_not_allowed", "method not allowed for this endpoint"),
            );
        }
        _ => {
            return HttpResponse::json(404, &ErrorBody::new("not_found", "no such endpoint"));
        }
    };
    match result {
        Ok(resp) => resp,
        Err(e) => {
            log::debug!("{} {} failed: {}", req.method, req.path, e);
            error_response(&e)
        }
    }
}

fn session_id_from_path(path: &str) -> Option<u64> {
    path.strip_prefix("/api/session/")?.parse().ok()
}

/// Serve the long-lived NDJSON telemetry stream.
///
/// Snapshots are coalesced by the hub, so a slow reader sees the newest
/// state rather than a growing backlog. Quiet periods emit a bare
/// newline, which doubles as a disconnect probe.
fn stream_telemetry(
    stream: &mut TcpStream,
    ctx: &ApiContext,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: application/x-ndjson\r\n\
          Connection: close\r\n\
          \r\n",
    )?;
    stream.flush()?;

    let mut sub = ctx.hub.subscribe();
    while !shutdown.load(Ordering::SeqCst) {
        match sub.recv_timeout(STREAM_POLL) {
            Some(snap) => {
                let mut line = serde_json::to_vec(&*snap)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                line.push(b'\n');
                stream.write_all(&line)?;
                stream.flush()?;
            }
            None => {
                if sub.is_shutdown() {
                    break;
                }
                stream.write_all(b"\n")?;
                stream.flush()?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_path() {
        assert_eq!(session_id_from_path("/api/session/42"), Some(42));
        assert_eq!(session_id_from_path("/api/session/abc"), None);
        assert_eq!(session_id_from_path("/api/session/"), None);
        assert_eq!(session_id_from_path("/api/move"), None);
    }
}
