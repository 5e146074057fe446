//! HTTP/1.1 response writing and error mapping
//!
//! Every response body is JSON. Failures map onto a small status
//! taxonomy so clients can distinguish "the rover is unreachable" from
//! "you asked for something invalid" without parsing prose.

use crate::error::Error;
use serde::Serialize;
use std::io::Write;
use std::net::TcpStream;

/// A response ready to be written
pub struct HttpResponse {
    status: u16,
    body: Vec<u8>,
    close: bool,
}

impl HttpResponse {
    /// Build a JSON response
    pub fn json<T: Serialize>(status: u16, body: &T) -> HttpResponse {
        match serde_json::to_vec(body) {
            Ok(body) => HttpResponse {
                status,
                body,
                close: false,
            },
            Err(e) => {
                log::error!("Failed to serialize response body: {}", e);
                HttpResponse {
                    status: 500,
                    body: br#"{"status":"error","error":"internal","message":"response serialization failed"}"#.to_vec(),
                    close: false,
                }
            }
        }
    }

    /// Mark the connection for closing after this response
    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn closes(&self) -> bool {
        self.close
    }
}

/// Standard error body shape
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub status: &'static str,
    pub error: &'static str,
    pub message: &'a str,
}

impl<'a> ErrorBody<'a> {
    pub fn new(error: &'static str, message: &'a str) -> Self {
        ErrorBody {
            status: "error",
            error,
            message,
        }
    }
}

/// HTTP status for each error variant
pub fn status_for(err: &Error) -> u16 {
    match err {
        Error::LinkUnavailable(_)
        | Error::LinkDegraded
        | Error::LinkWriteTimeout
        | Error::LinkReadTimeout
        | Error::Shutdown => 503,
        Error::CommandTimeout(_) => 504,
        Error::SessionBusy => 409,
        Error::SessionExpired => 410,
        Error::InvalidCommand(_) | Error::BadRequest(_) => 400,
        Error::Rejected(_) => 502,
        Error::Serial(_) | Error::Io(_) | Error::Config(_) => 500,
    }
}

/// Stable machine-readable slug for each error variant
pub fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::LinkUnavailable(_) => "link_unavailable",
        Error::LinkDegraded => "link_degraded",
        Error::LinkWriteTimeout => "link_write_timeout",
        Error::LinkReadTimeout => "link_read_timeout",
        Error::CommandTimeout(_) => "command_timeout",
        Error::Rejected(_) => "chassis_rejected",
        Error::InvalidCommand(_) => "invalid_command",
        Error::BadRequest(_) => "bad_request",
        Error::SessionBusy => "session_busy",
        Error::SessionExpired => "session_expired",
        Error::Shutdown => "shutting_down",
        Error::Serial(_) | Error::Io(_) | Error::Config(_) => "internal",
    }
}

/// Build the error response for a failed handler
pub fn error_response(err: &Error) -> HttpResponse {
    let message = err.to_string();
    HttpResponse::json(status_for(err), &ErrorBody::new(error_kind(err), &message))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Write a complete response to the stream
pub fn write_response(stream: &mut TcpStream, resp: &HttpResponse) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        resp.status,
        reason_phrase(resp.status),
        resp.body.len(),
        if resp.close { "close" } else { "keep-alive" },
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(&resp.body)?;
    stream.flush()
}
