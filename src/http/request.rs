//! HTTP/1.1 request parsing
//!
//! Minimal parser for the API surface this daemon serves: request line,
//! headers, and an optional Content-Length body. Connections use a short
//! read timeout so handler threads can notice shutdown between requests.

use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, Read};
use std::net::TcpStream;

/// Caps keeping one misbehaving client from holding memory hostage
pub const MAX_HEADER_BYTES: usize = 8 * 1024;
pub const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed request
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Client asked us to close after this exchange
    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    /// Parse the body as JSON
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Err(Error::BadRequest("request body required".into()));
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::BadRequest(format!("invalid JSON body: {}", e)))
    }
}

/// What one read attempt produced
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete request
    Request(Request),
    /// Read timeout with nothing consumed; poll again
    Idle,
    /// Peer closed the connection cleanly
    Disconnected,
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Read one request off the connection
///
/// `Err(BadRequest)` means the framing cannot be trusted and the caller
/// should answer 400 and drop the connection; other errors are I/O.
pub fn read_request(reader: &mut BufReader<TcpStream>) -> Result<ReadOutcome> {
    // Request line; tolerate stray blank lines between pipelined requests
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(ReadOutcome::Disconnected),
            Ok(_) => {}
            Err(e) if is_timeout(&e) && line.is_empty() => return Ok(ReadOutcome::Idle),
            Err(e) => return Err(e.into()),
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::BadRequest("empty request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| Error::BadRequest("request line missing target".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::BadRequest("request line missing version".into()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(Error::BadRequest(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    // Query strings are accepted but carry nothing this API uses
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut headers = Vec::new();
    let mut header_bytes = line.len();
    loop {
        let mut header_line = String::new();
        match reader.read_line(&mut header_line) {
            Ok(0) => return Ok(ReadOutcome::Disconnected),
            Ok(n) => header_bytes += n,
            Err(e) => return Err(e.into()),
        }
        if header_line.trim().is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::BadRequest("too many headers".into()));
        }
        if header_bytes > MAX_HEADER_BYTES {
            return Err(Error::BadRequest("header section too large".into()));
        }
        let Some((name, value)) = header_line.split_once(':') else {
            return Err(Error::BadRequest(format!(
                "malformed header line: {}",
                header_line.trim()
            )));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = Request {
        method,
        path,
        headers,
        body: Vec::new(),
    };

    if let Some(te) = request.header("transfer-encoding") {
        if !te.eq_ignore_ascii_case("identity") {
            return Err(Error::BadRequest(
                "chunked request bodies are not supported".into(),
            ));
        }
    }
    if let Some(length) = request.header("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| Error::BadRequest("invalid Content-Length".into()))?;
        if length > MAX_BODY_BYTES {
            return Err(Error::BadRequest("request body too large".into()));
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;
        request.body = body;
    }

    Ok(ReadOutcome::Request(request))
}
