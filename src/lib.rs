//! RoverD - Edge controller for a small differential-drive rover
//!
//! This library bridges a JSON-over-HTTP control API to a rover chassis
//! reached over a framed serial link.
//!
//! ## Components
//!
//! - [`protocol`]: wire framing, checksums and the command/telemetry codec
//! - [`link`]: serial transport with supervised reconnect
//! - [`dispatch`]: single-writer command queue with ack correlation,
//!   halt preemption and session arbitration
//! - [`telemetry`]: latest-state hub with bounded history and streaming
//!   subscriptions
//! - [`http`]: embedded HTTP/1.1 server exposing the control API
//! - [`app`]: daemon assembly and lifecycle

pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod link;
pub mod protocol;
pub mod telemetry;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{Error, Result};
