//! Error types for roverd

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// roverd error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Link could not be opened
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// Link is degraded and awaiting reconnection
    #[error("Link degraded, reconnection in progress")]
    LinkDegraded,

    /// Write did not complete within the configured deadline
    #[error("Link write timed out")]
    LinkWriteTimeout,

    /// No telemetry received within the staleness window
    #[error("Link read timed out, telemetry is stale")]
    LinkReadTimeout,

    /// Command was transmitted but no acknowledgement arrived in time
    #[error("Command {0} not acknowledged in time")]
    CommandTimeout(u16),

    /// Chassis acknowledged the command with a fault status
    #[error("Chassis rejected command with status {0:#04x}")]
    Rejected(u8),

    /// Command parameters outside the accepted range
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Malformed API request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Another client holds an exclusive session
    #[error("Rover is held by an exclusive session")]
    SessionBusy,

    /// Session id is unknown or expired
    #[error("Session not found or expired")]
    SessionExpired,

    /// Daemon is shutting down
    #[error("Shutting down")]
    Shutdown,
}
