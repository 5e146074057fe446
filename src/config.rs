//! Configuration for the roverd daemon
//!
//! Loads configuration from a TOML file covering the serial link, the
//! command timeouts, session arbitration, telemetry history, and the
//! HTTP listener.

use crate::error::{Error, Result};
use crate::protocol::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub timeouts: TimeoutConfig,
    pub session: SessionConfig,
    pub telemetry: TelemetryConfig,
    pub http: HttpConfig,
    pub drive: DriveConfig,
    pub dispatch: DispatchConfig,
}

/// Serial link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    /// Chassis serial device
    pub device: String,
    /// Baud rate
    pub baud: u32,
    /// Wire protocol revision the chassis firmware speaks
    pub protocol: ProtocolVersion,
}

/// Deadlines for link and command operations, in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// A frame must be fully written within this window
    pub write_ms: u64,
    /// Telemetry older than this marks the link stale
    pub read_ms: u64,
    /// A transmitted command must be acknowledged within this window
    pub ack_ms: u64,
}

impl TimeoutConfig {
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn read_staleness(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn ack(&self) -> Duration {
        Duration::from_millis(self.ack_ms)
    }
}

/// Session arbitration configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sessions with no activity for this long are expired
    pub idle_timeout_ms: u64,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Telemetry hub configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Snapshots retained for the history endpoint
    pub history_capacity: usize,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Bind address, e.g. `0.0.0.0:5000`
    pub bind_addr: String,
}

/// Calibration for distance-based drive requests
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriveConfig {
    /// Ground speed in cm/s when driving at `default_speed`
    pub speed_cm_per_s: f64,
    /// Normalized speed used when a request does not name one
    pub default_speed: f64,
}

/// Command dispatch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Commands buffered ahead of the writer before submitters block
    pub queue_depth: usize,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration for the rover reference build
    ///
    /// Suitable for development. Production deployments should use a
    /// proper TOML configuration file.
    pub fn rover_defaults() -> Self {
        Self {
            link: LinkConfig {
                device: "/dev/ttyAMA0".to_string(),
                baud: 115_200,
                protocol: ProtocolVersion::V1,
            },
            timeouts: TimeoutConfig {
                write_ms: 200,
                read_ms: 1000,
                ack_ms: 250,
            },
            session: SessionConfig {
                idle_timeout_ms: 60_000,
            },
            telemetry: TelemetryConfig {
                history_capacity: 64,
            },
            http: HttpConfig {
                bind_addr: "0.0.0.0:5000".to_string(),
            },
            drive: DriveConfig {
                speed_cm_per_s: 10.0,
                default_speed: 0.3,
            },
            dispatch: DispatchConfig { queue_depth: 32 },
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.link.baud == 0 {
            return Err(Error::Config("link.baud must be non-zero".into()));
        }
        if self.timeouts.write_ms == 0 || self.timeouts.ack_ms == 0 {
            return Err(Error::Config(
                "timeouts.write_ms and timeouts.ack_ms must be non-zero".into(),
            ));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(Error::Config("dispatch.queue_depth must be non-zero".into()));
        }
        if self.telemetry.history_capacity == 0 {
            return Err(Error::Config(
                "telemetry.history_capacity must be non-zero".into(),
            ));
        }
        if !(self.drive.speed_cm_per_s > 0.0) {
            return Err(Error::Config("drive.speed_cm_per_s must be positive".into()));
        }
        if !(self.drive.default_speed > 0.0 && self.drive.default_speed <= 1.0) {
            return Err(Error::Config(
                "drive.default_speed must be within (0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::rover_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::rover_defaults();
        assert_eq!(config.link.device, "/dev/ttyAMA0");
        assert_eq!(config.link.baud, 115_200);
        assert_eq!(config.link.protocol, ProtocolVersion::V1);
        assert_eq!(config.timeouts.ack_ms, 250);
        assert_eq!(config.http.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.drive.speed_cm_per_s, 10.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_serialization() {
        let config = AppConfig::rover_defaults();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        // Should contain all sections
        assert!(toml_string.contains("[link]"));
        assert!(toml_string.contains("[timeouts]"));
        assert!(toml_string.contains("[session]"));
        assert!(toml_string.contains("[telemetry]"));
        assert!(toml_string.contains("[http]"));
        assert!(toml_string.contains("[drive]"));
        assert!(toml_string.contains("[dispatch]"));

        // Should contain key values
        assert!(toml_string.contains("device = \"/dev/ttyAMA0\""));
        assert!(toml_string.contains("protocol = \"v1\""));
        assert!(toml_string.contains("ack_ms = 250"));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[link]
device = "/dev/ttyUSB0"
baud = 57600
protocol = "v1"

[timeouts]
write_ms = 100
read_ms = 2000
ack_ms = 500

[session]
idle_timeout_ms = 30000

[telemetry]
history_capacity = 128

[http]
bind_addr = "127.0.0.1:8080"

[drive]
speed_cm_per_s = 12.5
default_speed = 0.5

[dispatch]
queue_depth = 8
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.link.device, "/dev/ttyUSB0");
        assert_eq!(config.link.baud, 57_600);
        assert_eq!(config.timeouts.ack(), Duration::from_millis(500));
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.http.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.dispatch.queue_depth, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::rover_defaults();
        config.dispatch.queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::rover_defaults();
        config.drive.default_speed = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::rover_defaults();
        config.timeouts.ack_ms = 0;
        assert!(config.validate().is_err());
    }
}
