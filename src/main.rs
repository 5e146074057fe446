//! RoverD - Rover edge controller daemon
//!
//! ## Architecture
//!
//! - **HTTP (port 5000)**: control API and telemetry streaming for clients
//! - **Serial (/dev/ttyAMA0)**: framed command/telemetry protocol to the
//!   chassis microcontroller
//!
//! One writer thread owns the serial TX path so commands reach the wire
//! in order; a reader thread correlates acks and publishes telemetry.

mod app;
mod config;
mod dispatch;
mod error;
mod http;
mod link;
mod protocol;
mod telemetry;

pub use crate::error::{Error, Result};

use crate::app::RoverApp;
use crate::config::AppConfig;
use std::env;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `roverd <path>` (positional)
/// - `roverd --config <path>` (flag-based)
/// - `roverd -c <path>` (short flag)
///
/// Defaults to `/etc/roverd.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    // Look for --config or -c flag
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    // Fall back to first positional argument (if it doesn't start with -)
    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    // Default path
    "/etc/roverd.toml".to_string()
}

fn load_config(path: &str) -> AppConfig {
    if Path::new(path).exists() {
        match AppConfig::from_file(path) {
            Ok(cfg) => {
                log::info!("Loaded config from {}", path);
                cfg
            }
            Err(e) => {
                log::warn!("Failed to load config {}: {}", path, e);
                AppConfig::rover_defaults()
            }
        }
    } else {
        log::info!("No config file at {}, using defaults", path);
        AppConfig::rover_defaults()
    }
}

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("RoverD v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = parse_config_path();
    let config = load_config(&config_path);

    log::info!(
        "Chassis link: {} at {} baud, protocol {}",
        config.link.device,
        config.link.baud,
        config.link.protocol
    );

    let mut app = RoverApp::new(config)?;

    // Set up shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    app.run(&running)?;

    log::info!("RoverD stopped");
    Ok(())
}
