//! blehub WebSocket bridge: entry point.
//!
//! This binary discovers Bluetooth Low Energy peripherals through the local
//! Bluetooth service (BlueZ), announces the interesting ones to a single
//! browser over a WebSocket, and forwards decoded characteristic
//! notifications as JSON.
//!
//! # Usage
//!
//! ```text
//! blehub-bridge [OPTIONS]
//!
//! Options:
//!   --ws-port <PORT>            WebSocket listener port [default: 8080]
//!   --ws-bind <ADDR>            Address to bind [default: 0.0.0.0]
//!   --call-timeout-ms <MS>      Bluetooth call timeout [default: 10000]
//!   --retry-attempts <N>        Attempts for Connect/StartNotify [default: 3]
//!   --interest-file <PATH>      TOML interest table (default: Nordic UART)
//!   --log-level <FILTER>        Log filter when RUST_LOG is unset [default: info]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                 | Default   | Description                  |
//! |--------------------------|-----------|------------------------------|
//! | `BLEHUB_WS_PORT`         | `8080`    | WebSocket listener port      |
//! | `BLEHUB_WS_BIND`         | `0.0.0.0` | WebSocket bind address       |
//! | `BLEHUB_CALL_TIMEOUT_MS` | `10000`   | Bluetooth call timeout (ms)  |
//! | `BLEHUB_RETRY_ATTEMPTS`  | `3`       | Retry attempts               |
//! | `BLEHUB_INTEREST_FILE`   | none      | Interest table file          |
//! | `BLEHUB_LOG_LEVEL`       | `info`    | Fallback log filter          |
//!
//! # Backends
//!
//! The BlueZ backend is compiled in with `--features bluez` (Linux, needs
//! the system D-Bus library).  A build without it can run the test suite but
//! refuses to start the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blehub_bridge::domain::BridgeConfig;
use blehub_bridge::infrastructure::load_interest_file;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// BLE GATT to WebSocket bridge.
#[derive(Debug, Parser)]
#[command(
    name = "blehub-bridge",
    about = "Forwards BLE characteristic notifications to a browser over WebSocket",
    version
)]
struct Cli {
    /// TCP port for the WebSocket server to listen on.
    #[arg(long, default_value_t = 8080, env = "BLEHUB_WS_PORT")]
    ws_port: u16,

    /// IP address to bind the WebSocket server to.
    ///
    /// Use `127.0.0.1` to accept only local browsers.
    #[arg(long, default_value = "0.0.0.0", env = "BLEHUB_WS_BIND")]
    ws_bind: String,

    /// Upper bound on every call into the Bluetooth service, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "BLEHUB_CALL_TIMEOUT_MS")]
    call_timeout_ms: u64,

    /// Attempts for Connect and StartNotify when the failure is transient.
    #[arg(long, default_value_t = 3, env = "BLEHUB_RETRY_ATTEMPTS")]
    retry_attempts: u32,

    /// TOML file listing the forwarded characteristics.
    #[arg(long, env = "BLEHUB_INTEREST_FILE")]
    interest_file: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info", env = "BLEHUB_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    /// Converts the parsed CLI arguments into a [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--ws-bind` is not a valid IP address or the
    /// interest file cannot be loaded.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let ws_bind_addr: SocketAddr = format!("{}:{}", self.ws_bind, self.ws_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid WebSocket bind address: '{}:{}'",
                    self.ws_bind, self.ws_port
                )
            })?;

        let mut config = BridgeConfig {
            ws_bind_addr,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            retry_attempts: self.retry_attempts,
            ..BridgeConfig::default()
        };

        if let Some(path) = &self.interest_file {
            config.interest = load_interest_file(path)
                .with_context(|| format!("failed to load interest file {}", path.display()))?;
        }

        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `RUST_LOG` wins; `--log-level` is the fallback.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = cli.into_bridge_config()?;

    info!(
        "blehub bridge starting: ws={}, {} interest entries",
        config.ws_bind_addr,
        config.interest.len()
    );

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    serve(config, running).await?;

    info!("blehub bridge stopped");
    Ok(())
}

#[cfg(feature = "bluez")]
async fn serve(config: BridgeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    use blehub_bridge::infrastructure::bluetooth::bluez::BluezService;
    use blehub_bridge::infrastructure::run_server;

    let service = BluezService::new()
        .await
        .context("cannot reach the BlueZ daemon")?;
    run_server(config, Arc::new(service), running).await
}

#[cfg(not(feature = "bluez"))]
async fn serve(_config: BridgeConfig, _running: Arc<AtomicBool>) -> anyhow::Result<()> {
    anyhow::bail!("no Bluetooth backend compiled in; rebuild with `--features bluez`")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange: parse with no arguments (all defaults apply)
        let cli = Cli::parse_from(["blehub-bridge"]);

        // Assert
        assert_eq!(cli.ws_port, 8080);
        assert_eq!(cli.ws_bind, "0.0.0.0");
        assert_eq!(cli.call_timeout_ms, 10_000);
        assert_eq!(cli.retry_attempts, 3);
        assert!(cli.interest_file.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_ws_port_override() {
        let cli = Cli::parse_from(["blehub-bridge", "--ws-port", "9999"]);
        assert_eq!(cli.ws_port, 9999);
    }

    #[test]
    fn test_into_bridge_config_defaults() {
        let cli = Cli::parse_from(["blehub-bridge"]);

        let config = cli.into_bridge_config().unwrap();

        assert_eq!(config.ws_bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.interest.len(), 1);
    }

    #[test]
    fn test_into_bridge_config_overrides() {
        let cli = Cli::parse_from([
            "blehub-bridge",
            "--ws-bind",
            "127.0.0.1",
            "--ws-port",
            "9000",
            "--call-timeout-ms",
            "2500",
            "--retry-attempts",
            "5",
        ]);

        let config = cli.into_bridge_config().unwrap();

        assert_eq!(config.ws_bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry_attempts, 5);
    }

    #[test]
    fn test_into_bridge_config_invalid_ws_bind_returns_error() {
        // Arrange
        let cli = Cli {
            ws_port: 8080,
            ws_bind: "not.an.ip".to_string(),
            call_timeout_ms: 10_000,
            retry_attempts: 3,
            interest_file: None,
            log_level: "info".to_string(),
        };

        // Act
        let result = cli.into_bridge_config();

        // Assert: must return an error, not panic
        assert!(result.is_err());
    }

    #[test]
    fn test_into_bridge_config_missing_interest_file_returns_error() {
        let cli = Cli::parse_from([
            "blehub-bridge",
            "--interest-file",
            "/nonexistent/interest.toml",
        ]);

        let err = cli.into_bridge_config().unwrap_err();

        assert!(format!("{err:#}").contains("/nonexistent/interest.toml"));
    }
}
