//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is built from CLI arguments in `main.rs` (optionally with an interest
//! file) or from defaults in tests.  Nothing in here reads the environment.

use std::net::SocketAddr;
use std::time::Duration;

use blehub_core::InterestTable;

/// Default WebSocket port.
pub const DEFAULT_WS_PORT: u16 = 8080;

/// All runtime configuration for the bridge.
///
/// # Example
///
/// ```rust
/// use blehub_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 8080);
/// assert_eq!(cfg.retry_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the WebSocket listener binds to.
    pub ws_bind_addr: SocketAddr,

    /// Upper bound on reading the HTTP upgrade request.  A client that has
    /// not finished its handshake by then is dropped.
    pub handshake_timeout: Duration,

    /// Largest frame payload accepted from the browser.  Anything larger
    /// terminates the session.
    pub max_frame_len: usize,

    /// Upper bound on every call into the Bluetooth service.
    pub call_timeout: Duration,

    /// Attempts for `Connect` and `StartNotify` when the failure is
    /// transient.  `1` disables retrying.
    pub retry_attempts: u32,

    /// Delay before the second attempt; doubled for each further one.
    pub retry_backoff: Duration,

    /// Which characteristics are forwarded and how they are decoded.
    pub interest: InterestTable,
}

impl Default for BridgeConfig {
    /// | Field              | Default                  |
    /// |--------------------|--------------------------|
    /// | ws_bind_addr       | `0.0.0.0:8080`           |
    /// | handshake_timeout  | 5 seconds                |
    /// | max_frame_len      | 1 MiB                    |
    /// | call_timeout       | 10 seconds               |
    /// | retry_attempts     | 3                        |
    /// | retry_backoff      | 250 ms                   |
    /// | interest           | Nordic UART TX → `uart_packet` |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)),
            handshake_timeout: Duration::from_secs(5),
            max_frame_len: 1 << 20,
            call_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            interest: InterestTable::nordic_uart(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ws_port_is_8080_on_all_interfaces() {
        // Arrange / Act
        let cfg = BridgeConfig::default();

        // Assert
        assert_eq!(cfg.ws_bind_addr.port(), 8080);
        assert!(cfg.ws_bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_default_timeouts() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(5));
        assert_eq!(cfg.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_default_retry_policy() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.retry_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_default_max_frame_len_is_one_mebibyte() {
        assert_eq!(BridgeConfig::default().max_frame_len, 1_048_576);
    }

    #[test]
    fn test_default_interest_is_nordic_uart() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.interest.len(), 1);
    }
}
