//! Timeout and retry policy for calls into the Bluetooth service.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::domain::BridgeConfig;
use crate::infrastructure::bluetooth::BluetoothError;

/// How long a call may take and how transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            timeout: config.call_timeout,
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }

    /// Awaits `call`, turning an overrun into [`BluetoothError::Timeout`].
    pub async fn call<T, F>(&self, call: F) -> Result<T, BluetoothError>
    where
        F: Future<Output = Result<T, BluetoothError>>,
    {
        match timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BluetoothError::Timeout(self.timeout)),
        }
    }

    /// Like [`call`](Self::call), retrying transient failures with
    /// exponential backoff up to `attempts` times in total.
    pub async fn call_with_retry<T, F, Fut>(
        &self,
        what: &str,
        mut make_call: F,
    ) -> Result<T, BluetoothError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BluetoothError>>,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.call(make_call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        "{what} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        self.attempts
                    );
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
