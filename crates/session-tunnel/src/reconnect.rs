//! Reconnection logic with exponential backoff

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of consecutive reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
    /// A session that stayed up this long resets the backoff
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(10),
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before next reconnection attempt, giving up early on cancel
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            self.current_backoff.as_millis(),
            self.attempt
        );

        tokio::select! {
            _ = sleep(self.current_backoff) => {}
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
        }

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);

        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff if the last session ran long enough to count as stable
    pub fn session_ended(&mut self, uptime: Duration) {
        if uptime >= self.config.stable_after {
            self.reset();
        }
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_attempts: Option<usize>) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
            stable_after: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_reconnect_backoff() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(fast_config(None));

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 1);
        assert_eq!(manager.current_backoff(), Duration::from_millis(20));

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(80));

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 4);
        // Should cap at max_backoff
        assert_eq!(manager.current_backoff(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stable_session_resets_backoff() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(fast_config(None));

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();

        manager.session_ended(Duration::from_millis(5));
        assert_eq!(manager.attempt(), 2);

        manager.session_ended(Duration::from_secs(2));
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(fast_config(Some(2)));

        assert!(manager.wait(&cancel).await.is_ok());
        assert!(manager.wait(&cancel).await.is_ok());

        let result = manager.wait(&cancel).await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_observes_cancellation() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(3600),
            ..fast_config(None)
        });

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = manager.wait(&cancel).await;
        assert!(matches!(result, Err(ReconnectError::Cancelled)));
    }
}
