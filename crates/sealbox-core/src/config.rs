use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cipher::MAX_CHUNK_SIZE;
use crate::error::TransferError;

/// Tuning knobs shared by the upload and download coordinators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Plaintext bytes sealed per frame (256 KiB by default)
    pub chunk_size: usize,

    /// Retries allowed after the first attempt fails
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries
    pub retry_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_retries: 3,
            retry_delay_ms: 250,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::validation("chunk_size", "must be non-zero"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::validation(
                "chunk_size",
                format!("must be at most {MAX_CHUNK_SIZE} bytes"),
            ));
        }
        Ok(())
    }

    /// Delay before the retry with the given zero-based index. Doubles each
    /// time, capped so long outages do not push waits toward minutes.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let factor = 1u64 << retry_index.min(6);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TransferConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_chunk_sizes() {
        let mut config = TransferConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        config.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());

        config.chunk_size = MAX_CHUNK_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let config = TransferConfig {
            retry_delay_ms: 100,
            ..TransferConfig::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(6), Duration::from_millis(6400));
        assert_eq!(config.backoff_delay(20), Duration::from_millis(6400));
    }
}
