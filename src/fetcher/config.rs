//! Fetcher configuration
//!
//! Controls when an accumulating batch is sealed: after `max_wait` has
//! passed since it was opened, or once it holds `max_batch_size` ids,
//! whichever comes first.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{FleetError, Result};

/// Default accumulation window
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(10);

/// Default batch size threshold
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Batch accumulation limits for a [`Fetcher`](super::Fetcher)
///
/// To effectively disable the time limit, use a very long `max_wait`.
/// Likewise, a very large `max_batch_size` disables the size limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Maximum time a batch accumulates ids before it is executed
    pub max_wait: Duration,
    /// Number of ids that seals a batch immediately
    pub max_batch_size: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl FetcherConfig {
    /// Create a configuration with both limits set
    pub fn new(max_wait: Duration, max_batch_size: usize) -> Self {
        Self {
            max_wait,
            max_batch_size,
        }
    }

    /// Set the accumulation window
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the batch size threshold
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Reject limits that could never seal a batch sensibly
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(FleetError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_wait.is_zero() {
            return Err(FleetError::InvalidConfig(
                "max_wait must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
