//! # singlefleet
//!
//! Coalesces concurrent per-item fetches into shared batched calls against a
//! backend that can fetch many items by key in one round trip (databases,
//! remote caches, search indices, bulk REST endpoints).
//!
//! ## Overview
//!
//! A [`Fetcher`](fetcher::Fetcher) keeps at most one open batch. Each
//! [`fetch`](fetcher::Fetcher::fetch) call either waits on a batch that
//! already holds its id, joins the open batch, or opens a new one. A batch is
//! sealed when `max_wait` elapses, when it reaches `max_batch_size` ids, or
//! when [`fetch_now`](fetcher::Fetcher::fetch_now) is called, whichever
//! comes first. The job then runs once for the whole batch and every caller
//! receives its slice of the shared result.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use singlefleet::fetcher::{Fetcher, FetcherConfig};
//!
//! # async fn example() -> singlefleet::Result<()> {
//! let fetcher = Fetcher::from_fn(
//!     |ids: Vec<u64>| async move {
//!         // One round trip for the whole batch
//!         Ok::<_, anyhow::Error>(ids.into_iter().map(|id| (id, id * 2)).collect::<HashMap<_, _>>())
//!     },
//!     FetcherConfig::new(Duration::from_millis(5), 64),
//! )?;
//!
//! let (a, b) = tokio::join!(fetcher.fetch(1), fetcher.fetch(2));
//! assert_eq!(a?, Some(2));
//! assert_eq!(b?, Some(4));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`fetcher`]: the fetcher, its configuration, jobs and batch lifecycle

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::sync::Arc;
use thiserror::Error;

/// Result type for singlefleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Main error type for singlefleet operations
///
/// Cloneable so one batch failure can be handed to every caller that shared
/// the batch.
#[derive(Error, Debug, Clone)]
pub enum FleetError {
    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The batch job returned an error; shared by every caller of the batch
    #[error("Job error: {0}")]
    Job(Arc<anyhow::Error>),

    /// The batch job panicked
    #[error("Job panicked: {0}")]
    JobPanicked(String),

    /// The batch driver stopped before publishing an outcome
    #[error("Batch abandoned before completion")]
    Abandoned,
}

/// Batched fetch coordination
pub mod fetcher;

pub use fetcher::{BatchJob, Fetcher, FetcherConfig, FetcherStats, FnJob, SealReason};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        let err = FleetError::Job(Arc::new(anyhow::anyhow!("connection refused")));
        assert_eq!(err.to_string(), "Job error: connection refused");
    }

    #[test]
    fn test_cloned_job_error_shares_source() {
        let err = FleetError::Job(Arc::new(anyhow::anyhow!("timeout")));
        let copy = err.clone();

        match (err, copy) {
            (FleetError::Job(a), FleetError::Job(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => unreachable!(),
        }
    }
}
