//! Request and batch counters

use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

use super::batch::SealReason;

/// Lock-free counters updated by the fetcher and its batch drivers
#[derive(Debug, Default)]
pub(crate) struct FetchCounters {
    requests: AtomicU64,
    coalesced: AtomicU64,
    batches_executed: AtomicU64,
    ids_fetched: AtomicU64,
    sealed_by_timeout: AtomicU64,
    sealed_by_size: AtomicU64,
    sealed_manually: AtomicU64,
    job_failures: AtomicU64,
    job_panics: AtomicU64,
}

impl FetchCounters {
    pub(crate) fn record_request(&self, coalesced: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_seal(&self, reason: SealReason) {
        let counter = match reason {
            SealReason::Timeout => &self.sealed_by_timeout,
            SealReason::BatchFull => &self.sealed_by_size,
            SealReason::Manual => &self.sealed_manually,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self, batch_len: usize) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        self.ids_fetched.fetch_add(batch_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, panicked: bool) {
        self.job_failures.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.job_panics.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> FetcherStats {
        FetcherStats {
            requests: self.requests.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            ids_fetched: self.ids_fetched.load(Ordering::Relaxed),
            sealed_by_timeout: self.sealed_by_timeout.load(Ordering::Relaxed),
            sealed_by_size: self.sealed_by_size.load(Ordering::Relaxed),
            sealed_manually: self.sealed_manually.load(Ordering::Relaxed),
            job_failures: self.job_failures.load(Ordering::Relaxed),
            job_panics: self.job_panics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a fetcher's activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherStats {
    /// Calls to `fetch`
    pub requests: u64,
    /// Calls that piggybacked on an id already in flight
    pub coalesced: u64,
    /// Job invocations
    pub batches_executed: u64,
    /// Ids handed to the job across all batches
    pub ids_fetched: u64,
    /// Batches sealed because `max_wait` elapsed
    pub sealed_by_timeout: u64,
    /// Batches sealed because they reached `max_batch_size`
    pub sealed_by_size: u64,
    /// Batches sealed by `fetch_now`
    pub sealed_manually: u64,
    /// Batches whose job returned an error or panicked
    pub job_failures: u64,
    /// Subset of `job_failures` caused by a panic
    pub job_panics: u64,
}

impl FetcherStats {
    /// Total batches sealed, by any trigger
    pub fn batches_sealed(&self) -> u64 {
        self.sealed_by_timeout + self.sealed_by_size + self.sealed_manually
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = FetchCounters::default();
        counters.record_request(false);
        counters.record_request(true);
        counters.record_seal(SealReason::BatchFull);
        counters.record_seal(SealReason::Manual);
        counters.record_execution(3);
        counters.record_failure(true);

        let stats = counters.snapshot();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.batches_sealed(), 2);
        assert_eq!(stats.sealed_by_timeout, 0);
        assert_eq!(stats.ids_fetched, 3);
        assert_eq!(stats.job_failures, 1);
        assert_eq!(stats.job_panics, 1);
    }
}
