//! Batch lifecycle
//!
//! A batch moves through `Open -> Sealing -> Executing -> Done` and never
//! goes back. While open it accepts ids; the first seal trigger to fire
//! (timer, size threshold or manual) freezes the id set. Its outcome is
//! published once through a watch channel, so every participant observes
//! the same map or the same error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::{FleetError, Result};

/// Shared result of one job execution
pub(crate) type BatchOutcome<K, V> = Result<Arc<HashMap<K, V>>>;

/// Which trigger sealed a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SealReason {
    /// `max_wait` elapsed since the batch was opened
    Timeout,
    /// The batch reached `max_batch_size` ids
    BatchFull,
    /// `Fetcher::fetch_now` was called
    Manual,
}

impl SealReason {
    /// Short name used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::Timeout => "timeout",
            SealReason::BatchFull => "batch_full",
            SealReason::Manual => "manual",
        }
    }
}

impl fmt::Display for SealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    /// Accepting ids
    Open,
    /// Id set frozen, waiting for the driver to run the job
    Sealing,
    /// Job running
    Executing,
    /// Outcome published
    Done,
}

/// Result of trying to add an id to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    /// The id was appended; `full` is set when this append sealed the batch
    Joined { full: bool },
    /// The batch was already sealed and the id was not appended
    Sealed,
}

struct Members<K> {
    ids: Vec<K>,
    state: BatchState,
    reason: Option<SealReason>,
    trigger: Option<oneshot::Sender<SealReason>>,
}

impl<K> Members<K> {
    fn fire(&mut self, reason: SealReason) {
        self.state = BatchState::Sealing;
        self.reason = Some(reason);
        if let Some(trigger) = self.trigger.take() {
            // The driver may already have stopped listening after its timer fired
            let _ = trigger.send(reason);
        }
    }
}

/// One group of ids fetched by a single job call
pub(crate) struct Batch<K, V> {
    id: u64,
    opened_at: Instant,
    members: Mutex<Members<K>>,
    outcome: watch::Receiver<Option<BatchOutcome<K, V>>>,
}

/// Driver-side ends of a batch's channels
pub(crate) struct BatchSignals<K, V> {
    /// Fires once with the reason of the winning non-timer seal
    pub seal: oneshot::Receiver<SealReason>,
    /// Releases every waiter
    pub publisher: OutcomePublisher<K, V>,
}

/// Write end of the completion barrier
pub(crate) struct OutcomePublisher<K, V> {
    tx: watch::Sender<Option<BatchOutcome<K, V>>>,
}

impl<K, V> OutcomePublisher<K, V> {
    /// Publish the outcome, waking all current and future waiters
    pub fn publish(self, outcome: BatchOutcome<K, V>) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<K, V> Batch<K, V> {
    /// Create an empty open batch
    pub fn open(id: u64, capacity_hint: usize) -> (Self, BatchSignals<K, V>) {
        let (seal_tx, seal_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let batch = Self {
            id,
            opened_at: Instant::now(),
            members: Mutex::new(Members {
                ids: Vec::with_capacity(capacity_hint.min(1024)),
                state: BatchState::Open,
                reason: None,
                trigger: Some(seal_tx),
            }),
            outcome: outcome_rx,
        };
        let signals = BatchSignals {
            seal: seal_rx,
            publisher: OutcomePublisher { tx: outcome_tx },
        };
        (batch, signals)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn len(&self) -> usize {
        self.members.lock().ids.len()
    }

    pub fn state(&self) -> BatchState {
        self.members.lock().state
    }

    pub fn seal_reason(&self) -> Option<SealReason> {
        self.members.lock().reason
    }

    /// Append `id` unless the batch is sealed. Reaching `max_batch_size`
    /// seals the batch in the same critical section.
    pub fn try_join(&self, id: K, max_batch_size: usize) -> JoinOutcome {
        let mut members = self.members.lock();
        if members.state != BatchState::Open {
            return JoinOutcome::Sealed;
        }

        members.ids.push(id);
        let full = members.ids.len() >= max_batch_size;
        if full {
            members.fire(SealReason::BatchFull);
        }
        JoinOutcome::Joined { full }
    }

    /// Seal the batch if it is still open. Returns false when another
    /// trigger got there first.
    pub fn seal(&self, reason: SealReason) -> bool {
        let mut members = self.members.lock();
        if members.state != BatchState::Open {
            return false;
        }
        members.fire(reason);
        true
    }

    /// Move a sealed batch to `Executing` and hand out its frozen ids
    pub fn begin_execution(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut members = self.members.lock();
        debug_assert_eq!(members.state, BatchState::Sealing);
        members.state = BatchState::Executing;
        members.ids.clone()
    }

    pub fn finish(&self) {
        self.members.lock().state = BatchState::Done;
    }

    /// Ids accumulated so far
    pub fn ids(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.members.lock().ids.clone()
    }

    /// Wait on the completion barrier
    pub async fn wait(&self) -> BatchOutcome<K, V> {
        let mut rx = self.outcome.clone();
        let published = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        published.unwrap_or(Err(FleetError::Abandoned))
    }
}
