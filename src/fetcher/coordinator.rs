//! Request routing for batched fetches
//!
//! Lock order is always the fetcher state lock first, then a batch's member
//! lock. Neither lock is held across an `.await`. Every seal path runs with
//! both locks held, so a batch is sealed and detached from the open slot in
//! one step and a concurrent `fetch` either joins it or opens a new batch.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::batch::{Batch, BatchOutcome, BatchSignals, BatchState, JoinOutcome, SealReason};
use super::config::FetcherConfig;
use super::job::{BatchJob, FnJob};
use super::stats::{FetchCounters, FetcherStats};
use crate::{FleetError, Result};

/// Coalesces concurrent per-id fetches into batched job calls
///
/// Cloning a `Fetcher` is cheap and yields a handle to the same batch pool.
/// A tokio runtime must be running when [`fetch`](Self::fetch) is called.
pub struct Fetcher<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Fetcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<K, V> {
    config: FetcherConfig,
    job: Arc<dyn BatchJob<K, V>>,
    state: Mutex<FetcherState<K, V>>,
    counters: FetchCounters,
    next_batch_id: AtomicU64,
}

struct FetcherState<K, V> {
    /// The one batch currently accepting ids; always unsealed
    open: Option<Arc<Batch<K, V>>>,
    /// Every id of every batch that has not yet delivered its outcome
    registry: HashMap<K, Arc<Batch<K, V>>>,
}

impl<K, V> Fetcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a fetcher around `job`, failing fast on invalid limits
    pub fn new<J>(job: J, config: FetcherConfig) -> Result<Self>
    where
        J: BatchJob<K, V> + 'static,
    {
        config.validate()?;
        debug!(
            max_wait_ms = saturating_millis(config.max_wait),
            max_batch_size = config.max_batch_size,
            "Creating fetcher"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                job: Arc::new(job),
                state: Mutex::new(FetcherState {
                    open: None,
                    registry: HashMap::new(),
                }),
                counters: FetchCounters::default(),
                next_batch_id: AtomicU64::new(1),
            }),
        })
    }

    /// Create a fetcher from an async closure taking the batch ids
    pub fn from_fn<F, Fut>(f: F, config: FetcherConfig) -> Result<Self>
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<HashMap<K, V>>> + Send + 'static,
    {
        Self::new(FnJob::new(f), config)
    }

    /// Fetch one item through the batch pool
    ///
    /// Returns `Ok(None)` when the job ran but did not return a value for
    /// `id`. An error means the whole batch failed; every caller that shared
    /// the batch receives the same error.
    pub async fn fetch(&self, id: K) -> Result<Option<V>> {
        let (batch, signals) = self.route(id.clone());

        if let Some(signals) = signals {
            let driver = BatchDriver {
                shared: Arc::clone(&self.shared),
                batch: Arc::clone(&batch),
            };
            tokio::spawn(driver.run(signals));
        }

        let outcome = batch.wait().await;
        outcome.map(|values| values.get(&id).cloned())
    }

    /// Seal the open batch now, ignoring `max_wait` and `max_batch_size`
    ///
    /// Returns false when no batch is accumulating.
    pub fn fetch_now(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.open.clone() {
            Some(batch) => self.shared.seal_locked(&mut state, &batch, SealReason::Manual),
            None => false,
        }
    }

    /// Number of ids waiting on a batch outcome
    pub fn pending(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Whether a batch is currently accumulating ids
    pub fn has_open_batch(&self) -> bool {
        self.shared.state.lock().open.is_some()
    }

    /// Limits this fetcher was built with
    pub fn config(&self) -> &FetcherConfig {
        &self.shared.config
    }

    /// Snapshot of request and batch counters
    pub fn stats(&self) -> FetcherStats {
        self.shared.counters.snapshot()
    }

    /// Decide under the state lock whether `id` waits on an existing batch,
    /// joins the open one, or opens a new one. Only the last case returns
    /// driver signals.
    fn route(&self, id: K) -> (Arc<Batch<K, V>>, Option<BatchSignals<K, V>>) {
        let shared = &self.shared;
        let max_batch_size = shared.config.max_batch_size;
        let mut state = shared.state.lock();

        if let Some(batch) = state.registry.get(&id) {
            shared.counters.record_request(true);
            debug!(
                batch_id = batch.id(),
                state = ?batch.state(),
                "Id already in flight, waiting on its batch"
            );
            return (Arc::clone(batch), None);
        }
        shared.counters.record_request(false);

        if let Some(batch) = state.open.clone() {
            debug_assert_eq!(
                batch.state(),
                BatchState::Open,
                "seal paths detach under the state lock"
            );
            match batch.try_join(id.clone(), max_batch_size) {
                JoinOutcome::Joined { full } => {
                    state.registry.insert(id, Arc::clone(&batch));
                    if full {
                        shared.detach_sealed(&mut state, &batch, SealReason::BatchFull);
                    }
                    return (batch, None);
                }
                JoinOutcome::Sealed => {
                    // Unreachable while every seal path detaches; release
                    // builds recover by opening a fresh batch
                    warn!(batch_id = batch.id(), "Open slot held a sealed batch, replacing it");
                    state.open = None;
                }
            }
        }

        let batch_id = shared.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let (batch, signals) = Batch::open(batch_id, max_batch_size);
        let batch = Arc::new(batch);
        debug!(batch_id, "Opened batch");

        state.registry.insert(id.clone(), Arc::clone(&batch));
        match batch.try_join(id, max_batch_size) {
            JoinOutcome::Joined { full: true } => {
                shared.detach_sealed(&mut state, &batch, SealReason::BatchFull);
            }
            _ => state.open = Some(Arc::clone(&batch)),
        }

        (batch, Some(signals))
    }
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Seal `batch` if still open and detach it from the open slot.
    /// Caller holds the state lock.
    fn seal_locked(
        &self,
        state: &mut FetcherState<K, V>,
        batch: &Arc<Batch<K, V>>,
        reason: SealReason,
    ) -> bool {
        if !batch.seal(reason) {
            return false;
        }
        self.detach_sealed(state, batch, reason);
        true
    }

    fn detach_sealed(
        &self,
        state: &mut FetcherState<K, V>,
        batch: &Arc<Batch<K, V>>,
        reason: SealReason,
    ) {
        if state.open.as_ref().is_some_and(|open| Arc::ptr_eq(open, batch)) {
            state.open = None;
        }
        self.counters.record_seal(reason);
        debug!(batch_id = batch.id(), size = batch.len(), reason = %reason, "Sealed batch");
    }

    async fn execute(&self, ids: &[K]) -> BatchOutcome<K, V> {
        // The call sits inside the future so a job that panics before
        // returning its future is caught as well
        let call = async { self.job.fetch_batch(ids).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(values)) => Ok(Arc::new(values)),
            Ok(Err(err)) => Err(FleetError::Job(Arc::new(err))),
            Err(panic) => Err(FleetError::JobPanicked(panic_message(panic.as_ref()))),
        }
    }
}

/// Runs one batch: waits for its seal, executes the job once, purges the
/// registry and publishes the outcome
struct BatchDriver<K, V> {
    shared: Arc<Shared<K, V>>,
    batch: Arc<Batch<K, V>>,
}

impl<K, V> BatchDriver<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[instrument(skip_all, fields(batch_id = self.batch.id()))]
    async fn run(self, signals: BatchSignals<K, V>) {
        let BatchSignals { seal, publisher } = signals;
        let mut purge = RegistryPurge {
            shared: Arc::clone(&self.shared),
            batch: Arc::clone(&self.batch),
            done: false,
        };

        // A max_wait too large for the clock means the timer never fires
        let deadline = self.batch.opened_at().checked_add(self.shared.config.max_wait);
        let timer = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = seal => {}
            _ = timer => {}
        }
        {
            // No-op when a size or manual seal already won
            let mut state = self.shared.state.lock();
            self.shared.seal_locked(&mut state, &self.batch, SealReason::Timeout);
        }

        let ids = self.batch.begin_execution();
        let reason = self.batch.seal_reason().unwrap_or(SealReason::Timeout);
        let started = tokio::time::Instant::now();
        debug!(size = ids.len(), reason = %reason, "Executing batch");

        let outcome = self.shared.execute(&ids).await;
        self.shared.counters.record_execution(ids.len());

        match &outcome {
            Ok(values) => info!(
                size = ids.len(),
                found = values.len(),
                reason = %reason,
                duration_ms = saturating_millis(started.elapsed()),
                "Batch completed"
            ),
            Err(err @ FleetError::JobPanicked(_)) => {
                self.shared.counters.record_failure(true);
                error!(size = ids.len(), error = %err, "Batch job panicked");
            }
            Err(err) => {
                self.shared.counters.record_failure(false);
                warn!(size = ids.len(), error = %err, "Batch job failed");
            }
        }

        // Waiters already hold the batch, so purging first only stops new
        // requests from reaching a finished batch
        purge.purge();
        publisher.publish(outcome);
        self.batch.finish();
    }
}

/// Removes a batch's ids from the registry. Runs on drop as well, so a
/// driver task dropped before publishing still leaves no stale entries.
struct RegistryPurge<K, V>
where
    K: Eq + Hash + Clone,
{
    shared: Arc<Shared<K, V>>,
    batch: Arc<Batch<K, V>>,
    done: bool,
}

impl<K, V> RegistryPurge<K, V>
where
    K: Eq + Hash + Clone,
{
    fn purge(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        let mut state = self.shared.state.lock();
        if state.open.as_ref().is_some_and(|open| Arc::ptr_eq(open, &self.batch)) {
            state.open = None;
        }

        let ids = self.batch.ids();
        for id in &ids {
            if state
                .registry
                .get(id)
                .is_some_and(|owner| Arc::ptr_eq(owner, &self.batch))
            {
                state.registry.remove(id);
            }
        }
        debug!(batch_id = self.batch.id(), purged = ids.len(), "Purged batch ids");
    }
}

impl<K, V> Drop for RegistryPurge<K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.purge();
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "job panicked".to_string()
    }
}
