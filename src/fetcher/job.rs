//! Bulk fetch jobs
//!
//! A job receives the unique ids of one sealed batch and returns the values
//! it found, keyed by id. Ids missing from the returned map are reported as
//! not found to their callers. An error fails the whole batch and the map is
//! discarded.

use std::collections::HashMap;
use std::future::Future;
use async_trait::async_trait;

/// A batched fetch operation against some backend
#[async_trait]
pub trait BatchJob<K, V>: Send + Sync {
    /// Fetch every id in `ids` in one round trip. `ids` holds no duplicates.
    async fn fetch_batch(&self, ids: &[K]) -> anyhow::Result<HashMap<K, V>>;
}

/// Adapts an async closure into a [`BatchJob`]
///
/// The closure receives an owned copy of the batch ids so it can move them
/// into its future.
pub struct FnJob<F> {
    f: F,
}

impl<F> FnJob<F> {
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<K, V, F, Fut> BatchJob<K, V> for FnJob<F>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashMap<K, V>>> + Send,
{
    async fn fetch_batch(&self, ids: &[K]) -> anyhow::Result<HashMap<K, V>> {
        (self.f)(ids.to_vec()).await
    }
}

impl<F> std::fmt::Debug for FnJob<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnJob").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_job_receives_ids() {
        let job = FnJob::new(|ids: Vec<u32>| async move {
            Ok::<_, anyhow::Error>(ids.into_iter().map(|id| (id, id * 10)).collect::<HashMap<_, _>>())
        });

        let values = job.fetch_batch(&[1, 2, 3]).await.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[&2], 20);
    }

    #[tokio::test]
    async fn test_fn_job_propagates_error() {
        let job = FnJob::new(|_ids: Vec<u32>| async move {
            Err::<HashMap<u32, u32>, _>(anyhow::anyhow!("backend unavailable"))
        });

        let err = job.fetch_batch(&[7]).await.unwrap_err();
        assert_eq!(err.to_string(), "backend unavailable");
    }
}
