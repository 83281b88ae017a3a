//! Simple batched fetch example
//!
//! Simulates a key-value backend with a fixed round-trip cost and shows
//! concurrent lookups sharing batches.

use singlefleet::{Fetcher, FetcherConfig, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("singlefleet=debug")
        .init();

    let users: HashMap<u32, String> = (1..=50).map(|id| (id, format!("user-{id}"))).collect();

    let fetcher = Fetcher::from_fn(
        move |ids: Vec<u32>| {
            let found: HashMap<u32, String> = ids
                .iter()
                .filter_map(|id| users.get(id).map(|name| (*id, name.clone())))
                .collect();
            async move {
                // One round trip, regardless of how many ids
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(found)
            }
        },
        FetcherConfig::new(Duration::from_millis(10), 16),
    )?;

    let start = Instant::now();
    let handles: Vec<_> = (1..=60u32)
        .map(|id| {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { (id, fetcher.fetch(id).await) })
        })
        .collect();

    for handle in handles {
        let (id, result) = handle.await.expect("fetch task");
        match result? {
            Some(name) => println!("{id:>3} -> {name}"),
            None => println!("{id:>3} -> not found"),
        }
    }

    let stats = fetcher.stats();
    println!(
        "\n{} requests served by {} backend calls in {:?}",
        stats.requests,
        stats.batches_executed,
        start.elapsed()
    );
    Ok(())
}
