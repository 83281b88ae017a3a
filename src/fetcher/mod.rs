pub mod batch;
pub mod config;
pub mod coordinator;
pub mod job;
pub mod stats;

pub use batch::{BatchState, SealReason};
pub use config::*;
pub use coordinator::*;
pub use job::*;
pub use stats::FetcherStats;
