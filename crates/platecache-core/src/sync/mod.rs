//! Offline write path.
//!
//! - `queue`: durable FIFO of requests waiting for delivery
//! - `engine`: drains the queue in order, stopping at the first failure
//! - `backoff`: bounded exponential delay between failed rounds
//! - `worker`: background task driving the engine

pub mod backoff;
pub mod engine;
pub mod queue;
pub mod worker;

pub use backoff::{Backoff, RetryConfig, MAX_RETRY_DELAY_MS};
pub use engine::{DrainOutcome, DrainReport, SyncEngine, SyncState};
pub use queue::{OperationId, PendingOperation, PendingQueue};
pub use worker::SyncWorker;
