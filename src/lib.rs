//! A Tokio-based worker pool whose bounded task queue cooperates with the
//! pool's growth policy: while every worker is busy and the pool can still
//! grow, new tasks start workers instead of waiting in the queue. Only once
//! growth is exhausted are tasks queued, then force-inserted, then rejected.

mod bounded_queue;
mod config;
mod error;
mod handle;
mod manager;
mod task;
mod task_queue;
mod worker;

pub use config::PoolConfig;
pub use error::{OfferError, PoolError};
pub use handle::TaskHandle;
pub use manager::{AdaptivePoolManager, ShutdownMode};
pub use task::TaskToExecute;
pub use task_queue::{AdaptiveTaskQueue, PoolControl, WorkerId};
