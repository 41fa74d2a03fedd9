use crate::error::PoolError;
use crate::manager::PoolInner;
use crate::task::Job;
use crate::task_queue::WorkerId;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Registry entry for a live worker.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
  /// Cancels the worker's current queue wait.
  pub(crate) token: CancellationToken,
  pub(crate) idle: bool,
  /// Set once the worker no longer counts towards the pool size.
  pub(crate) retired: bool,
}

impl WorkerSlot {
  pub(crate) fn new(token: CancellationToken) -> Self {
    Self {
      token,
      idle: false,
      retired: false,
    }
  }
}

/// Runs one worker until it is retired or the pool shuts down with an empty queue.
pub(crate) async fn run_worker(
  pool: Arc<PoolInner>,
  worker_id: WorkerId,
  mut token: CancellationToken,
  first_task: Option<Job>,
) {
  debug!(pool_name = %*pool.name, worker_id, "Worker started.");

  if let Some(job) = first_task {
    pool.run_job(worker_id, job).await;
  }

  loop {
    if pool.is_retired(worker_id) {
      debug!(pool_name = %*pool.name, worker_id, "Worker retired.");
      break;
    }

    if pool.is_shutting_down() {
      match pool.queue.try_poll() {
        Some(job) => {
          trace!(pool_name = %*pool.name, worker_id, task_id = job.task_id, "Draining queued task during shutdown.");
          pool.run_job(worker_id, job).await;
          continue;
        }
        None => {
          debug!(pool_name = %*pool.name, worker_id, "Queue drained during shutdown. Worker exiting.");
          break;
        }
      }
    }

    pool.set_idle(worker_id, true);
    let next = pool.queue.take(worker_id, &token).await;
    pool.set_idle(worker_id, false);

    match next {
      Ok(Some(job)) => pool.run_job(worker_id, job).await,
      Ok(None) => trace!(pool_name = %*pool.name, worker_id, "No task within keep-alive."),
      Err(PoolError::WaitCancelled) => {
        if !pool.is_retired(worker_id) && !pool.is_shutting_down() {
          trace!(pool_name = %*pool.name, worker_id, "Queue wait interrupted. Re-evaluating.");
          token = pool.renew_worker_token(worker_id);
        }
      }
      Err(e) => {
        error!(pool_name = %*pool.name, worker_id, "Worker could not read from the task queue: {}", e);
        break;
      }
    }
  }

  pool.worker_exited(worker_id);
}
