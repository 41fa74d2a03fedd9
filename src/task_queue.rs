use crate::bounded_queue::BoundedQueue;
use crate::error::{OfferError, PoolError};

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// Identifies a worker to the pool that owns it.
pub type WorkerId = u64;

/// The view of a worker pool that an [`AdaptiveTaskQueue`] needs in order to
/// decide between queueing a task and growing the pool.
///
/// Size reads are snapshots; they do not need to be consistent with each other.
pub trait PoolControl: Send + Sync {
  /// Number of live workers.
  fn current_size(&self) -> usize;

  /// Maximum number of workers the pool may grow to.
  fn maximum_size(&self) -> usize;

  /// Number of tasks submitted and not yet finished (queued or running).
  fn submitted_count(&self) -> usize;

  fn is_shutdown(&self) -> bool;

  /// How long a surplus worker waits for a task before it may be retired.
  fn keep_alive(&self) -> Duration;

  /// Whether `worker` is surplus to the pool's target size and should wait
  /// no longer than the keep-alive before being considered for exit.
  fn should_worker_stop(&self, worker: WorkerId) -> bool;

  /// Called when `worker` timed out waiting for a task. The pool may retire it.
  fn on_worker_idle_timeout(&self, worker: WorkerId);
}

/// A bounded FIFO task queue that cooperates with its pool's growth policy.
///
/// While the pool can still start workers and every existing worker is busy,
/// [`offer`](Self::offer) declines so the pool grows instead of queueing.
/// Once growth is exhausted tasks are queued, and [`force`](Self::force) lets
/// the pool insert a task after a failed growth attempt.
///
/// Without an attached pool the queue behaves like a plain bounded queue.
pub struct AdaptiveTaskQueue<T> {
  inner: BoundedQueue<T>,
  parent: OnceLock<Weak<dyn PoolControl>>,
  forced_remaining_capacity: Mutex<Option<usize>>,
}

impl<T> fmt::Debug for AdaptiveTaskQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AdaptiveTaskQueue")
      .field("queue", &self.inner)
      .field("pool_attached", &self.pool().is_some())
      .field("capacity_override", &self.capacity_override())
      .finish()
  }
}

impl<T> AdaptiveTaskQueue<T> {
  /// Creates an unattached queue that holds at most `capacity` tasks.
  ///
  /// # Panics
  /// Panics if `capacity` exceeds [`tokio::sync::Semaphore::MAX_PERMITS`].
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: BoundedQueue::new(capacity),
      parent: OnceLock::new(),
      forced_remaining_capacity: Mutex::new(None),
    }
  }

  /// Attaches the owning pool. The queue keeps only a weak reference, so it
  /// never extends the pool's lifetime.
  ///
  /// # Errors
  /// Returns `PoolError::PoolAlreadyAttached` if a pool was attached before.
  pub fn attach_pool<P: PoolControl + 'static>(&self, pool: &Arc<P>) -> Result<(), PoolError> {
    let weak: Weak<P> = Arc::downgrade(pool);
    self.parent.set(weak).map_err(|_| PoolError::PoolAlreadyAttached)
  }

  fn pool(&self) -> Option<Arc<dyn PoolControl>> {
    self.parent.get().and_then(Weak::upgrade)
  }

  /// Offers a task without waiting. A declined task is handed back.
  ///
  /// The decision, first match wins:
  /// 1. no pool attached: plain bounded insert;
  /// 2. the pool is at its maximum size: queue;
  /// 3. there are at least as many workers as outstanding tasks: queue;
  /// 4. the pool can still grow: decline, so the caller starts a worker;
  /// 5. otherwise queue.
  pub fn offer(&self, task: T) -> Result<(), T> {
    let Some(pool) = self.pool() else {
      return self.inner.offer(task);
    };

    let current = pool.current_size();
    let maximum = pool.maximum_size();
    if current == maximum {
      return self.inner.offer(task);
    }
    if pool.submitted_count() <= current {
      return self.inner.offer(task);
    }
    if current < maximum {
      info!(current_size = current, maximum_size = maximum, "Declining to queue task so the pool can grow.");
      return Err(task);
    }
    // Only reachable when the maximum was lowered below the current size.
    self.inner.offer(task)
  }

  /// Stores a task bypassing the growth policy, without waiting.
  ///
  /// # Errors
  /// `OfferError::Rejected` if no pool is attached or the pool is shutting
  /// down, `OfferError::Full` if the queue has no free space.
  pub fn force(&self, task: T) -> Result<(), OfferError<T>> {
    if !self.is_running() {
      return Err(OfferError::Rejected(task));
    }
    self.inner.offer(task).map_err(OfferError::Full)
  }

  /// Stores a task bypassing the growth policy, waiting up to `timeout` for
  /// free space.
  ///
  /// # Errors
  /// `OfferError::Rejected` if no pool is attached or the pool is shutting
  /// down, `OfferError::Full` if no space freed up in time, and
  /// `OfferError::Cancelled` if `cancel` fired while waiting.
  pub async fn force_timeout(
    &self,
    task: T,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<(), OfferError<T>> {
    if !self.is_running() {
      return Err(OfferError::Rejected(task));
    }
    self.inner.offer_timeout(task, timeout, cancel).await
  }

  fn is_running(&self) -> bool {
    self.pool().is_some_and(|pool| !pool.is_shutdown())
  }

  /// Waits up to `timeout` for a task on behalf of `worker`.
  ///
  /// When the wait elapses the pool is told that `worker` idled out, and
  /// `Ok(None)` is returned so the worker can check whether it should exit.
  ///
  /// # Errors
  /// `PoolError::WaitCancelled` if `cancel` fired while waiting.
  pub async fn poll(
    &self,
    worker: WorkerId,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<Option<T>, PoolError> {
    let task = self.inner.poll_timeout(timeout, cancel).await?;
    if task.is_none() {
      if let Some(pool) = self.pool() {
        trace!(worker_id = worker, "Idle wait elapsed without a task.");
        pool.on_worker_idle_timeout(worker);
      }
    }
    Ok(task)
  }

  /// Waits for a task on behalf of `worker`.
  ///
  /// A worker the pool considers surplus only waits for the pool's keep-alive,
  /// so this may return `Ok(None)`. Callers treat that as "check whether I
  /// should exit", not as an error.
  ///
  /// # Errors
  /// `PoolError::WaitCancelled` if `cancel` fired while waiting.
  pub async fn take(&self, worker: WorkerId, cancel: &CancellationToken) -> Result<Option<T>, PoolError> {
    let bounded_wait = self
      .pool()
      .filter(|pool| pool.should_worker_stop(worker))
      .map(|pool| pool.keep_alive());

    match bounded_wait {
      Some(keep_alive) => self.poll(worker, keep_alive, cancel).await,
      None => self.inner.take(cancel).await.map(Some),
    }
  }

  /// Removes the head of the queue without waiting and without consulting
  /// the pool.
  pub fn try_poll(&self) -> Option<T> {
    self.inner.try_poll()
  }

  /// Removes every queued task in FIFO order.
  pub fn drain(&self) -> Vec<T> {
    self.inner.drain()
  }

  pub fn len(&self) -> usize {
    self.inner.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity()
  }

  /// Free space in the queue, or the capacity override while one is set.
  pub fn remaining_capacity(&self) -> usize {
    match self.capacity_override() {
      Some(forced) => forced,
      None => self.inner.remaining_capacity(),
    }
  }

  /// Sets or clears the value reported by [`remaining_capacity`](Self::remaining_capacity).
  ///
  /// Meant to be driven by a single thread at a time (the pool serializes its
  /// resize sequences); readers on other threads see the latest value.
  pub fn set_capacity_override(&self, forced: Option<usize>) {
    *self.forced_remaining_capacity.lock() = forced;
  }

  pub fn capacity_override(&self) -> Option<usize> {
    *self.forced_remaining_capacity.lock()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  #[derive(Debug, Default)]
  struct MockPool {
    current: AtomicUsize,
    maximum: AtomicUsize,
    submitted: AtomicUsize,
    shutdown: AtomicBool,
    stop_workers: AtomicBool,
    keep_alive_ms: AtomicUsize,
    idle_timeouts: Mutex<Vec<WorkerId>>,
  }

  impl MockPool {
    fn with_sizes(current: usize, maximum: usize, submitted: usize) -> Arc<Self> {
      let pool = Self::default();
      pool.current.store(current, Ordering::SeqCst);
      pool.maximum.store(maximum, Ordering::SeqCst);
      pool.submitted.store(submitted, Ordering::SeqCst);
      pool.keep_alive_ms.store(60, Ordering::SeqCst);
      Arc::new(pool)
    }
  }

  impl PoolControl for MockPool {
    fn current_size(&self) -> usize {
      self.current.load(Ordering::SeqCst)
    }
    fn maximum_size(&self) -> usize {
      self.maximum.load(Ordering::SeqCst)
    }
    fn submitted_count(&self) -> usize {
      self.submitted.load(Ordering::SeqCst)
    }
    fn is_shutdown(&self) -> bool {
      self.shutdown.load(Ordering::SeqCst)
    }
    fn keep_alive(&self) -> Duration {
      Duration::from_millis(self.keep_alive_ms.load(Ordering::SeqCst) as u64)
    }
    fn should_worker_stop(&self, _worker: WorkerId) -> bool {
      self.stop_workers.load(Ordering::SeqCst)
    }
    fn on_worker_idle_timeout(&self, worker: WorkerId) {
      self.idle_timeouts.lock().push(worker);
    }
  }

  fn attached_queue(pool: &Arc<MockPool>, capacity: usize) -> AdaptiveTaskQueue<u32> {
    let queue = AdaptiveTaskQueue::new(capacity);
    queue.attach_pool(pool).unwrap();
    queue
  }

  #[test]
  fn test_unattached_queue_is_plain_bounded_queue() {
    let queue = AdaptiveTaskQueue::new(1);
    assert!(queue.offer(1).is_ok());
    assert_eq!(queue.offer(2), Err(2));
    assert!(matches!(queue.force(3), Err(OfferError::Rejected(3))));
  }

  #[test]
  fn test_attach_pool_only_once() {
    let pool = MockPool::with_sizes(1, 1, 0);
    let queue = attached_queue(&pool, 4);
    assert_eq!(queue.attach_pool(&pool), Err(PoolError::PoolAlreadyAttached));
  }

  #[test]
  fn test_offer_declines_when_pool_can_grow() {
    // The submitted count includes the task being offered.
    let pool = MockPool::with_sizes(2, 4, 3);
    let queue = attached_queue(&pool, 8);
    assert_eq!(queue.offer(1), Err(1));
    assert!(queue.is_empty());

    pool.submitted.store(40, Ordering::SeqCst);
    assert_eq!(queue.offer(2), Err(2));
    assert!(queue.is_empty());
  }

  #[test]
  fn test_offer_queues_when_workers_are_idle() {
    let pool = MockPool::with_sizes(2, 4, 1);
    let queue = attached_queue(&pool, 8);
    assert!(queue.offer(1).is_ok());

    pool.submitted.store(2, Ordering::SeqCst);
    assert!(queue.offer(2).is_ok());
    pool.submitted.store(0, Ordering::SeqCst);
    assert!(queue.offer(3).is_ok());
    assert_eq!(queue.len(), 3);
  }

  #[test]
  fn test_offer_queues_at_maximum_size_regardless_of_submissions() {
    let pool = MockPool::with_sizes(4, 4, 0);
    let queue = attached_queue(&pool, 16);
    for submitted in [0, 1, 4, 5, 100] {
      pool.submitted.store(submitted, Ordering::SeqCst);
      assert!(queue.offer(submitted as u32).is_ok(), "submitted = {}", submitted);
    }
    assert_eq!(queue.len(), 5);
  }

  #[test]
  fn test_offer_falls_back_to_queueing_above_maximum() {
    // Maximum lowered below the live worker count.
    let pool = MockPool::with_sizes(6, 4, 10);
    let queue = attached_queue(&pool, 2);
    assert!(queue.offer(1).is_ok());
    assert!(queue.offer(2).is_ok());
    assert_eq!(queue.offer(3), Err(3), "a full queue still declines");
  }

  #[test]
  fn test_offer_after_pool_dropped_acts_unattached() {
    let pool = MockPool::with_sizes(1, 4, 10);
    let queue = attached_queue(&pool, 2);
    drop(pool);
    assert!(queue.offer(1).is_ok());
    assert!(matches!(queue.force(2), Err(OfferError::Rejected(2))));
  }

  #[test]
  fn test_force_rejects_on_shutdown() {
    let pool = MockPool::with_sizes(4, 4, 4);
    let queue = attached_queue(&pool, 4);
    pool.shutdown.store(true, Ordering::SeqCst);
    let err = queue.force(9).unwrap_err();
    assert!(matches!(err, OfferError::Rejected(_)));
    assert_eq!(PoolError::from(err), PoolError::RejectedSubmission);
    assert!(queue.is_empty());
  }

  #[test]
  fn test_force_bypasses_growth_policy() {
    let pool = MockPool::with_sizes(2, 4, 10);
    let queue = attached_queue(&pool, 1);
    assert_eq!(queue.offer(1), Err(1));
    assert!(queue.force(1).is_ok());
    assert!(matches!(queue.force(2), Err(OfferError::Full(2))));
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test]
  async fn test_force_timeout_rejects_on_shutdown() {
    let pool = MockPool::with_sizes(1, 1, 1);
    let queue = attached_queue(&pool, 1);
    pool.shutdown.store(true, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    let result = queue.force_timeout(5, Duration::from_millis(10), &cancel).await;
    assert!(matches!(result, Err(OfferError::Rejected(5))));
  }

  #[tokio::test]
  async fn test_force_timeout_times_out_when_full() {
    let pool = MockPool::with_sizes(1, 1, 1);
    let queue = attached_queue(&pool, 1);
    let cancel = CancellationToken::new();
    queue.force(1).unwrap();
    let result = queue.force_timeout(2, Duration::from_millis(30), &cancel).await;
    assert!(matches!(result, Err(OfferError::Full(2))));
  }

  #[test]
  fn test_remaining_capacity_override() {
    let queue = AdaptiveTaskQueue::new(3);
    queue.offer(1).unwrap();
    assert_eq!(queue.remaining_capacity(), 2);

    queue.set_capacity_override(Some(0));
    assert_eq!(queue.remaining_capacity(), 0);
    queue.offer(2).unwrap();
    queue.set_capacity_override(Some(7));
    assert_eq!(queue.remaining_capacity(), 7);

    queue.set_capacity_override(None);
    assert_eq!(queue.capacity_override(), None);
    assert_eq!(queue.remaining_capacity(), 1);
  }

  #[test]
  fn test_capacity_override_is_returned_exactly() {
    let queue = AdaptiveTaskQueue::<u32>::new(3);
    queue.set_capacity_override(Some(usize::MAX));
    assert_eq!(queue.capacity_override(), Some(usize::MAX));
    assert_eq!(queue.remaining_capacity(), usize::MAX);
  }

  #[tokio::test]
  async fn test_force_timeout_reports_cancellation_with_task() {
    let pool = MockPool::with_sizes(1, 1, 1);
    let queue = Arc::new(attached_queue(&pool, 1));
    let cancel = CancellationToken::new();
    queue.force(1).unwrap();

    let waiter = {
      let queue = queue.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move { queue.force_timeout(2, Duration::from_secs(5), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_millis(500), waiter)
      .await
      .expect("cancelled insert should return promptly")
      .unwrap();
    assert!(matches!(result, Err(OfferError::Cancelled(2))));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.remaining_capacity(), 0);
  }

  #[tokio::test]
  async fn test_take_on_stopping_worker_times_out_after_keep_alive() {
    let pool = MockPool::with_sizes(3, 4, 0);
    pool.stop_workers.store(true, Ordering::SeqCst);
    let queue = attached_queue(&pool, 4);
    let cancel = CancellationToken::new();

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(2), queue.take(42, &cancel))
      .await
      .expect("take should be bounded by the keep-alive");
    assert_eq!(result, Ok(None));
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(*pool.idle_timeouts.lock(), vec![42]);
  }

  #[tokio::test]
  async fn test_take_waits_unbounded_for_core_worker() {
    let pool = MockPool::with_sizes(1, 4, 0);
    let queue = attached_queue(&pool, 4);
    let cancel = CancellationToken::new();

    let waited = tokio::time::timeout(Duration::from_millis(150), queue.take(1, &cancel)).await;
    assert!(waited.is_err(), "a core worker should keep waiting past the keep-alive");
    assert!(pool.idle_timeouts.lock().is_empty());

    queue.offer(5).unwrap();
    assert_eq!(queue.take(1, &cancel).await, Ok(Some(5)));
  }

  #[tokio::test]
  async fn test_poll_returns_task_without_idle_notification() {
    let pool = MockPool::with_sizes(1, 1, 1);
    let queue = attached_queue(&pool, 4);
    let cancel = CancellationToken::new();
    queue.offer(11).unwrap();
    assert_eq!(queue.poll(3, Duration::from_millis(10), &cancel).await, Ok(Some(11)));
    assert!(pool.idle_timeouts.lock().is_empty());
  }

  #[tokio::test]
  async fn test_cancelled_wait_is_reported() {
    let pool = MockPool::with_sizes(1, 1, 0);
    let queue = Arc::new(attached_queue(&pool, 4));
    let cancel = CancellationToken::new();

    let waiter = {
      let queue = queue.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move { queue.take(7, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert_eq!(waiter.await.unwrap(), Err(PoolError::WaitCancelled));
    assert!(pool.idle_timeouts.lock().is_empty());
  }
}
