use crate::config::PoolConfig;
use crate::error::{OfferError, PoolError};
use crate::handle::TaskHandle;
use crate::task::{Job, SubmittedGuard, TaskToExecute};
use crate::task_queue::{AdaptiveTaskQueue, PoolControl, WorkerId};
use crate::worker::{self, WorkerSlot};

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops accepting tasks, runs every queued task and waits for running
  /// tasks to complete.
  Graceful,
  /// Cancels every task. Running tasks resolve as cancelled, and queued
  /// tasks resolve as cancelled without running.
  ForcefulCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeBound {
  Core,
  Max,
}

/// State shared between the manager, its workers and its task queue.
pub(crate) struct PoolInner {
  pub(crate) name: Arc<String>,
  pub(crate) queue: AdaptiveTaskQueue<Job>,
  core_size: AtomicUsize,
  max_size: AtomicUsize,
  keep_alive: Duration,
  allow_core_timeout: bool,
  current_size: AtomicUsize,
  largest_size: AtomicUsize,
  active_count: AtomicUsize,
  completed_count: AtomicU64,
  submitted: Arc<AtomicUsize>,
  next_worker_id: AtomicU64,
  workers: DashMap<WorkerId, WorkerSlot>,
  shutdown_token: CancellationToken,
  task_root_token: CancellationToken,
  resize_lock: Mutex<()>,
  tracker: TaskTracker,
  tokio_handle: TokioHandle,
}

impl PoolControl for PoolInner {
  fn current_size(&self) -> usize {
    self.current_size.load(AtomicOrdering::Acquire)
  }

  fn maximum_size(&self) -> usize {
    self.max_size.load(AtomicOrdering::Acquire)
  }

  fn submitted_count(&self) -> usize {
    self.submitted.load(AtomicOrdering::Acquire)
  }

  fn is_shutdown(&self) -> bool {
    self.is_shutting_down()
  }

  fn keep_alive(&self) -> Duration {
    self.keep_alive
  }

  fn should_worker_stop(&self, worker: WorkerId) -> bool {
    if self.is_retired(worker) {
      return true;
    }
    let current = self.current_size();
    current > self.maximum_size() || current > self.core_size() || (self.allow_core_timeout && current > 0)
  }

  fn on_worker_idle_timeout(&self, worker: WorkerId) {
    if self.is_retired(worker) {
      return;
    }
    let floor = if self.allow_core_timeout { 0 } else { self.core_size() };
    // The last worker stays while tasks are still queued.
    let floor = if self.queue.is_empty() { floor } else { floor.max(1) };
    if self.try_retire(floor) {
      self.mark_retired(worker);
      debug!(pool_name = %*self.name, worker_id = worker, "Retiring idle worker after keep-alive.");
    }
  }
}

impl PoolInner {
  fn core_size(&self) -> usize {
    self.core_size.load(AtomicOrdering::Acquire)
  }

  pub(crate) fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  pub(crate) fn is_retired(&self, worker: WorkerId) -> bool {
    self.workers.get(&worker).map_or(true, |slot| slot.retired)
  }

  fn mark_retired(&self, worker: WorkerId) {
    if let Some(mut slot) = self.workers.get_mut(&worker) {
      slot.retired = true;
    }
  }

  pub(crate) fn set_idle(&self, worker: WorkerId, idle: bool) {
    if let Some(mut slot) = self.workers.get_mut(&worker) {
      slot.idle = idle;
    }
  }

  /// Replaces a worker's interrupted wait token with a fresh one.
  pub(crate) fn renew_worker_token(&self, worker: WorkerId) -> CancellationToken {
    let token = self.shutdown_token.child_token();
    if let Some(mut slot) = self.workers.get_mut(&worker) {
      slot.token = token.clone();
    }
    token
  }

  pub(crate) async fn run_job(&self, worker: WorkerId, job: Job) {
    let task_id = job.task_id;
    self.active_count.fetch_add(1, AtomicOrdering::AcqRel);
    trace!(pool_name = %*self.name, worker_id = worker, %task_id, "Running task.");
    job.run().await;
    self.active_count.fetch_sub(1, AtomicOrdering::AcqRel);
    self.completed_count.fetch_add(1, AtomicOrdering::Relaxed);
  }

  pub(crate) fn worker_exited(self: &Arc<Self>, worker: WorkerId) {
    let retired = self.workers.remove(&worker).map_or(true, |(_, slot)| slot.retired);
    if !retired {
      self.current_size.fetch_sub(1, AtomicOrdering::AcqRel);
    }
    debug!(
      pool_name = %*self.name,
      worker_id = worker,
      current_size = self.current_size(),
      "Worker stopped."
    );

    // A task may have been queued while this worker was retiring.
    if self.current_size() == 0 && !self.queue.is_empty() && self.add_idle_worker(SizeBound::Max) {
      debug!(pool_name = %*self.name, queued = self.queue.len(), "Started a replacement worker for queued tasks.");
    }
  }

  /// Counts a new worker if the pool is below `bound`.
  fn reserve_worker(&self, bound: SizeBound) -> bool {
    loop {
      let current = self.current_size();
      let limit = match bound {
        SizeBound::Core => self.core_size(),
        SizeBound::Max => self.maximum_size(),
      };
      if current >= limit {
        return false;
      }
      if self
        .current_size
        .compare_exchange(current, current + 1, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
        .is_ok()
      {
        self.largest_size.fetch_max(current + 1, AtomicOrdering::Relaxed);
        return true;
      }
    }
  }

  /// Stops counting one worker if the pool is above `floor`.
  fn try_retire(&self, floor: usize) -> bool {
    loop {
      let current = self.current_size();
      if current <= floor {
        return false;
      }
      if self
        .current_size
        .compare_exchange(current, current - 1, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
        .is_ok()
      {
        return true;
      }
    }
  }

  fn add_worker(self: &Arc<Self>, first_task: Job, bound: SizeBound) -> Result<(), Job> {
    if self.is_shutting_down() || !self.reserve_worker(bound) {
      return Err(first_task);
    }
    self.spawn_worker(Some(first_task));
    Ok(())
  }

  fn add_idle_worker(self: &Arc<Self>, bound: SizeBound) -> bool {
    // During shutdown a worker is only started to drain stranded tasks.
    if self.is_shutting_down() && self.queue.is_empty() {
      return false;
    }
    if !self.reserve_worker(bound) {
      return false;
    }
    self.spawn_worker(None);
    true
  }

  fn spawn_worker(self: &Arc<Self>, first_task: Option<Job>) {
    let worker_id = self.next_worker_id.fetch_add(1, AtomicOrdering::Relaxed);
    let token = self.shutdown_token.child_token();
    self.workers.insert(worker_id, WorkerSlot::new(token.clone()));

    debug!(
      pool_name = %*self.name,
      worker_id,
      current_size = self.current_size(),
      with_task = first_task.is_some(),
      "Starting worker."
    );
    self.tracker.spawn_on(
      worker::run_worker(self.clone(), worker_id, token, first_task)
        .instrument(info_span!("adaptive_pool_worker", pool_name = %*self.name, worker_id)),
      &self.tokio_handle,
    );
  }

  /// Makes sure a queued task is not stranded without any worker.
  fn ensure_worker_for_queue(self: &Arc<Self>) {
    if self.current_size() == 0 {
      self.add_idle_worker(SizeBound::Max);
    }
  }

  /// Starts a core worker, or queues, or starts a non-core worker, in that
  /// order. Hands the job back if none of them worked.
  fn grow_or_queue(self: &Arc<Self>, job: Job) -> Result<(), Job> {
    let job = if self.current_size() < self.core_size() {
      match self.add_worker(job, SizeBound::Core) {
        Ok(()) => return Ok(()),
        Err(job) => job,
      }
    } else {
      job
    };

    let job = match self.queue.offer(job) {
      Ok(()) => {
        self.ensure_worker_for_queue();
        return Ok(());
      }
      Err(job) => job,
    };

    self.add_worker(job, SizeBound::Max)
  }

  fn execute(self: &Arc<Self>, job: Job) -> Result<(), PoolError> {
    let job = match self.grow_or_queue(job) {
      Ok(()) => return Ok(()),
      Err(job) => job,
    };

    let task_id = job.task_id;
    match self.queue.force(job) {
      Ok(()) => {
        self.ensure_worker_for_queue();
        Ok(())
      }
      Err(err) => {
        warn!(pool_name = %*self.name, %task_id, "Rejecting task: {}", err);
        Err(err.into())
      }
    }
  }

  async fn execute_with_timeout(self: &Arc<Self>, job: Job, timeout: Duration) -> Result<(), PoolError> {
    let job = match self.grow_or_queue(job) {
      Ok(()) => return Ok(()),
      Err(job) => job,
    };

    let task_id = job.task_id;
    match self.queue.force_timeout(job, timeout, &self.shutdown_token).await {
      Ok(()) => {
        self.ensure_worker_for_queue();
        Ok(())
      }
      Err(OfferError::Cancelled(_)) => {
        warn!(pool_name = %*self.name, %task_id, "Pool shut down while waiting for queue space.");
        Err(PoolError::PoolShuttingDown)
      }
      Err(err) => {
        warn!(pool_name = %*self.name, %task_id, ?timeout, "Rejecting task: {}", err);
        Err(err.into())
      }
    }
  }

  /// Retires idle workers while the pool is above `floor`. Returns how many.
  fn retire_idle_workers(&self, floor: usize) -> usize {
    let mut retired = 0;
    for mut slot in self.workers.iter_mut() {
      if !slot.idle || slot.retired {
        continue;
      }
      if !self.try_retire(floor) {
        break;
      }
      slot.retired = true;
      slot.token.cancel();
      retired += 1;
    }
    retired
  }

  /// Interrupts idle workers so they re-evaluate how long they should wait.
  fn wake_idle_workers(&self) -> usize {
    let mut woken = 0;
    for slot in self.workers.iter() {
      if slot.idle && !slot.retired {
        slot.token.cancel();
        woken += 1;
      }
    }
    woken
  }

  /// Caller must hold `resize_lock`. Returns the number of workers retired.
  fn apply_core_size(self: &Arc<Self>, core_size: usize) -> usize {
    let previous = self.core_size.swap(core_size, AtomicOrdering::AcqRel);
    let current = self.current_size();

    if current > core_size {
      if self.queue.remaining_capacity() == 0 {
        let retired = self.retire_idle_workers(core_size);
        debug!(pool_name = %*self.name, core_size, retired, "Core size lowered. Retired idle workers.");
        return retired;
      }
      let woken = self.wake_idle_workers();
      debug!(pool_name = %*self.name, core_size, woken, "Core size lowered. Idle workers will time out.");
    } else if core_size > previous {
      let wanted = (core_size - previous).min(self.queue.len());
      let mut started = 0;
      while started < wanted && self.add_idle_worker(SizeBound::Core) {
        started += 1;
      }
      debug!(pool_name = %*self.name, core_size, started, "Core size raised.");
    }
    0
  }

  fn initiate_shutdown(&self, mode: ShutdownMode) -> bool {
    let first = !self.shutdown_token.is_cancelled();
    if first {
      info!(pool_name = %*self.name, "Initiating pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      self.tracker.close();
    }
    if mode == ShutdownMode::ForcefulCancel && !self.task_root_token.is_cancelled() {
      info!(
        pool_name = %*self.name,
        queued = self.queue.len(),
        active = self.active_count.load(AtomicOrdering::Acquire),
        "Forceful shutdown: Cancelling all tasks."
      );
      self.task_root_token.cancel();
    }
    first
  }
}

/// A pool of Tokio workers that grows before it queues.
///
/// Submission starts a core worker while below the core size, otherwise it
/// offers the task to an [`AdaptiveTaskQueue`], which declines while every
/// worker is busy and the pool can still grow. A declined task starts a new
/// worker; if the pool is already at its maximum the task is forced onto the
/// queue, and rejected only when the queue is full.
///
/// Workers above the core size retire after idling for the keep-alive.
pub struct AdaptivePoolManager<R: Send + 'static> {
  inner: Arc<PoolInner>,
  _result: PhantomData<fn() -> R>,
}

impl<R: Send + 'static> std::fmt::Debug for AdaptivePoolManager<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AdaptivePoolManager")
      .field("name", &self.inner.name)
      .field("current_size", &self.current_size())
      .field("core_size", &self.core_size())
      .field("max_size", &self.max_size())
      .field("queued", &self.queued_task_count())
      .field("shutdown", &self.is_shutdown())
      .finish()
  }
}

impl<R: Send + 'static> AdaptivePoolManager<R> {
  /// Creates a pool whose workers run on `tokio_handle`.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidConfig` if `config` does not validate.
  pub fn new(config: PoolConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    config.validate()?;

    let inner = Arc::new(PoolInner {
      name: Arc::new(config.name.clone()),
      queue: AdaptiveTaskQueue::new(config.queue_capacity),
      core_size: AtomicUsize::new(config.core_size),
      max_size: AtomicUsize::new(config.max_size),
      keep_alive: config.keep_alive,
      allow_core_timeout: config.allow_core_timeout,
      current_size: AtomicUsize::new(0),
      largest_size: AtomicUsize::new(0),
      active_count: AtomicUsize::new(0),
      completed_count: AtomicU64::new(0),
      submitted: Arc::new(AtomicUsize::new(0)),
      next_worker_id: AtomicU64::new(0),
      workers: DashMap::new(),
      shutdown_token: CancellationToken::new(),
      task_root_token: CancellationToken::new(),
      resize_lock: Mutex::new(()),
      tracker: TaskTracker::new(),
      tokio_handle,
    });
    inner.queue.attach_pool(&inner)?;

    info!(
      pool_name = %config.name,
      core_size = config.core_size,
      max_size = config.max_size,
      queue_capacity = config.queue_capacity,
      keep_alive = ?config.keep_alive,
      "Created adaptive pool."
    );

    let manager = Arc::new(Self {
      inner,
      _result: PhantomData,
    });
    if config.prestart_core_workers {
      manager.prestart_core_workers();
    }
    Ok(manager)
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn core_size(&self) -> usize {
    self.inner.core_size()
  }

  pub fn max_size(&self) -> usize {
    self.inner.maximum_size()
  }

  /// Number of live workers.
  pub fn current_size(&self) -> usize {
    self.inner.current_size()
  }

  /// Highest number of workers that were ever live at once.
  pub fn largest_size(&self) -> usize {
    self.inner.largest_size.load(AtomicOrdering::Relaxed)
  }

  /// Number of workers currently running a task.
  pub fn active_count(&self) -> usize {
    self.inner.active_count.load(AtomicOrdering::Acquire)
  }

  /// Number of tasks submitted and not yet finished, queued or running.
  pub fn submitted_count(&self) -> usize {
    self.inner.submitted_count()
  }

  pub fn completed_task_count(&self) -> u64 {
    self.inner.completed_count.load(AtomicOrdering::Relaxed)
  }

  /// Returns the current number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.inner.queue.len()
  }

  pub fn remaining_capacity(&self) -> usize {
    self.inner.queue.remaining_capacity()
  }

  pub fn keep_alive(&self) -> Duration {
    self.inner.keep_alive
  }

  pub fn is_shutdown(&self) -> bool {
    self.inner.is_shutting_down()
  }

  /// Submits a task without waiting.
  ///
  /// # Errors
  /// `PoolError::PoolShuttingDown` once shutdown has started,
  /// `PoolError::QueueFull` if the pool is at its maximum size and the queue
  /// is full, `PoolError::RejectedSubmission` if the queue refused a forced insert.
  pub fn submit(&self, task_future: TaskToExecute<R>) -> Result<TaskHandle<R>, PoolError> {
    self.ensure_accepting()?;
    let (job, handle) = self.prepare(task_future);
    debug!(pool_name = %*self.inner.name, task_id = handle.task_id, "Submitting task.");
    self.inner.execute(job)?;
    Ok(handle)
  }

  /// Submits a task, waiting up to `timeout` for queue space if the pool
  /// cannot grow and the queue is full.
  ///
  /// # Errors
  /// As [`submit`](Self::submit), with `PoolError::QueueFull` meaning no space
  /// freed up within `timeout`.
  pub async fn submit_with_timeout(
    &self,
    task_future: TaskToExecute<R>,
    timeout: Duration,
  ) -> Result<TaskHandle<R>, PoolError> {
    self.ensure_accepting()?;
    let (job, handle) = self.prepare(task_future);
    debug!(pool_name = %*self.inner.name, task_id = handle.task_id, ?timeout, "Submitting task with timeout.");
    self.inner.execute_with_timeout(job, timeout).await?;
    Ok(handle)
  }

  fn ensure_accepting(&self) -> Result<(), PoolError> {
    if self.inner.is_shutting_down() {
      warn!(pool_name = %*self.inner.name, "Submit: Attempted to submit task to a pool that is shutting down.");
      return Err(PoolError::PoolShuttingDown);
    }
    Ok(())
  }

  fn prepare(&self, task_future: TaskToExecute<R>) -> (Job, TaskHandle<R>) {
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let token = self.inner.task_root_token.child_token();
    let (result_tx, result_rx) = oneshot::channel::<Result<R, PoolError>>();

    let task_token = token.clone();
    let pool_name_for_task = self.inner.name.clone();
    let future = async move {
      let execution_outcome: Result<R, PoolError> = tokio::select! {
        biased;
        _ = task_token.cancelled() => {
          debug!(pool_name = %*pool_name_for_task, %task_id, "Task cancelled by its token.");
          Err(PoolError::TaskCancelled)
        },
        task_result = AssertUnwindSafe(task_future).catch_unwind() => {
          match task_result {
            Ok(actual_result) => {
              trace!(pool_name = %*pool_name_for_task, %task_id, "Task executed successfully.");
              Ok(actual_result)
            }
            Err(_panic_payload) => {
              error!(pool_name = %*pool_name_for_task, %task_id, "Task panicked during execution.");
              Err(PoolError::TaskPanicked)
            }
          }
        }
      };

      if result_tx.send(execution_outcome).is_err() {
        trace!(pool_name = %*pool_name_for_task, %task_id, "Result receiver for task was dropped.");
      }
    }
    .instrument(info_span!("managed_task", pool_name = %*self.inner.name, %task_id));

    let job = Job::new(task_id, Box::pin(future), SubmittedGuard::new(self.inner.submitted.clone()));
    let handle = TaskHandle {
      task_id,
      cancellation_token: token,
      result_receiver: Some(result_rx),
    };
    (job, handle)
  }

  /// Changes the core size at runtime.
  ///
  /// Lowering it below the live worker count retires idle workers at once
  /// when the queue reports no remaining capacity; otherwise idle workers are
  /// woken and retire after the keep-alive. Raising it starts workers for
  /// tasks that are already queued.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidConfig` if `core_size` exceeds the maximum size.
  pub fn set_core_size(&self, core_size: usize) -> Result<(), PoolError> {
    let _resize = self.inner.resize_lock.lock();
    if core_size > self.inner.maximum_size() {
      return Err(PoolError::InvalidConfig(format!(
        "core_size ({}) must not exceed max_size ({})",
        core_size,
        self.inner.maximum_size()
      )));
    }
    self.inner.apply_core_size(core_size);
    Ok(())
  }

  /// Changes the maximum size at runtime, retiring idle workers above it.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidConfig` if `max_size` is zero or below the core size.
  pub fn set_max_size(&self, max_size: usize) -> Result<(), PoolError> {
    let _resize = self.inner.resize_lock.lock();
    if max_size == 0 || max_size < self.inner.core_size() {
      return Err(PoolError::InvalidConfig(format!(
        "max_size ({}) must be at least 1 and not below core_size ({})",
        max_size,
        self.inner.core_size()
      )));
    }
    self.inner.max_size.store(max_size, AtomicOrdering::Release);
    if self.inner.current_size() > max_size {
      let retired = self.inner.retire_idle_workers(max_size);
      self.inner.wake_idle_workers();
      debug!(pool_name = %*self.inner.name, max_size, retired, "Max size lowered.");
    }
    Ok(())
  }

  /// Retires every idle worker immediately, keeping the configured core size.
  ///
  /// Busy workers are left alone and retire through the keep-alive once idle.
  /// New submissions grow the pool again as usual. Returns how many workers
  /// were retired.
  pub fn release_idle_workers(&self) -> usize {
    let _resize = self.inner.resize_lock.lock();
    let saved_core_size = self.inner.core_size();

    self.inner.queue.set_capacity_override(Some(0));
    let retired = self.inner.apply_core_size(0);
    self.inner.queue.set_capacity_override(None);
    self.inner.apply_core_size(saved_core_size);

    info!(pool_name = %*self.inner.name, retired, "Released idle workers.");
    retired
  }

  /// Starts idle workers up to the core size. Returns how many were started.
  pub fn prestart_core_workers(&self) -> usize {
    let mut started = 0;
    while self.inner.add_idle_worker(SizeBound::Core) {
      started += 1;
    }
    debug!(pool_name = %*self.inner.name, started, "Prestarted core workers.");
    started
  }

  /// Shuts the pool down and waits for every worker to exit.
  ///
  /// Calling it again (or with a different mode) is allowed; a later
  /// `ForcefulCancel` still cancels outstanding tasks.
  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), PoolError> {
    let initiated_here = self.inner.initiate_shutdown(mode);
    if !initiated_here {
      info!(pool_name = %*self.inner.name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    info!(pool_name = %*self.inner.name, workers = self.current_size(), "Waiting for workers to exit.");
    self.inner.tracker.wait().await;

    let stranded = self.inner.queue.drain();
    if !stranded.is_empty() {
      warn!(pool_name = %*self.inner.name, count = stranded.len(), "Dropping tasks left in the queue after shutdown.");
    }

    if initiated_here {
      info!(pool_name = %*self.inner.name, "Pool shutdown process completed by this call.");
    }
    Ok(())
  }
}

impl<R: Send + 'static> Drop for AdaptivePoolManager<R> {
  fn drop(&mut self) {
    if !self.inner.is_shutting_down() {
      info!(
        pool_name = %*self.inner.name,
        "AdaptivePoolManager dropped. Initiating implicit graceful shutdown."
      );
      self.inner.initiate_shutdown(ShutdownMode::Graceful);
    } else {
      trace!(
        pool_name = %*self.inner.name,
        "Drop: Shutdown already in progress or completed. No new signals sent."
      );
    }
  }
}
