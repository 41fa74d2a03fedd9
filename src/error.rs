use std::fmt;

use thiserror::Error;

/// Errors that can occur within the `adaptive_pool` pool and its task queue.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  InvalidConfig(String),

  #[error("Task queue is not running (no pool attached or pool is shutting down)")]
  RejectedSubmission,

  #[error("Task queue is full and the pool cannot grow any further")]
  QueueFull,

  #[error("A pool is already attached to this task queue")]
  PoolAlreadyAttached,

  #[error("Waiting on the task queue was cancelled")]
  WaitCancelled,

  #[error("Task queue was closed unexpectedly")]
  QueueClosed,

  #[error("Task result channel error (task might have panicked, was cancelled, or was dropped unrun): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken or channel was not available")]
  ResultUnavailable,

  #[error("Submitted task future panicked")]
  TaskPanicked,

  #[error("Task was cancelled")]
  TaskCancelled,

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,
}

/// Reasons a task could not be stored by a forced or timed insert.
///
/// Every variant hands the task back, so the caller decides whether to retry,
/// drop, or report it.
#[derive(Error)]
pub enum OfferError<T> {
  /// No pool is attached to the queue, or the pool is shutting down.
  #[error("Task queue is not running")]
  Rejected(T),

  /// The queue had no free space (or none freed up before the timeout).
  #[error("Task queue is full")]
  Full(T),

  /// The wait for free space was cancelled.
  #[error("Waiting for queue space was cancelled")]
  Cancelled(T),
}

impl<T> OfferError<T> {
  /// Recovers the task that could not be stored.
  pub fn into_inner(self) -> T {
    match self {
      OfferError::Rejected(task) | OfferError::Full(task) | OfferError::Cancelled(task) => task,
    }
  }
}

impl<T> fmt::Debug for OfferError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OfferError::Rejected(_) => f.write_str("Rejected(..)"),
      OfferError::Full(_) => f.write_str("Full(..)"),
      OfferError::Cancelled(_) => f.write_str("Cancelled(..)"),
    }
  }
}

impl<T> From<OfferError<T>> for PoolError {
  fn from(err: OfferError<T>) -> Self {
    match err {
      OfferError::Rejected(_) => PoolError::RejectedSubmission,
      OfferError::Full(_) => PoolError::QueueFull,
      OfferError::Cancelled(_) => PoolError::WaitCancelled,
    }
  }
}
