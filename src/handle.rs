use crate::error::PoolError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A handle to a task submitted to the `AdaptivePoolManager`.
///
/// Allows for requesting cancellation of the task and awaiting its result.
#[derive(Debug)]
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<R, PoolError>>>,
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Checks if cancellation has been requested for this task via its token.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Requests cancellation of this task. A queued task resolves as cancelled
  /// as soon as a worker picks it up; a running task is dropped at its next
  /// suspension point.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, "TaskHandle: Cancellation requested.");
    self.cancellation_token.cancel();
  }

  /// Awaits the completion of the task and returns its result of type `R`.
  ///
  /// # Errors
  /// Returns `PoolError::ResultChannelError` if the task was dropped without running.
  /// Returns `PoolError::TaskPanicked` if the task panicked during execution.
  /// Returns `PoolError::TaskCancelled` if the task was cancelled.
  /// Returns `PoolError::ResultUnavailable` if the result was already taken.
  pub async fn await_result(&mut self) -> Result<R, PoolError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(task_outcome_result) => task_outcome_result,
        Err(recv_error) => {
          tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", recv_error);
          Err(PoolError::ResultChannelError(format!(
            "Task (id: {}) result channel unexpectedly closed: {}",
            self.task_id, recv_error
          )))
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn handle_pair() -> (TaskHandle<u32>, oneshot::Sender<Result<u32, PoolError>>) {
    let (tx, rx) = oneshot::channel();
    let handle = TaskHandle {
      task_id: 9,
      cancellation_token: CancellationToken::new(),
      result_receiver: Some(rx),
    };
    (handle, tx)
  }

  #[tokio::test]
  async fn test_result_can_only_be_taken_once() {
    let (mut handle, tx) = handle_pair();
    tx.send(Ok(5)).unwrap();
    assert_eq!(handle.await_result().await, Ok(5));
    assert_eq!(handle.await_result().await, Err(PoolError::ResultUnavailable));
  }

  #[tokio::test]
  async fn test_dropped_sender_reports_channel_error() {
    let (mut handle, tx) = handle_pair();
    drop(tx);
    assert!(matches!(handle.await_result().await, Err(PoolError::ResultChannelError(_))));
  }

  #[test]
  fn test_cancel_sets_token() {
    let (handle, _tx) = handle_pair();
    assert!(!handle.is_cancellation_requested());
    handle.cancel();
    assert!(handle.is_cancellation_requested());
    assert_eq!(handle.id(), 9);
  }
}
