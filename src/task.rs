use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The type of future that the pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// Keeps a task counted in the pool's submitted count until it is dropped,
/// whether it ran to completion or was discarded unrun.
pub(crate) struct SubmittedGuard {
  submitted: Arc<AtomicUsize>,
}

impl SubmittedGuard {
  pub(crate) fn new(submitted: Arc<AtomicUsize>) -> Self {
    submitted.fetch_add(1, Ordering::AcqRel);
    Self { submitted }
  }
}

impl Drop for SubmittedGuard {
  fn drop(&mut self) {
    self.submitted.fetch_sub(1, Ordering::AcqRel);
  }
}

/// Internal representation of a task on its way through the queue.
///
/// The wrapped future already handles cancellation, panics and result delivery,
/// so running it never fails.
pub(crate) struct Job {
  pub(crate) task_id: u64,
  future: TaskToExecute<()>,
  _submitted: SubmittedGuard,
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job").field("task_id", &self.task_id).finish_non_exhaustive()
  }
}

impl Job {
  pub(crate) fn new(task_id: u64, future: TaskToExecute<()>, submitted: SubmittedGuard) -> Self {
    Self {
      task_id,
      future,
      _submitted: submitted,
    }
  }

  pub(crate) async fn run(self) {
    let Job { future, _submitted, .. } = self;
    future.await;
    drop(_submitted);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_submitted_count_tracks_job_lifetime() {
    let submitted = Arc::new(AtomicUsize::new(0));

    let ran = Job::new(1, Box::pin(async {}), SubmittedGuard::new(submitted.clone()));
    let dropped = Job::new(2, Box::pin(async {}), SubmittedGuard::new(submitted.clone()));
    assert_eq!(submitted.load(Ordering::SeqCst), 2);

    ran.run().await;
    assert_eq!(submitted.load(Ordering::SeqCst), 1);

    drop(dropped);
    assert_eq!(submitted.load(Ordering::SeqCst), 0);
  }
}
