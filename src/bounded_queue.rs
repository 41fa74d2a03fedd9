use crate::error::{OfferError, PoolError};

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A bounded, multi-producer, multi-consumer FIFO queue with async waits.
///
/// Capacity is tracked by two fair semaphores: `slots` counts free space and
/// `filled` counts stored items. A permit is always converted into a push or a
/// pop while holding the lock, so a waiter that wakes up is guaranteed to find
/// its item and waiters are served in arrival order.
pub(crate) struct BoundedQueue<T> {
  items: Mutex<VecDeque<T>>,
  capacity: usize,
  slots: Semaphore,
  filled: Semaphore,
}

impl<T> fmt::Debug for BoundedQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundedQueue")
      .field("len", &self.len())
      .field("capacity", &self.capacity)
      .field("free_slots", &self.slots.available_permits())
      .finish_non_exhaustive()
  }
}

impl<T> BoundedQueue<T> {
  /// Largest capacity the underlying semaphores can represent.
  pub(crate) const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
      capacity,
      slots: Semaphore::new(capacity),
      filled: Semaphore::new(0),
    }
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  pub(crate) fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.items.lock().is_empty()
  }

  pub(crate) fn remaining_capacity(&self) -> usize {
    self.slots.available_permits()
  }

  /// Stores `item` if there is free space, otherwise hands it back.
  pub(crate) fn offer(&self, item: T) -> Result<(), T> {
    match self.slots.try_acquire() {
      Ok(permit) => {
        permit.forget();
        self.push_reserved(item);
        Ok(())
      }
      Err(_) => Err(item),
    }
  }

  /// Stores `item`, waiting up to `timeout` for free space.
  pub(crate) async fn offer_timeout(
    &self,
    item: T,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<(), OfferError<T>> {
    let acquired = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(OfferError::Cancelled(item)),
      result = tokio::time::timeout(timeout, self.slots.acquire()) => result,
    };

    match acquired {
      Ok(Ok(permit)) => {
        permit.forget();
        self.push_reserved(item);
        Ok(())
      }
      // The slot semaphore is never closed; treat it like running out of time.
      Ok(Err(_)) | Err(_) => Err(OfferError::Full(item)),
    }
  }

  /// Removes the head of the queue without waiting.
  pub(crate) fn try_poll(&self) -> Option<T> {
    let permit = self.filled.try_acquire().ok()?;
    permit.forget();
    self.pop_reserved()
  }

  /// Waits until an item is available and removes it.
  pub(crate) async fn take(&self, cancel: &CancellationToken) -> Result<T, PoolError> {
    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PoolError::WaitCancelled),
        permit = self.filled.acquire() => {
          match permit {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(PoolError::QueueClosed),
          }
        }
      }

      if let Some(item) = self.pop_reserved() {
        return Ok(item);
      }
    }
  }

  /// Waits up to `timeout` for an item. `Ok(None)` means the wait elapsed.
  pub(crate) async fn poll_timeout(
    &self,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<Option<T>, PoolError> {
    match tokio::time::timeout(timeout, self.take(cancel)).await {
      Ok(result) => result.map(Some),
      Err(_elapsed) => Ok(None),
    }
  }

  /// Removes every stored item in FIFO order.
  pub(crate) fn drain(&self) -> Vec<T> {
    let mut drained = Vec::new();
    while let Some(item) = self.try_poll() {
      drained.push(item);
    }
    drained
  }

  fn push_reserved(&self, item: T) {
    self.items.lock().push_back(item);
    self.filled.add_permits(1);
  }

  fn pop_reserved(&self) -> Option<T> {
    let item = self.items.lock().pop_front();
    if item.is_some() {
      self.slots.add_permits(1);
    }
    item
  }
}
