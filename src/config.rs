use crate::bounded_queue::BoundedQueue;
use crate::error::PoolError;

use std::time::Duration;

/// Sizing and timing parameters for an [`AdaptivePoolManager`](crate::AdaptivePoolManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Used in log fields and worker spans.
  pub name: String,
  /// Worker count the pool shrinks back to when idle.
  pub core_size: usize,
  /// Upper bound on live workers.
  pub max_size: usize,
  /// How long a surplus worker waits for a task before it is retired.
  pub keep_alive: Duration,
  /// Maximum number of queued (not yet running) tasks.
  pub queue_capacity: usize,
  /// Lets core workers time out as well, so an idle pool can shrink to zero.
  pub allow_core_timeout: bool,
  /// Starts `core_size` idle workers when the pool is created.
  pub prestart_core_workers: bool,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "adaptive-pool".to_string(),
      core_size: 25,
      max_size: 200,
      keep_alive: Duration::from_secs(60),
      queue_capacity: 1024,
      allow_core_timeout: false,
      prestart_core_workers: false,
    }
  }
}

impl PoolConfig {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Self::default()
    }
  }

  pub fn with_core_size(mut self, core_size: usize) -> Self {
    self.core_size = core_size;
    self
  }

  pub fn with_max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }

  pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
    self.keep_alive = keep_alive;
    self
  }

  pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
    self.queue_capacity = queue_capacity;
    self
  }

  pub fn with_allow_core_timeout(mut self, allow: bool) -> Self {
    self.allow_core_timeout = allow;
    self
  }

  pub fn with_prestart_core_workers(mut self, prestart: bool) -> Self {
    self.prestart_core_workers = prestart;
    self
  }

  /// Checks the configuration for values the pool cannot run with.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidConfig` describing the first problem found.
  pub fn validate(&self) -> Result<(), PoolError> {
    if self.max_size == 0 {
      return Err(PoolError::InvalidConfig("max_size must be at least 1".to_string()));
    }
    if self.core_size > self.max_size {
      return Err(PoolError::InvalidConfig(format!(
        "core_size ({}) must not exceed max_size ({})",
        self.core_size, self.max_size
      )));
    }
    if self.queue_capacity == 0 || self.queue_capacity > BoundedQueue::<()>::MAX_CAPACITY {
      return Err(PoolError::InvalidConfig(format!(
        "queue_capacity must be between 1 and {}, got {}",
        BoundedQueue::<()>::MAX_CAPACITY,
        self.queue_capacity
      )));
    }
    let workers_can_time_out = self.allow_core_timeout || self.core_size < self.max_size;
    if workers_can_time_out && self.keep_alive.is_zero() {
      return Err(PoolError::InvalidConfig(
        "keep_alive must be non-zero when workers can time out".to_string(),
      ));
    }
    Ok(())
  }
}
