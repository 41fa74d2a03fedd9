use adaptive_pool::{AdaptivePoolManager, PoolConfig, PoolError, ShutdownMode, TaskHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> String {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  format!("Task {} finished after {}ms", id, delay_ms)
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Growth Before Queueing Example ---");

  let config = PoolConfig::new("demo_pool")
    .with_core_size(1)
    .with_max_size(4)
    .with_queue_capacity(2)
    .with_keep_alive(Duration::from_millis(300));
  let manager = AdaptivePoolManager::<String>::new(config, Handle::current())?;

  let mut handles: Vec<TaskHandle<String>> = Vec::new();
  for task_id in 0..8 {
    let future = Box::pin(my_task_fn(task_id, 400));
    match manager.submit(future) {
      Ok(handle) => handles.push(handle),
      Err(e) => info!("Task {} rejected: {}", task_id, e),
    }
    info!(
      "After task {}: workers = {}, queued = {}",
      task_id,
      manager.current_size(),
      manager.queued_task_count()
    );
  }

  for handle in handles.iter_mut() {
    match handle.await_result().await {
      Ok(result) => info!("{}", result),
      Err(e) => info!("Task {} failed: {}", handle.id(), e),
    }
  }

  tokio::time::sleep(Duration::from_millis(800)).await;
  info!("After keep-alive: workers = {} (largest = {})", manager.current_size(), manager.largest_size());

  manager.shutdown(ShutdownMode::Graceful).await?;
  info!("--- Growth Before Queueing Example End ---");
  Ok(())
}
