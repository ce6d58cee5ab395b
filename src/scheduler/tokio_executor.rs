use tokio::runtime::Handle;

use super::Executor;
use crate::error::SchedulerError;

/// Jobs are synchronous pipeline work, so they go to the blocking pool
/// instead of stalling the runtime's async workers.
impl Executor for Handle {
  fn execute(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), SchedulerError> {
    self.spawn_blocking(job);
    Ok(())
  }
}
