use std::{sync::Arc, time::Duration};

use super::{run_logged, table::TaskTable, Scheduler, Task, TaskId};
use crate::{error::SchedulerError, timer};

const IMMEDIATE: &str = "immediate";

/// Runs undelayed work on the submitting thread before `schedule` returns.
///
/// Delayed work fires on the timer thread. Mostly useful in tests and for
/// stages that only need the cancellation bookkeeping of a boundary.
#[derive(Clone, Default)]
pub struct ImmediateScheduler {
  table: Arc<TaskTable>,
}

impl Scheduler for ImmediateScheduler {
  fn schedule(&self, task: Task, delay: Option<Duration>, _serial: bool) -> Result<TaskId, SchedulerError> {
    let id = task.id();
    match delay.filter(|d| !d.is_zero()) {
      None => run_logged(IMMEDIATE, task),
      Some(delay) => {
        self.table.insert(task);
        let table = self.table.clone();
        let fired = timer::after(delay, move || {
          if let Some(task) = table.take(id) {
            run_logged(IMMEDIATE, task);
          }
        });
        match fired {
          Ok(handle) => self.table.attach_timer(id, handle),
          Err(err) => {
            self.table.take(id);
            return Err(err);
          }
        }
      }
    }
    Ok(id)
  }

  fn cancel(&self, id: TaskId, _may_interrupt: bool) -> bool { self.table.cancel(id) }

  fn name(&self) -> &str { IMMEDIATE }
}
