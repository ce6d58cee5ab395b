use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Task, TaskId};
use crate::timer::TimerHandle;

struct Pending {
  task: Task,
  timer: Option<TimerHandle>,
}

/// Tasks that were submitted but have not started.
///
/// Running and cancelling both remove the entry; whichever gets there first
/// decides the outcome, so a task either runs or is withdrawn, never both.
#[derive(Default)]
pub(crate) struct TaskTable {
  tasks: Mutex<HashMap<TaskId, Pending>>,
}

impl TaskTable {
  pub(crate) fn insert(&self, task: Task) -> TaskId {
    let id = task.id();
    self.tasks.lock().insert(id, Pending { task, timer: None });
    id
  }

  /// Remember the timer that will release `id`. Dropped if the task already
  /// left the table.
  pub(crate) fn attach_timer(&self, id: TaskId, timer: TimerHandle) {
    if let Some(pending) = self.tasks.lock().get_mut(&id) {
      pending.timer = Some(timer);
    }
  }

  /// Claim a task for running.
  pub(crate) fn take(&self, id: TaskId) -> Option<Task> {
    self.tasks.lock().remove(&id).map(|pending| pending.task)
  }

  /// Withdraw a task. Returns whether it was still pending.
  pub(crate) fn cancel(&self, id: TaskId) -> bool {
    let pending = self.tasks.lock().remove(&id);
    match pending {
      Some(pending) => {
        if let Some(timer) = pending.timer {
          timer.cancel();
        }
        true
      }
      None => false,
    }
  }

  pub(crate) fn len(&self) -> usize { self.tasks.lock().len() }
}
