use std::{
  sync::Arc,
  thread::{self, ThreadId},
  time::Duration,
};

use futures::{
  channel::mpsc::{self, UnboundedSender},
  executor::block_on_stream,
};
use parking_lot::Mutex;

use super::{run_logged, table::TaskTable, Scheduler, Task, TaskId};
use crate::{error::SchedulerError, timer};

struct HostInner {
  name: String,
  table: Arc<TaskTable>,
  sender: Mutex<Option<UnboundedSender<TaskId>>>,
}

impl HostInner {
  fn post(&self, id: TaskId) -> Result<(), SchedulerError> {
    let sent = match self.sender.lock().as_ref() {
      Some(sender) => sender.unbounded_send(id).is_ok(),
      None => false,
    };
    if sent {
      Ok(())
    } else {
      Err(SchedulerError::ShutDown { scheduler: self.name.clone() })
    }
  }
}

/// A single dedicated thread that runs every task in submission order.
///
/// Stands in for a UI main loop: all work, serial or not, executes one task
/// at a time on the same thread.
#[derive(Clone)]
pub struct HostScheduler {
  inner: Arc<HostInner>,
  thread: ThreadId,
}

impl HostScheduler {
  /// Start the host thread under `name`.
  pub fn spawn(name: impl Into<String>) -> Result<Self, SchedulerError> {
    let name = name.into();
    let (sender, receiver) = mpsc::unbounded::<TaskId>();
    let table = Arc::new(TaskTable::default());
    let inner = Arc::new(HostInner {
      name: name.clone(),
      table: table.clone(),
      sender: Mutex::new(Some(sender)),
    });

    // The channel closes once every handle and pending timer is gone; ids
    // already queued still run.
    let thread_name = name.clone();
    let handle = thread::Builder::new().name(name).spawn(move || {
      for id in block_on_stream(receiver) {
        if let Some(task) = table.take(id) {
          run_logged(&thread_name, task);
        }
      }
    })?;

    Ok(HostScheduler { inner, thread: handle.thread().id() })
  }

  /// The id of the host thread, for affinity checks.
  pub fn thread_id(&self) -> ThreadId { self.thread }

  /// Whether the caller is running on the host thread.
  pub fn is_current(&self) -> bool { thread::current().id() == self.thread }

  /// Stop accepting work. The thread exits once the queued tasks ran.
  pub fn shutdown(&self) {
    self.inner.sender.lock().take();
    tracing::debug!(scheduler = %self.inner.name, "host scheduler shut down");
  }
}

impl Scheduler for HostScheduler {
  fn schedule(&self, task: Task, delay: Option<Duration>, _serial: bool) -> Result<TaskId, SchedulerError> {
    if self.inner.sender.lock().is_none() {
      return Err(SchedulerError::ShutDown { scheduler: self.inner.name.clone() });
    }
    let id = self.inner.table.insert(task);

    match delay.filter(|d| !d.is_zero()) {
      Some(delay) => {
        let inner = self.inner.clone();
        let fired = timer::after(delay, move || {
          if let Err(err) = inner.post(id) {
            if let Some(task) = inner.table.take(id) {
              task.reject(&inner.name, err);
            }
          }
        });
        match fired {
          Ok(handle) => self.inner.table.attach_timer(id, handle),
          Err(err) => {
            self.inner.table.take(id);
            return Err(err);
          }
        }
      }
      None => {
        if let Err(err) = self.inner.post(id) {
          self.inner.table.take(id);
          return Err(err);
        }
      }
    }
    Ok(id)
  }

  fn cancel(&self, id: TaskId, _may_interrupt: bool) -> bool {
    let cancelled = self.inner.table.cancel(id);
    if cancelled {
      tracing::trace!(scheduler = %self.inner.name, task = %id, "task cancelled");
    }
    cancelled
  }

  fn name(&self) -> &str { &self.inner.name }
}
