use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::{executor::ThreadPool, future, task::SpawnExt};
use parking_lot::Mutex;

use super::{run_logged, table::TaskTable, Scheduler, Task, TaskId};
use crate::{error::SchedulerError, timer};

/// Something that can run a job on a worker thread.
///
/// [`PoolScheduler`] layers delays, serial queues and cancellation on top.
pub trait Executor: Send + Sync + 'static {
  fn execute(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), SchedulerError>;
}

impl Executor for ThreadPool {
  fn execute(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), SchedulerError> {
    self
      .spawn(future::lazy(move |_| job()))
      .map_err(|err| SchedulerError::Rejected { scheduler: "thread-pool".into(), reason: err.to_string() })
  }
}

/// Settings for [`PoolScheduler::new`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Worker count; `None` lets the executor pick one per CPU.
  pub pool_size: Option<usize>,
  pub name_prefix: String,
}

impl Default for PoolConfig {
  fn default() -> Self { PoolConfig { pool_size: None, name_prefix: "rxchain-pool-".to_owned() } }
}

#[derive(Default)]
struct SerialQueue {
  queue: VecDeque<TaskId>,
  active: bool,
}

struct PoolInner {
  name: String,
  executor: Box<dyn Executor>,
  table: TaskTable,
  serial: Mutex<SerialQueue>,
  shut_down: AtomicBool,
}

/// A background scheduler over a worker pool.
///
/// Parallel work goes straight to the executor. Serial work waits in a FIFO
/// queue with at most one task handed to the executor at a time, so the
/// submitting thread never blocks.
#[derive(Clone)]
pub struct PoolScheduler {
  inner: Arc<PoolInner>,
}

impl PoolScheduler {
  /// Start a pool on a `futures` thread pool.
  pub fn new(config: PoolConfig) -> Result<Self, SchedulerError> {
    let mut builder = ThreadPool::builder();
    builder.name_prefix(config.name_prefix.clone());
    if let Some(size) = config.pool_size {
      builder.pool_size(size);
    }
    let pool = builder.create()?;
    let name = config.name_prefix.trim_end_matches('-').to_owned();
    Ok(Self::with_executor(name, pool))
  }

  /// Run on a caller-provided executor.
  pub fn with_executor(name: impl Into<String>, executor: impl Executor) -> Self {
    PoolScheduler {
      inner: Arc::new(PoolInner {
        name: name.into(),
        executor: Box::new(executor),
        table: TaskTable::default(),
        serial: Mutex::new(SerialQueue::default()),
        shut_down: AtomicBool::new(false),
      }),
    }
  }

  /// Refuse new work. Tasks already submitted still run.
  pub fn shutdown(&self) {
    self.inner.shut_down.store(true, Ordering::Release);
    tracing::debug!(scheduler = %self.inner.name, "scheduler shut down");
  }

  /// Number of submitted tasks that have not started.
  pub fn pending(&self) -> usize { self.inner.table.len() }
}

impl PoolInner {
  fn dispatch(self: &Arc<Self>, id: TaskId, serial: bool) -> Result<(), SchedulerError> {
    if serial {
      self.serial.lock().queue.push_back(id);
      self.pump();
      Ok(())
    } else {
      let this = self.clone();
      self.executor.execute(Box::new(move || this.run(id)))
    }
  }

  fn run(&self, id: TaskId) {
    if let Some(task) = self.table.take(id) {
      run_logged(&self.name, task);
    }
  }

  /// Hand the head of the serial queue to the executor unless a serial task
  /// is already active.
  fn pump(self: &Arc<Self>) {
    let id = {
      let mut serial = self.serial.lock();
      if serial.active {
        return;
      }
      match serial.queue.pop_front() {
        Some(id) => {
          serial.active = true;
          id
        }
        None => return,
      }
    };

    let this = self.clone();
    let submitted = self.executor.execute(Box::new(move || {
      this.run(id);
      this.serial.lock().active = false;
      this.pump();
    }));
    if let Err(err) = submitted {
      self.serial.lock().active = false;
      if let Some(task) = self.table.take(id) {
        task.reject(&self.name, err);
      }
      self.pump();
    }
  }
}

impl Scheduler for PoolScheduler {
  fn schedule(&self, task: Task, delay: Option<Duration>, serial: bool) -> Result<TaskId, SchedulerError> {
    let inner = &self.inner;
    if inner.shut_down.load(Ordering::Acquire) {
      return Err(SchedulerError::ShutDown { scheduler: inner.name.clone() });
    }
    let id = inner.table.insert(task);

    match delay.filter(|d| !d.is_zero()) {
      Some(delay) => {
        let this = inner.clone();
        let fired = timer::after(delay, move || {
          if let Err(err) = this.dispatch(id, serial) {
            if let Some(task) = this.table.take(id) {
              task.reject(&this.name, err);
            }
          }
        });
        match fired {
          Ok(handle) => inner.table.attach_timer(id, handle),
          Err(err) => {
            inner.table.take(id);
            return Err(err);
          }
        }
      }
      None => {
        if let Err(err) = inner.dispatch(id, serial) {
          inner.table.take(id);
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

#[cfg(test)]
mod test {
  use std::{
    sync::{atomic::AtomicUsize, mpsc},
    thread,
  };

  use super::*;

  fn pool() -> PoolScheduler {
    PoolScheduler::new(PoolConfig { pool_size: Some(4), name_prefix: "pool-test-".into() }).unwrap()
  }

  #[test]
  fn serial_work_keeps_fifo_order() {
    let scheduler = pool();
    let (tx, rx) = mpsc::channel();
    let running = Arc::new(AtomicUsize::new(0));
    for i in 0..50 {
      let tx = tx.clone();
      let running = running.clone();
      scheduler
        .schedule_now(
          Task::new(move || {
            assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
            thread::yield_now();
            running.fetch_sub(1, Ordering::SeqCst);
            tx.send(i).unwrap();
          }),
          true,
        )
        .unwrap();
    }
    let got: Vec<_> = (0..50).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    assert_eq!(got, (0..50).collect::<Vec<_>>());
  }

  #[test]
  fn parallel_work_uses_worker_threads() {
    let scheduler = pool();
    let (tx, rx) = mpsc::channel();
    scheduler
      .schedule_now(Task::new(move || tx.send(thread::current().name().map(str::to_owned)).unwrap()), false)
      .unwrap();
    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(name.unwrap().starts_with("pool-test-"));
  }

  #[test]
  fn delayed_task_can_be_cancelled() {
    let scheduler = pool();
    let (tx, rx) = mpsc::channel::<()>();
    let id = scheduler
      .schedule(Task::new(move || tx.send(()).unwrap()), Some(Duration::from_millis(100)), false)
      .unwrap();
    assert_eq!(scheduler.pending(), 1);
    assert!(scheduler.cancel(id, true));
    assert!(!scheduler.cancel(id, true));
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(scheduler.pending(), 0);
  }

  #[test]
  fn started_task_cannot_be_cancelled() {
    let scheduler = pool();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let id = scheduler
      .schedule_now(
        Task::new(move || {
          started_tx.send(()).unwrap();
          let _ = release_rx.recv_timeout(Duration::from_secs(5));
        }),
        false,
      )
      .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!scheduler.cancel(id, true));
    release_tx.send(()).unwrap();
  }

  #[test]
  fn panics_do_not_stall_the_serial_queue() {
    let scheduler = pool();
    let (tx, rx) = mpsc::channel();
    scheduler.schedule_now(Task::new(|| panic!("first task fails")), true).unwrap();
    scheduler.schedule_now(Task::new(move || tx.send(2).unwrap()), true).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
  }

  struct Failing;

  impl Executor for Failing {
    fn execute(&self, _: Box<dyn FnOnce() + Send>) -> Result<(), SchedulerError> {
      Err(SchedulerError::Rejected { scheduler: "failing".into(), reason: "no workers".into() })
    }
  }

  #[test]
  fn executor_failures_reject_accepted_tasks() {
    let scheduler = PoolScheduler::with_executor("failing", Failing);
    let (tx, rx) = mpsc::channel();

    let c_tx = tx.clone();
    let id = scheduler
      .schedule_now(Task::new(|| unreachable!()).on_reject(move |err| c_tx.send(err.to_string()).unwrap()), true)
      .unwrap();
    assert!(!scheduler.cancel(id, true));
    assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().contains("no workers"));

    scheduler
      .schedule(
        Task::new(|| unreachable!()).on_reject(move |err| tx.send(err.to_string()).unwrap()),
        Some(Duration::from_millis(5)),
        false,
      )
      .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().contains("no workers"));
    assert_eq!(scheduler.pending(), 0);
  }

  #[test]
  fn shut_down_scheduler_refuses_work() {
    let scheduler = pool();
    scheduler.shutdown();
    let err = scheduler.schedule_now(Task::new(|| {}), false).unwrap_err();
    assert!(matches!(err, SchedulerError::ShutDown { .. }));
  }
}
