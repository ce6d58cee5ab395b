//! Execution contexts for pipeline stages.
//!
//! A [`Scheduler`] runs a [`Task`] now or after a delay, optionally
//! serialized against other serial work submitted to the same instance, and
//! can withdraw work that has not started yet. Operators receive schedulers
//! explicitly; [`background`] and [`host`] are lazily created process-wide
//! instances for call sites that do not care.

use std::{
  fmt::{Display, Formatter},
  panic::{self, AssertUnwindSafe},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use once_cell::sync::Lazy;

use crate::error::{panic_message, SchedulerError};

mod host;
mod immediate;
mod pool;
mod table;
#[cfg(feature = "tokio-scheduler")]
mod tokio_executor;

pub use host::HostScheduler;
pub use immediate::ImmediateScheduler;
pub use pool::{Executor, PoolConfig, PoolScheduler};

// ============================================================================
// Task
// ============================================================================

/// Process-unique identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
  pub(crate) fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl Display for TaskId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "#{}", self.0) }
}

type RejectFn = Box<dyn FnOnce(SchedulerError) + Send>;

/// A unit of work handed to a scheduler.
///
/// Once `schedule` returned `Ok`, the task either runs, is withdrawn through
/// `Scheduler::cancel`, or is rejected: a scheduler that can no longer run
/// accepted work calls [`Task::reject`], which hands the reason to the
/// callback set with [`Task::on_reject`].
pub struct Task {
  id: TaskId,
  job: Box<dyn FnOnce() + Send>,
  rejected: Option<RejectFn>,
}

impl Task {
  pub fn new(job: impl FnOnce() + Send + 'static) -> Self { Self::with_id(TaskId::next(), job) }

  /// Build a task under an id the caller reserved with `TaskId::next`, so
  /// the id can be recorded before the task is submitted.
  pub(crate) fn with_id(id: TaskId, job: impl FnOnce() + Send + 'static) -> Self {
    Task { id, job: Box::new(job), rejected: None }
  }

  /// Run `f` instead of the job if the scheduler accepted the task but later
  /// failed to start it.
  pub fn on_reject(mut self, f: impl FnOnce(SchedulerError) + Send + 'static) -> Self {
    self.rejected = Some(Box::new(f));
    self
  }

  pub fn id(&self) -> TaskId { self.id }

  pub(crate) fn run(self) { (self.job)() }

  /// Give up on an accepted task that will never run.
  pub fn reject(self, scheduler: &str, err: SchedulerError) {
    match self.rejected {
      Some(f) => {
        tracing::debug!(scheduler, task = %self.id, error = %err, "accepted task rejected");
        f(err);
      }
      None => tracing::error!(scheduler, task = %self.id, error = %err, "accepted task dropped"),
    }
  }
}

impl std::fmt::Debug for Task {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Task").field("id", &self.id).finish()
  }
}

// ============================================================================
// Scheduler Trait
// ============================================================================

/// An execution context that pipeline stages hand work to.
///
/// Implementations must be safe to share between threads: operators keep
/// an `Arc<dyn Scheduler>` and submit from whatever thread an event arrives
/// on.
pub trait Scheduler: Send + Sync {
  /// Submit `task`, to start after `delay` if one is given.
  ///
  /// Serial work submitted to the same scheduler runs one task at a time in
  /// submission order. Non-serial work may run concurrently with anything.
  fn schedule(&self, task: Task, delay: Option<Duration>, serial: bool) -> Result<TaskId, SchedulerError>;

  fn schedule_now(&self, task: Task, serial: bool) -> Result<TaskId, SchedulerError> {
    self.schedule(task, None, serial)
  }

  /// Withdraw a task that has not started. Returns whether the task was
  /// withdrawn; work that is already running is never interrupted, whatever
  /// `may_interrupt` says.
  fn cancel(&self, id: TaskId, may_interrupt: bool) -> bool;

  fn name(&self) -> &str;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
  fn schedule(&self, task: Task, delay: Option<Duration>, serial: bool) -> Result<TaskId, SchedulerError> {
    (**self).schedule(task, delay, serial)
  }

  fn schedule_now(&self, task: Task, serial: bool) -> Result<TaskId, SchedulerError> {
    (**self).schedule_now(task, serial)
  }

  fn cancel(&self, id: TaskId, may_interrupt: bool) -> bool { (**self).cancel(id, may_interrupt) }

  fn name(&self) -> &str { (**self).name() }
}

// ============================================================================
// Defaults
// ============================================================================

static BACKGROUND: Lazy<Result<Arc<PoolScheduler>, SchedulerError>> =
  Lazy::new(|| PoolScheduler::new(PoolConfig::default()).map(Arc::new));

static HOST: Lazy<Result<Arc<HostScheduler>, SchedulerError>> =
  Lazy::new(|| HostScheduler::spawn("rxchain-host").map(Arc::new));

/// The shared background pool, started on first use.
pub fn background() -> Result<Arc<PoolScheduler>, SchedulerError> { (*BACKGROUND).clone() }

/// The shared single-threaded host scheduler, started on first use.
pub fn host() -> Result<Arc<HostScheduler>, SchedulerError> { (*HOST).clone() }

// ============================================================================
// Helpers
// ============================================================================

/// Run a task, logging instead of unwinding if it panics.
pub(crate) fn run_logged(scheduler: &str, task: Task) {
  let id = task.id();
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
    tracing::error!(
      scheduler,
      task = %id,
      panic = %panic_message(payload.as_ref()),
      "scheduled task panicked"
    );
  }
}

/// Hand `job` to `scheduler`, running it on the calling thread if the
/// scheduler refuses it, or on the rejecting thread if the scheduler gives
/// up on it later.
pub(crate) fn schedule_or_run(
  scheduler: &dyn Scheduler,
  delay: Option<Duration>,
  serial: bool,
  job: impl FnOnce() + Send + 'static,
) {
  let slot = Arc::new(parking_lot::Mutex::new(Some(job)));
  let (c_slot, r_slot) = (slot.clone(), slot.clone());
  let task = Task::new(move || {
    let job = c_slot.lock().take();
    if let Some(job) = job {
      job();
    }
  })
  .on_reject(move |_| {
    let job = r_slot.lock().take();
    if let Some(job) = job {
      job();
    }
  });
  if let Err(err) = scheduler.schedule(task, delay, serial) {
    tracing::warn!(scheduler = scheduler.name(), error = %err, "running work inline");
    let job = slot.lock().take();
    if let Some(job) = job {
      job();
    }
  }
}

#[cfg(test)]
mod test {
  use std::sync::atomic::AtomicUsize;

  use super::*;

  struct Refusing;

  impl Scheduler for Refusing {
    fn schedule(&self, _: Task, _: Option<Duration>, _: bool) -> Result<TaskId, SchedulerError> {
      Err(SchedulerError::ShutDown { scheduler: "refusing".into() })
    }

    fn cancel(&self, _: TaskId, _: bool) -> bool { false }

    fn name(&self) -> &str { "refusing" }
  }

  #[test]
  fn task_ids_are_unique() {
    let a = Task::new(|| {});
    let b = Task::new(|| {});
    assert_ne!(a.id(), b.id());
    assert!(b.id() > a.id());
  }

  #[test]
  fn panicking_task_is_contained() {
    run_logged("test", Task::new(|| panic!("task blew up")));
  }

  #[test]
  fn refused_work_runs_inline() {
    let hits = Arc::new(AtomicUsize::new(0));
    let c_hits = hits.clone();
    schedule_or_run(&Refusing, None, true, move || {
      c_hits.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn rejected_task_runs_its_callback() {
    let hits = Arc::new(AtomicUsize::new(0));
    let c_hits = hits.clone();
    let task = Task::new(|| unreachable!()).on_reject(move |err| {
      assert!(matches!(err, SchedulerError::ShutDown { .. }));
      c_hits.fetch_add(1, Ordering::SeqCst);
    });
    task.reject("test", SchedulerError::ShutDown { scheduler: "test".into() });
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    Task::new(|| unreachable!()).reject("test", SchedulerError::ShutDown { scheduler: "test".into() });
  }

  #[test]
  fn arc_schedulers_delegate() {
    let scheduler: Arc<dyn Scheduler> = Arc::new(ImmediateScheduler::default());
    let hits = Arc::new(AtomicUsize::new(0));
    let c_hits = hits.clone();
    scheduler
      .schedule_now(
        Task::new(move || {
          c_hits.fetch_add(1, Ordering::SeqCst);
        }),
        false,
      )
      .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.name(), "immediate");
  }
}
