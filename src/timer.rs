//! The timer thread behind `delay` and delayed scheduling.
//!
//! Timers sleep on one dedicated worker so a long delay never occupies a
//! scheduler thread. Fired jobs run on that worker and should only hand work
//! on or deliver a single event.

use std::{
  panic::{self, AssertUnwindSafe},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::{
  executor::ThreadPool,
  future::{AbortHandle, Abortable},
  task::SpawnExt,
};
use once_cell::sync::Lazy;

use crate::error::{panic_message, SchedulerError};

const TIMER: &str = "timer";

static TIMER_POOL: Lazy<Result<ThreadPool, SchedulerError>> = Lazy::new(|| {
  ThreadPool::builder()
    .pool_size(1)
    .name_prefix("rxchain-timer-")
    .create()
    .map_err(SchedulerError::from)
});

/// Handle to a pending timer.
#[derive(Debug)]
pub struct TimerHandle {
  claimed: Arc<AtomicBool>,
  abort: AbortHandle,
}

impl TimerHandle {
  /// Stop the timer. Returns `true` if the job will never run, `false` if
  /// it already started.
  pub fn cancel(&self) -> bool {
    let won = !self.claimed.swap(true, Ordering::AcqRel);
    if won {
      self.abort.abort();
    }
    won
  }
}

/// Run `job` on the timer thread once `delay` has elapsed.
pub fn after(delay: Duration, job: impl FnOnce() + Send + 'static) -> Result<TimerHandle, SchedulerError> {
  let pool = TIMER_POOL.as_ref().map_err(Clone::clone)?;
  let (abort, registration) = AbortHandle::new_pair();
  let claimed = Arc::new(AtomicBool::new(false));
  let c_claimed = claimed.clone();
  let sleep = Abortable::new(futures_time::task::sleep(delay.into()), registration);

  pool
    .spawn(async move {
      if sleep.await.is_err() || c_claimed.swap(true, Ordering::AcqRel) {
        return;
      }
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
          scheduler = TIMER,
          panic = %panic_message(payload.as_ref()),
          "timer job panicked"
        );
      }
    })
    .map_err(|err| SchedulerError::Rejected { scheduler: TIMER.to_owned(), reason: err.to_string() })?;

  Ok(TimerHandle { claimed, abort })
}
