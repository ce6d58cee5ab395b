//! `observe_on`: deliver every downstream callback from a scheduler.
//!
//! Subscribing stays on the caller's thread. Each event from upstream
//! becomes a task on the scheduler and reaches downstream through a
//! [`Relay`], which keeps the protocol order even when a parallel scheduler
//! runs the tasks out of order. Items keep their relative order only on a
//! serial scheduler.
//!
//! Cancelling withdraws the item tasks that have not started; the terminal
//! event and `on_final` are never withdrawn.

use std::{
  collections::HashSet,
  sync::{Arc, Weak},
  time::Duration,
};

use parking_lot::Mutex;

use super::relay::{Relay, Terminal};
use crate::{
  controllable::{ControlChain, Controllable},
  error::{RxError, SchedulerError},
  scheduler::{schedule_or_run, Scheduler, Task, TaskId},
  sink::{BoxSink, Sink},
  stream::{Node, Stream},
};

struct ObserveOnNode<T> {
  upstream: Stream<T>,
  scheduler: Arc<dyn Scheduler>,
  delay: Option<Duration>,
  serial: bool,
}

impl<T: Send + 'static> Node<T> for ObserveOnNode<T> {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    let sink = ObserveOnSink {
      relay: Arc::new(Relay::new(sink)),
      pending: Arc::new(Mutex::new(HashSet::new())),
      scheduler: self.scheduler.clone(),
      delay: self.delay,
      serial: self.serial,
    };
    self.upstream.perform_subscribe(Box::new(sink), chain)
  }
}

struct ObserveOnSink<T> {
  relay: Arc<Relay<T>>,
  pending: Arc<Mutex<HashSet<TaskId>>>,
  scheduler: Arc<dyn Scheduler>,
  delay: Option<Duration>,
  serial: bool,
}

impl<T: Send + 'static> ObserveOnSink<T> {
  /// Run `job` on the scheduler after the configured delay.
  fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
    schedule_or_run(&*self.scheduler, self.delay, self.serial, job)
  }

  fn withdraw_pending(
    relay: &Weak<Relay<T>>,
    pending: &Weak<Mutex<HashSet<TaskId>>>,
    scheduler: &Arc<dyn Scheduler>,
    serial: bool,
  ) {
    let (Some(relay), Some(pending)) = (relay.upgrade(), pending.upgrade()) else { return };
    let ids: Vec<TaskId> = pending.lock().drain().collect();
    let withdrawn = ids.into_iter().filter(|id| scheduler.cancel(*id, true)).count();
    if withdrawn > 0 {
      tracing::trace!(scheduler = scheduler.name(), withdrawn, "withdrew pending items");
      relay.release(withdrawn);
      schedule_or_run(&**scheduler, None, serial, move || relay.finish());
    }
  }
}

/// The scheduler accepted an item task, then gave up on it: the item fails
/// the subscription unless cancellation already withdrew it.
pub(super) fn reject_item<T>(
  relay: Arc<Relay<T>>,
  pending: Arc<Mutex<HashSet<TaskId>>>,
  id: TaskId,
) -> impl FnOnce(SchedulerError) + Send + 'static
where
  T: Send + 'static,
{
  move |err| {
    if !pending.lock().remove(&id) {
      relay.abandon();
      return;
    }
    relay.fail_item(RxError::from(err));
    if let Some(control) = relay.control() {
      control.cancel();
    }
  }
}

impl<T: Send + 'static> Sink<T> for ObserveOnSink<T> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    let boundary = controllable.child();
    self.relay.bind(boundary.clone());

    let relay = Arc::downgrade(&self.relay);
    let pending = Arc::downgrade(&self.pending);
    let scheduler = self.scheduler.clone();
    let serial = self.serial;
    boundary.on_cancel(move |_| Self::withdraw_pending(&relay, &pending, &scheduler, serial));

    let relay = self.relay.clone();
    self.dispatch(move || relay.subscribe(boundary));
  }

  fn on_next(&mut self, item: T) {
    if !self.relay.admit() {
      return;
    }
    let id = TaskId::next();
    self.pending.lock().insert(id);

    let relay = self.relay.clone();
    let pending = self.pending.clone();
    let task = Task::with_id(id, move || {
      let live = pending.lock().remove(&id);
      if live {
        relay.deliver(item);
      } else {
        relay.abandon();
      }
    })
    .on_reject(reject_item(self.relay.clone(), self.pending.clone(), id));

    if let Err(err) = self.scheduler.schedule(task, self.delay, self.serial) {
      self.pending.lock().remove(&id);
      self.relay.fail_item(RxError::from(err));
      if let Some(control) = self.relay.control() {
        control.cancel();
      }
    }
  }

  fn on_error(&mut self, err: RxError) {
    self.relay.close(Terminal::Error(err));
    let relay = self.relay.clone();
    self.dispatch(move || relay.finish());
  }

  fn on_complete(&mut self) {
    self.relay.close(Terminal::Complete);
    let relay = self.relay.clone();
    self.dispatch(move || relay.finish());
  }

  fn on_final(&mut self) {
    self.relay.mark_final();
    let relay = self.relay.clone();
    schedule_or_run(&*self.scheduler, None, self.serial, move || relay.finish());
  }
}

impl<T: Send + 'static> Stream<T> {
  /// Deliver downstream callbacks from `scheduler`.
  ///
  /// ```rust
  /// use std::time::Duration;
  /// use rxchain::{prelude::*, testing::Recorder};
  ///
  /// let host = HostScheduler::spawn("ui").unwrap();
  /// let recorder = Recorder::new();
  /// Stream::from_iter(1..=5).observe_on(host, None, true).subscribe(recorder.clone());
  /// assert!(recorder.wait_for_final(Duration::from_secs(5)));
  /// assert_eq!(recorder.items(), vec![1, 2, 3, 4, 5]);
  /// ```
  pub fn observe_on(self, scheduler: impl Scheduler + 'static, delay: Option<Duration>, serial: bool) -> Stream<T> {
    Stream::from_node(ObserveOnNode { upstream: self, scheduler: Arc::new(scheduler), delay, serial })
  }
}
