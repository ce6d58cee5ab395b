//! `publish_on`: run a side effect for every item on a scheduler and forward
//! the item once the side effect is done.
//!
//! Unlike `observe_on`, only the items travel through the scheduler. The
//! subscription handle reaches downstream on the subscribing thread, and the
//! terminal event and `on_final` follow the last item without another task.

use std::{
  collections::HashSet,
  panic::{self, AssertUnwindSafe},
  sync::Arc,
  time::Duration,
};

use parking_lot::Mutex;

use super::{
  observe_on::reject_item,
  relay::{Relay, Terminal},
};
use crate::{
  controllable::{ControlChain, Controllable},
  error::RxError,
  scheduler::{Scheduler, Task, TaskId},
  sink::{BoxSink, Sink},
  stream::{Node, Stream},
};

type Action<T> = Arc<dyn Fn(&T) -> Result<(), RxError> + Send + Sync>;

struct PublishOnNode<T> {
  upstream: Stream<T>,
  scheduler: Arc<dyn Scheduler>,
  action: Action<T>,
  delay: Option<Duration>,
  serial: bool,
}

impl<T: Send + 'static> Node<T> for PublishOnNode<T> {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    let sink = PublishOnSink {
      relay: Arc::new(Relay::new(sink)),
      pending: Arc::new(Mutex::new(HashSet::new())),
      scheduler: self.scheduler.clone(),
      action: self.action.clone(),
      delay: self.delay,
      serial: self.serial,
    };
    self.upstream.perform_subscribe(Box::new(sink), chain)
  }
}

struct PublishOnSink<T> {
  relay: Arc<Relay<T>>,
  pending: Arc<Mutex<HashSet<TaskId>>>,
  scheduler: Arc<dyn Scheduler>,
  action: Action<T>,
  delay: Option<Duration>,
  serial: bool,
}

impl<T: Send + 'static> PublishOnSink<T> {
  fn cancel(&self) {
    if let Some(control) = self.relay.control() {
      control.cancel();
    }
  }
}

/// Run the action, turning a panic into an error.
fn perform<T>(action: &Action<T>, item: &T) -> Result<(), RxError> {
  panic::catch_unwind(AssertUnwindSafe(|| action(item)))
    .unwrap_or_else(|payload| Err(RxError::from_panic(payload)))
}

impl<T: Send + 'static> Sink<T> for PublishOnSink<T> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    let boundary = controllable.child();
    self.relay.bind(boundary.clone());

    let relay = Arc::downgrade(&self.relay);
    let pending = Arc::downgrade(&self.pending);
    let scheduler = self.scheduler.clone();
    boundary.on_cancel(move |_| {
      let (Some(relay), Some(pending)) = (relay.upgrade(), pending.upgrade()) else { return };
      let ids: Vec<TaskId> = pending.lock().drain().collect();
      let withdrawn = ids.into_iter().filter(|id| scheduler.cancel(*id, true)).count();
      if withdrawn > 0 {
        tracing::trace!(scheduler = scheduler.name(), withdrawn, "withdrew pending actions");
        relay.release(withdrawn);
        relay.finish();
      }
    });

    self.relay.subscribe(boundary);
  }

  fn on_next(&mut self, item: T) {
    if !self.relay.admit() {
      return;
    }
    let id = TaskId::next();
    self.pending.lock().insert(id);

    let relay = self.relay.clone();
    let pending = self.pending.clone();
    let action = self.action.clone();
    let task = Task::with_id(id, move || {
      if !pending.lock().remove(&id) {
        relay.abandon();
        return;
      }
      match perform(&action, &item) {
        Ok(()) => relay.deliver(item),
        Err(err) => {
          relay.fail_item(err);
          if let Some(control) = relay.control() {
            control.cancel();
          }
        }
      }
    })
    .on_reject(reject_item(self.relay.clone(), self.pending.clone(), id));

    if let Err(err) = self.scheduler.schedule(task, self.delay, self.serial) {
      self.pending.lock().remove(&id);
      self.relay.fail_item(RxError::from(err));
      self.cancel();
    }
  }

  fn on_error(&mut self, err: RxError) { self.relay.terminate(Terminal::Error(err)); }

  fn on_complete(&mut self) { self.relay.terminate(Terminal::Complete); }

  fn on_final(&mut self) { self.relay.request_final(); }
}

impl<T: Send + 'static> Stream<T> {
  /// Run `action` on `scheduler` for every item, forwarding the item after
  /// the action returned. An action error ends the subscription with that
  /// error.
  ///
  /// ```rust
  /// use std::time::Duration;
  /// use rxchain::{prelude::*, testing::Recorder};
  ///
  /// let host = HostScheduler::spawn("publisher").unwrap();
  /// let recorder = Recorder::new();
  /// Stream::from_iter(vec!["a", "b"])
  ///   .publish_on(host, |item| Ok::<_, RxError>(println!("published {item}")), None, true)
  ///   .subscribe(recorder.clone());
  /// assert!(recorder.wait_for_final(Duration::from_secs(5)));
  /// assert_eq!(recorder.items(), vec!["a", "b"]);
  /// ```
  pub fn publish_on<E, F>(
    self,
    scheduler: impl Scheduler + 'static,
    action: F,
    delay: Option<Duration>,
    serial: bool,
  ) -> Stream<T>
  where
    E: Into<RxError>,
    F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
  {
    let action: Action<T> = Arc::new(move |item| action(item).map_err(Into::into));
    Stream::from_node(PublishOnNode {
      upstream: self,
      scheduler: Arc::new(scheduler),
      action,
      delay,
      serial,
    })
  }
}
