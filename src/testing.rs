//! A recording sink for tests.
//!
//! ```rust
//! use rxchain::prelude::*;
//! use rxchain::testing::{Event, Recorder};
//!
//! let recorder = Recorder::new();
//! Stream::just(7).subscribe(recorder.clone());
//! assert_eq!(
//!   recorder.events(),
//!   vec![Event::Subscribe, Event::Next(7), Event::Complete, Event::Final]
//! );
//! ```

use std::{
  sync::Arc,
  thread::{self, ThreadId},
  time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{controllable::Controllable, error::RxError, sink::Sink};

/// One callback observed by a [`Recorder`]. Errors are kept as their
/// display string so events compare with `==`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
  Subscribe,
  Next(T),
  Error(String),
  Complete,
  Final,
}

struct Log<T> {
  events: Vec<(Event<T>, ThreadId)>,
  finals: usize,
  controllable: Option<Controllable>,
}

struct Shared<T> {
  log: Mutex<Log<T>>,
  finalized: Condvar,
}

/// A sink that records every callback together with the thread it ran on.
///
/// Clones share one log, so keep a clone and subscribe another. Options set
/// before cloning apply to the subscribed clone.
pub struct Recorder<T> {
  shared: Arc<Shared<T>>,
  cancel_on_subscribe: bool,
  cancel_after: Option<usize>,
  seen: usize,
}

impl<T> Clone for Recorder<T> {
  fn clone(&self) -> Self {
    Recorder {
      shared: self.shared.clone(),
      cancel_on_subscribe: self.cancel_on_subscribe,
      cancel_after: self.cancel_after,
      seen: 0,
    }
  }
}

impl<T> Default for Recorder<T> {
  fn default() -> Self { Self::new() }
}

impl<T> Recorder<T> {
  pub fn new() -> Self {
    Recorder {
      shared: Arc::new(Shared {
        log: Mutex::new(Log { events: Vec::new(), finals: 0, controllable: None }),
        finalized: Condvar::new(),
      }),
      cancel_on_subscribe: false,
      cancel_after: None,
      seen: 0,
    }
  }

  /// Cancel the subscription from inside `on_subscribe`.
  pub fn cancel_on_subscribe(mut self) -> Self {
    self.cancel_on_subscribe = true;
    self
  }

  /// Cancel the subscription after `count` items arrived.
  pub fn cancel_after(mut self, count: usize) -> Self {
    self.cancel_after = Some(count);
    self
  }

  /// The handle received in `on_subscribe`, if it arrived yet.
  pub fn controllable(&self) -> Option<Controllable> { self.shared.log.lock().controllable.clone() }

  pub fn final_count(&self) -> usize { self.shared.log.lock().finals }

  /// Block until `on_final` arrived or `timeout` passed. Returns whether it
  /// arrived.
  pub fn wait_for_final(&self, timeout: Duration) -> bool {
    let mut log = self.shared.log.lock();
    if log.finals > 0 {
      return true;
    }
    let _ = self.shared.finalized.wait_while_for(&mut log, |log| log.finals == 0, timeout);
    log.finals > 0
  }

  /// Threads the callbacks ran on, one per recorded event.
  pub fn threads(&self) -> Vec<ThreadId> {
    self.shared.log.lock().events.iter().map(|(_, thread)| *thread).collect()
  }

  fn record(&self, event: Event<T>) {
    let mut log = self.shared.log.lock();
    let is_final = matches!(event, Event::Final);
    log.events.push((event, thread::current().id()));
    if is_final {
      log.finals += 1;
      self.shared.finalized.notify_all();
    }
  }
}

impl<T: Clone> Recorder<T> {
  pub fn events(&self) -> Vec<Event<T>> {
    self.shared.log.lock().events.iter().map(|(event, _)| event.clone()).collect()
  }

  /// Just the items, in arrival order.
  pub fn items(&self) -> Vec<T> {
    self
      .shared
      .log
      .lock()
      .events
      .iter()
      .filter_map(|(event, _)| match event {
        Event::Next(item) => Some(item.clone()),
        _ => None,
      })
      .collect()
  }
}

impl<T: Send> Sink<T> for Recorder<T> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    self.shared.log.lock().controllable = Some(controllable.clone());
    self.record(Event::Subscribe);
    if self.cancel_on_subscribe {
      controllable.cancel();
    }
  }

  fn on_next(&mut self, item: T) {
    self.record(Event::Next(item));
    self.seen += 1;
    if self.cancel_after == Some(self.seen) {
      if let Some(controllable) = self.controllable() {
        controllable.cancel();
      }
    }
  }

  fn on_error(&mut self, err: RxError) { self.record(Event::Error(err.to_string())); }

  fn on_complete(&mut self) { self.record(Event::Complete); }

  fn on_final(&mut self) { self.record(Event::Final); }
}
