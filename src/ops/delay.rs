//! `delay`: hold every item back for a fixed duration.
//!
//! Items wait on the timer thread and are forwarded from there. The terminal
//! event and `on_final` are not delayed themselves, but they never overtake
//! an item that is still waiting.

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use parking_lot::Mutex;

use super::relay::{Relay, Terminal};
use crate::{
  controllable::{ControlChain, Controllable},
  error::RxError,
  sink::{BoxSink, Sink},
  stream::{Node, Stream},
  timer::{self, TimerHandle},
};

struct DelayNode<T> {
  upstream: Stream<T>,
  delay: Duration,
}

impl<T: Send + 'static> Node<T> for DelayNode<T> {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    let sink = DelaySink {
      relay: Arc::new(Relay::new(sink)),
      timers: Arc::new(Mutex::new(HashMap::new())),
      next_key: AtomicU64::new(0),
      delay: self.delay,
    };
    self.upstream.perform_subscribe(Box::new(sink), chain)
  }
}

struct DelaySink<T> {
  relay: Arc<Relay<T>>,
  timers: Arc<Mutex<HashMap<u64, TimerHandle>>>,
  next_key: AtomicU64,
  delay: Duration,
}

impl<T: Send + 'static> Sink<T> for DelaySink<T> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    let boundary = controllable.child();
    self.relay.bind(boundary.clone());

    let relay = Arc::downgrade(&self.relay);
    let timers = Arc::downgrade(&self.timers);
    boundary.on_cancel(move |_| {
      let (Some(relay), Some(timers)) = (relay.upgrade(), timers.upgrade()) else { return };
      let handles: Vec<TimerHandle> = timers.lock().drain().map(|(_, handle)| handle).collect();
      let stopped = handles.iter().filter(|handle| handle.cancel()).count();
      if stopped > 0 {
        tracing::trace!(stopped, "stopped delayed items");
        relay.release(stopped);
        relay.finish();
      }
    });

    self.relay.subscribe(boundary);
  }

  fn on_next(&mut self, item: T) {
    if !self.relay.admit() {
      return;
    }
    let key = self.next_key.fetch_add(1, Ordering::Relaxed);
    let relay = self.relay.clone();
    let c_timers = self.timers.clone();

    let mut timers = self.timers.lock();
    let scheduled = timer::after(self.delay, move || {
      c_timers.lock().remove(&key);
      relay.deliver(item);
    });
    match scheduled {
      Ok(handle) => {
        timers.insert(key, handle);
      }
      Err(err) => {
        drop(timers);
        self.relay.fail_item(RxError::from(err));
        if let Some(control) = self.relay.control() {
          control.cancel();
        }
      }
    }
  }

  fn on_error(&mut self, err: RxError) { self.relay.terminate(Terminal::Error(err)); }

  fn on_complete(&mut self) { self.relay.terminate(Terminal::Complete); }

  fn on_final(&mut self) { self.relay.request_final(); }
}

impl<T: Send + 'static> Stream<T> {
  /// Forward each item `delay` after it arrived.
  pub fn delay(self, delay: Duration) -> Stream<T> { Stream::from_node(DelayNode { upstream: self, delay }) }
}
