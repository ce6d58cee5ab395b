use std::{
  panic::{self, AssertUnwindSafe},
  sync::Arc,
};

use crate::{
  controllable::{ControlChain, Controllable},
  error::{panic_message, RxError},
  sink::{BoxSink, Sink},
  stream::{Node, Stream},
};

/// A side effect attached to one kind of event.
enum Tap<T> {
  Subscribe(Arc<dyn Fn(&Controllable) + Send + Sync>),
  Next(Arc<dyn Fn(&T) + Send + Sync>),
  Error(Arc<dyn Fn(&RxError) + Send + Sync>),
  Complete(Arc<dyn Fn() + Send + Sync>),
  Final(Arc<dyn Fn() + Send + Sync>),
}

impl<T> Clone for Tap<T> {
  fn clone(&self) -> Self {
    match self {
      Tap::Subscribe(f) => Tap::Subscribe(f.clone()),
      Tap::Next(f) => Tap::Next(f.clone()),
      Tap::Error(f) => Tap::Error(f.clone()),
      Tap::Complete(f) => Tap::Complete(f.clone()),
      Tap::Final(f) => Tap::Final(f.clone()),
    }
  }
}

/// Run a tap callback. A panic is logged and never replaces the event.
fn guarded(event: &'static str, f: impl FnOnce()) {
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
    tracing::warn!(event, panic = %panic_message(payload.as_ref()), "tap callback panicked");
  }
}

struct TapNode<T> {
  upstream: Stream<T>,
  tap: Tap<T>,
}

impl<T: Send + 'static> Node<T> for TapNode<T> {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    let sink = TapSink { downstream: sink, tap: self.tap.clone() };
    self.upstream.perform_subscribe(Box::new(sink), chain)
  }
}

struct TapSink<T> {
  downstream: BoxSink<T>,
  tap: Tap<T>,
}

impl<T> Sink<T> for TapSink<T> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    if let Tap::Subscribe(f) = &self.tap {
      guarded("subscribe", || f(&controllable));
    }
    self.downstream.on_subscribe(controllable);
  }

  fn on_next(&mut self, item: T) {
    if let Tap::Next(f) = &self.tap {
      guarded("next", || f(&item));
    }
    self.downstream.on_next(item);
  }

  fn on_error(&mut self, err: RxError) {
    if let Tap::Error(f) = &self.tap {
      guarded("error", || f(&err));
    }
    self.downstream.on_error(err);
  }

  fn on_complete(&mut self) {
    if let Tap::Complete(f) = &self.tap {
      guarded("complete", || f());
    }
    self.downstream.on_complete();
  }

  fn on_final(&mut self) {
    if let Tap::Final(f) = &self.tap {
      guarded("final", || f());
    }
    self.downstream.on_final();
  }
}

impl<T: Send + 'static> Stream<T> {
  fn tap(self, tap: Tap<T>) -> Stream<T> { Stream::from_node(TapNode { upstream: self, tap }) }

  /// Run `f` with the handle of each new subscription.
  pub fn do_on_subscribe(self, f: impl Fn(&Controllable) + Send + Sync + 'static) -> Stream<T> {
    self.tap(Tap::Subscribe(Arc::new(f)))
  }

  /// Inspect each item before it moves on.
  pub fn do_on_next(self, f: impl Fn(&T) + Send + Sync + 'static) -> Stream<T> {
    self.tap(Tap::Next(Arc::new(f)))
  }

  pub fn do_on_error(self, f: impl Fn(&RxError) + Send + Sync + 'static) -> Stream<T> {
    self.tap(Tap::Error(Arc::new(f)))
  }

  pub fn do_on_complete(self, f: impl Fn() + Send + Sync + 'static) -> Stream<T> {
    self.tap(Tap::Complete(Arc::new(f)))
  }

  /// Run `f` when the subscription finalizes, whatever the outcome.
  pub fn do_on_final(self, f: impl Fn() + Send + Sync + 'static) -> Stream<T> {
    self.tap(Tap::Final(Arc::new(f)))
  }
}

#[cfg(test)]
mod test {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  use parking_lot::Mutex;

  use crate::{
    prelude::*,
    testing::{Event, Recorder},
  };

  #[test]
  fn taps_see_every_event_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());
    Stream::from_iter(vec![1, 2])
      .do_on_subscribe(move |_| l1.lock().push("subscribe".to_owned()))
      .do_on_next(move |v| l2.lock().push(format!("next {v}")))
      .do_on_complete(move || l3.lock().push("complete".to_owned()))
      .do_on_final(move || l4.lock().push("final".to_owned()))
      .subscribe_fn(|_| {});
    assert_eq!(*log.lock(), vec!["subscribe", "next 1", "next 2", "complete", "final"]);
  }

  #[test]
  fn error_tap_observes_failures() {
    let hits = Arc::new(AtomicUsize::new(0));
    let c_hits = hits.clone();
    let recorder = Recorder::<i32>::new();
    Stream::fail(RxError::msg("bad"))
      .do_on_error(move |err| {
        assert_eq!(err.to_string(), "bad");
        c_hits.fetch_add(1, Ordering::SeqCst);
      })
      .subscribe(recorder.clone());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.events(), vec![Event::Subscribe, Event::Error("bad".into()), Event::Final]);
  }

  #[test]
  fn panicking_tap_does_not_replace_the_event() {
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 2, 3])
      .do_on_next(|v| {
        if *v == 2 {
          panic!("tap failed on {v}");
        }
      })
      .do_on_final(|| panic!("final tap failed"))
      .subscribe(recorder.clone());
    assert_eq!(
      recorder.events(),
      vec![Event::Subscribe, Event::Next(1), Event::Next(2), Event::Next(3), Event::Complete, Event::Final]
    );
  }
}
