//! The lazy pipeline description.
//!
//! A [`Stream`] is an immutable recipe. Building one (from a source or by
//! chaining operators) does no work; each `subscribe` runs the recipe once,
//! independently of every other subscription.
//!
//! ```rust
//! use rxchain::{prelude::*, testing::Recorder};
//!
//! let doubled = Stream::from_iter(vec![1, 2, 3]).map(|v| v * 2);
//! let recorder = Recorder::new();
//! doubled.subscribe(recorder.clone());
//! assert_eq!(recorder.items(), vec![2, 4, 6]);
//! ```

use std::{fmt::Debug, sync::Arc};

use crate::{
  controllable::{ControlChain, Controllable},
  sink::{BoxSink, CallbackSink, LoggingSink, ProtocolGuard, Sink},
};

/// One stage of a pipeline.
///
/// `perform_subscribe` wraps `sink` as needed and subscribes upstream, or,
/// for a source, starts producing. Every stage of one subscription shares
/// `chain`.
pub(crate) trait Node<T>: Send + Sync {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>);
}

/// An immutable, lazily evaluated pipeline producing items of type `T`.
pub struct Stream<T> {
  node: Arc<dyn Node<T>>,
}

impl<T> Clone for Stream<T> {
  fn clone(&self) -> Self { Stream { node: self.node.clone() } }
}

impl<T: Send + 'static> Stream<T> {
  pub(crate) fn from_node(node: impl Node<T> + 'static) -> Self { Stream { node: Arc::new(node) } }

  pub(crate) fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    self.node.perform_subscribe(sink, chain)
  }

  /// Run the pipeline, delivering its events to `sink`.
  pub fn subscribe(&self, sink: impl Sink<T> + 'static) { self.subscribe_for_controllable(sink); }

  /// Run the pipeline with a closure receiving each item. Errors are logged.
  pub fn subscribe_fn(&self, next: impl FnMut(T) + Send + 'static) {
    self.subscribe(CallbackSink::new(next))
  }

  /// Run the pipeline and return the handle that cancels it.
  pub fn subscribe_for_controllable(&self, sink: impl Sink<T> + 'static) -> Controllable {
    let (chain, anchor) = ControlChain::new();
    self.perform_subscribe(Box::new(ProtocolGuard::new(sink)), &chain);
    anchor
  }
}

impl<T: Debug + Send + 'static> Stream<T> {
  /// Fire and forget: every event is logged through `tracing`.
  pub fn subscribe_detached(&self) -> Controllable {
    self.subscribe_for_controllable(LoggingSink::default())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::testing::{Event, Recorder};

  #[test]
  fn building_does_no_work() {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let c_calls = calls.clone();
    let stream = Stream::from_fn(move || {
      c_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      Ok::<_, crate::error::RxError>(1)
    })
    .map(|v| v + 1);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    stream.subscribe_fn(|_| {});
    stream.clone().subscribe_fn(|_| {});
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
  }

  #[test]
  fn subscriptions_are_independent() {
    let stream = Stream::from_iter(vec![1, 2]);
    let first = Recorder::new();
    let second = Recorder::new().cancel_on_subscribe();
    stream.subscribe(first.clone());
    stream.subscribe(second.clone());
    assert_eq!(first.events(), vec![Event::Subscribe, Event::Next(1), Event::Next(2), Event::Complete, Event::Final]);
    assert_eq!(second.events(), vec![Event::Subscribe, Event::Final]);
  }

  #[test]
  fn controllable_cancels_from_outside() {
    let recorder = Recorder::new();
    let control = Stream::<i32>::create(|emitter| {
      emitter.next(1);
      Ok::<_, crate::error::RxError>(())
    })
    .subscribe_for_controllable(recorder.clone());
    assert!(control.is_root());
    control.cancel();
    control.cancel();
    assert!(control.is_cancel_requested());
    assert_eq!(recorder.final_count(), 1);
  }

  #[test]
  fn detached_subscription_runs() {
    let control = Stream::just("hello").subscribe_detached();
    assert!(!control.is_cancel_requested());
  }
}
