//! The consumer side of a subscription.
//!
//! A [`Sink`] receives, in order: one `on_subscribe`, any number of
//! `on_next`, at most one of `on_error`/`on_complete`, and exactly one
//! `on_final`. Every operator presents itself to its upstream as a sink that
//! wraps the sink it was given.

use std::fmt::Debug;

use crate::{controllable::Controllable, error::RxError};

// ============================================================================
// Sink Trait
// ============================================================================

/// The four-callback consumer of a subscription's events.
///
/// Only `on_next` is required. The defaults ignore the lifecycle callbacks
/// and log an error that nobody handled.
pub trait Sink<T>: Send {
  /// Called once, before anything else, with the handle for this execution.
  fn on_subscribe(&mut self, _controllable: Controllable) {}

  fn on_next(&mut self, item: T);

  /// The subscription failed. `on_complete` will not follow.
  fn on_error(&mut self, err: RxError) {
    tracing::warn!(error = %err, "unhandled error reached a sink");
  }

  /// The producer finished normally. `on_error` will not follow.
  fn on_complete(&mut self) {}

  /// The last callback of every subscription, whatever its outcome.
  fn on_final(&mut self) {}
}

/// Type-erased sink, the form every stage hands to its upstream.
pub type BoxSink<T> = Box<dyn Sink<T>>;

impl<T, S> Sink<T> for Box<S>
where
  S: Sink<T> + ?Sized,
{
  #[inline]
  fn on_subscribe(&mut self, controllable: Controllable) { (**self).on_subscribe(controllable) }
  #[inline]
  fn on_next(&mut self, item: T) { (**self).on_next(item) }
  #[inline]
  fn on_error(&mut self, err: RxError) { (**self).on_error(err) }
  #[inline]
  fn on_complete(&mut self) { (**self).on_complete() }
  #[inline]
  fn on_final(&mut self) { (**self).on_final() }
}

/// Generate callbacks that pass straight through to `self.downstream`.
macro_rules! forward {
  (on_subscribe) => {
    fn on_subscribe(&mut self, controllable: $crate::controllable::Controllable) {
      self.downstream.on_subscribe(controllable)
    }
  };
  (on_error) => {
    fn on_error(&mut self, err: $crate::error::RxError) { self.downstream.on_error(err) }
  };
  (on_complete) => {
    fn on_complete(&mut self) { self.downstream.on_complete() }
  };
  (on_final) => {
    fn on_final(&mut self) { self.downstream.on_final() }
  };
  ($($callback:ident),+ $(,)?) => {
    $($crate::sink::forward!($callback);)+
  };
}

pub(crate) use forward;

// ============================================================================
// Closure Sink
// ============================================================================

/// A sink assembled from closures.
///
/// ```rust
/// use rxchain::prelude::*;
///
/// Stream::from_iter(vec![1, 2, 3]).subscribe(
///   CallbackSink::new(|v: i32| println!("{v}"))
///     .with_error(|err| eprintln!("failed: {err}"))
///     .with_final(|| println!("done")),
/// );
/// ```
pub struct CallbackSink<T> {
  next: Box<dyn FnMut(T) + Send>,
  subscribe: Option<Box<dyn FnOnce(Controllable) + Send>>,
  error: Option<Box<dyn FnOnce(RxError) + Send>>,
  complete: Option<Box<dyn FnOnce() + Send>>,
  finally: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> CallbackSink<T> {
  pub fn new(next: impl FnMut(T) + Send + 'static) -> Self {
    CallbackSink {
      next: Box::new(next),
      subscribe: None,
      error: None,
      complete: None,
      finally: None,
    }
  }

  pub fn with_subscribe(mut self, f: impl FnOnce(Controllable) + Send + 'static) -> Self {
    self.subscribe = Some(Box::new(f));
    self
  }

  pub fn with_error(mut self, f: impl FnOnce(RxError) + Send + 'static) -> Self {
    self.error = Some(Box::new(f));
    self
  }

  pub fn with_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
    self.complete = Some(Box::new(f));
    self
  }

  pub fn with_final(mut self, f: impl FnOnce() + Send + 'static) -> Self {
    self.finally = Some(Box::new(f));
    self
  }
}

impl<T> Sink<T> for CallbackSink<T> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    if let Some(f) = self.subscribe.take() {
      f(controllable);
    }
  }

  fn on_next(&mut self, item: T) { (self.next)(item) }

  fn on_error(&mut self, err: RxError) {
    match self.error.take() {
      Some(f) => f(err),
      None => tracing::warn!(error = %err, "unhandled error reached a callback sink"),
    }
  }

  fn on_complete(&mut self) {
    if let Some(f) = self.complete.take() {
      f();
    }
  }

  fn on_final(&mut self) {
    if let Some(f) = self.finally.take() {
      f();
    }
  }
}

// ============================================================================
// Logging Sink
// ============================================================================

/// The sink used by `Stream::subscribe_detached`: logs everything it sees.
#[derive(Debug, Clone)]
pub struct LoggingSink {
  label: String,
}

impl LoggingSink {
  pub fn new(label: impl Into<String>) -> Self { LoggingSink { label: label.into() } }
}

impl Default for LoggingSink {
  fn default() -> Self { Self::new("rxchain") }
}

impl<T: Debug> Sink<T> for LoggingSink {
  fn on_next(&mut self, item: T) { tracing::debug!(sink = %self.label, ?item, "next"); }

  fn on_error(&mut self, err: RxError) {
    tracing::warn!(sink = %self.label, error = %err, "subscription failed");
  }

  fn on_complete(&mut self) { tracing::debug!(sink = %self.label, "complete"); }

  fn on_final(&mut self) { tracing::trace!(sink = %self.label, "final"); }
}

// ============================================================================
// Protocol Guard
// ============================================================================

/// Wraps the user's sink at the end of every chain and enforces the event
/// order. Events that arrive out of protocol are dropped with a warning; a
/// second `on_final` trips a debug assertion.
pub(crate) struct ProtocolGuard<S> {
  inner: S,
  subscribed: bool,
  terminated: bool,
  finalized: bool,
}

impl<S> ProtocolGuard<S> {
  pub(crate) fn new(inner: S) -> Self {
    ProtocolGuard { inner, subscribed: false, terminated: false, finalized: false }
  }

  fn accepts(&self, event: &'static str) -> bool {
    let ok = self.subscribed && !self.terminated && !self.finalized;
    if !ok {
      tracing::warn!(event, "dropping event that violates the sink protocol");
    }
    ok
  }
}

impl<T, S: Sink<T>> Sink<T> for ProtocolGuard<S> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    if self.subscribed {
      tracing::warn!("dropping repeated on_subscribe");
      return;
    }
    self.subscribed = true;
    self.inner.on_subscribe(controllable);
  }

  fn on_next(&mut self, item: T) {
    if self.accepts("next") {
      self.inner.on_next(item);
    }
  }

  fn on_error(&mut self, err: RxError) {
    if self.accepts("error") {
      self.terminated = true;
      self.inner.on_error(err);
    }
  }

  fn on_complete(&mut self) {
    if self.accepts("complete") {
      self.terminated = true;
      self.inner.on_complete();
    }
  }

  fn on_final(&mut self) {
    debug_assert!(!self.finalized, "on_final delivered twice");
    if self.finalized {
      tracing::warn!("dropping repeated on_final");
      return;
    }
    self.finalized = true;
    self.inner.on_final();
  }
}

#[cfg(test)]
mod test {
  use std::sync::{Arc, Mutex};

  use super::*;
  use crate::controllable::ControlChain;

  #[test]
  fn callback_sink_runs_terminal_closures_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
    let mut sink = CallbackSink::new(move |v: i32| l1.lock().unwrap().push(format!("next {v}")))
      .with_complete(move || l2.lock().unwrap().push("complete".to_owned()))
      .with_final(move || l3.lock().unwrap().push("final".to_owned()));

    sink.on_next(1);
    sink.on_complete();
    sink.on_complete();
    sink.on_final();
    sink.on_final();
    assert_eq!(*log.lock().unwrap(), vec!["next 1", "complete", "final"]);
  }

  #[test]
  fn guard_drops_events_after_terminal() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let c_seen = seen.clone();
    let mut guard = ProtocolGuard::new(CallbackSink::new(move |v: i32| c_seen.lock().unwrap().push(v)));
    let (_chain, anchor) = ControlChain::new();

    guard.on_next(0);
    guard.on_subscribe(anchor);
    guard.on_next(1);
    guard.on_error(RxError::msg("boom"));
    guard.on_complete();
    guard.on_next(2);
    guard.on_final();
    assert_eq!(*seen.lock().unwrap(), vec![1]);
  }

  #[test]
  #[should_panic(expected = "on_final delivered twice")]
  #[cfg(debug_assertions)]
  fn guard_flags_double_final() {
    let mut guard = ProtocolGuard::new(CallbackSink::new(|_: i32| {}));
    guard.on_final();
    guard.on_final();
  }

  #[test]
  fn boxed_sinks_forward() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let c_seen = seen.clone();
    let mut sink: BoxSink<&str> = Box::new(CallbackSink::new(move |v| c_seen.lock().unwrap().push(v)));
    sink.on_next("a");
    sink.on_next("b");
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
  }
}
