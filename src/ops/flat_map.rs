//! `flat_map`: every upstream item opens an inner stream whose items are
//! merged into the same downstream sink.
//!
//! Each inner subscription runs in its own scope of the outer control chain,
//! so cancelling the subscription reaches it and its control nodes are freed
//! once it finalizes. An inner stream runs wherever its own
//! stages put it; without a scheduling boundary it runs to completion inside
//! the outer `on_next`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
  controllable::{ControlChain, Controllable},
  error::RxError,
  sink::{BoxSink, Sink},
  stream::{Node, Stream},
};

type Converter<T, U> = Arc<dyn Fn(T) -> Result<Stream<U>, RxError> + Send + Sync>;

struct MergeState {
  control: Option<Controllable>,
  active: usize,
  outer_completed: bool,
  outer_finalized: bool,
  terminated: bool,
  finalized: bool,
  delivering: bool,
}

/// State shared by the outer sink and every inner sink. The downstream sink
/// has its own lock, held only while downstream code runs. Locks are taken
/// sink first, never the other way round.
struct Merge<U> {
  state: Mutex<MergeState>,
  sink: Mutex<Option<BoxSink<U>>>,
}

enum Step {
  Complete,
  Final,
}

impl<U> Merge<U> {
  fn new(sink: BoxSink<U>) -> Self {
    Merge {
      state: Mutex::new(MergeState {
        control: None,
        active: 0,
        outer_completed: false,
        outer_finalized: false,
        terminated: false,
        finalized: false,
        delivering: false,
      }),
      sink: Mutex::new(Some(sink)),
    }
  }

  fn with_sink(&self, f: impl FnOnce(&mut BoxSink<U>)) {
    if let Some(sink) = self.sink.lock().as_mut() {
      f(sink);
    }
  }

  /// Deliver an error unless a terminal event already went out.
  fn error(&self, err: RxError) {
    {
      let mut state = self.state.lock();
      if state.terminated {
        return;
      }
      state.terminated = true;
    }
    self.with_sink(|sink| sink.on_error(err));
  }

  /// Complete, then finalize, once the outer stream and every inner stream
  /// are done.
  fn settle(&self) {
    let mut state = self.state.lock();
    loop {
      if state.active > 0 || state.delivering {
        return;
      }
      let step = if state.outer_completed && !state.terminated {
        state.terminated = true;
        Step::Complete
      } else if state.outer_finalized && !state.finalized {
        state.finalized = true;
        Step::Final
      } else {
        return;
      };
      state.delivering = true;
      drop(state);

      match step {
        Step::Complete => self.with_sink(|sink| sink.on_complete()),
        Step::Final => {
          let sink = self.sink.lock().take();
          if let Some(mut sink) = sink {
            sink.on_final();
          }
        }
      }

      state = self.state.lock();
      state.delivering = false;
    }
  }
}

struct FlatMapNode<T, U> {
  upstream: Stream<T>,
  convert: Converter<T, U>,
}

impl<T, U> Node<U> for FlatMapNode<T, U>
where
  T: Send + 'static,
  U: Send + 'static,
{
  fn perform_subscribe(&self, sink: BoxSink<U>, chain: &Arc<ControlChain>) {
    let outer = FlatMapSink {
      merge: Arc::new(Merge::new(sink)),
      convert: self.convert.clone(),
      chain: chain.clone(),
    };
    self.upstream.perform_subscribe(Box::new(outer), chain)
  }
}

struct FlatMapSink<T, U> {
  merge: Arc<Merge<U>>,
  convert: Converter<T, U>,
  chain: Arc<ControlChain>,
}

impl<T, U: Send + 'static> Sink<T> for FlatMapSink<T, U> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    self.merge.state.lock().control = Some(controllable.clone());
    self.merge.with_sink(|sink| sink.on_subscribe(controllable));
  }

  fn on_next(&mut self, item: T) {
    if self.merge.state.lock().terminated {
      return;
    }
    match (self.convert)(item) {
      Ok(inner) => {
        self.merge.state.lock().active += 1;
        let sink = InnerSink { merge: self.merge.clone(), control: None };
        inner.perform_subscribe(Box::new(sink), &self.chain.scope());
      }
      Err(err) => {
        self.merge.error(err);
        let control = self.merge.state.lock().control.clone();
        if let Some(control) = control {
          control.cancel();
        }
      }
    }
  }

  fn on_error(&mut self, err: RxError) { self.merge.error(err); }

  fn on_complete(&mut self) {
    self.merge.state.lock().outer_completed = true;
    self.merge.settle();
  }

  fn on_final(&mut self) {
    self.merge.state.lock().outer_finalized = true;
    self.merge.settle();
  }
}

/// Forwards an inner stream's items. Its lifecycle events only update the
/// merge bookkeeping.
struct InnerSink<U> {
  merge: Arc<Merge<U>>,
  control: Option<Controllable>,
}

impl<U: Send> Sink<U> for InnerSink<U> {
  fn on_subscribe(&mut self, controllable: Controllable) { self.control = Some(controllable); }

  fn on_next(&mut self, item: U) {
    let mut sink = self.merge.sink.lock();
    if self.merge.state.lock().terminated {
      return;
    }
    if let Some(sink) = sink.as_mut() {
      sink.on_next(item);
    }
  }

  fn on_error(&mut self, err: RxError) {
    self.merge.error(err);
    if let Some(control) = &self.control {
      control.cancel();
    }
  }

  fn on_final(&mut self) {
    self.merge.state.lock().active -= 1;
    self.merge.settle();
  }
}

impl<T: Send + 'static> Stream<T> {
  /// Map every item to an inner stream and merge the inner streams' items.
  ///
  /// Downstream completes after the upstream and every inner stream
  /// completed; an error from any of them ends the subscription.
  pub fn flat_map<U, F>(self, f: F) -> Stream<U>
  where
    U: Send + 'static,
    F: Fn(T) -> Stream<U> + Send + Sync + 'static,
  {
    self.try_flat_map(move |item| Ok::<_, RxError>(f(item)))
  }

  /// Like [`Stream::flat_map`] with a converter that may fail. A failed
  /// conversion is delivered as `on_error` and cancels the subscription.
  pub fn try_flat_map<U, E, F>(self, f: F) -> Stream<U>
  where
    U: Send + 'static,
    E: Into<RxError>,
    F: Fn(T) -> Result<Stream<U>, E> + Send + Sync + 'static,
  {
    let convert: Converter<T, U> = Arc::new(move |item| f(item).map_err(Into::into));
    Stream::from_node(FlatMapNode { upstream: self, convert })
  }
}

#[cfg(test)]
mod test {
  use std::time::Duration;

  use crate::{
    controllable::ControlChain,
    prelude::*,
    scheduler::PoolConfig,
    testing::{Event, Recorder},
  };

  #[test]
  fn inner_items_are_merged() {
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 2, 3])
      .flat_map(|v| Stream::from_iter(vec![v * 10, v * 10 + 1]))
      .subscribe(recorder.clone());
    assert_eq!(recorder.items(), vec![10, 11, 20, 21, 30, 31]);
    let events = recorder.events();
    assert_eq!(events.iter().filter(|e| **e == Event::Complete).count(), 1);
    assert_eq!(events.last(), Some(&Event::Final));
  }

  #[test]
  fn failed_conversion_is_an_error() {
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 2, 3])
      .try_flat_map(|v| if v == 2 { Err(RxError::msg("no stream for 2")) } else { Ok(Stream::just(v)) })
      .subscribe(recorder.clone());
    assert_eq!(
      recorder.events(),
      vec![Event::Subscribe, Event::Next(1), Event::Error("no stream for 2".into()), Event::Final]
    );
  }

  #[test]
  fn inner_error_ends_the_subscription() {
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 2, 3])
      .flat_map(|v| if v == 2 { Stream::fail(RxError::msg("inner failed")) } else { Stream::just(v) })
      .subscribe(recorder.clone());
    assert_eq!(
      recorder.events(),
      vec![Event::Subscribe, Event::Next(1), Event::Error("inner failed".into()), Event::Final]
    );
  }

  #[test]
  fn final_waits_for_asynchronous_inners() {
    let pool = PoolScheduler::new(PoolConfig { pool_size: Some(2), name_prefix: "flat-map-".into() }).unwrap();
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 2, 3])
      .flat_map(move |v| Stream::just(v).schedule_in(pool.clone(), Some(Duration::from_millis(5)), false))
      .subscribe(recorder.clone());
    assert!(recorder.wait_for_final(Duration::from_secs(5)));

    let mut items = recorder.items();
    items.sort();
    assert_eq!(items, vec![1, 2, 3]);
    let events = recorder.events();
    assert_eq!(events.len(), 6);
    assert_eq!(events[4], Event::Complete);
    assert_eq!(recorder.final_count(), 1);
  }

  #[test]
  fn finished_inners_release_their_control_nodes() {
    let (chain, _anchor) = ControlChain::new();
    let recorder = Recorder::new();
    Stream::from_iter(0..10_000).flat_map(Stream::just).perform_subscribe(Box::new(recorder.clone()), &chain);
    assert_eq!(recorder.items().len(), 10_000);
    assert!(chain.node_count() <= 2);
    assert_eq!(chain.scope_count(), 0);
  }

  #[test]
  fn no_items_follow_an_inner_error() {
    let pool = PoolScheduler::new(PoolConfig { pool_size: Some(4), name_prefix: "flat-map-race-".into() }).unwrap();
    for _ in 0..20 {
      let recorder = Recorder::new();
      let c_pool = pool.clone();
      Stream::from_iter(0..32)
        .flat_map(move |v| {
          if v == 16 {
            Stream::fail(RxError::msg("inner failed")).schedule_in(c_pool.clone(), None, false)
          } else {
            Stream::from_iter(0..50).schedule_in(c_pool.clone(), None, false)
          }
        })
        .subscribe(recorder.clone());
      assert!(recorder.wait_for_final(Duration::from_secs(5)));

      let events = recorder.events();
      let error_at = events.iter().position(|e| matches!(e, Event::Error(_))).unwrap();
      assert_eq!(&events[error_at + 1..], &[Event::Final]);
    }
  }

  #[test]
  fn cancelling_reaches_inner_subscriptions() {
    let recorder = Recorder::new().cancel_after(1);
    Stream::just(())
      .flat_map(|_| Stream::from_iter(0..1000))
      .subscribe(recorder.clone());
    assert_eq!(recorder.items(), vec![0]);
    assert_eq!(recorder.final_count(), 1);
  }
}
