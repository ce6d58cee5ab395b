use std::sync::Arc;

use crate::{
  controllable::{ControlChain, Controllable},
  error::RxError,
  sink::{forward, BoxSink, Sink},
  stream::{Node, Stream},
};

type MapFn<T, U> = Arc<dyn Fn(T) -> Result<U, RxError> + Send + Sync>;

struct MapNode<T, U> {
  upstream: Stream<T>,
  func: MapFn<T, U>,
}

impl<T, U> Node<U> for MapNode<T, U>
where
  T: Send + 'static,
  U: Send + 'static,
{
  fn perform_subscribe(&self, sink: BoxSink<U>, chain: &Arc<ControlChain>) {
    let sink = MapSink { downstream: sink, func: self.func.clone(), control: None, failed: false };
    self.upstream.perform_subscribe(Box::new(sink), chain)
  }
}

/// Applies the mapping function. A failing mapper errors the subscription
/// and cancels upstream; anything upstream still sends is swallowed, except
/// `on_final`.
struct MapSink<T, U> {
  downstream: BoxSink<U>,
  func: MapFn<T, U>,
  control: Option<Controllable>,
  failed: bool,
}

impl<T: Send, U> Sink<T> for MapSink<T, U> {
  fn on_subscribe(&mut self, controllable: Controllable) {
    self.control = Some(controllable.clone());
    self.downstream.on_subscribe(controllable);
  }

  fn on_next(&mut self, item: T) {
    if self.failed {
      return;
    }
    match (self.func)(item) {
      Ok(mapped) => self.downstream.on_next(mapped),
      Err(err) => {
        self.failed = true;
        self.downstream.on_error(err);
        if let Some(control) = &self.control {
          control.cancel();
        }
      }
    }
  }

  fn on_error(&mut self, err: RxError) {
    if !self.failed {
      self.downstream.on_error(err);
    }
  }

  fn on_complete(&mut self) {
    if !self.failed {
      self.downstream.on_complete();
    }
  }

  forward!(on_final);
}

impl<T: Send + 'static> Stream<T> {
  /// Transform every item with `f`.
  ///
  /// ```rust
  /// use rxchain::{prelude::*, testing::Recorder};
  ///
  /// let recorder = Recorder::new();
  /// Stream::from_iter(vec![1, 2, 3]).map(|v| v * 2).subscribe(recorder.clone());
  /// assert_eq!(recorder.items(), vec![2, 4, 6]);
  /// ```
  pub fn map<U, F>(self, f: F) -> Stream<U>
  where
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
  {
    self.try_map(move |item| Ok::<_, RxError>(f(item)))
  }

  /// Transform every item with a mapper that may fail. The first `Err`
  /// is delivered as `on_error` and the upstream is cancelled.
  pub fn try_map<U, E, F>(self, f: F) -> Stream<U>
  where
    U: Send + 'static,
    E: Into<RxError>,
    F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
  {
    let func: MapFn<T, U> = Arc::new(move |item| f(item).map_err(Into::into));
    Stream::from_node(MapNode { upstream: self, func })
  }
}
