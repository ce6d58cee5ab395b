use std::sync::Arc;

use crate::{
  controllable::ControlChain,
  sink::{forward, BoxSink, Sink},
  stream::{Node, Stream},
};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct FilterNode<T> {
  upstream: Stream<T>,
  predicate: Predicate<T>,
}

impl<T: Send + 'static> Node<T> for FilterNode<T> {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    let sink = FilterSink { downstream: sink, predicate: self.predicate.clone() };
    self.upstream.perform_subscribe(Box::new(sink), chain)
  }
}

struct FilterSink<T> {
  downstream: BoxSink<T>,
  predicate: Predicate<T>,
}

impl<T> Sink<T> for FilterSink<T> {
  fn on_next(&mut self, item: T) {
    if (self.predicate)(&item) {
      self.downstream.on_next(item)
    }
  }

  forward!(on_subscribe, on_error, on_complete, on_final);
}

impl<T: Send + 'static> Stream<T> {
  /// Keep only the items that pass `predicate`.
  pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Stream<T> {
    Stream::from_node(FilterNode { upstream: self, predicate: Arc::new(predicate) })
  }
}
