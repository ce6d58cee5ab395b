use std::sync::Arc;

use crate::{
  controllable::ControlChain,
  error::RxError,
  sink::{forward, BoxSink, Sink},
  stream::{Node, Stream},
};

struct TryCatchNode<T> {
  upstream: Stream<T>,
}

impl<T: Send + 'static> Node<Option<T>> for TryCatchNode<T> {
  fn perform_subscribe(&self, sink: BoxSink<Option<T>>, chain: &Arc<ControlChain>) {
    self.upstream.perform_subscribe(Box::new(TryCatchSink { downstream: sink }), chain)
  }
}

struct TryCatchSink<T> {
  downstream: BoxSink<Option<T>>,
}

impl<T> Sink<T> for TryCatchSink<T> {
  fn on_next(&mut self, item: T) { self.downstream.on_next(Some(item)) }

  fn on_error(&mut self, err: RxError) {
    tracing::debug!(error = %err, "error recovered as an empty item");
    self.downstream.on_next(None);
  }

  forward!(on_subscribe, on_complete, on_final);
}

impl<T: Send + 'static> Stream<T> {
  /// Turn an upstream error into a `None` item.
  ///
  /// Items arrive wrapped in `Some`. An error arrives as one `None`
  /// followed by `on_final`; downstream sees neither `on_error` nor
  /// `on_complete` in that case.
  pub fn try_catch(self) -> Stream<Option<T>> { Stream::from_node(TryCatchNode { upstream: self }) }
}

#[cfg(test)]
mod test {
  use crate::{
    prelude::*,
    testing::{Event, Recorder},
  };

  #[test]
  fn failing_source_yields_none() {
    let recorder = Recorder::new();
    Stream::<i32>::from_fn(|| Err(RxError::msg("broken"))).try_catch().subscribe(recorder.clone());
    assert_eq!(recorder.events(), vec![Event::Subscribe, Event::Next(None), Event::Final]);
  }

  #[test]
  fn items_pass_through_wrapped() {
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 2]).try_catch().subscribe(recorder.clone());
    assert_eq!(
      recorder.events(),
      vec![Event::Subscribe, Event::Next(Some(1)), Event::Next(Some(2)), Event::Complete, Event::Final]
    );
  }

  #[test]
  fn recovers_a_failing_map() {
    let recorder = Recorder::new();
    Stream::from_iter(vec![1, 0, 3])
      .try_map(|v| if v == 0 { Err("division by zero") } else { Ok(6 / v) })
      .try_catch()
      .subscribe(recorder.clone());
    assert_eq!(recorder.items(), vec![Some(6), None]);
    assert_eq!(recorder.final_count(), 1);
  }
}
