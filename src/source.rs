//! Source stages: the producers at the top of every pipeline.
//!
//! All sources share one driver. It hands the sink a fresh parentless
//! [`Controllable`], checks for cancellation before producing, turns a
//! failure or a panic during production into `on_error`, and always finishes
//! with exactly one `on_final`.

use std::{
  panic::{self, AssertUnwindSafe},
  sync::Arc,
};

use crate::{
  controllable::{ControlChain, Controllable},
  error::RxError,
  sink::BoxSink,
  stream::{Node, Stream},
};

/// The producer's view of a running subscription.
pub struct Emitter<'a, T> {
  sink: &'a mut BoxSink<T>,
  controllable: &'a Controllable,
}

impl<'a, T> Emitter<'a, T> {
  /// Push one item downstream. Returns `false` once the subscription has
  /// been cancelled; the item is dropped in that case and the producer
  /// should stop.
  pub fn next(&mut self, item: T) -> bool {
    if self.controllable.is_cancel_requested() {
      return false;
    }
    self.sink.on_next(item);
    !self.controllable.is_cancel_requested()
  }

  pub fn is_cancelled(&self) -> bool { self.controllable.is_cancel_requested() }

  /// The handle of this source stage.
  pub fn controllable(&self) -> &Controllable { self.controllable }
}

fn drive<T, F>(mut sink: BoxSink<T>, chain: &Arc<ControlChain>, produce: F)
where
  F: FnOnce(&mut Emitter<'_, T>) -> Result<(), RxError>,
{
  let controllable = chain.source();
  sink.on_subscribe(controllable.clone());

  if controllable.is_cancel_requested() {
    controllable.mark_cancel_completed();
  } else {
    let outcome = {
      let mut emitter = Emitter { sink: &mut sink, controllable: &controllable };
      panic::catch_unwind(AssertUnwindSafe(|| produce(&mut emitter)))
    };
    match outcome {
      Ok(Ok(())) if controllable.is_cancel_requested() => controllable.mark_cancel_completed(),
      Ok(Ok(())) => sink.on_complete(),
      Ok(Err(err)) => sink.on_error(err),
      Err(payload) => sink.on_error(RxError::from_panic(payload)),
    }
  }
  sink.on_final();
}

struct Just<T>(T);

impl<T: Clone + Send + Sync> Node<T> for Just<T> {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    drive(sink, chain, |emitter| {
      emitter.next(self.0.clone());
      Ok(())
    })
  }
}

struct FromIter<I>(I);

impl<I> Node<I::Item> for FromIter<I>
where
  I: IntoIterator + Clone + Send + Sync,
{
  fn perform_subscribe(&self, sink: BoxSink<I::Item>, chain: &Arc<ControlChain>) {
    drive(sink, chain, |emitter| {
      for item in self.0.clone() {
        if !emitter.next(item) {
          break;
        }
      }
      Ok(())
    })
  }
}

struct FromFn<F>(F);

impl<T, E, F> Node<T> for FromFn<F>
where
  F: Fn() -> Result<T, E> + Send + Sync,
  E: Into<RxError>,
{
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    drive(sink, chain, |emitter| {
      let value = (self.0)().map_err(Into::into)?;
      emitter.next(value);
      Ok(())
    })
  }
}

struct Create<F>(F);

impl<T, E, F> Node<T> for Create<F>
where
  F: Fn(&mut Emitter<'_, T>) -> Result<(), E> + Send + Sync,
  E: Into<RxError>,
{
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    drive(sink, chain, |emitter| (self.0)(emitter).map_err(Into::into))
  }
}

struct Fail(RxError);

impl<T> Node<T> for Fail {
  fn perform_subscribe(&self, sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    drive(sink, chain, |_| Err(self.0.clone()))
  }
}

impl<T: Send + 'static> Stream<T> {
  /// Emit a single value.
  pub fn just(item: T) -> Self
  where
    T: Clone + Sync,
  {
    Stream::from_node(Just(item))
  }

  /// Emit every item of a collection, checking for cancellation between
  /// items. The collection is cloned per subscription.
  pub fn from_iter<I>(items: I) -> Self
  where
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
  {
    Stream::from_node(FromIter(items))
  }

  /// Emit the result of a computation run at subscribe time.
  pub fn from_fn<E, F>(f: F) -> Self
  where
    F: Fn() -> Result<T, E> + Send + Sync + 'static,
    E: Into<RxError>,
  {
    Stream::from_node(FromFn(f))
  }

  /// Emit from a caller-supplied task.
  ///
  /// The task pushes items through the [`Emitter`] and should return as soon
  /// as [`Emitter::next`] reports cancellation. Returning `Err` fails the
  /// subscription; completion is sent when the task returns `Ok` without
  /// having been cancelled.
  pub fn create<E, F>(task: F) -> Self
  where
    F: Fn(&mut Emitter<'_, T>) -> Result<(), E> + Send + Sync + 'static,
    E: Into<RxError>,
  {
    Stream::from_node(Create(task))
  }

  /// Complete immediately.
  pub fn empty() -> Self { Stream::from_node(FromIter(std::iter::empty::<T>())) }

  /// Fail immediately with `err`.
  pub fn fail(err: RxError) -> Self { Stream::from_node(Fail(err)) }
}
