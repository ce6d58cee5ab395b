//! Ordered delivery into a downstream sink from several threads.
//!
//! Boundaries that move items onto other threads (`observe_on`,
//! `publish_on`, `delay`) funnel every downstream call through a [`Relay`].
//! It keeps the sink protocol intact whatever order the work completes in:
//!
//! * items that finish before `on_subscribe` reached downstream are held
//!   back and flushed right after it,
//! * the terminal event waits until no admitted item is still in flight,
//! * `on_final` waits for the terminal event and is delivered exactly once,
//!   after which the downstream sink is dropped.
//!
//! The state lock is never held while downstream code runs; the sink lock
//! is.

use std::{
  collections::VecDeque,
  panic::{self, AssertUnwindSafe},
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
  controllable::Controllable,
  error::RxError,
  sink::{BoxSink, Sink},
};

pub(crate) enum Terminal {
  Error(RxError),
  Complete,
}

struct RelayState<T> {
  subscribed: bool,
  in_flight: usize,
  early: VecDeque<T>,
  closed: bool,
  failed: bool,
  terminal: Option<Terminal>,
  delivering: bool,
  final_requested: bool,
  finished: bool,
}

pub(crate) struct Relay<T> {
  sink: Mutex<Option<BoxSink<T>>>,
  state: Mutex<RelayState<T>>,
  control: OnceCell<Controllable>,
}

enum Step {
  Terminal(Terminal),
  Final,
}

/// Hand one item downstream. A panic in downstream code is caught here so
/// it cannot leave the item counted as in flight.
fn forward_next<T>(sink: &mut BoxSink<T>, item: T) -> Result<(), RxError> {
  panic::catch_unwind(AssertUnwindSafe(|| sink.on_next(item))).map_err(RxError::from_panic)
}

impl<T> Relay<T> {
  pub(crate) fn new(sink: BoxSink<T>) -> Self {
    Relay {
      sink: Mutex::new(Some(sink)),
      state: Mutex::new(RelayState {
        subscribed: false,
        in_flight: 0,
        early: VecDeque::new(),
        closed: false,
        failed: false,
        terminal: None,
        delivering: false,
        final_requested: false,
        finished: false,
      }),
      control: OnceCell::new(),
    }
  }

  /// Remember the boundary handle; items are dropped once it is cancelled.
  pub(crate) fn bind(&self, control: Controllable) { let _ = self.control.set(control); }

  pub(crate) fn control(&self) -> Option<&Controllable> { self.control.get() }

  fn is_cancelled(&self) -> bool { self.control.get().map_or(false, Controllable::is_cancel_requested) }

  /// Deliver `on_subscribe`, then anything that arrived ahead of it.
  pub(crate) fn subscribe(&self, control: Controllable) {
    let mut panicked = None;
    {
      let mut sink = self.sink.lock();
      if let Some(sink) = sink.as_mut() {
        sink.on_subscribe(control);
      }
      loop {
        let mut state = self.state.lock();
        match state.early.pop_front() {
          Some(item) => {
            let drop_it = state.failed || self.is_cancelled();
            drop(state);
            if !drop_it {
              if let Some(sink) = sink.as_mut() {
                if let Err(err) = forward_next(sink, item) {
                  self.state.lock().failed = true;
                  panicked = Some(err);
                }
              }
            }
            self.state.lock().in_flight -= 1;
          }
          None => {
            state.subscribed = true;
            break;
          }
        }
      }
    }
    match panicked {
      Some(err) => self.fail_and_cancel(err),
      None => self.finish(),
    }
  }

  /// Count an item as in flight. Returns `false` if the relay no longer
  /// accepts items.
  pub(crate) fn admit(&self) -> bool {
    let mut state = self.state.lock();
    if state.closed {
      return false;
    }
    state.in_flight += 1;
    true
  }

  /// Hand an admitted item downstream.
  pub(crate) fn deliver(&self, item: T) {
    {
      let mut state = self.state.lock();
      if !state.subscribed {
        state.early.push_back(item);
        return;
      }
      if state.failed || self.is_cancelled() {
        drop(state);
        self.abandon();
        return;
      }
    }
    let delivered = match self.sink.lock().as_mut() {
      Some(sink) => forward_next(sink, item),
      None => Ok(()),
    };
    match delivered {
      Ok(()) => self.abandon(),
      Err(err) => {
        self.release(1);
        self.fail_and_cancel(err);
      }
    }
  }

  /// An admitted item will never be delivered.
  pub(crate) fn abandon(&self) {
    self.release(1);
    self.finish();
  }

  /// Forget `count` admitted items without trying to finish.
  pub(crate) fn release(&self, count: usize) {
    let mut state = self.state.lock();
    state.in_flight = state.in_flight.saturating_sub(count);
  }

  /// An admitted item failed: it is dropped and the subscription errors.
  pub(crate) fn fail_item(&self, err: RxError) {
    self.release(1);
    self.fault(err);
  }

  /// Downstream panicked on an item: fail the subscription and stop the
  /// upstream.
  fn fail_and_cancel(&self, err: RxError) {
    self.fault(err);
    if let Some(control) = self.control() {
      control.cancel();
    }
  }

  /// Fail the subscription. Later items and terminal events are ignored.
  pub(crate) fn fault(&self, err: RxError) {
    {
      let mut state = self.state.lock();
      state.failed = true;
      let replace = match &state.terminal {
        Some(Terminal::Complete) => true,
        Some(Terminal::Error(_)) => false,
        None => !state.closed,
      };
      if replace {
        state.terminal = Some(Terminal::Error(err));
      }
      state.closed = true;
    }
    self.finish();
  }

  /// Record the upstream terminal event without delivering it yet.
  pub(crate) fn close(&self, terminal: Terminal) {
    let mut state = self.state.lock();
    if !state.closed {
      state.closed = true;
      state.terminal = Some(terminal);
    }
  }

  pub(crate) fn terminate(&self, terminal: Terminal) {
    self.close(terminal);
    self.finish();
  }

  /// Record that upstream finalized without delivering it yet.
  pub(crate) fn mark_final(&self) {
    let mut state = self.state.lock();
    state.closed = true;
    state.final_requested = true;
  }

  pub(crate) fn request_final(&self) {
    self.mark_final();
    self.finish();
  }

  /// Deliver whatever is due: the terminal event once nothing is in flight,
  /// then `on_final` once requested.
  pub(crate) fn finish(&self) {
    let mut state = self.state.lock();
    loop {
      if !state.subscribed || state.in_flight > 0 || state.delivering {
        return;
      }
      let step = if let Some(terminal) = state.terminal.take() {
        Step::Terminal(terminal)
      } else if state.final_requested && !state.finished {
        state.finished = true;
        Step::Final
      } else {
        return;
      };
      state.delivering = true;
      drop(state);

      {
        let mut sink = self.sink.lock();
        match step {
          Step::Terminal(Terminal::Error(err)) => {
            if let Some(sink) = sink.as_mut() {
              sink.on_error(err);
            }
          }
          Step::Terminal(Terminal::Complete) => {
            if let Some(sink) = sink.as_mut() {
              sink.on_complete();
            }
          }
          Step::Final => {
            if let Some(mut sink) = sink.take() {
              sink.on_final();
            }
          }
        }
      }

      state = self.state.lock();
      state.delivering = false;
    }
  }
}
