//! `schedule_in`: subscribe to the upstream on a scheduler.
//!
//! Downstream receives its handle immediately, on the subscribing thread.
//! The upstream subscription itself is a scheduled task; cancelling before
//! that task starts withdraws it and `on_final` is still delivered, from the
//! scheduler. Once the task has started, cancellation is the cooperative
//! request every source polls.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
  controllable::{ControlChain, Controllable},
  error::RxError,
  scheduler::{schedule_or_run, Scheduler, Task, TaskId},
  sink::{forward, BoxSink, Sink},
  stream::{Node, Stream},
};

struct ScheduleInNode<T> {
  upstream: Stream<T>,
  scheduler: Arc<dyn Scheduler>,
  delay: Option<Duration>,
  serial: bool,
}

impl<T: Send + 'static> Node<T> for ScheduleInNode<T> {
  fn perform_subscribe(&self, mut sink: BoxSink<T>, chain: &Arc<ControlChain>) {
    let boundary = chain.detached();
    sink.on_subscribe(boundary.clone());
    if boundary.is_cancel_requested() {
      sink.on_final();
      return;
    }

    let slot = Arc::new(Mutex::new(Some(sink)));
    let id = TaskId::next();

    let scheduler = self.scheduler.clone();
    let c_slot = slot.clone();
    let serial = self.serial;
    boundary.on_cancel(move |_| {
      scheduler.cancel(id, true);
      let sink = c_slot.lock().take();
      if let Some(mut sink) = sink {
        tracing::trace!(task = %id, "subscription withdrawn before it started");
        schedule_or_run(&*scheduler, None, serial, move || sink.on_final());
      }
    });

    let task = {
      let slot = slot.clone();
      let upstream = self.upstream.clone();
      let chain = chain.clone();
      let boundary = boundary.clone();
      let r_slot = slot.clone();
      Task::with_id(id, move || {
        let sink = slot.lock().take();
        if let Some(sink) = sink {
          upstream.perform_subscribe(Box::new(ScheduleInSink { downstream: sink, boundary }), &chain);
        }
      })
      .on_reject(move |err| {
        let sink = r_slot.lock().take();
        if let Some(mut sink) = sink {
          sink.on_error(RxError::from(err));
          sink.on_final();
        }
      })
    };

    if let Err(err) = self.scheduler.schedule(task, self.delay, self.serial) {
      let sink = slot.lock().take();
      if let Some(mut sink) = sink {
        sink.on_error(RxError::from(err));
        sink.on_final();
      }
    }
  }
}

/// Hides the upstream `on_subscribe`: downstream already has the boundary
/// handle, which is linked to the upstream handle instead.
struct ScheduleInSink<T> {
  downstream: BoxSink<T>,
  boundary: Controllable,
}

impl<T> Sink<T> for ScheduleInSink<T> {
  fn on_subscribe(&mut self, controllable: Controllable) { self.boundary.link_parent(&controllable); }

  fn on_next(&mut self, item: T) { self.downstream.on_next(item) }

  forward!(on_error, on_complete, on_final);
}

impl<T: Send + 'static> Stream<T> {
  /// Subscribe to the upstream from a task on `scheduler`, so the source
  /// produces there.
  ///
  /// `delay` postpones the subscription; `serial` queues it behind other
  /// serial work on the same scheduler.
  pub fn schedule_in(self, scheduler: impl Scheduler + 'static, delay: Option<Duration>, serial: bool) -> Stream<T> {
    Stream::from_node(ScheduleInNode { upstream: self, scheduler: Arc::new(scheduler), delay, serial })
  }
}
