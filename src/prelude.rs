//! Prelude module for convenient imports

pub use crate::{
  controllable::{CancelGuard, Controllable},
  error::{RxError, SchedulerError},
  scheduler::{
    Executor, HostScheduler, ImmediateScheduler, PoolConfig, PoolScheduler, Scheduler, Task, TaskId,
  },
  sink::{BoxSink, CallbackSink, LoggingSink, Sink},
  source::Emitter,
  stream::Stream,
};
