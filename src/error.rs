//! Error types carried through a pipeline.
//!
//! [`RxError`] is the value delivered to `Sink::on_error`. It is cheap to
//! clone so scheduling boundaries can move it between threads freely.
//! [`SchedulerError`] describes a scheduler refusing work; it converts into
//! `RxError` when such a fault has to terminate a subscription.

use std::{any::Any, error::Error, io, sync::Arc};

/// The error delivered to a sink's `on_error` callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RxError {
  /// A plain failure described by a message.
  #[error("{0}")]
  Message(String),

  /// An error produced by user code, kept behind an `Arc` so it can be cloned.
  #[error(transparent)]
  User(Arc<dyn Error + Send + Sync>),

  /// User code panicked where the pipeline could catch it.
  #[error("callback panicked: {0}")]
  Panicked(String),

  /// A scheduler refused the work a stage needed to submit.
  #[error(transparent)]
  Scheduler(#[from] SchedulerError),
}

impl RxError {
  /// Create an error from a message.
  pub fn msg(message: impl Into<String>) -> Self { Self::Message(message.into()) }

  /// Wrap any error value.
  pub fn user(err: impl Error + Send + Sync + 'static) -> Self { Self::User(Arc::new(err)) }

  /// Build an error from a caught panic payload.
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    Self::Panicked(panic_message(payload.as_ref()))
  }

  /// Whether this error came from a caught panic.
  pub fn is_panic(&self) -> bool { matches!(self, Self::Panicked(_)) }
}

impl From<String> for RxError {
  fn from(message: String) -> Self { Self::Message(message) }
}

impl From<&str> for RxError {
  fn from(message: &str) -> Self { Self::Message(message.to_owned()) }
}

impl From<io::Error> for RxError {
  fn from(err: io::Error) -> Self { Self::user(err) }
}

/// Failure to hand work to a scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
  /// The scheduler no longer accepts work.
  #[error("scheduler `{scheduler}` is shut down")]
  ShutDown { scheduler: String },

  /// The underlying executor rejected the task.
  #[error("scheduler `{scheduler}` rejected a task: {reason}")]
  Rejected { scheduler: String, reason: String },

  /// Worker threads could not be started.
  #[error("failed to start scheduler threads")]
  Startup(#[source] Arc<io::Error>),
}

impl From<io::Error> for SchedulerError {
  fn from(err: io::Error) -> Self { Self::Startup(Arc::new(err)) }
}

/// Render a panic payload the way `std` prints it.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_owned()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_owned()
  }
}
