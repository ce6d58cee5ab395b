//! # rxchain: push-based event pipelines
//!
//! A [`Stream`] describes how a source produces items and how a chain of
//! operators transforms them. Nothing runs until the stream is subscribed;
//! each subscription then drives the chain once, delivering the events of the
//! [`Sink`] protocol:
//!
//! ```text
//! on_subscribe → on_next* → (on_error | on_complete)? → on_final
//! ```
//!
//! `on_final` is delivered exactly once for every subscription, whether it
//! completed, failed or was cancelled.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use rxchain::{prelude::*, testing::Recorder};
//!
//! let pool = PoolScheduler::new(PoolConfig::default()).unwrap();
//! let host = HostScheduler::spawn("main").unwrap();
//!
//! let recorder = Recorder::new();
//! Stream::from_iter(1..=5)
//!   .schedule_in(pool, None, false)
//!   .map(|v| v * 10)
//!   .observe_on(host, None, true)
//!   .subscribe(recorder.clone());
//!
//! assert!(recorder.wait_for_final(Duration::from_secs(5)));
//! assert_eq!(recorder.items(), vec![10, 20, 30, 40, 50]);
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Stream`] | Immutable, lazy pipeline description |
//! | [`Sink`] | Consumer of the five protocol callbacks |
//! | [`Controllable`] | Per-subscription handle used to cancel |
//! | [`Scheduler`] | Execution context used by `schedule_in`, `observe_on` and `publish_on` |
//!
//! ## Feature Flags
//!
//! - **`tokio-scheduler`**: run a [`PoolScheduler`] on a tokio runtime handle.
//!
//! [`Stream`]: stream::Stream
//! [`Sink`]: sink::Sink
//! [`Controllable`]: controllable::Controllable
//! [`Scheduler`]: scheduler::Scheduler
//! [`PoolScheduler`]: scheduler::PoolScheduler

pub mod controllable;
pub mod error;
mod ops;
pub mod prelude;
pub mod scheduler;
pub mod sink;
mod source;
pub mod stream;
pub mod testing;
pub mod timer;

pub use prelude::*;
