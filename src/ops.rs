//! Operators. Each module adds its methods to [`Stream`](crate::stream::Stream)
//! and defines the sink it wraps around downstream.

mod delay;
mod filter;
mod flat_map;
mod map;
mod observe_on;
mod publish_on;
mod relay;
mod schedule_in;
mod tap;
mod try_catch;
