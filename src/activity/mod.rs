//! Activity abstractions
//!
//! An activity is the I/O a `call`/`run` task performs once the driver
//! ([`crate::interp`]) suspends at it. Activities may fail; the consumer
//! feeds the [`crate::error::WorkflowError`] back through
//! [`crate::interp::resume`], where `try`/`catch`/`retry` decide what
//! happens next. There is no separate heartbeat/cancellation surface here:
//! an activity either returns within the dispatcher's own timeout or the
//! outbox's retry backoff covers the retry.

mod dispatch;

pub use dispatch::{ActivityDispatcher, RecordingDispatcher, StandardDispatcher};
