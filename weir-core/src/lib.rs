//! Weir ingests a partitioned stream of user-activity events, durably checkpoints the
//! raw data, applies windowed aggregation, and commits the results exactly-once to an
//! object store and a relational store.
//!
//! Each assigned partition runs an independent loop until its assignment is revoked:
//! - Fetch a bounded batch from the partition log (sized by backpressure)
//! - Persist the raw batch as an immutable, deterministically named object
//! - Validate events (dead-lettering schema violations) and fold them into window
//!   state; advance the watermark
//! - Write closed windows to both sinks, keyed for idempotence
//! - Conditionally commit the offset + window snapshot under the worker's generation
//!
//! Exactly-once is an *effect*, not a transport guarantee: fetches are at-least-once,
//! every downstream write is idempotent, and the generation-fenced commit is the
//! single atomicity boundary.

mod error;
pub use crate::error::{Error, Result};

pub mod pipeline;
pub use crate::pipeline::run;

mod backpressure;
mod config;
mod coordinator;
mod log;
mod message;
mod metrics;
mod sink;
mod store;
mod window;
mod worker;
