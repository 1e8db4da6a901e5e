//! The pipeline's write side. Three writers share one property: every write is
//! idempotent, keyed by a name derived from what is being written, never by when.
//! That is what lets the worker treat the conditional offset commit, rather than any
//! individual write, as the atomicity boundary for durability.

/// Malformed payloads preserved for inspection instead of being dropped silently.
pub(crate) mod dead_letter;
/// Emitted aggregates written to the object store and the relational store.
pub(crate) mod dual;
/// Fetched batches durably checkpointed as immutable raw objects.
pub(crate) mod raw;
