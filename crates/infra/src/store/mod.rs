//! Durable store boundary for the batch pipeline.
//!
//! The relational store is the single source of truth: which events are
//! pending, retried, or done is row state, never in-memory state, so a run can
//! crash and the next one resumes by re-querying. This module defines the
//! store traits without storage assumptions, an in-memory implementation for
//! tests and database-less operation, and the Postgres implementation.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryEventStore, InMemoryRequestStore};
pub use postgres::{PostgresEventStore, PostgresRequestStore};
pub use r#trait::{EventStore, RequestStore, StoreError};
