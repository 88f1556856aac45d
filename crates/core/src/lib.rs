//! `credflow-core` — domain foundation of the credential batch pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! credential events and their status lifecycle, unconfirmed credential
//! requests, and the retry policies the batch jobs apply.

pub mod error;
pub mod event;
pub mod id;
pub mod request;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use event::{CredentialEvent, EventStatus, IdentityRecord};
pub use id::{CredentialRequestId, EventId};
pub use request::{CredentialRequest, RequestStatus};
pub use retry::{BackoffPolicy, RetryInterval};
