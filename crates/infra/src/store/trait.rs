use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use credflow_core::{
    CredentialEvent, CredentialRequest, CredentialRequestId, EventId, IdentityRecord,
};

/// Store operation error.
///
/// These are **infrastructure errors** (connectivity, corrupted rows) as
/// opposed to domain errors (validation, illegal transitions).
///
/// `Unavailable` is the fatal case: it propagates to the chunk boundary and
/// aborts the current job run. Already-committed chunks stay committed; the
/// next scheduled run re-queries current pending state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("credential event {0} not found")]
    EventNotFound(EventId),

    #[error("credential request {0} not found")]
    RequestNotFound(CredentialRequestId),

    #[error("row decoding failed: {0}")]
    Decode(String),
}

/// Persistence boundary for credential events and their identity artifacts.
///
/// ## Fetch order
///
/// `fetch_pending` returns events with status `NEW` or `FAILED`, sorted by a
/// strict four-key comparator so pagination is deterministic:
///
/// 1. status descending — `NEW` before `FAILED`, fresh work first
/// 2. retry_count ascending — least-retried first, low starvation
/// 3. created_at ascending — oldest first
/// 4. event id ascending — total-order tiebreak
///
/// ## Write semantics
///
/// `record_processed` and `record_failure` each persist one item's outcome
/// atomically. Both are idempotent and neither regresses a `PROCESSED` row:
/// the pipeline is at-least-once, so a replayed write after a crash must be
/// harmless.
pub trait EventStore: Send + Sync {
    /// Insert a new event into the pending set.
    fn append(&self, event: CredentialEvent) -> Result<(), StoreError>;

    /// One page of the pending set in fetch order.
    fn fetch_pending(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialEvent>, StoreError>;

    /// Persist a successful outcome: store the identity record and mark the
    /// event `PROCESSED`. No-op if the event is already processed.
    fn record_processed(&self, identity: &IdentityRecord) -> Result<(), StoreError>;

    /// Persist a failed attempt: mark the event `FAILED` and increment its
    /// retry count. No-op if the event is already processed.
    fn record_failure(&self, id: EventId, attempted_at: DateTime<Utc>) -> Result<(), StoreError>;

    fn get(&self, id: EventId) -> Result<Option<CredentialEvent>, StoreError>;

    /// The stored identity artifact for a request, if processing completed.
    fn get_identity(
        &self,
        request_id: CredentialRequestId,
    ) -> Result<Option<IdentityRecord>, StoreError>;

    /// Number of events currently in the pending set.
    fn pending_count(&self) -> Result<u64, StoreError>;
}

/// Persistence boundary for issued-but-unconfirmed credential requests.
///
/// `fetch_unresolved` pages through requests still awaiting confirmation,
/// oldest first (created_at ascending, id ascending tiebreak), excluding
/// resolved and abandoned rows.
pub trait RequestStore: Send + Sync {
    /// Track a newly issued request.
    fn record_request(&self, request: CredentialRequest) -> Result<(), StoreError>;

    /// One page of unresolved requests, oldest first.
    fn fetch_unresolved(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialRequest>, StoreError>;

    /// Record one resubmission of the request. No-op if the request is no
    /// longer unresolved (a concurrent confirmation won the race).
    fn mark_resubmitted(
        &self,
        id: CredentialRequestId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Confirmation observed for this request. Tolerates unknown ids: events
    /// may arrive for requests this store never tracked.
    fn mark_resolved(&self, id: CredentialRequestId) -> Result<(), StoreError>;

    /// Give up on the request after the lifetime resubmission limit. No-op if
    /// already resolved.
    fn mark_abandoned(&self, id: CredentialRequestId) -> Result<(), StoreError>;

    fn get(&self, id: CredentialRequestId) -> Result<Option<CredentialRequest>, StoreError>;

    /// Number of requests still awaiting confirmation.
    fn unresolved_count(&self) -> Result<u64, StoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(&self, event: CredentialEvent) -> Result<(), StoreError> {
        (**self).append(event)
    }

    fn fetch_pending(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialEvent>, StoreError> {
        (**self).fetch_pending(page_size, offset)
    }

    fn record_processed(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
        (**self).record_processed(identity)
    }

    fn record_failure(&self, id: EventId, attempted_at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).record_failure(id, attempted_at)
    }

    fn get(&self, id: EventId) -> Result<Option<CredentialEvent>, StoreError> {
        (**self).get(id)
    }

    fn get_identity(
        &self,
        request_id: CredentialRequestId,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        (**self).get_identity(request_id)
    }

    fn pending_count(&self) -> Result<u64, StoreError> {
        (**self).pending_count()
    }
}

impl<S> RequestStore for Arc<S>
where
    S: RequestStore + ?Sized,
{
    fn record_request(&self, request: CredentialRequest) -> Result<(), StoreError> {
        (**self).record_request(request)
    }

    fn fetch_unresolved(
        &self,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<CredentialRequest>, StoreError> {
        (**self).fetch_unresolved(page_size, offset)
    }

    fn mark_resubmitted(
        &self,
        id: CredentialRequestId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_resubmitted(id, at)
    }

    fn mark_resolved(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        (**self).mark_resolved(id)
    }

    fn mark_abandoned(&self, id: CredentialRequestId) -> Result<(), StoreError> {
        (**self).mark_abandoned(id)
    }

    fn get(&self, id: CredentialRequestId) -> Result<Option<CredentialRequest>, StoreError> {
        (**self).get(id)
    }

    fn unresolved_count(&self) -> Result<u64, StoreError> {
        (**self).unresolved_count()
    }
}
