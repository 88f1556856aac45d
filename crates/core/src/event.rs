//! Credential events: the unit of pending work drained by the batch pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CredentialRequestId, EventId};

/// Processing status of a credential event.
///
/// Legal transitions: `New -> Processed`, `New -> Failed`, `Failed -> Processed`,
/// `Failed -> Failed` (each failure increments the retry count). A `Processed`
/// event never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Freshly received, never attempted.
    New,
    /// At least one attempt failed; eligible for retry.
    Failed,
    /// Terminal: the identity artifact has been persisted.
    Processed,
}

impl EventStatus {
    /// Whether the event still belongs to the pending set drained by a run.
    pub fn is_pending(&self) -> bool {
        matches!(self, EventStatus::New | EventStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Processed)
    }

    /// Database text representation (`NEW` / `FAILED` / `PROCESSED`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "NEW",
            EventStatus::Failed => "FAILED",
            EventStatus::Processed => "PROCESSED",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(EventStatus::New),
            "FAILED" => Ok(EventStatus::Failed),
            "PROCESSED" => Ok(EventStatus::Processed),
            other => Err(DomainError::validation(format!(
                "unknown event status: {other}"
            ))),
        }
    }
}

/// One unit of credential work: a received issuance event waiting to be turned
/// into a persisted identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEvent {
    /// Unique event ID.
    pub id: EventId,
    /// The credential request this event belongs to.
    pub request_id: CredentialRequestId,
    /// Raw issuance payload as received.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: EventStatus,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// When the event was received.
    pub created_at: DateTime<Utc>,
    /// When the event was last attempted, if ever.
    pub last_attempted_at: Option<DateTime<Utc>>,
}

impl CredentialEvent {
    /// Create a fresh event for a request.
    pub fn new(request_id: CredentialRequestId, payload: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            request_id,
            payload,
            status: EventStatus::New,
            retry_count: 0,
            created_at: Utc::now(),
            last_attempted_at: None,
        }
    }

    /// Override the creation timestamp (tests need deterministic ordering).
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Override the status and retry count (seeding helpers).
    pub fn with_attempts(mut self, status: EventStatus, retry_count: u32) -> Self {
        self.status = status;
        self.retry_count = retry_count;
        self
    }

    /// Override the last-attempt timestamp.
    pub fn with_last_attempted_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempted_at = Some(at);
        self
    }

    /// Mark the event processed.
    ///
    /// Idempotent: marking an already processed event again is a no-op, so a
    /// replayed write after a crash cannot corrupt state.
    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status == EventStatus::Processed {
            return Ok(());
        }
        self.status = EventStatus::Processed;
        self.last_attempted_at = Some(at);
        Ok(())
    }

    /// Record a failed attempt: status becomes `Failed` and the retry count
    /// increments. Refused for a processed event, which never regresses.
    pub fn mark_failed(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status == EventStatus::Processed {
            return Err(DomainError::illegal_transition(
                self.status.as_str(),
                EventStatus::Failed.as_str(),
            ));
        }
        self.status = EventStatus::Failed;
        self.retry_count += 1;
        self.last_attempted_at = Some(at);
        Ok(())
    }
}

/// The persisted result of successfully processing one credential event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Event that produced this record.
    pub event_id: EventId,
    /// Request the identity belongs to.
    pub request_id: CredentialRequestId,
    /// The validated identity document.
    pub identity: serde_json::Value,
    /// When processing completed.
    pub processed_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn new(
        event_id: EventId,
        request_id: CredentialRequestId,
        identity: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            request_id,
            identity,
            processed_at: Utc::now(),
        }
    }
}
