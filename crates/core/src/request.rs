//! Credential requests: issued-but-unconfirmed issuance requests tracked by
//! the retrigger sub-pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::CredentialRequestId;

/// Lifecycle of a credential request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Sent, no issuance confirmation observed yet.
    Pending,
    /// A credential event for this request reached `Processed`.
    Resolved,
    /// Gave up after exhausting the resubmission limit.
    Abandoned,
}

impl RequestStatus {
    /// Whether the retrigger job should still consider this request.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Resolved => "RESOLVED",
            RequestStatus::Abandoned => "ABANDONED",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "RESOLVED" => Ok(RequestStatus::Resolved),
            "ABANDONED" => Ok(RequestStatus::Abandoned),
            other => Err(DomainError::validation(format!(
                "unknown request status: {other}"
            ))),
        }
    }
}

/// A credential request whose issuance callback has not been confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub id: CredentialRequestId,
    /// The original issuance payload, replayed on resubmission.
    pub payload: serde_json::Value,
    pub status: RequestStatus,
    /// How many times the request has been resubmitted.
    pub resubmit_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_resubmitted_at: Option<DateTime<Utc>>,
}

impl CredentialRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: CredentialRequestId::new(),
            payload,
            status: RequestStatus::Pending,
            resubmit_count: 0,
            created_at: Utc::now(),
            last_resubmitted_at: None,
        }
    }

    /// Override the creation timestamp (tests need deterministic ordering).
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Override the resubmission bookkeeping (seeding helper).
    pub fn with_resubmissions(mut self, count: u32, last: Option<DateTime<Utc>>) -> Self {
        self.resubmit_count = count;
        self.last_resubmitted_at = last;
        self
    }

    /// Record one resubmission. Only a pending request can be resubmitted.
    pub fn mark_resubmitted(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_unresolved() {
            return Err(DomainError::illegal_transition(
                self.status.as_str(),
                "resubmitted",
            ));
        }
        self.resubmit_count += 1;
        self.last_resubmitted_at = Some(at);
        Ok(())
    }

    /// Confirmation observed. Idempotent; a late confirmation also supersedes
    /// an earlier abandonment.
    pub fn mark_resolved(&mut self) -> DomainResult<()> {
        self.status = RequestStatus::Resolved;
        Ok(())
    }

    /// Give up on the request. Refused once resolved.
    pub fn mark_abandoned(&mut self) -> DomainResult<()> {
        if self.status == RequestStatus::Resolved {
            return Err(DomainError::illegal_transition(
                self.status.as_str(),
                RequestStatus::Abandoned.as_str(),
            ));
        }
        self.status = RequestStatus::Abandoned;
        Ok(())
    }
}
