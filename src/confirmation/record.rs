//! Pending confirmation records and the lifecycle they move through.
//!
//! ```text
//! Proposed ──store──▶ Pending ──┬──▶ Confirmed
//!  (memory)          (stored)   ├──▶ Rejected
//!                               └──▶ Expired
//! ```
//!
//! `Proposed` exists only as an [`ActionProposal`] in the proposer's hands.
//! A stored record is always `Pending`; reaching any terminal state removes it
//! from the store, so a terminal record is never read back.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Lifecycle status of a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    /// Stored and awaiting a decision
    Pending,
    /// Approved and dispatched to the executor
    Confirmed,
    /// Rejected by the approver
    Rejected,
    /// TTL elapsed before a decision
    Expired,
}

impl ConfirmationStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Move to `next`, enforcing `pending → {confirmed, rejected, expired}`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` for any other transition.
    pub fn transition(self, next: Self) -> Result<Self> {
        match (self, next) {
            (Self::Pending, Self::Confirmed | Self::Rejected | Self::Expired) => Ok(next),
            _ => Err(Error::Internal(format!(
                "illegal confirmation transition {self} -> {next}"
            ))),
        }
    }
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        })
    }
}

/// A sensitive action that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionProposal {
    /// Action name understood by the domain executor
    pub action: String,
    /// Description shown to the approver
    pub summary: String,
    /// Opaque data the executor needs
    pub payload: Value,
}

impl ActionProposal {
    /// Create a proposal.
    pub fn new(action: impl Into<String>, summary: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            summary: summary.into(),
            payload,
        }
    }
}

/// A stored proposal awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmation {
    /// Opaque, generator-assigned id
    pub confirmation_id: String,
    /// Storage namespace of the owning domain service
    pub service_key_prefix: String,
    /// Only this subject may confirm
    pub principal_subject: String,
    /// Action name
    pub action: String,
    /// Approver-facing description
    pub summary: String,
    /// Executor input
    pub action_payload: Value,
    /// When the proposal was stored
    pub created_at: DateTime<Utc>,
    /// After this instant the record can no longer be confirmed
    pub expires_at: DateTime<Utc>,
    /// Always `Pending` while stored
    pub status: ConfirmationStatus,
}

impl PendingConfirmation {
    /// Materialize a proposal as a pending record.
    #[must_use]
    pub fn from_proposal(
        confirmation_id: String,
        service_key_prefix: &str,
        principal_subject: &str,
        proposal: ActionProposal,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            confirmation_id,
            service_key_prefix: service_key_prefix.to_string(),
            principal_subject: principal_subject.to_string(),
            action: proposal.action,
            summary: proposal.summary,
            action_payload: proposal.payload,
            created_at,
            expires_at: created_at + ttl,
            status: ConfirmationStatus::Pending,
        }
    }

    /// Whether the confirmable window has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Successful result of [`confirm`](super::ConfirmationMachine::confirm).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    /// The executor ran and succeeded.
    #[serde(rename = "confirmed")]
    Executed {
        /// Consumed confirmation id
        #[serde(rename = "confirmationId")]
        confirmation_id: String,
        /// Executed action
        action: String,
        /// Executor output
        result: Value,
    },
    /// The approver declined; nothing ran.
    Rejected {
        /// Consumed confirmation id
        #[serde(rename = "confirmationId")]
        confirmation_id: String,
    },
}

impl PendingConfirmation {
    /// Outcome for a record that reached `confirmed` or `rejected`.
    ///
    /// `result` is the executor output and is ignored for rejections.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the record is not in one of those states.
    pub fn into_outcome(self, result: Value) -> Result<ConfirmationOutcome> {
        match self.status {
            ConfirmationStatus::Confirmed => Ok(ConfirmationOutcome::Executed {
                confirmation_id: self.confirmation_id,
                action: self.action,
                result,
            }),
            ConfirmationStatus::Rejected => Ok(ConfirmationOutcome::Rejected {
                confirmation_id: self.confirmation_id,
            }),
            other => Err(Error::Internal(format!(
                "confirmation {} has no outcome in state {other}",
                self.confirmation_id
            ))),
        }
    }
}

impl ConfirmationOutcome {
    /// Terminal status this outcome represents.
    #[must_use]
    pub fn status(&self) -> ConfirmationStatus {
        match self {
            Self::Executed { .. } => ConfirmationStatus::Confirmed,
            Self::Rejected { .. } => ConfirmationStatus::Rejected,
        }
    }
}
