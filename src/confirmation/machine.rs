//! The action confirmation state machine.
//!
//! # At-most-once
//!
//! `confirm` removes the record with an atomic `take` *before* the executor is
//! called. Whoever wins the `take` is the only caller that can dispatch; every
//! concurrent or retried `confirm` observes `ConfirmationNotFound`. An executor
//! failure therefore leaves nothing behind to retry, and the caller receives
//! `ExecutionFailed` so the approver knows the action was attempted.
//!
//! # Expiry
//!
//! Records are stored for `ttl + expiry_grace`. Past `expires_at` a record is
//! consumed and reported as `ConfirmationExpired`; once the store has dropped
//! it, the caller sees `ConfirmationNotFound`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::executor::ActionExecutor;
use super::record::{ActionProposal, ConfirmationOutcome, ConfirmationStatus, PendingConfirmation};
use super::store::{ConfirmationStore, generate_confirmation_id};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::ConfirmationConfig;
use crate::failsafe::{RetryPolicy, with_retry};
use crate::identity::Principal;
use crate::{Error, Result};

/// Drives proposals through `pending` to a terminal state.
#[derive(Clone)]
pub struct ConfirmationMachine {
    store: Arc<dyn ConfirmationStore>,
    ttl: Duration,
    expiry_grace: Duration,
    retry: RetryPolicy,
    audit: Option<AuditSink>,
}

impl ConfirmationMachine {
    /// Create a state machine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ConfirmationStore>, config: &ConfirmationConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
            expiry_grace: config.expiry_grace,
            retry: RetryPolicy::new(&config.retry),
            audit: None,
        }
    }

    /// Record lifecycle events to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: AuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// The default proposal TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.record(event);
        }
    }

    /// Store a proposal with the default TTL.
    ///
    /// # Errors
    ///
    /// `ConfirmationStoreUnavailable` if the write fails after retries, or
    /// `ConfirmationIdCollision` if the generated id is already live.
    pub async fn propose(
        &self,
        principal: &Principal,
        service_key_prefix: &str,
        proposal: ActionProposal,
    ) -> Result<PendingConfirmation> {
        self.propose_with_ttl(principal, service_key_prefix, proposal, self.ttl)
            .await
    }

    /// Store a proposal that stays confirmable for `ttl`.
    ///
    /// # Errors
    ///
    /// See [`propose`](Self::propose).
    pub async fn propose_with_ttl(
        &self,
        principal: &Principal,
        service_key_prefix: &str,
        proposal: ActionProposal,
        ttl: Duration,
    ) -> Result<PendingConfirmation> {
        let id = generate_confirmation_id();
        let record =
            PendingConfirmation::from_proposal(id, service_key_prefix, &principal.subject, proposal, ttl);
        let store_ttl = ttl.saturating_add(self.expiry_grace);

        let attempts = &AtomicU32::new(0);
        let stored = &record;
        with_retry(&self.retry, "confirmation_create", move || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            match self
                .store
                .create(service_key_prefix, &stored.confirmation_id, stored, store_ttl)
                .await
            {
                // An earlier attempt may have written the record before its reply was lost.
                Err(Error::ConfirmationIdCollision(id)) if attempt > 0 => {
                    self.adopt_earlier_write(stored, id).await
                }
                other => other,
            }
        })
        .await
        .inspect_err(|e| {
            warn!(prefix = service_key_prefix, error = %e, "Failed to store pending confirmation");
        })?;

        info!(
            prefix = service_key_prefix,
            subject = %principal.subject,
            action = %record.action,
            expires_at = %record.expires_at,
            "Confirmation proposed"
        );
        self.audit(AuditEvent::confirmation(
            "confirmation.proposed",
            &principal.subject,
            service_key_prefix,
            &record.confirmation_id,
        ));
        Ok(record)
    }

    /// Decide a pending confirmation.
    ///
    /// With `approve = false` the record is consumed and `Rejected` returned.
    /// With `approve = true` the record is consumed and `executor` called once.
    ///
    /// # Errors
    ///
    /// - `ConfirmationNotFound`: no live record (never existed, already decided,
    ///   or lost a concurrent race)
    /// - `ConfirmationExpired`: the TTL elapsed; the action will never run
    /// - `ConfirmationPrincipalMismatch`: the caller is not the proposer
    /// - `ConfirmationStoreUnavailable`: the store failed after retries
    /// - `ExecutionFailed`: the executor failed after the record was consumed
    pub async fn confirm(
        &self,
        principal: &Principal,
        service_key_prefix: &str,
        confirmation_id: &str,
        approve: bool,
        executor: &dyn ActionExecutor,
    ) -> Result<ConfirmationOutcome> {
        let record = with_retry(&self.retry, "confirmation_get", || {
            self.store.get(service_key_prefix, confirmation_id)
        })
        .await?
        .ok_or_else(|| Error::ConfirmationNotFound(confirmation_id.to_string()))?;

        if record.is_expired() {
            return Err(self.expire(principal, &record).await);
        }

        if record.principal_subject != principal.subject {
            warn!(
                prefix = service_key_prefix,
                subject = %principal.subject,
                "Confirmation attempted by a principal other than the proposer"
            );
            self.audit(AuditEvent::confirmation(
                "confirmation.principal_mismatch",
                &principal.subject,
                service_key_prefix,
                confirmation_id,
            ));
            return Err(Error::ConfirmationPrincipalMismatch(
                confirmation_id.to_string(),
            ));
        }

        // Single point of serialization: only one caller gets the record back.
        let mut record = with_retry(&self.retry, "confirmation_take", || {
            self.store.take(service_key_prefix, confirmation_id)
        })
        .await?
        .ok_or_else(|| Error::ConfirmationNotFound(confirmation_id.to_string()))?;

        if !approve {
            record.status = record.status.transition(ConfirmationStatus::Rejected)?;
            info!(prefix = service_key_prefix, action = %record.action, "Confirmation rejected");
            self.audit(AuditEvent::confirmation(
                "confirmation.rejected",
                &principal.subject,
                service_key_prefix,
                confirmation_id,
            ));
            return record.into_outcome(Value::Null);
        }

        record.status = record.status.transition(ConfirmationStatus::Confirmed)?;
        match executor
            .execute(principal, &record.action, &record.action_payload)
            .await
        {
            Ok(result) => {
                info!(prefix = service_key_prefix, action = %record.action, "Confirmed action executed");
                self.audit(AuditEvent::confirmation(
                    "confirmation.confirmed",
                    &principal.subject,
                    service_key_prefix,
                    confirmation_id,
                ));
                record.into_outcome(result)
            }
            Err(e) => {
                warn!(
                    prefix = service_key_prefix,
                    action = %record.action,
                    error = %e,
                    "Confirmed action failed"
                );
                self.audit(
                    AuditEvent::confirmation(
                        "confirmation.execution_failed",
                        &principal.subject,
                        service_key_prefix,
                        confirmation_id,
                    )
                    .with_reason("EXECUTION_FAILED"),
                );
                Err(Error::ExecutionFailed {
                    confirmation_id: record.confirmation_id,
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Whether a record is still stored for `confirmation_id`.
    ///
    /// # Errors
    ///
    /// `ConfirmationStoreUnavailable` if the store fails after retries.
    pub async fn exists(&self, service_key_prefix: &str, confirmation_id: &str) -> Result<bool> {
        with_retry(&self.retry, "confirmation_exists", || {
            self.store.exists(service_key_prefix, confirmation_id)
        })
        .await
    }

    /// Treat a create collision on a retried attempt as success when the
    /// stored record is the one being written.
    async fn adopt_earlier_write(&self, record: &PendingConfirmation, id: String) -> Result<()> {
        let prefix = record.service_key_prefix.as_str();
        match self.store.get(prefix, &id).await? {
            Some(existing) if existing == *record => {
                debug!(prefix, "Create retried after an unacknowledged write; record already stored");
                Ok(())
            }
            _ => Err(Error::ConfirmationIdCollision(id)),
        }
    }

    /// Consume a logically expired record and build the error to report.
    async fn expire(&self, principal: &Principal, record: &PendingConfirmation) -> Error {
        let prefix = record.service_key_prefix.as_str();
        let id = record.confirmation_id.as_str();

        match with_retry(&self.retry, "confirmation_expire", || self.store.take(prefix, id)).await {
            // Another caller already consumed it.
            Ok(None) => return Error::ConfirmationNotFound(id.to_string()),
            Ok(Some(_)) => {}
            Err(e) => warn!(prefix, error = %e, "Failed to remove expired confirmation"),
        }

        info!(prefix, "Confirmation expired before a decision");
        self.audit(AuditEvent::confirmation(
            "confirmation.expired",
            &principal.subject,
            prefix,
            id,
        ));
        Error::ConfirmationExpired(id.to_string())
    }
}
