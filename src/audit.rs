//! Audit trail for authentication, authorization, confirmation and
//! prompt-defense outcomes.
//!
//! Events are pushed onto a bounded queue by [`AuditSink::record`], which never
//! blocks and never fails: if the queue is full or the drain task is gone, the
//! event is written to the local log instead. A background task forwards
//! queued events to an [`AuditForwarder`] (structured `tracing` output, or a
//! SIEM HTTP endpoint).
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.success` | A bearer token was validated |
//! | `auth.failure` | Token validation failed |
//! | `authz.denied` | The role policy refused an operation |
//! | `policy.superuser_bypass_refused` | An automation identity held a superuser role in production |
//! | `confirmation.proposed` | A pending confirmation was stored |
//! | `confirmation.confirmed` | A confirmed action executed successfully |
//! | `confirmation.rejected` | The approver rejected the action |
//! | `confirmation.expired` | A confirm arrived after the TTL |
//! | `confirmation.execution_failed` | The executor failed after the record was consumed |
//! | `confirmation.principal_mismatch` | Someone other than the proposer tried to confirm |
//! | `prompt_defense.violation` | Inbound scan found violations |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::AuditConfig;
use crate::identity::Principal;

/// Structured audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event id
    pub id: String,
    /// Event type string (e.g., `"auth.success"`)
    pub event: &'static str,
    /// When the event was produced
    pub at: DateTime<Utc>,
    /// Subject of the acting principal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Business domain involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Requested access level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// Confirmation id involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
    /// Hashed conversation session id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Violation kinds for defense events
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    /// Public error code or machine-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event,
            at: Utc::now(),
            subject: None,
            domain: None,
            access: None,
            confirmation_id: None,
            session: None,
            findings: Vec::new(),
            reason: None,
        }
    }

    /// `auth.success`
    #[must_use]
    pub fn auth_success(principal: &Principal) -> Self {
        Self {
            subject: Some(principal.subject.clone()),
            ..Self::new("auth.success")
        }
    }

    /// `auth.failure` with the public error code as reason.
    #[must_use]
    pub fn auth_failure(code: &str) -> Self {
        Self {
            reason: Some(code.to_string()),
            ..Self::new("auth.failure")
        }
    }

    /// `authz.denied`
    #[must_use]
    pub fn authz_denied(principal: &Principal, domain: &str, access: &str, reason: &str) -> Self {
        Self {
            subject: Some(principal.subject.clone()),
            domain: Some(domain.to_string()),
            access: Some(access.to_string()),
            reason: Some(reason.to_string()),
            ..Self::new("authz.denied")
        }
    }

    /// `policy.superuser_bypass_refused`
    #[must_use]
    pub fn superuser_refused(principal: &Principal, domain: &str) -> Self {
        Self {
            subject: Some(principal.subject.clone()),
            domain: Some(domain.to_string()),
            ..Self::new("policy.superuser_bypass_refused")
        }
    }

    /// A confirmation lifecycle event (`confirmation.*`).
    #[must_use]
    pub fn confirmation(
        event: &'static str,
        subject: &str,
        service_key_prefix: &str,
        confirmation_id: &str,
    ) -> Self {
        Self {
            subject: Some(subject.to_string()),
            domain: Some(service_key_prefix.to_string()),
            confirmation_id: Some(confirmation_id.to_string()),
            ..Self::new(event)
        }
    }

    /// `prompt_defense.violation`
    #[must_use]
    pub fn defense_violation(session_id: &str, findings: Vec<String>, strict: bool) -> Self {
        Self {
            session: Some(hash_session(session_id)),
            findings,
            reason: Some(if strict { "suppressed" } else { "redacted" }.to_string()),
            ..Self::new("prompt_defense.violation")
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Truncated SHA-256 of a session id; raw session ids never reach the audit log.
#[must_use]
pub fn hash_session(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    hex::encode(&digest[..8])
}

/// Emit an audit event via `tracing::info!` with the JSON blob in the `audit` field.
///
/// ```text
/// INFO hitl_gateway::audit audit={"event":"auth.success",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "gateway audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

/// Destination for drained audit events.
#[async_trait::async_trait]
pub trait AuditForwarder: Send + Sync + 'static {
    /// Deliver a single event.
    async fn forward(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Forwards events to the structured log.
#[derive(Debug, Default)]
pub struct TracingForwarder;

#[async_trait::async_trait]
impl AuditForwarder for TracingForwarder {
    async fn forward(&self, event: &AuditEvent) -> anyhow::Result<()> {
        emit(event);
        Ok(())
    }
}

/// Posts events as JSON to a SIEM collector.
pub struct HttpForwarder {
    http: reqwest::Client,
    url: String,
}

impl HttpForwarder {
    /// Create a forwarder for `url` with a per-event timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl AuditForwarder for HttpForwarder {
    async fn forward(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.http
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Non-blocking handle for recording audit events.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink {
    /// Create a sink and the receiving half of its queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Create a sink drained into `forwarder` by a background task.
    ///
    /// The task exits when `shutdown` fires, after flushing what is queued.
    #[must_use]
    pub fn spawn(
        forwarder: Arc<dyn AuditForwarder>,
        capacity: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (sink, rx) = Self::channel(capacity);
        tokio::spawn(drain(rx, forwarder, shutdown));
        sink
    }

    /// Build a sink from configuration (SIEM forwarder if configured, log otherwise).
    #[must_use]
    pub fn from_config(config: &AuditConfig, shutdown: broadcast::Receiver<()>) -> Self {
        let forwarder: Arc<dyn AuditForwarder> = match config.siem_url.as_deref() {
            Some(url) => match HttpForwarder::new(url, config.siem_timeout) {
                Ok(f) => Arc::new(f),
                Err(e) => {
                    warn!(error = %e, "Failed to build SIEM forwarder; audit events go to the log");
                    Arc::new(TracingForwarder)
                }
            },
            None => Arc::new(TracingForwarder),
        };
        Self::spawn(forwarder, config.buffer_size, shutdown)
    }

    /// Queue an event. Never blocks; falls back to the local log.
    pub fn record(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let event = match err {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(event = event.event, "Audit queue unavailable; logging event locally");
            emit(&event);
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<AuditEvent>,
    forwarder: Arc<dyn AuditForwarder>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                deliver(forwarder.as_ref(), &event).await;
            }
            _ = shutdown.recv() => {
                while let Ok(event) = rx.try_recv() {
                    deliver(forwarder.as_ref(), &event).await;
                }
                debug!("Audit drain shutting down");
                break;
            }
        }
    }
}

async fn deliver(forwarder: &dyn AuditForwarder, event: &AuditEvent) {
    if let Err(e) = forwarder.forward(event).await {
        warn!(error = %e, event = event.event, "Audit delivery failed; logging event locally");
        emit(event);
    }
}
