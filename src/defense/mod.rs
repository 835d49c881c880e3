//! Prompt defense pipeline.
//!
//! Outbound (toward the LLM provider):
//! 1. [`sanitize_outbound`](PromptDefense::sanitize_outbound) redacts PII.
//!    It never depends on the downstream call succeeding.
//! 2. [`prepare`](PromptDefense::prepare) additionally strips anything shaped
//!    like a delimiter from the untrusted text, then wraps it in the session's
//!    current [`SessionDelimiterSet`].
//!
//! Inbound (model output toward the user):
//! [`scan_inbound`](PromptDefense::scan_inbound) looks for system-prompt
//! phrasing, delimiter tags (own, other sessions', or forged) and PII. Strict
//! mode withholds the response; otherwise findings are redacted in place. Both
//! modes audit.
//!
//! All of this is synchronous computation; the only shared state is the
//! delimiter registry, which bounds how many sessions each subject may hold.

mod delimiter;
mod pii;
mod scanner;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

pub use delimiter::{DelimiterRegistry, SessionDelimiterSet};
pub use pii::{PiiKind, PiiRedactor};
pub use scanner::{OutputScanner, ScanResult, Violation, ViolationKind};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::DefenseConfig;
use crate::{Error, Result};

/// Untrusted text ready to be placed into a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedPrompt {
    /// Sanitized text wrapped in the session delimiters
    pub text: String,
    /// Opening tag in effect
    pub open_tag: String,
    /// Closing tag in effect
    pub close_tag: String,
    /// PII matches redacted
    pub redactions: usize,
    /// Delimiter-shaped sequences removed
    pub removed_delimiters: usize,
}

/// The prompt defense facade.
pub struct PromptDefense {
    registry: DelimiterRegistry,
    pii: PiiRedactor,
    scanner: OutputScanner,
    strict_default: bool,
    redact_pii_in_output: bool,
    audit: Option<AuditSink>,
}

impl PromptDefense {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid delimiter TTL or signature.
    pub fn from_config(config: &DefenseConfig) -> Result<Self> {
        Ok(Self {
            registry: DelimiterRegistry::new(config.delimiter_ttl, config.max_sessions_per_subject)?,
            pii: PiiRedactor::new()?,
            scanner: OutputScanner::new(&config.system_prompt_signatures)?,
            strict_default: config.strict,
            redact_pii_in_output: config.redact_pii_in_output,
            audit: None,
        })
    }

    /// Record violations to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: AuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Strictness applied when a caller does not choose.
    #[must_use]
    pub fn strict_default(&self) -> bool {
        self.strict_default
    }

    /// Current delimiter set for `session_id` (rotated if expired).
    #[must_use]
    pub fn delimiters(&self, session_id: &str) -> SessionDelimiterSet {
        self.registry.current(session_id)
    }

    /// Redact PII from text bound for an external provider.
    #[must_use]
    pub fn sanitize_outbound(&self, session_id: &str, text: &str) -> String {
        let (out, kinds) = self.pii.redact(text);
        if !kinds.is_empty() {
            debug!(
                session = %crate::audit::hash_session(session_id),
                count = kinds.len(),
                "Redacted PII from outbound text"
            );
        }
        out
    }

    /// Wrap untrusted text in the session's current delimiters.
    #[must_use]
    pub fn wrap_untrusted(&self, session_id: &str, text: &str) -> String {
        self.registry.current(session_id).wrap(text)
    }

    /// Sanitize, neutralize and wrap untrusted user text.
    #[must_use]
    pub fn prepare(&self, session_id: &str, text: &str) -> PreparedPrompt {
        let (redacted, kinds) = self.pii.redact(text);
        let (cleaned, removed) = self.registry.neutralize(&redacted);
        if removed > 0 {
            warn!(
                session = %crate::audit::hash_session(session_id),
                count = removed,
                "Removed delimiter-shaped text from user input"
            );
        }
        let set = self.registry.current(session_id);
        PreparedPrompt {
            text: set.wrap(&cleaned),
            open_tag: set.open_tag,
            close_tag: set.close_tag,
            redactions: kinds.len(),
            removed_delimiters: removed,
        }
    }

    /// Scan model output before it reaches the user.
    ///
    /// # Errors
    ///
    /// Returns `PromptDefenseViolation` in strict mode when anything is found.
    pub fn scan_inbound(&self, session_id: &str, text: &str, strict: bool) -> Result<ScanResult> {
        let own = self.registry.current(session_id);
        let pii = self.redact_pii_in_output.then_some(&self.pii);
        let result = self.scanner.scan(text, &own, &self.registry, pii);

        if result.is_clean() {
            return Ok(result);
        }

        let findings: Vec<String> = result.violations.iter().map(|v| v.kind.to_string()).collect();
        warn!(
            session = %crate::audit::hash_session(session_id),
            count = findings.len(),
            strict,
            "Prompt defense violation in model output"
        );
        if let Some(sink) = &self.audit {
            sink.record(AuditEvent::defense_violation(session_id, findings, strict));
        }

        if strict {
            return Err(Error::PromptDefenseViolation {
                count: result.violations.len(),
            });
        }
        Ok(result)
    }

    /// Drop expired delimiter sets.
    pub fn evict_expired(&self) -> usize {
        self.registry.evict_expired()
    }

    /// Number of sessions holding a delimiter set.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.registry.len()
    }
}

/// Periodically evict expired delimiter sets until `shutdown` fires.
pub fn spawn_delimiter_sweeper(
    defense: Arc<PromptDefense>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = defense.evict_expired();
                    if evicted > 0 {
                        debug!(count = evicted, "Evicted expired delimiter sets");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Delimiter sweeper shutting down");
                    break;
                }
            }
        }
    });
}
