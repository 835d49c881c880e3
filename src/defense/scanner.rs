//! Inbound (model output) scanning.

use std::fmt;

use regex::{Captures, Regex, RegexBuilder};
use serde::Serialize;

use super::delimiter::{DelimiterRegistry, SessionDelimiterSet};
use super::pii::{PiiKind, PiiRedactor};
use crate::{Error, Result};

const SYSTEM_PROMPT_PLACEHOLDER: &str = "[REDACTED:SYSTEM_PROMPT]";
const DELIMITER_PLACEHOLDER: &str = "[REDACTED:DELIMITER]";

/// What a violation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "pii")]
pub enum ViolationKind {
    /// Internal system-prompt phrasing appeared in output
    SystemPromptLeak,
    /// The caller's own delimiter tag appeared in output
    OwnDelimiter,
    /// Another session's delimiter tag appeared in output
    ForeignDelimiter,
    /// Something shaped like a delimiter tag appeared in output
    ForgedDelimiter,
    /// PII appeared in output
    Pii(PiiKind),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemPromptLeak => f.write_str("system_prompt_leak"),
            Self::OwnDelimiter => f.write_str("own_delimiter"),
            Self::ForeignDelimiter => f.write_str("foreign_delimiter"),
            Self::ForgedDelimiter => f.write_str("forged_delimiter"),
            Self::Pii(kind) => write!(f, "pii:{}", kind.label()),
        }
    }
}

/// One finding. Never carries the offending text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Finding category
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl From<ViolationKind> for Violation {
    fn from(kind: ViolationKind) -> Self {
        Self { kind }
    }
}

/// Redacted text plus findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Text with every finding replaced
    pub text: String,
    /// One entry per replaced occurrence
    pub violations: Vec<Violation>,
}

impl ScanResult {
    /// Whether nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Scans model output for leakage and injection artefacts.
pub struct OutputScanner {
    signatures: Vec<Regex>,
}

impl OutputScanner {
    /// Compile phrase signatures.
    ///
    /// Matching ignores case and treats any whitespace run as equivalent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a signature cannot be compiled.
    pub fn new(signatures: &[String]) -> Result<Self> {
        let signatures = signatures
            .iter()
            .map(|s| s.split_whitespace().collect::<Vec<_>>())
            .filter(|words| !words.is_empty())
            .map(|words| {
                let pattern = words
                    .iter()
                    .map(|w| regex::escape(w))
                    .collect::<Vec<_>>()
                    .join(r"\s+");
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("invalid system prompt signature: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { signatures })
    }

    /// Scan `text`.
    ///
    /// Every delimiter-shaped sequence is classified by its nonce against
    /// `own` and the `registry`, in a single pass over the text. PII is
    /// checked only when `pii` is given.
    #[must_use]
    pub fn scan(
        &self,
        text: &str,
        own: &SessionDelimiterSet,
        registry: &DelimiterRegistry,
        pii: Option<&PiiRedactor>,
    ) -> ScanResult {
        let mut violations = Vec::new();
        let mut out = registry
            .shape()
            .replace_all(text, |caps: &Captures<'_>| {
                violations.push(Violation::from(classify_tag(caps, own, registry)));
                DELIMITER_PLACEHOLDER
            })
            .into_owned();

        for signature in &self.signatures {
            replace_pattern(
                &mut out,
                signature,
                SYSTEM_PROMPT_PLACEHOLDER,
                ViolationKind::SystemPromptLeak,
                &mut violations,
            );
        }

        if let Some(pii) = pii {
            let (redacted, kinds) = pii.redact(&out);
            out = redacted;
            violations.extend(kinds.into_iter().map(|k| Violation::from(ViolationKind::Pii(k))));
        }

        ScanResult {
            text: out,
            violations,
        }
    }
}

fn classify_tag(
    caps: &Captures<'_>,
    own: &SessionDelimiterSet,
    registry: &DelimiterRegistry,
) -> ViolationKind {
    let Some(nonce) = caps.get(1).map(|m| m.as_str().to_ascii_lowercase()) else {
        return ViolationKind::ForgedDelimiter;
    };
    if nonce == own.nonce {
        ViolationKind::OwnDelimiter
    } else if registry.session_for_nonce(&nonce).is_some() {
        ViolationKind::ForeignDelimiter
    } else {
        ViolationKind::ForgedDelimiter
    }
}

fn replace_pattern(
    out: &mut String,
    regex: &Regex,
    placeholder: &str,
    kind: ViolationKind,
    found: &mut Vec<Violation>,
) {
    let count = regex.find_iter(out).count();
    if count > 0 {
        *out = regex.replace_all(out, placeholder).into_owned();
        found.extend(std::iter::repeat_n(Violation::from(kind), count));
    }
}
