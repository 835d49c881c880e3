//! Pattern-based PII detection and redaction.
//!
//! Rules run in a fixed order so the more specific shapes win: a government id
//! is never half-consumed by the phone rule, and a card number is redacted
//! before the phone rule could see its digit groups. Every match is replaced by
//! a typed placeholder such as `[REDACTED:EMAIL]`.
//!
//! Card candidates must pass the Luhn check, so timestamps and order numbers
//! of card length are left alone.

use std::fmt;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::{Error, Result};

/// Category of personal data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiKind {
    /// National id / social security number
    GovernmentId,
    /// Payment card number
    PaymentCard,
    /// IBAN or labelled bank account number
    BankAccount,
    /// Email address
    Email,
    /// Phone number
    Phone,
}

impl PiiKind {
    /// Placeholder label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::GovernmentId => "GOV_ID",
            Self::PaymentCard => "CARD",
            Self::BankAccount => "BANK_ACCOUNT",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
        }
    }

    /// Replacement text for a match.
    #[must_use]
    pub fn placeholder(self) -> String {
        format!("[REDACTED:{}]", self.label())
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Extra check a match must pass before it is redacted.
type Validator = fn(&str) -> bool;

/// A compiled rule. `group` selects the part of the match that is replaced;
/// group 0 is the whole match.
struct PiiRule {
    kind: PiiKind,
    regex: Regex,
    group: usize,
    validate: Option<Validator>,
}

const RULES: &[(PiiKind, &str, usize, Option<Validator>)] = &[
    (PiiKind::GovernmentId, r"\b\d{3}-\d{2}-\d{4}\b", 0, None),
    (
        PiiKind::PaymentCard,
        r"\b(?:\d[ -]?){12,18}\d\b",
        0,
        Some(passes_luhn),
    ),
    (PiiKind::BankAccount, r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b", 0, None),
    (
        PiiKind::BankAccount,
        r"(?i)\b(?:bank\s+)?(?:account|acct|a/c)(?:\s+(?:no|number|num))?\.?\s*[:#]?\s*(\d{6,17})\b",
        1,
        None,
    ),
    (
        PiiKind::Email,
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        0,
        None,
    ),
    (
        PiiKind::Phone,
        r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{2,4}\)\s?|\b\d{2,4}[\s.-])\d{3,4}[\s.-]\d{4}\b",
        0,
        None,
    ),
];

/// Luhn checksum over the digits of `candidate`.
fn passes_luhn(candidate: &str) -> bool {
    let mut sum = 0;
    let mut count = 0;
    for (i, digit) in candidate
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
    {
        let value = if i % 2 == 1 {
            let doubled = digit * 2;
            if doubled > 9 { doubled - 9 } else { doubled }
        } else {
            digit
        };
        sum += value;
        count += 1;
    }
    count >= 13 && sum % 10 == 0
}

/// Detects and redacts PII.
pub struct PiiRedactor {
    rules: Vec<PiiRule>,
}

impl PiiRedactor {
    /// Compile the built-in rule set.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if a rule fails to compile.
    pub fn new() -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|&(kind, pattern, group, validate)| {
                Regex::new(pattern)
                    .map(|regex| PiiRule {
                        kind,
                        regex,
                        group,
                        validate,
                    })
                    .map_err(|e| Error::Internal(format!("PII rule {kind} failed to compile: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Replace every match with its placeholder.
    ///
    /// Returns the redacted text and one entry per replaced match.
    #[must_use]
    pub fn redact(&self, text: &str) -> (String, Vec<PiiKind>) {
        let mut out = text.to_string();
        let mut found = Vec::new();

        for rule in &self.rules {
            if !rule.regex.is_match(&out) {
                continue;
            }
            let placeholder = rule.kind.placeholder();
            let replaced = rule.regex.replace_all(&out, |caps: &Captures<'_>| {
                let candidate = caps.get(rule.group).map_or("", |m| m.as_str());
                if rule.validate.is_some_and(|valid| !valid(candidate)) {
                    return caps.get(0).map_or_else(String::new, |m| m.as_str().to_string());
                }
                found.push(rule.kind);
                replace_group(caps, rule.group, &placeholder)
            });
            out = replaced.into_owned();
        }

        (out, found)
    }

    /// Kinds present in `text`, one entry per match.
    #[must_use]
    pub fn detect(&self, text: &str) -> Vec<PiiKind> {
        self.redact(text).1
    }
}

fn replace_group(caps: &Captures<'_>, group: usize, placeholder: &str) -> String {
    let (Some(whole), Some(target)) = (caps.get(0), caps.get(group)) else {
        return placeholder.to_string();
    };
    let text = whole.as_str();
    let start = target.start() - whole.start();
    let end = target.end() - whole.start();
    format!("{}{placeholder}{}", &text[..start], &text[end..])
}
