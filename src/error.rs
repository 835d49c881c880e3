//! Error types for the gateway
//!
//! Every failure the core can produce is a variant of [`Error`]. Callers never
//! see the `Display` text of an error directly: the router maps each variant to
//! a stable public code ([`Error::code`]), an HTTP status ([`Error::status`])
//! and a generic message ([`Error::public_message`]).

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// The token's `exp` is in the past (beyond the clock-skew allowance).
    #[error("Token expired")]
    TokenExpired,

    /// The token is not a structurally valid JWT or its claims have an unexpected shape.
    #[error("Token malformed: {0}")]
    TokenMalformed(String),

    /// The signature could not be verified against any trusted key.
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// The token was not issued for this service.
    #[error("Audience mismatch: {0}")]
    AudienceMismatch(String),

    /// The caller lacks a role for the requested domain/access level.
    #[error("Insufficient permissions for {access} access to domain '{domain}'")]
    InsufficientPermissions {
        /// Domain name
        domain: String,
        /// Requested access level
        access: String,
    },

    /// No live pending confirmation exists for the id.
    #[error("Confirmation not found: {0}")]
    ConfirmationNotFound(String),

    /// The confirmation existed but its TTL elapsed before it was confirmed.
    #[error("Confirmation expired: {0}")]
    ConfirmationExpired(String),

    /// The confirming principal is not the one who proposed the action.
    #[error("Confirmation {0} belongs to a different principal")]
    ConfirmationPrincipalMismatch(String),

    /// A freshly generated confirmation id already exists in the store.
    #[error("Confirmation id collision: {0}")]
    ConfirmationIdCollision(String),

    /// The confirmation store backend could not complete an operation.
    #[error("Confirmation store unavailable: {0}")]
    ConfirmationStoreUnavailable(String),

    /// The domain executor failed after the confirmation was consumed.
    #[error("Execution of confirmation {confirmation_id} failed: {reason}")]
    ExecutionFailed {
        /// The consumed confirmation id
        confirmation_id: String,
        /// Executor error text (internal only)
        reason: String,
    },

    /// Prompt defense found violations in strict mode.
    #[error("Prompt defense violation ({count} finding(s))")]
    PromptDefenseViolation {
        /// Number of violations found
        count: usize,
    },

    /// The identity provider could not be reached within the retry budget.
    #[error("Identity provider unavailable: {0}")]
    IdentityProviderUnavailable(String),

    /// The service credential may not impersonate the requested subject.
    #[error("Token exchange denied: {0}")]
    ExchangeDenied(String),

    /// The requested subject does not exist at the identity provider.
    #[error("Subject not found: {0}")]
    SubjectNotFound(String),

    /// The exchanged token lacks the identity claims callers rely on.
    #[error("Exchanged token is missing identity claims: {0}")]
    ExchangeIncomplete(String),

    /// The domain is not configured.
    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    /// The tool is not configured for its domain.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Request body or parameters are invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable public error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenMalformed(_) => "TOKEN_MALFORMED",
            Self::SignatureInvalid(_) => "SIGNATURE_INVALID",
            Self::AudienceMismatch(_) => "AUDIENCE_MISMATCH",
            Self::InsufficientPermissions { .. } => "INSUFFICIENT_PERMISSIONS",
            Self::ConfirmationNotFound(_) => "CONFIRMATION_NOT_FOUND",
            Self::ConfirmationExpired(_) => "CONFIRMATION_EXPIRED",
            Self::ConfirmationPrincipalMismatch(_) => "CONFIRMATION_PRINCIPAL_MISMATCH",
            Self::ConfirmationStoreUnavailable(_) | Self::ConfirmationIdCollision(_) => {
                "CONFIRMATION_STORE_UNAVAILABLE"
            }
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
            Self::PromptDefenseViolation { .. } => "PROMPT_DEFENSE_VIOLATION",
            Self::IdentityProviderUnavailable(_) => "IDENTITY_PROVIDER_UNAVAILABLE",
            Self::ExchangeDenied(_) => "EXCHANGE_DENIED",
            Self::SubjectNotFound(_) => "SUBJECT_NOT_FOUND",
            Self::ExchangeIncomplete(_) => "EXCHANGE_INCOMPLETE",
            Self::UnknownDomain(_) | Self::UnknownTool(_) => "NOT_FOUND",
            Self::InvalidRequest(_) | Self::Json(_) => "INVALID_REQUEST",
            Self::Config(_) | Self::Io(_) | Self::Http(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TokenExpired
            | Self::TokenMalformed(_)
            | Self::SignatureInvalid(_)
            | Self::AudienceMismatch(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermissions { .. }
            | Self::ConfirmationPrincipalMismatch(_)
            | Self::ExchangeDenied(_) => StatusCode::FORBIDDEN,
            Self::ConfirmationNotFound(_)
            | Self::SubjectNotFound(_)
            | Self::UnknownDomain(_)
            | Self::UnknownTool(_) => StatusCode::NOT_FOUND,
            Self::ConfirmationExpired(_) => StatusCode::GONE,
            Self::PromptDefenseViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidRequest(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::ExecutionFailed { .. } | Self::ExchangeIncomplete(_) => StatusCode::BAD_GATEWAY,
            Self::ConfirmationStoreUnavailable(_)
            | Self::ConfirmationIdCollision(_)
            | Self::IdentityProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Io(_) | Self::Http(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Human-readable message safe to return to callers.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::TokenExpired => "The access token has expired. Please sign in again.",
            Self::TokenMalformed(_) => "The access token is malformed.",
            Self::SignatureInvalid(_) => "The access token signature could not be verified.",
            Self::AudienceMismatch(_) => "The access token was not issued for this service.",
            Self::InsufficientPermissions { .. } => {
                "You do not have permission to perform this operation."
            }
            Self::ConfirmationNotFound(_) => {
                "No pending confirmation was found. It may have already been processed."
            }
            Self::ConfirmationExpired(_) => {
                "The confirmation has expired. The action was not performed."
            }
            Self::ConfirmationPrincipalMismatch(_) => {
                "This confirmation was requested by a different user."
            }
            Self::ConfirmationStoreUnavailable(_) | Self::ConfirmationIdCollision(_) => {
                "Confirmations are temporarily unavailable. Please retry."
            }
            Self::ExecutionFailed { .. } => {
                "The action was attempted but failed. It may have been partially applied."
            }
            Self::PromptDefenseViolation { .. } => "The response was withheld by content policy.",
            Self::IdentityProviderUnavailable(_) => {
                "The identity provider is unavailable. Please retry."
            }
            Self::ExchangeDenied(_) => "Token exchange was denied.",
            Self::SubjectNotFound(_) => "The requested subject does not exist.",
            Self::ExchangeIncomplete(_) => "The exchanged token is missing identity claims.",
            Self::UnknownDomain(_) | Self::UnknownTool(_) => "The requested resource does not exist.",
            Self::InvalidRequest(_) | Self::Json(_) => "The request is invalid.",
            Self::Config(_) | Self::Io(_) | Self::Http(_) | Self::Internal(_) => {
                "An internal error occurred."
            }
        }
    }

    /// Whether the operation that produced this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConfirmationStoreUnavailable(_) | Self::IdentityProviderUnavailable(_)
        )
    }

    /// Whether this error belongs to the authentication group.
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::TokenExpired
                | Self::TokenMalformed(_)
                | Self::SignatureInvalid(_)
                | Self::AudienceMismatch(_)
        )
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            ErrorKind::InvalidSignature => Self::SignatureInvalid(err.to_string()),
            ErrorKind::InvalidAudience => Self::AudienceMismatch(err.to_string()),
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                Self::SignatureInvalid(err.to_string())
            }
            _ => Self::TokenMalformed(err.to_string()),
        }
    }
}
