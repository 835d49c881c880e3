//! Access token validation.
//!
//! The validator never trusts the token to describe how it should be checked:
//! the algorithm must be on the configured allow-list, the key is looked up by
//! `kid` from a trusted [`KeySource`], and role claims are projected into a
//! fixed [`Principal`] shape. Any structural surprise rejects the token.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Validation, decode, decode_header};
use tracing::debug;

use super::keys::{JwksKeySource, KeySource};
use super::principal::{AccessTokenClaims, Principal, check_audience};
use crate::config::{IdentityConfig, RoleSource};
use crate::{Error, Result};

/// Verifies bearer tokens and produces request-scoped principals.
pub struct TokenValidator {
    keys: Arc<dyn KeySource>,
    issuer: Option<String>,
    audience: String,
    client_id: String,
    role_source: RoleSource,
    ignored_audiences: Vec<String>,
    allowed_algorithms: Vec<jsonwebtoken::Algorithm>,
    leeway_secs: u64,
}

impl TokenValidator {
    /// Create a validator backed by the provider's JWKS endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the identity section is incomplete or the
    /// JWKS URI violates `require_https`.
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let keys = JwksKeySource::from_config(config)?;
        Self::with_key_source(config, Arc::new(keys))
    }

    /// Create a validator with an explicit key source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no audience or no algorithm is configured.
    pub fn with_key_source(config: &IdentityConfig, keys: Arc<dyn KeySource>) -> Result<Self> {
        if config.audience.is_empty() {
            return Err(Error::Config("identity.audience must be set".into()));
        }
        if config.allowed_algorithms.is_empty() {
            return Err(Error::Config(
                "identity.allowed_algorithms must not be empty".into(),
            ));
        }
        if config.ignored_audiences.contains(&config.audience) {
            return Err(Error::Config(format!(
                "identity.audience '{}' is listed in ignored_audiences",
                config.audience
            )));
        }

        Ok(Self {
            keys,
            issuer: (!config.issuer.is_empty()).then(|| config.issuer.clone()),
            audience: config.audience.clone(),
            client_id: config.client_id.clone(),
            role_source: config.role_source,
            ignored_audiences: config.ignored_audiences.clone(),
            allowed_algorithms: config.allowed_algorithms.clone(),
            leeway_secs: config.leeway.as_secs(),
        })
    }

    /// Validate a raw bearer token.
    ///
    /// # Errors
    ///
    /// `TokenExpired`, `TokenMalformed`, `SignatureInvalid` or
    /// `AudienceMismatch` for bad tokens; `IdentityProviderUnavailable` when
    /// signing keys cannot be fetched.
    pub async fn validate(&self, raw: &str) -> Result<Principal> {
        let header = decode_header(raw)?;

        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(Error::SignatureInvalid(format!(
                "algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| Error::TokenMalformed("token header has no kid".into()))?;
        let key = self.keys.key(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        // Audience is checked below so generic provider audiences can be ignored.
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<AccessTokenClaims>(raw, &key, &validation)?;
        let claims = data.claims;

        let audience = check_audience(&claims.aud, &self.audience, &self.ignored_audiences)?;

        if claims.sub.trim().is_empty() {
            return Err(Error::TokenMalformed("empty sub claim".into()));
        }

        let roles = claims.roles.flatten(self.role_source, &self.client_id);
        if roles.is_empty() {
            return Err(Error::TokenMalformed("token carries no role claims".into()));
        }

        let token_expiry = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| Error::TokenMalformed("exp out of range".into()))?;

        debug!(subject = %claims.sub, roles = roles.len(), "Token validated");

        Ok(Principal {
            subject: claims.sub,
            username: claims.preferred_username.filter(|u| !u.is_empty()),
            roles,
            audience,
            token_expiry,
        })
    }
}
