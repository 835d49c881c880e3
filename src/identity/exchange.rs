//! Service-to-service impersonation via OAuth 2.0 token exchange (RFC 8693).
//!
//! Two steps against the provider's token endpoint:
//!
//! 1. `client_credentials` grant for a service token.
//! 2. `urn:ietf:params:oauth:grant-type:token-exchange` naming the subject.
//!
//! Step 2 always sends an explicit `scope`. Without it the provider issues a
//! token lacking `preferred_username` and role claims, so the exchanged token
//! is decoded and checked for both before it is returned.
//!
//! Only trusted automation and service callers use this client; it is not
//! reachable from the end-user request path.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::principal::{IdentityClaims, decode_unverified};
use crate::config::{IdentityConfig, RoleSource, TokenExchangeConfig};
use crate::failsafe::{RetryPolicy, with_retry};
use crate::{Error, Result};

const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS: &str = "urn:ietf:params:oauth:token-type:access_token";

/// A confidential client's credentials.
#[derive(Clone)]
pub struct ServiceCredential {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ServiceCredential {
    /// Build from the `token_exchange` config section.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the client id or secret is missing.
    pub fn from_config(config: &TokenExchangeConfig) -> Result<Self> {
        if config.client_id.is_empty() {
            return Err(Error::Config("token_exchange.client_id must be set".into()));
        }
        let client_secret = config
            .resolve_client_secret()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("token_exchange.client_secret must be set".into()))?;
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token exchange client.
pub struct TokenExchangeClient {
    http: reqwest::Client,
    token_endpoint: String,
    scope: String,
    audience: Option<String>,
    client_id: String,
    role_source: RoleSource,
    retry: RetryPolicy,
}

impl TokenExchangeClient {
    /// Create a client from identity and exchange configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `scope` is empty or the token endpoint
    /// violates `require_https`.
    pub fn new(identity: &IdentityConfig, exchange: &TokenExchangeConfig) -> Result<Self> {
        if exchange.scope.trim().is_empty() {
            return Err(Error::Config(
                "token_exchange.scope must name the scopes carrying username and role claims"
                    .into(),
            ));
        }

        let token_endpoint = identity.resolved_token_endpoint();
        if identity.require_https && !token_endpoint.starts_with("https://") {
            return Err(Error::Config(format!(
                "token endpoint must be HTTPS: {token_endpoint}"
            )));
        }

        let http = reqwest::Client::builder()
            .https_only(identity.require_https)
            .timeout(identity.http_timeout)
            .build()?;

        Ok(Self {
            http,
            token_endpoint,
            scope: exchange.scope.clone(),
            audience: exchange.audience.clone(),
            client_id: identity.client_id.clone(),
            role_source: identity.role_source,
            retry: RetryPolicy::new(&identity.retry),
        })
    }

    /// Obtain an access token that names `requested_subject`.
    ///
    /// # Errors
    ///
    /// `ExchangeDenied` when the credential may not impersonate,
    /// `SubjectNotFound` when the subject does not exist,
    /// `ExchangeIncomplete` when the issued token lacks identity claims and
    /// `IdentityProviderUnavailable` on transport failures.
    pub async fn exchange_for_subject(
        &self,
        credential: &ServiceCredential,
        requested_subject: &str,
    ) -> Result<String> {
        if requested_subject.trim().is_empty() {
            return Err(Error::InvalidRequest("requested subject is empty".into()));
        }

        let service_token = self.client_credentials(credential).await?;
        let token = self
            .token_exchange(credential, &service_token, requested_subject)
            .await?;

        self.ensure_identity_claims(&token, requested_subject)?;
        info!(
            client_id = %credential.client_id,
            subject = requested_subject,
            "Token exchange completed"
        );
        Ok(token)
    }

    async fn client_credentials(&self, credential: &ServiceCredential) -> Result<String> {
        let mut params = HashMap::new();
        params.insert("grant_type", GRANT_CLIENT_CREDENTIALS);
        params.insert("client_id", credential.client_id.as_str());
        params.insert("client_secret", credential.client_secret.as_str());

        debug!(client_id = %credential.client_id, "Requesting service token");
        self.post_token_request("client_credentials", &params, None)
            .await
    }

    async fn token_exchange(
        &self,
        credential: &ServiceCredential,
        service_token: &str,
        requested_subject: &str,
    ) -> Result<String> {
        let mut params = HashMap::new();
        params.insert("grant_type", GRANT_TOKEN_EXCHANGE);
        params.insert("client_id", credential.client_id.as_str());
        params.insert("client_secret", credential.client_secret.as_str());
        params.insert("subject_token", service_token);
        params.insert("subject_token_type", TOKEN_TYPE_ACCESS);
        params.insert("requested_token_type", TOKEN_TYPE_ACCESS);
        params.insert("requested_subject", requested_subject);
        params.insert("scope", self.scope.as_str());
        if let Some(audience) = &self.audience {
            params.insert("audience", audience.as_str());
        }

        debug!(subject = requested_subject, "Requesting impersonation token");
        self.post_token_request("token_exchange", &params, Some(requested_subject))
            .await
    }

    async fn post_token_request(
        &self,
        step: &'static str,
        params: &HashMap<&str, &str>,
        subject: Option<&str>,
    ) -> Result<String> {
        with_retry(&self.retry, step, || async {
            let response = self
                .http
                .post(&self.token_endpoint)
                .form(params)
                .send()
                .await
                .map_err(|e| {
                    Error::IdentityProviderUnavailable(format!("{step} request failed: {e}"))
                })?;

            let status = response.status();
            if status.is_success() {
                let body: TokenResponse = response.json().await.map_err(|e| {
                    Error::IdentityProviderUnavailable(format!("{step} response invalid: {e}"))
                })?;
                return Ok(body.access_token);
            }

            if status.is_server_error() {
                return Err(Error::IdentityProviderUnavailable(format!(
                    "{step} failed: HTTP {status}"
                )));
            }

            let body = response.text().await.unwrap_or_default();
            let detail: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            Err(classify_rejection(step, status, &detail, subject))
        })
        .await
    }

    /// Reject tokens that would leave callers without a username or roles.
    fn ensure_identity_claims(&self, token: &str, requested_subject: &str) -> Result<()> {
        let claims: IdentityClaims = decode_unverified(token)
            .map_err(|e| Error::ExchangeIncomplete(format!("exchanged token unreadable: {e}")))?;

        let username = claims.preferred_username.as_deref().unwrap_or_default();
        if username.trim().is_empty() {
            warn!(
                subject = requested_subject,
                scope = %self.scope,
                "Exchanged token has no preferred_username; check the requested scope"
            );
            return Err(Error::ExchangeIncomplete(
                "preferred_username claim is missing".into(),
            ));
        }

        if claims
            .roles
            .flatten(self.role_source, &self.client_id)
            .is_empty()
        {
            warn!(
                subject = requested_subject,
                scope = %self.scope,
                "Exchanged token has no role claims; check the requested scope"
            );
            return Err(Error::ExchangeIncomplete("role claims are missing".into()));
        }

        Ok(())
    }
}

/// Map a 4xx token endpoint response onto the exchange error taxonomy.
fn classify_rejection(
    step: &str,
    status: reqwest::StatusCode,
    detail: &TokenErrorResponse,
    subject: Option<&str>,
) -> Error {
    let description = detail
        .error_description
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mentions_subject = description.contains("user") || description.contains("subject");
    let says_missing = description.contains("not found")
        || description.contains("invalid")
        || description.contains("does not exist");

    if let Some(subject) = subject {
        if status == reqwest::StatusCode::NOT_FOUND || (mentions_subject && says_missing) {
            return Error::SubjectNotFound(subject.to_string());
        }
    }

    let error = if detail.error.is_empty() {
        "unknown_error"
    } else {
        detail.error.as_str()
    };
    Error::ExchangeDenied(format!("{step} rejected: HTTP {status} ({error})"))
}
