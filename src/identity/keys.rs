//! Signing-key resolution for token validation.
//!
//! # JWKS caching
//!
//! [`JwksKeySource`] caches the provider's key set for `jwks_cache_ttl`.
//! A `kid` missing from a fresh cache triggers at most one forced refresh per
//! `jwks_min_refresh_interval`; tokens carrying random `kid`s cannot make the
//! gateway hammer the identity provider. Refreshes are single-flight: callers
//! that queue behind a refresh reuse its outcome instead of fetching again.
//! Fetches are bounded by the HTTP timeout and the retry policy. When no key
//! can be obtained the caller fails closed: an unverifiable signature is never
//! accepted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::IdentityConfig;
use crate::failsafe::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// Resolves a JWT `kid` to a verification key.
#[async_trait::async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Return the decoding key for `kid`.
    ///
    /// Fails with `SignatureInvalid` for unknown keys and
    /// `IdentityProviderUnavailable` when keys cannot be fetched.
    async fn key(&self, kid: &str) -> Result<DecodingKey>;
}

/// A fixed set of keys, for deployments with pinned keys and for tests.
#[derive(Clone, Default)]
pub struct StaticKeySource {
    keys: HashMap<String, DecodingKey>,
}

impl StaticKeySource {
    /// Create an empty key source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key under `kid`.
    #[must_use]
    pub fn with_key(mut self, kid: impl Into<String>, key: DecodingKey) -> Self {
        self.keys.insert(kid.into(), key);
        self
    }
}

#[async_trait::async_trait]
impl KeySource for StaticKeySource {
    async fn key(&self, kid: &str) -> Result<DecodingKey> {
        self.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| Error::SignatureInvalid(format!("unknown key id '{kid}'")))
    }
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Keys fetched from the identity provider's JWKS endpoint.
pub struct JwksKeySource {
    http: reqwest::Client,
    jwks_uri: String,
    ttl: Duration,
    min_refresh_interval: Duration,
    retry: RetryPolicy,
    cache: RwLock<Option<CachedJwks>>,
    last_forced_refresh: Mutex<Option<Instant>>,
    /// Held for the duration of a fetch; guards the last fetch error
    refresh_lock: tokio::sync::Mutex<Option<String>>,
    /// Completed refresh attempts
    refresh_generation: AtomicU64,
}

impl JwksKeySource {
    /// Create from identity configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the JWKS URI is not HTTPS while
    /// `require_https` is set, or `Error::Http` if the client cannot be built.
    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        let jwks_uri = config.resolved_jwks_uri();
        if config.require_https && !jwks_uri.starts_with("https://") {
            return Err(Error::Config(format!("JWKS URI must be HTTPS: {jwks_uri}")));
        }

        let http = reqwest::Client::builder()
            .https_only(config.require_https)
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            http,
            jwks_uri,
            ttl: config.jwks_cache_ttl,
            min_refresh_interval: config.jwks_min_refresh_interval,
            retry: RetryPolicy::new(&config.retry),
            cache: RwLock::new(None),
            last_forced_refresh: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(None),
            refresh_generation: AtomicU64::new(0),
        })
    }

    /// Look up `kid` in a fresh cache.
    ///
    /// Returns `(key, cache_is_fresh)`.
    fn cached(&self, kid: &str) -> (Option<DecodingKey>, bool) {
        let guard = self.cache.read();
        match guard.as_ref() {
            Some(c) if c.fetched_at.elapsed() < self.ttl => (find_key(&c.keys, kid), true),
            _ => (None, false),
        }
    }

    /// Claim the forced-refresh slot if the throttle interval has passed.
    fn try_claim_forced_refresh(&self) -> bool {
        let mut last = self.last_forced_refresh.lock();
        match *last {
            Some(at) if at.elapsed() < self.min_refresh_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    async fn fetch(&self) -> Result<JwkSet> {
        with_retry(&self.retry, "jwks_fetch", || async {
            debug!(uri = %self.jwks_uri, "Fetching JWKS");
            let response = self
                .http
                .get(&self.jwks_uri)
                .send()
                .await
                .map_err(|e| Error::IdentityProviderUnavailable(format!("JWKS request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(Error::IdentityProviderUnavailable(format!(
                    "JWKS endpoint returned {}",
                    response.status()
                )));
            }

            response
                .json::<JwkSet>()
                .await
                .map_err(|e| Error::IdentityProviderUnavailable(format!("JWKS body invalid: {e}")))
        })
        .await
    }

    /// Refresh the cache and look up `kid`.
    ///
    /// Only one fetch runs at a time. A caller that waited while another
    /// fetch completed uses that result instead of starting its own.
    async fn refresh_and_find(&self, kid: &str, observed: u64) -> Result<DecodingKey> {
        let mut last_error = self.refresh_lock.lock().await;

        if self.refresh_generation.load(Ordering::Acquire) != observed {
            if let (Some(key), _) = self.cached(kid) {
                return Ok(key);
            }
            return Err(match last_error.as_ref() {
                Some(reason) => Error::IdentityProviderUnavailable(reason.clone()),
                None => Error::SignatureInvalid(format!("unknown key id '{kid}'")),
            });
        }

        debug!(kid, "Key not in cached JWKS, refreshing");
        let keys = match self.fetch().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "JWKS refresh failed");
                *last_error = Some(match &e {
                    Error::IdentityProviderUnavailable(reason) => reason.clone(),
                    other => other.to_string(),
                });
                self.refresh_generation.fetch_add(1, Ordering::Release);
                return Err(e);
            }
        };

        let found = find_key(&keys, kid);
        *self.cache.write() = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        *last_error = None;
        // Published only after the cache holds the new keys.
        self.refresh_generation.fetch_add(1, Ordering::Release);
        found.ok_or_else(|| Error::SignatureInvalid(format!("unknown key id '{kid}'")))
    }
}

#[async_trait::async_trait]
impl KeySource for JwksKeySource {
    async fn key(&self, kid: &str) -> Result<DecodingKey> {
        // Read before the cache so a refresh landing in between is noticed.
        let observed = self.refresh_generation.load(Ordering::Acquire);
        let (found, fresh) = self.cached(kid);
        if let Some(key) = found {
            return Ok(key);
        }

        if fresh && !self.try_claim_forced_refresh() {
            warn!(kid, "Unknown key id; JWKS refresh throttled");
            return Err(Error::SignatureInvalid(format!("unknown key id '{kid}'")));
        }

        self.refresh_and_find(kid, observed).await
    }
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`.
fn find_key(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks.find(kid)?;
    match DecodingKey::from_jwk(jwk) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(kid, error = %e, "JWK could not be converted to a decoding key");
            None
        }
    }
}
