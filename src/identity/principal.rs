//! The authenticated caller and the claim shapes it is projected from.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RoleSource;
use crate::{Error, Result};

/// The authenticated caller. Lives for exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// `sub` claim
    pub subject: String,
    /// `preferred_username` claim, when present
    pub username: Option<String>,
    /// Flattened role set
    pub roles: BTreeSet<String>,
    /// The audience the token was accepted for
    pub audience: String,
    /// Token `exp`
    pub token_expiry: DateTime<Utc>,
}

impl Principal {
    /// Build a principal directly from a subject and role names.
    ///
    /// Used by trusted in-process callers (and tests) that already hold an
    /// authenticated identity.
    #[must_use]
    pub fn with_roles(subject: &str, roles: &[&str]) -> Self {
        Self {
            subject: subject.to_string(),
            username: Some(subject.to_string()),
            roles: roles.iter().map(ToString::to_string).collect(),
            audience: String::new(),
            token_expiry: Utc::now() + Duration::minutes(5),
        }
    }

    /// Whether the principal holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Display name for logs: username if known, else subject.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.subject)
    }
}

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Default for Audience {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Audience {
    pub(crate) fn values(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// `{"roles": [...]}` as used by `realm_access` and each `resource_access` entry.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RoleList {
    roles: Vec<String>,
}

/// Provider-specific nested role claims.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RoleClaims {
    #[serde(default)]
    realm_access: Option<RoleList>,
    #[serde(default)]
    resource_access: Option<HashMap<String, RoleList>>,
}

impl RoleClaims {
    /// Flatten nested role claims into a single set.
    pub(crate) fn flatten(&self, source: RoleSource, client_id: &str) -> BTreeSet<String> {
        let mut roles = BTreeSet::new();
        if matches!(source, RoleSource::Realm | RoleSource::Both) {
            if let Some(realm) = &self.realm_access {
                roles.extend(realm.roles.iter().cloned());
            }
        }
        if matches!(source, RoleSource::Client | RoleSource::Both) {
            if let Some(client) = self
                .resource_access
                .as_ref()
                .and_then(|access| access.get(client_id))
            {
                roles.extend(client.roles.iter().cloned());
            }
        }
        roles.retain(|r| !r.trim().is_empty());
        roles
    }
}

/// Claims of a gateway access token.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AccessTokenClaims {
    pub(crate) sub: String,
    pub(crate) exp: i64,
    #[serde(default)]
    pub(crate) aud: Audience,
    #[serde(default)]
    pub(crate) preferred_username: Option<String>,
    #[serde(flatten)]
    pub(crate) roles: RoleClaims,
}

/// Claims inspected on an exchanged token before it is handed out.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IdentityClaims {
    #[serde(default)]
    pub(crate) preferred_username: Option<String>,
    #[serde(flatten)]
    pub(crate) roles: RoleClaims,
}

/// Pick the expected audience out of `aud`, ignoring generic provider audiences.
///
/// A token whose only audience is an ignored one (Keycloak's `account`) was not
/// issued for this service and is rejected.
pub(crate) fn check_audience(aud: &Audience, expected: &str, ignored: &[String]) -> Result<String> {
    let values = aud.values();
    let relevant: Vec<&str> = values
        .iter()
        .copied()
        .filter(|a| !ignored.iter().any(|i| i == a))
        .collect();

    if relevant.contains(&expected) {
        return Ok(expected.to_string());
    }

    if relevant.is_empty() && !values.is_empty() {
        Err(Error::AudienceMismatch(format!(
            "token only carries generic audience(s) {values:?}"
        )))
    } else {
        Err(Error::AudienceMismatch(format!(
            "expected '{expected}', got {values:?}"
        )))
    }
}

/// Decode the payload segment of a JWT without verifying it.
pub(crate) fn decode_unverified<T: serde::de::DeserializeOwned>(token: &str) -> Result<T> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::TokenMalformed("expected three JWT segments".into()));
    };

    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload)
        .map_err(|e| Error::TokenMalformed(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::TokenMalformed(format!("unexpected claim structure: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: serde_json::Value) -> RoleClaims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn flattens_client_and_realm_roles() {
        // GIVEN: Keycloak-style nested role claims
        let c = claims(json!({
            "realm_access": {"roles": ["employee"]},
            "resource_access": {
                "gateway": {"roles": ["finance-read", "finance-write"]},
                "other-client": {"roles": ["ignored"]}
            }
        }));

        // THEN: the union of realm and the configured client's roles
        let both = c.flatten(RoleSource::Both, "gateway");
        assert_eq!(
            both.into_iter().collect::<Vec<_>>(),
            vec!["employee", "finance-read", "finance-write"]
        );
        assert_eq!(c.flatten(RoleSource::Realm, "gateway").len(), 1);
        assert_eq!(c.flatten(RoleSource::Client, "gateway").len(), 2);
    }

    #[test]
    fn roles_that_are_not_a_list_fail_to_parse() {
        let result: std::result::Result<RoleClaims, _> =
            serde_json::from_value(json!({"realm_access": {"roles": "admin"}}));
        assert!(result.is_err());
    }

    #[test]
    fn audience_accepts_array_member() {
        let aud = Audience::Many(vec!["account".into(), "gateway".into()]);
        assert_eq!(
            check_audience(&aud, "gateway", &["account".into()]).unwrap(),
            "gateway"
        );
    }

    #[test]
    fn audience_rejects_account_only() {
        let aud = Audience::One("account".into());
        assert!(matches!(
            check_audience(&aud, "gateway", &["account".into()]),
            Err(Error::AudienceMismatch(_))
        ));
    }

    #[test]
    fn ignored_audience_is_never_accepted_even_if_expected() {
        // A misconfigured expected audience of "account" must still fail closed.
        let aud = Audience::One("account".into());
        assert!(check_audience(&aud, "account", &["account".into()]).is_err());
    }

    #[test]
    fn audience_rejects_empty() {
        assert!(check_audience(&Audience::default(), "gateway", &[]).is_err());
    }

    #[test]
    fn decode_unverified_rejects_wrong_segment_count() {
        let result: Result<IdentityClaims> = decode_unverified("a.b");
        assert!(matches!(result, Err(Error::TokenMalformed(_))));
        let result: Result<IdentityClaims> = decode_unverified("a.b.c.d");
        assert!(matches!(result, Err(Error::TokenMalformed(_))));
    }

    #[test]
    fn principal_display_name_prefers_username() {
        let mut p = Principal::with_roles("f3a1", &["hr-read"]);
        p.username = Some("alice.chen".into());
        assert_eq!(p.display_name(), "alice.chen");
        p.username = None;
        assert_eq!(p.display_name(), "f3a1");
        assert!(p.has_role("hr-read"));
    }
}
