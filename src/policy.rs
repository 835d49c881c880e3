//! Role policy engine: maps a principal's roles to per-domain access.
//!
//! # Design
//!
//! The [`DomainRoleMatrix`] is built once from configuration and never
//! mutated, so it is shared across requests without locking. Evaluation is a
//! pure function of `(principal, domain, access level)`.
//!
//! ## Tiers
//!
//! | Level | Granted when |
//! |-------|--------------|
//! | `read` | principal holds a read **or** write role of the domain, or the domain is public |
//! | `write` | principal holds a write role of the domain |
//!
//! Write roles are folded into the read set when the matrix is built, so a
//! write grant always implies a read grant for the same domain.
//!
//! ## Superuser bypass
//!
//! A principal holding one of `superuser_roles` skips per-domain checks,
//! except in production mode when the subject is a known automation identity.
//! Such an identity is then evaluated on its ordinary roles alone. The refusal
//! is logged so a misprovisioned test account is visible.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RolesConfig;
use crate::identity::Principal;
use crate::{Error, Result};

/// Requested access tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Read-only operations
    Read,
    /// Mutating operations
    Write,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Role sets for a single domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRoles {
    /// Effective read roles (includes every write role)
    pub read_roles: BTreeSet<String>,
    /// Write roles
    pub write_roles: BTreeSet<String>,
    /// Readable without any role
    pub public: bool,
}

/// Static domain → role-set mapping.
#[derive(Debug, Clone, Default)]
pub struct DomainRoleMatrix {
    domains: BTreeMap<String, DomainRoles>,
}

impl DomainRoleMatrix {
    /// Build the matrix from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a non-public domain has an empty role set.
    pub fn from_config(config: &RolesConfig) -> Result<Self> {
        let mut domains = BTreeMap::new();
        for (name, roles) in &config.domains {
            if !roles.public && (roles.read_roles.is_empty() || roles.write_roles.is_empty()) {
                return Err(Error::Config(format!(
                    "domain '{name}' is not public but has an empty role set"
                )));
            }
            let write_roles: BTreeSet<String> = roles.write_roles.iter().cloned().collect();
            let mut read_roles: BTreeSet<String> = roles.read_roles.iter().cloned().collect();
            read_roles.extend(write_roles.iter().cloned());
            domains.insert(
                name.clone(),
                DomainRoles {
                    read_roles,
                    write_roles,
                    public: roles.public,
                },
            );
        }
        Ok(Self { domains })
    }

    /// Role sets for `domain`, if configured.
    #[must_use]
    pub fn get(&self, domain: &str) -> Option<&DomainRoles> {
        self.domains.get(domain)
    }

    /// Whether `domain` appears in the matrix.
    #[must_use]
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    /// Iterate configured domain names.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }
}

/// Why an authorization decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A role in the domain's set matched
    RoleGranted,
    /// The domain is public and read access was requested
    PublicRead,
    /// Superuser bypass
    Superuser,
    /// No matching role
    Denied,
    /// Domain not in the matrix
    UnknownDomain,
    /// No matching role, and the superuser role was not honoured because
    /// the holder is an automation identity in production
    SuperuserRefused,
}

impl Decision {
    /// Whether access is granted.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::RoleGranted | Self::PublicRead | Self::Superuser)
    }
}

/// The role policy engine.
#[derive(Debug, Clone)]
pub struct RolePolicyEngine {
    matrix: DomainRoleMatrix,
    superuser_roles: HashSet<String>,
    automation_subjects: HashSet<String>,
    production: bool,
}

impl RolePolicyEngine {
    /// Build the engine from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the role matrix is invalid.
    pub fn from_config(config: &RolesConfig) -> Result<Self> {
        Ok(Self {
            matrix: DomainRoleMatrix::from_config(config)?,
            superuser_roles: config.superuser_roles.iter().cloned().collect(),
            automation_subjects: config.automation_subjects.iter().cloned().collect(),
            production: config.production,
        })
    }

    /// The underlying matrix.
    #[must_use]
    pub fn matrix(&self) -> &DomainRoleMatrix {
        &self.matrix
    }

    /// Evaluate access and return the reason.
    #[must_use]
    pub fn decide(&self, principal: &Principal, domain: &str, access: AccessLevel) -> Decision {
        let Some(roles) = self.matrix.get(domain) else {
            warn!(domain, "Authorization requested for unknown domain");
            return Decision::UnknownDomain;
        };

        let refused = self.bypass_refused(principal);
        if refused {
            warn!(
                subject = %principal.subject,
                domain,
                "Superuser role held by automation identity in production; bypass refused"
            );
        } else if self.holds_superuser_role(principal) {
            return Decision::Superuser;
        }

        let required = match access {
            AccessLevel::Read => &roles.read_roles,
            AccessLevel::Write => &roles.write_roles,
        };

        if principal.roles.iter().any(|r| required.contains(r)) {
            Decision::RoleGranted
        } else if access == AccessLevel::Read && roles.public {
            Decision::PublicRead
        } else if refused {
            Decision::SuperuserRefused
        } else {
            debug!(subject = %principal.subject, domain, %access, "No matching role");
            Decision::Denied
        }
    }

    /// Whether the principal holds a superuser role but may not use it.
    ///
    /// The principal's ordinary roles still apply.
    #[must_use]
    pub fn bypass_refused(&self, principal: &Principal) -> bool {
        self.production
            && self.holds_superuser_role(principal)
            && self.automation_subjects.contains(&principal.subject)
    }

    fn holds_superuser_role(&self, principal: &Principal) -> bool {
        principal.roles.iter().any(|r| self.superuser_roles.contains(r))
    }

    /// Returns `true` iff the principal may access `domain` at `access`.
    #[must_use]
    pub fn authorize(&self, principal: &Principal, domain: &str, access: AccessLevel) -> bool {
        self.decide(principal, domain, access).is_allowed()
    }

    /// Like [`authorize`](Self::authorize) but fails with `InsufficientPermissions`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InsufficientPermissions` when access is not granted.
    pub fn require(&self, principal: &Principal, domain: &str, access: AccessLevel) -> Result<()> {
        if self.authorize(principal, domain, access) {
            Ok(())
        } else {
            Err(Error::InsufficientPermissions {
                domain: domain.to_string(),
                access: access.to_string(),
            })
        }
    }
}
