//! Role-based authorization of verified claims.
//!
//! Authorization never fails with an error: a token without the required
//! role produces an [`AuthzDecision`] with `allow == false`.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::jwt::TokenClaims;

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthzDecision {
    /// Whether access is granted.
    pub allow: bool,
    /// Why access was denied. `None` when allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthzDecision {
    /// An allowing decision.
    #[must_use]
    pub fn allow() -> Self {
        Self { allow: true, reason: None }
    }

    /// A denying decision with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allow: false, reason: Some(reason.into()) }
    }

    /// Whether access is granted.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allow
    }
}

/// Reads the role set from `claim` in a token payload.
///
/// The claim must be an array of strings. Anything else (absent, `null`, a
/// string, an array containing a non-string) yields an empty set.
#[must_use]
pub fn extract_roles(payload: &Map<String, Value>, claim: &str) -> BTreeSet<String> {
    let Some(Value::Array(values)) = payload.get(claim) else {
        return BTreeSet::new();
    };

    let roles: Option<BTreeSet<String>> =
        values.iter().map(|value| value.as_str().map(str::to_owned)).collect();

    roles.unwrap_or_else(|| {
        tracing::debug!(claim, "roles claim contains non-string entries, treating as empty");
        BTreeSet::new()
    })
}

/// Allows iff `required_role` is among the claims' roles.
///
/// Matching is exact and case-sensitive.
#[must_use]
pub fn authorize(claims: &TokenClaims, required_role: &str) -> AuthzDecision {
    if claims.roles.contains(required_role) {
        AuthzDecision::allow()
    } else {
        AuthzDecision::deny(format!("missing role '{required_role}'"))
    }
}

/// Allows iff any of `accepted_roles` is among the claims' roles.
///
/// An empty `accepted_roles` denies.
#[must_use]
pub fn authorize_any(claims: &TokenClaims, accepted_roles: &[&str]) -> AuthzDecision {
    if accepted_roles.iter().any(|role| claims.roles.contains(*role)) {
        AuthzDecision::allow()
    } else {
        AuthzDecision::deny(format!("missing any of roles [{}]", accepted_roles.join(", ")))
    }
}
