//! Per-request authentication and role gate.
//!
//! [`RequestGate`] is what an HTTP layer calls for each protected request. It
//! extracts the bearer token, verifies it, checks the required role, and
//! returns a [`GateOutcome`] that maps directly onto a response.
//!
//! # Example
//!
//! ```no_run
//! use jwks_authn::{AuthConfig, GateOutcome, RequestGate};
//!
//! # async fn example(config: AuthConfig, header: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
//! let gate = RequestGate::from_config(&config)?;
//!
//! match gate.check(header, "admin").await {
//!     GateOutcome::Authorized(claims) => println!("welcome {:?}", claims.sub),
//!     denied => println!("{} {}", denied.status_code(), denied.public_message()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Callers only ever see a coarse message ("Token expired", "Invalid token",
//! "Insufficient role"); the precise failure is logged and kept on the
//! outcome as an [`AuthErrorKind`].

use std::sync::Arc;

use http::{HeaderMap, StatusCode, header::AUTHORIZATION};

use crate::{
    authz::{AuthzDecision, authorize, authorize_any},
    config::AuthConfig,
    error::{AuthError, AuthErrorKind, ConfigError},
    jwt::{TokenClaims, TokenVerifier},
    key_resolver::KeyResolver,
};

/// Result of gating one request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// The token is valid and carries the required role.
    Authorized(TokenClaims),
    /// No valid token was presented.
    Unauthenticated(AuthErrorKind),
    /// The token is valid but lacks the required role.
    Forbidden,
}

impl GateOutcome {
    /// HTTP status for this outcome.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authorized(_) => StatusCode::OK,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Only expiry is distinguished among authentication failures.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Authorized(_) => "OK",
            Self::Unauthenticated(AuthErrorKind::MissingCredentials) => "Not authenticated",
            Self::Unauthenticated(AuthErrorKind::Expired) => "Token expired",
            Self::Unauthenticated(_) => "Invalid token",
            Self::Forbidden => "Insufficient role",
        }
    }

    /// `WWW-Authenticate` challenge (RFC 6750) for denied requests.
    #[must_use]
    pub fn www_authenticate(&self) -> Option<String> {
        match self {
            Self::Authorized(_) => None,
            Self::Unauthenticated(AuthErrorKind::MissingCredentials) => Some("Bearer".to_owned()),
            Self::Unauthenticated(AuthErrorKind::Malformed) => Some(format!(
                "Bearer error=\"invalid_request\", error_description=\"{}\"",
                self.public_message()
            )),
            Self::Unauthenticated(_) => Some(format!(
                "Bearer error=\"invalid_token\", error_description=\"{}\"",
                self.public_message()
            )),
            Self::Forbidden => Some(format!(
                "Bearer error=\"insufficient_scope\", error_description=\"{}\"",
                self.public_message()
            )),
        }
    }

    /// Whether the request may proceed.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized(_))
    }

    /// The verified claims, if authorized.
    #[must_use]
    pub fn into_claims(self) -> Option<TokenClaims> {
        match self {
            Self::Authorized(claims) => Some(claims),
            _ => None,
        }
    }
}

/// Extracts the token from an `Authorization` header value.
///
/// The scheme is matched case-insensitively and may be followed by one or
/// more spaces.
///
/// # Errors
///
/// Returns [`AuthError::MissingCredentials`] if the scheme is not `Bearer`,
/// or [`AuthError::Malformed`] if the token is empty or contains whitespace.
pub fn extract_bearer(header: &str) -> Result<&str, AuthError> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingCredentials);
    }

    let token = rest.trim_start_matches(' ');
    if token.is_empty() {
        return Err(AuthError::malformed("empty bearer token"));
    }
    if token.chars().any(char::is_whitespace) {
        return Err(AuthError::malformed("bearer token contains whitespace"));
    }

    Ok(token)
}

/// Extracts the bearer token from request headers.
///
/// # Errors
///
/// Returns [`AuthError::MissingCredentials`] without an `Authorization`
/// header, and [`AuthError::Malformed`] if there are several or the value is
/// not visible ASCII. Otherwise as [`extract_bearer`].
pub fn bearer_from_headers(headers: &HeaderMap) -> Result<&str, AuthError> {
    let mut values = headers.get_all(AUTHORIZATION).iter();
    let value = values.next().ok_or(AuthError::MissingCredentials)?;
    if values.next().is_some() {
        return Err(AuthError::malformed("multiple Authorization headers"));
    }
    let value = value
        .to_str()
        .map_err(|_| AuthError::malformed("Authorization header is not visible ASCII"))?;
    extract_bearer(value)
}

/// Authenticates requests and enforces roles.
///
/// Cheap to clone; clones share the key cache.
#[derive(Debug, Clone)]
pub struct RequestGate {
    verifier: TokenVerifier,
}

impl RequestGate {
    /// Creates a gate around a verifier.
    #[must_use]
    pub fn new(verifier: TokenVerifier) -> Self {
        Self { verifier }
    }

    /// Creates a gate fetching keys over HTTP as configured.
    ///
    /// If `refresh_interval` is set, background refresh starts immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the HTTP
    /// client cannot be built.
    ///
    /// # Panics
    ///
    /// With `refresh_interval` set, must be called within a Tokio runtime context.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let mut resolver = Arc::new(KeyResolver::from_config(config)?);
        if let Some(interval) = config.refresh_interval() {
            resolver = resolver.with_refresh_interval(interval);
        }
        Ok(Self::new(TokenVerifier::from_config(resolver, config)))
    }

    /// The underlying verifier.
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Verifies the bearer token in `authorization` without checking roles.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] from header extraction or verification.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<TokenClaims, AuthError> {
        let header = authorization.ok_or(AuthError::MissingCredentials)?;
        let token = extract_bearer(header)?;
        self.verifier.verify(token).await
    }

    /// Gates a request on `required_role`, given its `Authorization` header value.
    #[tracing::instrument(skip(self, authorization))]
    pub async fn check(&self, authorization: Option<&str>, required_role: &str) -> GateOutcome {
        let result = self.authenticate(authorization).await;
        self.decide(result, |claims| authorize(claims, required_role))
    }

    /// Gates a request on any of `accepted_roles`.
    #[tracing::instrument(skip(self, authorization))]
    pub async fn check_any(
        &self,
        authorization: Option<&str>,
        accepted_roles: &[&str],
    ) -> GateOutcome {
        let result = self.authenticate(authorization).await;
        self.decide(result, |claims| authorize_any(claims, accepted_roles))
    }

    /// Gates a request on `required_role`, given its headers.
    #[tracing::instrument(skip(self, headers))]
    pub async fn check_headers(&self, headers: &HeaderMap, required_role: &str) -> GateOutcome {
        let result = match bearer_from_headers(headers) {
            Ok(token) => self.verifier.verify(token).await,
            Err(err) => Err(err),
        };
        self.decide(result, |claims| authorize(claims, required_role))
    }

    fn decide(
        &self,
        result: Result<TokenClaims, AuthError>,
        policy: impl FnOnce(&TokenClaims) -> AuthzDecision,
    ) -> GateOutcome {
        let claims = match result {
            Ok(claims) => claims,
            Err(err) => {
                let kind = err.kind();
                if err.is_retryable() {
                    tracing::warn!(kind = %kind, error = %err, "authentication unavailable");
                } else {
                    tracing::info!(kind = %kind, error = %err, "authentication failed");
                }
                return GateOutcome::Unauthenticated(kind);
            },
        };

        let decision = policy(&claims);
        if decision.allow {
            GateOutcome::Authorized(claims)
        } else {
            tracing::info!(
                sub = claims.sub.as_deref(),
                reason = decision.reason.as_deref().unwrap_or_default(),
                "authorization denied"
            );
            GateOutcome::Forbidden
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use http::HeaderValue;
    use jsonwebtoken::Algorithm;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        jwks::StaticJwksSource,
        testutil::{TEST_AUDIENCE, TEST_ISSUER, TestKey, jwks_document, standard_claims},
    };

    fn gate_for(key: &TestKey) -> RequestGate {
        let source = Arc::new(StaticJwksSource::new(jwks_document(&[key])));
        let resolver = Arc::new(KeyResolver::new(source, Duration::from_secs(600)));
        RequestGate::new(TokenVerifier::new(resolver, Algorithm::RS256, TEST_AUDIENCE, TEST_ISSUER))
    }

    #[rstest]
    #[case("Bearer abc.def.ghi", "abc.def.ghi")]
    #[case("bearer abc.def.ghi", "abc.def.ghi")]
    #[case("BEARER abc.def.ghi", "abc.def.ghi")]
    #[case("Bearer    abc.def.ghi", "abc.def.ghi")]
    #[case("  Bearer abc.def.ghi  ", "abc.def.ghi")]
    fn test_extract_bearer_accepts(#[case] header: &str, #[case] expected: &str) {
        assert_eq!(extract_bearer(header).unwrap(), expected);
    }

    #[rstest]
    #[case("Basic dXNlcjpwYXNz")]
    #[case("Token abc")]
    #[case("abc.def.ghi")]
    #[case("")]
    #[case("Bearerabc.def.ghi")]
    fn test_extract_bearer_other_schemes_are_missing_credentials(#[case] header: &str) {
        assert!(matches!(extract_bearer(header), Err(AuthError::MissingCredentials)));
    }

    #[rstest]
    #[case("Bearer")]
    #[case("Bearer   ")]
    #[case("Bearer abc def")]
    #[case("Bearer abc\tdef")]
    fn test_extract_bearer_malformed(#[case] header: &str) {
        assert!(matches!(extract_bearer(header), Err(AuthError::Malformed { .. })));
    }

    #[test]
    fn test_bearer_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(matches!(bearer_from_headers(&headers), Err(AuthError::MissingCredentials)));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_from_headers(&headers).unwrap(), "tok");

        headers.append(AUTHORIZATION, HeaderValue::from_static("Bearer other"));
        assert!(matches!(bearer_from_headers(&headers), Err(AuthError::Malformed { .. })));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_bytes(b"Bearer \xfftok").unwrap());
        assert!(matches!(bearer_from_headers(&headers), Err(AuthError::Malformed { .. })));
    }

    #[test]
    fn test_outcome_mapping() {
        let expired = GateOutcome::Unauthenticated(AuthErrorKind::Expired);
        assert_eq!(expired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(expired.public_message(), "Token expired");
        assert_eq!(
            expired.www_authenticate().unwrap(),
            "Bearer error=\"invalid_token\", error_description=\"Token expired\""
        );

        for kind in [
            AuthErrorKind::Malformed,
            AuthErrorKind::UnknownKey,
            AuthErrorKind::KeyFetch,
            AuthErrorKind::InvalidSignature,
            AuthErrorKind::InvalidClaims,
            AuthErrorKind::Replayed,
        ] {
            let outcome = GateOutcome::Unauthenticated(kind);
            assert_eq!(outcome.status_code(), StatusCode::UNAUTHORIZED);
            assert_eq!(outcome.public_message(), "Invalid token", "{kind}");
        }

        let missing = GateOutcome::Unauthenticated(AuthErrorKind::MissingCredentials);
        assert_eq!(missing.www_authenticate().as_deref(), Some("Bearer"));

        let forbidden = GateOutcome::Forbidden;
        assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(forbidden.public_message(), "Insufficient role");
        assert!(forbidden.www_authenticate().unwrap().contains("insufficient_scope"));
        assert!(!forbidden.is_authorized());
        assert!(forbidden.into_claims().is_none());
    }

    #[tokio::test]
    async fn test_check_authorized_and_forbidden() {
        let key = TestKey::rsa_primary("k1");
        let gate = gate_for(&key);
        let header = format!("Bearer {}", key.sign(&standard_claims(&["admin"])));

        let outcome = gate.check(Some(&header), "admin").await;
        assert_eq!(outcome.status_code(), StatusCode::OK);
        let claims = outcome.into_claims().unwrap();
        assert!(claims.has_role("admin"));

        let outcome = gate.check(Some(&header), "superadmin").await;
        assert_eq!(outcome, GateOutcome::Forbidden);
    }

    #[tokio::test]
    async fn test_check_without_header_is_unauthenticated() {
        let key = TestKey::rsa_primary("k1");
        let gate = gate_for(&key);

        let outcome = gate.check(None, "admin").await;
        assert_eq!(outcome, GateOutcome::Unauthenticated(AuthErrorKind::MissingCredentials));
        assert_eq!(outcome.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_check_expired_token() {
        let key = TestKey::rsa_primary("k1");
        let gate = gate_for(&key);
        let mut claims = standard_claims(&["admin"]);
        claims["exp"] = json!(chrono::Utc::now().timestamp() - 60);
        let header = format!("Bearer {}", key.sign(&claims));

        let outcome = gate.check(Some(&header), "admin").await;
        assert_eq!(outcome, GateOutcome::Unauthenticated(AuthErrorKind::Expired));
        assert_eq!(outcome.public_message(), "Token expired");
    }

    #[tokio::test]
    async fn test_check_expired_token_with_mistyped_claims() {
        let key = TestKey::rsa_primary("k1");
        let gate = gate_for(&key);
        let mut claims = standard_claims(&["admin"]);
        claims.as_object_mut().unwrap().remove("sub");
        claims["exp"] = json!(chrono::Utc::now().timestamp() - 600);
        claims["jti"] = json!(5);
        let header = format!("Bearer {}", key.sign(&claims));

        let outcome = gate.check(Some(&header), "admin").await;
        assert_eq!(outcome, GateOutcome::Unauthenticated(AuthErrorKind::Expired));
        assert_eq!(outcome.public_message(), "Token expired");
    }

    #[tokio::test]
    async fn test_check_any() {
        let key = TestKey::rsa_primary("k1");
        let gate = gate_for(&key);
        let header = format!("Bearer {}", key.sign(&standard_claims(&["user"])));

        assert!(gate.check_any(Some(&header), &["admin", "user"]).await.is_authorized());
        assert_eq!(gate.check_any(Some(&header), &["admin"]).await, GateOutcome::Forbidden);
    }

    #[tokio::test]
    async fn test_check_headers() {
        let key = TestKey::rsa_primary("k1");
        let gate = gate_for(&key);
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key.sign(&standard_claims(&["admin"]))))
                .unwrap(),
        );

        assert!(gate.check_headers(&headers, "admin").await.is_authorized());
        assert_eq!(
            gate.check_headers(&HeaderMap::new(), "admin").await,
            GateOutcome::Unauthenticated(AuthErrorKind::MissingCredentials)
        );
    }
}
