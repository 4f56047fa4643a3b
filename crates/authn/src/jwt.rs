//! Bearer token verification and claims.
//!
//! [`TokenVerifier`] runs the full pipeline on a raw token: structural
//! parsing, algorithm pinning, key resolution, signature verification and
//! registered-claim validation. The lower-level helpers
//! ([`decode_jwt_header`], [`decode_jwt_payload`], [`validate_payload`],
//! [`validate_claims`]) are public for callers that need to inspect tokens
//! without verifying them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use jwks_authn::{AuthConfig, KeyResolver, TokenVerifier};
//!
//! # async fn example(config: AuthConfig, token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = Arc::new(KeyResolver::from_config(&config)?);
//! let verifier = TokenVerifier::from_config(resolver, &config);
//!
//! let claims = verifier.verify(token).await?;
//! println!("subject: {:?}", claims.sub);
//! # Ok(())
//! # }
//! ```

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    authz::extract_roles,
    config::{AuthConfig, DEFAULT_ROLES_CLAIM},
    error::AuthError,
    jwks::SigningKey,
    key_resolver::KeyResolver,
    replay::ReplayDetector,
    validation::{algorithm_name, validate_algorithm, validate_kid},
};

/// Maximum accepted length of a raw token (16 KiB).
pub const MAX_TOKEN_LENGTH: usize = 16 * 1024;

/// JOSE header fields the verifier looks at.
///
/// `alg` is kept as a string so that values `jsonwebtoken` does not model
/// (such as `"none"`) still reach the algorithm check.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawHeader {
    /// Declared signing algorithm.
    pub alg: String,
    /// Key ID.
    #[serde(default)]
    pub kid: Option<String>,
    /// Token type, usually `JWT`.
    #[serde(default)]
    pub typ: Option<String>,
}

/// The `aud` claim: a single audience or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "my-api"`
    Single(String),
    /// `"aud": ["my-api", "other-api"]`
    Many(Vec<String>),
}

impl Audience {
    /// Whether `audience` is one of the token's audiences.
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::Single(aud) => aud == audience,
            Self::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }

    /// Iterates over the audiences.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            Self::Single(aud) => std::slice::from_ref(aud),
            Self::Many(auds) => auds.as_slice(),
        };
        slice.iter().map(String::as_str)
    }
}

/// Claims of a verified token.
///
/// Registered claims are typed; everything else, including the roles claim,
/// stays in [`extra`](Self::extra). Serializing a `TokenClaims` reproduces the
/// token's payload.
///
/// ```json
/// {
///   "sub": "user-123",
///   "aud": "https://api.example.com",
///   "iss": "https://idp.example.com/",
///   "exp": 1767225600,
///   "iat": 1767222000,
///   "roles": ["admin", "reader"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenClaims {
    /// Subject, if the token names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience(s).
    pub aud: Audience,
    /// Issuer.
    pub iss: String,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
    /// Issued at (seconds since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Not before (seconds since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// JWT ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Roles read from the roles claim. Empty if the claim is absent or malformed.
    #[serde(skip)]
    pub roles: BTreeSet<String>,
    /// Every other claim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    /// Builds claims from a decoded payload, reading roles from `roles_claim`.
    ///
    /// Only extracts; see [`validate_payload`] and [`validate_claims`] for the
    /// expiry, audience and issuer checks.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidClaims`] if `exp`, `aud` or `iss` is
    /// missing, or a registered claim has the wrong type.
    pub fn from_payload(mut payload: Map<String, Value>, roles_claim: &str) -> Result<Self, AuthError> {
        let exp = numeric_date(payload.remove("exp").as_ref(), "exp")?
            .ok_or_else(|| AuthError::missing_claim("exp"))?;
        let nbf = numeric_date(payload.remove("nbf").as_ref(), "nbf")?;
        let aud = audience(payload.remove("aud").as_ref())?
            .ok_or_else(|| AuthError::missing_claim("aud"))?;
        let iss = string_claim(payload.remove("iss").as_ref(), "iss")?
            .ok_or_else(|| AuthError::missing_claim("iss"))?;
        let sub = string_claim(payload.remove("sub").as_ref(), "sub")?;
        let iat = numeric_date(payload.remove("iat").as_ref(), "iat")?;
        let jti = string_claim(payload.remove("jti").as_ref(), "jti")?;

        let roles = extract_roles(&payload, roles_claim);

        Ok(Self { sub, aud, iss, exp, iat, nbf, jti, roles, extra: payload })
    }

    /// Expiration as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// Whether the token carries `role`. Exact, case-sensitive match.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Looks up a claim not modelled as a field.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

fn string_claim(value: Option<&Value>, claim: &str) -> Result<Option<String>, AuthError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(AuthError::invalid_claims(format!("'{claim}' claim must be a string"))),
    }
}

fn audience(value: Option<&Value>) -> Result<Option<Audience>, AuthError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Audience::deserialize(value).map(Some).map_err(|_| {
            AuthError::invalid_claims("'aud' claim must be a string or an array of strings")
        }),
    }
}

/// Reads a NumericDate. Fractional seconds are truncated.
fn numeric_date(value: Option<&Value>, claim: &str) -> Result<Option<i64>, AuthError> {
    let invalid = || AuthError::invalid_claims(format!("'{claim}' claim must be a numeric date"));
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => {
            if let Some(value) = number.as_i64() {
                Ok(Some(value))
            } else {
                match number.as_f64() {
                    Some(value) if value.is_finite() && value.abs() < i64::MAX as f64 => {
                        Ok(Some(value.trunc() as i64))
                    },
                    _ => Err(invalid()),
                }
            }
        },
        Some(_) => Err(invalid()),
    }
}

fn split_token(token: &str) -> Result<(&str, &str, &str), AuthError> {
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(AuthError::malformed(format!("token exceeds {MAX_TOKEN_LENGTH} bytes")));
    }

    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None) => {
            if header.is_empty() || payload.is_empty() {
                return Err(AuthError::malformed("JWT header and payload must not be empty"));
            }
            Ok((header, payload, signature))
        },
        _ => Err(AuthError::malformed("JWT must have 3 parts separated by dots")),
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::malformed(format!("failed to decode JWT {name}: {e}")))
}

/// Decodes the JOSE header without verifying the token.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the token is not three base64url
/// segments or the header is not a JSON object with a string `alg`.
pub fn decode_jwt_header(token: &str) -> Result<RawHeader, AuthError> {
    let (header, _, _) = split_token(token)?;
    let bytes = decode_segment(header, "header")?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::malformed(format!("failed to parse JWT header: {e}")))
}

/// Decodes the payload without verifying the token.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the token is not three base64url
/// segments or the payload is not a JSON object.
pub fn decode_jwt_payload(token: &str) -> Result<Map<String, Value>, AuthError> {
    let (_, payload, _) = split_token(token)?;
    let bytes = decode_segment(payload, "payload")?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::malformed(format!("failed to parse JWT payload: {e}")))
}

/// Checks the time-based and identity claims of a verified token.
///
/// Checks run in order: `exp`, `nbf`, `aud`, `iss`. `leeway` extends both
/// time checks; `now` is seconds since epoch.
///
/// # Errors
///
/// Returns an error if:
/// - `exp` is not after `now` ([`AuthError::Expired`])
/// - `nbf` is after `now` ([`AuthError::InvalidClaims`])
/// - `expected_audience` is not among the audiences ([`AuthError::InvalidClaims`])
/// - `iss` differs from `expected_issuer` ([`AuthError::InvalidClaims`])
pub fn validate_claims(
    claims: &TokenClaims,
    expected_audience: &str,
    expected_issuer: &str,
    leeway: Duration,
    now: i64,
) -> Result<(), AuthError> {
    let leeway = leeway_secs(leeway);
    check_expiry(claims.exp, leeway, now)?;
    check_not_before(claims.nbf, leeway, now)?;
    check_audience(&claims.aud, expected_audience)?;
    check_issuer(&claims.iss, expected_issuer)
}

/// Checks `exp`, `nbf`, `aud` and `iss` directly on a decoded payload.
///
/// Each claim is read and checked in turn, so an expired token reports
/// [`AuthError::Expired`] whatever else is wrong with it. Claims that are not
/// checked here (`sub`, `iat`, `jti`, ...) are not looked at.
///
/// # Errors
///
/// As [`validate_claims`], plus [`AuthError::InvalidClaims`] when one of the
/// four claims is missing or mistyped by the time it is reached.
pub fn validate_payload(
    payload: &Map<String, Value>,
    expected_audience: &str,
    expected_issuer: &str,
    leeway: Duration,
    now: i64,
) -> Result<(), AuthError> {
    let leeway = leeway_secs(leeway);

    let exp = numeric_date(payload.get("exp"), "exp")?
        .ok_or_else(|| AuthError::missing_claim("exp"))?;
    check_expiry(exp, leeway, now)?;

    check_not_before(numeric_date(payload.get("nbf"), "nbf")?, leeway, now)?;

    let aud = audience(payload.get("aud"))?.ok_or_else(|| AuthError::missing_claim("aud"))?;
    check_audience(&aud, expected_audience)?;

    let iss = string_claim(payload.get("iss"), "iss")?
        .ok_or_else(|| AuthError::missing_claim("iss"))?;
    check_issuer(&iss, expected_issuer)
}

fn leeway_secs(leeway: Duration) -> i64 {
    i64::try_from(leeway.as_secs()).unwrap_or(i64::MAX)
}

fn check_expiry(exp: i64, leeway: i64, now: i64) -> Result<(), AuthError> {
    if exp.saturating_add(leeway) <= now {
        return Err(AuthError::expired());
    }
    Ok(())
}

fn check_not_before(nbf: Option<i64>, leeway: i64, now: i64) -> Result<(), AuthError> {
    if let Some(nbf) = nbf
        && nbf > now.saturating_add(leeway)
    {
        return Err(AuthError::invalid_claims("token is not yet valid"));
    }
    Ok(())
}

fn check_audience(aud: &Audience, expected: &str) -> Result<(), AuthError> {
    if !aud.contains(expected) {
        return Err(AuthError::invalid_claims(format!("audience mismatch: expected '{expected}'")));
    }
    Ok(())
}

fn check_issuer(iss: &str, expected: &str) -> Result<(), AuthError> {
    if iss != expected {
        return Err(AuthError::invalid_claims(format!(
            "issuer mismatch: expected '{expected}', got '{iss}'"
        )));
    }
    Ok(())
}

/// Verifies the token's signature with `key` under `algorithm`.
///
/// Only the signature is checked here; claims are validated separately by
/// [`validate_claims`].
///
/// # Errors
///
/// Returns [`AuthError::InvalidSignature`] if the signature does not verify or
/// the key cannot be used with `algorithm`.
pub fn verify_signature(token: &str, key: &SigningKey, algorithm: Algorithm) -> Result<(), AuthError> {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<serde::de::IgnoredAny>(token, key.decoding_key(), &validation)?;
    Ok(())
}

/// Verifies bearer tokens against keys from a [`KeyResolver`].
///
/// Holds the single permitted algorithm and the expected audience and issuer.
/// Share it between requests behind an [`Arc`] or by cloning.
#[derive(Clone)]
pub struct TokenVerifier {
    resolver: Arc<KeyResolver>,
    algorithm: Algorithm,
    audience: String,
    issuer: String,
    leeway: Duration,
    roles_claim: String,
    replay_detector: Option<Arc<dyn ReplayDetector>>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("leeway", &self.leeway)
            .field("roles_claim", &self.roles_claim)
            .field("replay_detection", &self.replay_detector.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Creates a verifier accepting only `algorithm`, with zero leeway and the
    /// default roles claim.
    pub fn new(
        resolver: Arc<KeyResolver>,
        algorithm: Algorithm,
        audience: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            algorithm,
            audience: audience.into(),
            issuer: issuer.into(),
            leeway: Duration::ZERO,
            roles_claim: DEFAULT_ROLES_CLAIM.to_owned(),
            replay_detector: None,
        }
    }

    /// Creates a verifier from configuration.
    pub fn from_config(resolver: Arc<KeyResolver>, config: &AuthConfig) -> Self {
        Self::new(resolver, config.algorithm(), config.audience(), config.issuer())
            .with_leeway(config.leeway())
            .with_roles_claim(config.roles_claim())
    }

    /// Sets the clock skew tolerance for `exp` and `nbf`.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Sets the claim roles are read from.
    #[must_use]
    pub fn with_roles_claim(mut self, roles_claim: impl Into<String>) -> Self {
        self.roles_claim = roles_claim.into();
        self
    }

    /// Enables replay detection. Tokens must then carry a `jti` claim.
    #[must_use]
    pub fn with_replay_detector(mut self, detector: Arc<dyn ReplayDetector>) -> Self {
        self.replay_detector = Some(detector);
        self
    }

    /// The resolver keys come from.
    #[must_use]
    pub fn resolver(&self) -> &Arc<KeyResolver> {
        &self.resolver
    }

    /// The permitted algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Verifies `token` against the configured audience and issuer.
    ///
    /// # Errors
    ///
    /// See [`verify_with`](Self::verify_with).
    pub async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.verify_with(token, &self.audience, &self.issuer).await
    }

    /// Verifies `token`, expecting the given audience and issuer.
    ///
    /// Steps, each failing fast:
    /// 1. Parse header and payload
    /// 2. Check the declared algorithm and `kid`
    /// 3. Resolve the signing key
    /// 4. Verify the signature
    /// 5. Validate `exp`, `nbf`, `aud` and `iss`, in that order
    /// 6. Extract the remaining claims
    /// 7. Check for replay, if enabled
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The token is not a well-formed JWT, or `kid` is missing or invalid
    ///   ([`AuthError::Malformed`])
    /// - The declared algorithm is not the permitted one, the key is restricted to another
    ///   algorithm, or the signature does not verify ([`AuthError::InvalidSignature`])
    /// - The key id is not published ([`AuthError::UnknownKey`])
    /// - The key set cannot be fetched ([`AuthError::KeyFetch`])
    /// - The token has expired ([`AuthError::Expired`])
    /// - A registered claim is missing, mistyped or mismatched ([`AuthError::InvalidClaims`])
    /// - The `jti` was already seen ([`AuthError::Replayed`])
    #[tracing::instrument(skip(self, token), fields(kid = tracing::field::Empty))]
    pub async fn verify_with(
        &self,
        token: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<TokenClaims, AuthError> {
        let header = decode_jwt_header(token)?;
        let payload = decode_jwt_payload(token)?;

        validate_algorithm(&header.alg, self.algorithm)?;

        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::malformed("JWT header missing 'kid' field"))?;
        validate_kid(kid)?;
        tracing::Span::current().record("kid", kid);

        let key = self.resolver.resolve(kid).await?;
        if let Some(key_alg) = key.algorithm()
            && key_alg != self.algorithm
        {
            return Err(AuthError::invalid_signature(format!(
                "key '{kid}' is restricted to '{}'",
                algorithm_name(key_alg)
            )));
        }

        verify_signature(token, &key, self.algorithm)?;

        let now = Utc::now().timestamp();
        validate_payload(&payload, expected_audience, expected_issuer, self.leeway, now)?;
        let claims = TokenClaims::from_payload(payload, &self.roles_claim)?;

        if let Some(detector) = &self.replay_detector {
            let jti = claims.jti.as_deref().ok_or_else(|| AuthError::missing_claim("jti"))?;
            let remaining = u64::try_from(claims.exp.saturating_sub(now)).unwrap_or(0);
            let expires_in = Duration::from_secs(remaining).saturating_add(self.leeway);
            detector.check_and_mark(jti, expires_in).await?;
        }

        tracing::debug!(sub = claims.sub.as_deref(), roles = claims.roles.len(), "token verified");
        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        assert_auth_error,
        jwks::StaticJwksSource,
        replay::InMemoryReplayDetector,
        testutil::{
            TEST_AUDIENCE, TEST_ISSUER, TestKey, craft_raw_jwt, jwks_document, standard_claims,
        },
    };

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn claims_with(exp: i64, nbf: Option<i64>) -> TokenClaims {
        let mut value = json!({
            "sub": "user-1",
            "aud": TEST_AUDIENCE,
            "iss": TEST_ISSUER,
            "exp": exp,
        });
        if let Some(nbf) = nbf {
            value["nbf"] = json!(nbf);
        }
        TokenClaims::from_payload(payload(value), "roles").unwrap()
    }

    fn verifier_for(keys: &[&TestKey]) -> TokenVerifier {
        let source = Arc::new(StaticJwksSource::new(jwks_document(keys)));
        let resolver = Arc::new(
            KeyResolver::new(source, Duration::from_secs(600))
                .with_min_refresh_interval(Duration::ZERO),
        );
        TokenVerifier::new(resolver, Algorithm::RS256, TEST_AUDIENCE, TEST_ISSUER)
    }

    #[test]
    fn test_decode_jwt_header_keeps_unknown_alg() {
        let token = craft_raw_jwt(&json!({"alg": "none", "typ": "JWT"}), &json!({}), b"");
        let header = decode_jwt_header(&token).unwrap();
        assert_eq!(header.alg, "none");
        assert_eq!(header.kid, None);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
    }

    #[test]
    fn test_decode_rejects_wrong_part_count() {
        assert_auth_error!(decode_jwt_header("a.b"), Malformed);
        assert_auth_error!(decode_jwt_header("a.b.c.d"), Malformed);
        assert_auth_error!(decode_jwt_payload(""), Malformed);
    }

    #[test]
    fn test_decode_rejects_non_object_payload() {
        let token = craft_raw_jwt(&json!({"alg": "RS256"}), &json!([1, 2, 3]), b"sig");
        assert_auth_error!(decode_jwt_payload(&token), Malformed);
    }

    #[test]
    fn test_decode_rejects_oversized_token() {
        let token = format!("{}.{}.sig", "a".repeat(MAX_TOKEN_LENGTH), "b");
        assert_auth_error!(decode_jwt_header(&token), Malformed);
    }

    #[test]
    fn test_from_payload_splits_registered_and_extra_claims() {
        let claims = TokenClaims::from_payload(
            payload(json!({
                "sub": "user-1",
                "aud": ["a", "b"],
                "iss": "issuer",
                "exp": 2_000_000_000,
                "iat": 1_999_999_000,
                "jti": "id-1",
                "roles": ["admin", "reader"],
                "email": "u@example.com",
            })),
            "roles",
        )
        .unwrap();

        assert_eq!(claims.sub.as_deref(), Some("user-1"));
        assert!(claims.aud.contains("b"));
        assert_eq!(claims.aud.iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(claims.iat, Some(1_999_999_000));
        assert_eq!(claims.jti.as_deref(), Some("id-1"));
        assert!(claims.has_role("admin"));
        assert!(!claims.has_role("Admin"));
        assert_eq!(claims.claim("email"), Some(&json!("u@example.com")));
        assert!(claims.extra.contains_key("roles"));
        assert!(!claims.extra.contains_key("sub"));
        assert_eq!(claims.expires_at().unwrap().timestamp(), 2_000_000_000);
    }

    #[test]
    fn test_from_payload_missing_registered_claims() {
        for missing in ["iss", "aud", "exp"] {
            let mut value = json!({"sub": "s", "iss": "i", "aud": "a", "exp": 2_000_000_000});
            value.as_object_mut().unwrap().remove(missing);

            let err = TokenClaims::from_payload(payload(value), "roles").unwrap_err();
            assert!(
                matches!(&err, AuthError::InvalidClaims { message } if message.contains(missing)),
                "missing {missing}: {err:?}"
            );
        }
    }

    #[test]
    fn test_from_payload_rejects_mistyped_claims() {
        let cases = [
            json!({"sub": 1, "iss": "i", "aud": "a", "exp": 2_000_000_000}),
            json!({"sub": "s", "iss": "i", "aud": 7, "exp": 2_000_000_000}),
            json!({"sub": "s", "iss": "i", "aud": "a", "exp": "tomorrow"}),
            json!({"sub": "s", "iss": "i", "aud": "a", "exp": 2_000_000_000, "nbf": true}),
            json!({"sub": "s", "iss": "i", "aud": "a", "exp": 2_000_000_000, "jti": 5}),
        ];
        for case in cases {
            assert_auth_error!(TokenClaims::from_payload(payload(case.clone()), "roles"), InvalidClaims, case);
        }
    }

    #[test]
    fn test_from_payload_subject_is_optional() {
        let claims = TokenClaims::from_payload(
            payload(json!({"iss": "i", "aud": "a", "exp": 2_000_000_000})),
            "roles",
        )
        .unwrap();
        assert_eq!(claims.sub, None);
        assert!(!serde_json::to_value(&claims).unwrap().as_object().unwrap().contains_key("sub"));
    }

    #[test]
    fn test_from_payload_truncates_fractional_dates() {
        let claims = TokenClaims::from_payload(
            payload(json!({"sub": "s", "iss": "i", "aud": "a", "exp": 2_000_000_000.75})),
            "roles",
        )
        .unwrap();
        assert_eq!(claims.exp, 2_000_000_000);
    }

    #[test]
    fn test_claims_serialize_back_to_payload() {
        let original = json!({
            "sub": "user-1",
            "aud": "api",
            "iss": "issuer",
            "exp": 2_000_000_000,
            "roles": ["admin"],
            "tenant": {"id": 7},
        });
        let claims = TokenClaims::from_payload(payload(original.clone()), "roles").unwrap();

        assert_eq!(serde_json::to_value(&claims).unwrap(), original);
    }

    #[test]
    fn test_validate_claims_expiry_boundary() {
        let now = 1_800_000_000;
        let claims = claims_with(now, None);
        assert_auth_error!(
            validate_claims(&claims, TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now),
            Expired
        );

        let claims = claims_with(now + 1, None);
        assert!(validate_claims(&claims, TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now).is_ok());
    }

    #[test]
    fn test_validate_claims_leeway() {
        let now = 1_800_000_000;
        let claims = claims_with(now - 10, Some(now + 10));
        assert!(
            validate_claims(&claims, TEST_AUDIENCE, TEST_ISSUER, Duration::from_secs(30), now)
                .is_ok()
        );
        assert_auth_error!(
            validate_claims(&claims, TEST_AUDIENCE, TEST_ISSUER, Duration::from_secs(5), now),
            Expired
        );
    }

    #[test]
    fn test_validate_claims_not_yet_valid() {
        let now = 1_800_000_000;
        let claims = claims_with(now + 600, Some(now + 60));
        assert_auth_error!(
            validate_claims(&claims, TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now),
            InvalidClaims
        );
    }

    #[test]
    fn test_validate_claims_audience_and_issuer() {
        let now = 1_800_000_000;
        let claims = claims_with(now + 600, None);
        assert_auth_error!(
            validate_claims(&claims, "other-api", TEST_ISSUER, Duration::ZERO, now),
            InvalidClaims
        );
        assert_auth_error!(
            validate_claims(&claims, TEST_AUDIENCE, "https://evil.example.com/", Duration::ZERO, now),
            InvalidClaims
        );
    }

    #[test]
    fn test_validate_claims_expiry_checked_before_audience() {
        let now = 1_800_000_000;
        let claims = claims_with(now - 1, None);
        assert_auth_error!(
            validate_claims(&claims, "other-api", "other-issuer", Duration::ZERO, now),
            Expired
        );
    }

    #[rstest]
    #[case::missing_subject(json!({"jti": "id-1"}))]
    #[case::numeric_subject(json!({"sub": 42}))]
    #[case::numeric_jti(json!({"sub": "s", "jti": 5}))]
    #[case::mistyped_iat(json!({"sub": "s", "iat": "yesterday"}))]
    #[case::mistyped_nbf(json!({"nbf": true}))]
    #[case::wrong_audience(json!({"aud": "other-api"}))]
    #[case::mistyped_issuer(json!({"iss": 7}))]
    fn test_validate_payload_reports_expiry_first(#[case] overrides: Value) {
        let now = 1_800_000_000;
        let mut value = json!({"aud": TEST_AUDIENCE, "iss": TEST_ISSUER, "exp": now - 600});
        for (name, claim) in payload(overrides) {
            value[name] = claim;
        }
        assert_auth_error!(
            validate_payload(&payload(value.clone()), TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now),
            Expired
        );
    }

    #[test]
    fn test_validate_payload_order() {
        let now = 1_800_000_000;
        let base = json!({"aud": TEST_AUDIENCE, "iss": TEST_ISSUER, "exp": now + 600});
        assert!(
            validate_payload(&payload(base.clone()), TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now)
                .is_ok()
        );

        // Not-yet-valid wins over a bad audience and issuer.
        let mut value = base.clone();
        value["nbf"] = json!(now + 60);
        value["aud"] = json!("other-api");
        value["iss"] = json!(7);
        let err = validate_payload(&payload(value), TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now)
            .unwrap_err();
        assert!(matches!(&err, AuthError::InvalidClaims { message } if message.contains("not yet valid")));

        // Audience wins over issuer.
        let mut value = base.clone();
        value["aud"] = json!("other-api");
        value["iss"] = json!("https://evil.example.com/");
        let err = validate_payload(&payload(value), TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now)
            .unwrap_err();
        assert!(matches!(&err, AuthError::InvalidClaims { message } if message.contains("audience")));

        let mut value = base;
        value.as_object_mut().unwrap().remove("exp");
        let err = validate_payload(&payload(value), TEST_AUDIENCE, TEST_ISSUER, Duration::ZERO, now)
            .unwrap_err();
        assert!(matches!(&err, AuthError::InvalidClaims { message } if message.contains("exp")));
    }

    #[tokio::test]
    async fn test_verify_token_without_subject() {
        let key = TestKey::rsa_primary("k1");
        let verifier = verifier_for(&[&key]);
        let mut payload = standard_claims(&["admin"]);
        payload.as_object_mut().unwrap().remove("sub");

        let claims = verifier.verify(&key.sign(&payload)).await.unwrap();

        assert_eq!(claims.sub, None);
        assert!(claims.has_role("admin"));
        assert_eq!(serde_json::to_value(&claims).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_verify_expired_token_with_bad_claims_is_expired() {
        let key = TestKey::rsa_primary("k1");
        let verifier = verifier_for(&[&key]);
        let expired = Utc::now().timestamp() - 600;

        let mut without_sub = standard_claims(&[]);
        without_sub.as_object_mut().unwrap().remove("sub");
        without_sub["exp"] = json!(expired);

        let mut numeric_jti = standard_claims(&[]);
        numeric_jti["exp"] = json!(expired);
        numeric_jti["jti"] = json!(5);

        for claims in [without_sub, numeric_jti] {
            assert_auth_error!(verifier.verify(&key.sign(&claims)).await, Expired, claims);
        }
    }

    #[tokio::test]
    async fn test_verify_valid_token_with_mistyped_jti_is_invalid_claims() {
        let key = TestKey::rsa_primary("k1");
        let verifier = verifier_for(&[&key]);
        let mut payload = standard_claims(&[]);
        payload["jti"] = json!(5);

        assert_auth_error!(verifier.verify(&key.sign(&payload)).await, InvalidClaims);
    }

    #[tokio::test]
    async fn test_verify_valid_token_returns_payload() {
        let key = TestKey::rsa_primary("k1");
        let verifier = verifier_for(&[&key]);
        let payload = standard_claims(&["admin"]);
        let token = key.sign(&payload);

        let claims = verifier.verify(&token).await.unwrap();

        assert_eq!(serde_json::to_value(&claims).unwrap(), payload);
        assert!(claims.has_role("admin"));
    }

    #[tokio::test]
    async fn test_verify_with_explicit_audience_and_issuer() {
        let key = TestKey::rsa_primary("k1");
        let verifier = verifier_for(&[&key]);
        let mut payload = standard_claims(&[]);
        payload["aud"] = json!("billing");
        payload["iss"] = json!("https://other-idp.example.com/");
        let token = key.sign(&payload);

        assert_auth_error!(verifier.verify(&token).await, InvalidClaims);
        assert!(
            verifier
                .verify_with(&token, "billing", "https://other-idp.example.com/")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_verify_missing_kid_is_malformed() {
        let key = TestKey::rsa_primary("k1");
        let verifier = verifier_for(&[&key]);
        let token = key.sign_without_kid(&standard_claims(&[]));

        assert_auth_error!(verifier.verify(&token).await, Malformed);
    }

    #[tokio::test]
    async fn test_verify_key_restricted_to_other_algorithm() {
        let key = TestKey::ed25519("ed");
        let verifier = verifier_for(&[&key]);
        // Header claims RS256 but the published key is EdDSA-only.
        let token = craft_raw_jwt(
            &json!({"alg": "RS256", "kid": "ed", "typ": "JWT"}),
            &standard_claims(&[]),
            b"not-a-signature",
        );

        assert_auth_error!(verifier.verify(&token).await, InvalidSignature);
    }

    #[tokio::test]
    async fn test_verify_replay_detection() {
        let key = TestKey::rsa_primary("k1");
        let verifier =
            verifier_for(&[&key]).with_replay_detector(Arc::new(InMemoryReplayDetector::new(100)));

        let mut payload = standard_claims(&[]);
        payload["jti"] = json!("token-1");
        let token = key.sign(&payload);

        assert!(verifier.verify(&token).await.is_ok());
        assert_auth_error!(verifier.verify(&token).await, Replayed);

        let without_jti = key.sign(&standard_claims(&[]));
        assert_auth_error!(verifier.verify(&without_jti).await, InvalidClaims);
    }

    #[test]
    fn test_verifier_debug() {
        let verifier = verifier_for(&[]);
        let debug = format!("{verifier:?}");
        assert!(debug.contains("RS256"));
        assert!(debug.contains("replay_detection: false"));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_extra() -> impl Strategy<Value = Map<String, Value>> {
            proptest::collection::btree_map(
                "x_[a-z]{1,12}",
                prop_oneof![
                    any::<bool>().prop_map(Value::from),
                    any::<i64>().prop_map(Value::from),
                    "[ -~]{0,32}".prop_map(Value::from),
                ],
                0..6,
            )
            .prop_map(|entries| entries.into_iter().collect())
        }

        proptest! {
            /// Claims built from a payload serialize back to that payload.
            #[test]
            fn claims_preserve_payload(
                sub in "[a-zA-Z0-9:_-]{1,32}",
                iss in "[a-zA-Z0-9:/._-]{1,32}",
                auds in proptest::collection::vec("[a-z]{1,8}", 1..4),
                exp in 0i64..4_000_000_000,
                roles in proptest::collection::vec("[a-z]{1,8}", 0..4),
                extra in arb_extra(),
            ) {
                let mut map = extra;
                map.insert("sub".into(), json!(sub));
                map.insert("iss".into(), json!(iss));
                map.insert("aud".into(), json!(auds));
                map.insert("exp".into(), json!(exp));
                map.insert("roles".into(), json!(roles));
                let original = Value::Object(map.clone());

                let claims = TokenClaims::from_payload(map, "roles").unwrap();

                prop_assert_eq!(serde_json::to_value(&claims).unwrap(), original);
                for role in &roles {
                    prop_assert!(claims.has_role(role));
                }
            }

            /// Arbitrary input never panics the parsers.
            #[test]
            fn decoders_never_panic(token in "[A-Za-z0-9_.-]{0,256}") {
                let _ = decode_jwt_header(&token);
                let _ = decode_jwt_payload(&token);
            }
        }
    }
}
