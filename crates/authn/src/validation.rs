//! JWT algorithm and header validation.
//!
//! This module provides security checks for JWT algorithms and key ids,
//! ensuring only the single configured asymmetric algorithm is accepted.
//!
//! # Security
//!
//! These validators implement RFC 8725 recommendations:
//! - Strict algorithm checks to prevent algorithm substitution attacks
//! - Only asymmetric algorithms may be configured
//! - Symmetric algorithms and "none" are always rejected

use jsonwebtoken::Algorithm;

use crate::error::{AuthError, ConfigError};

/// Forbidden JWT algorithms that are never accepted for security reasons.
///
/// These algorithms are blocked because:
/// - `none`: No signature verification (trivially bypassable)
/// - `HS256`, `HS384`, `HS512`: Symmetric algorithms. A verifier holding only
///   public keys would treat the public key as an HMAC secret.
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Algorithms that may be configured as the single permitted algorithm.
///
/// All of them verify with a public key published in a JWKS document.
pub const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Maximum accepted length of a `kid` header value, in bytes.
pub const MAX_KID_LENGTH: usize = 256;

/// Returns the JOSE name of an algorithm (e.g. `"RS256"`).
#[must_use]
pub fn algorithm_name(alg: Algorithm) -> String {
    format!("{alg:?}")
}

/// Validate the algorithm declared in a token header.
///
/// The declared algorithm must be exactly `allowed`. Forbidden algorithms are
/// reported with a dedicated message so they stand out in logs.
///
/// # Errors
///
/// Returns [`AuthError::InvalidSignature`] if:
/// - Algorithm is symmetric (HS256, HS384, HS512) or "none"
/// - Algorithm is anything other than `allowed`
///
/// # Examples
///
/// ```
/// use jsonwebtoken::Algorithm;
/// use jwks_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("RS256", Algorithm::RS256).is_ok());
/// assert!(validate_algorithm("RS512", Algorithm::RS256).is_err());
/// assert!(validate_algorithm("HS256", Algorithm::RS256).is_err());
/// ```
pub fn validate_algorithm(declared: &str, allowed: Algorithm) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|forbidden| forbidden.eq_ignore_ascii_case(declared)) {
        return Err(AuthError::invalid_signature(format!(
            "algorithm '{declared}' is not allowed for security reasons"
        )));
    }

    let expected = algorithm_name(allowed);
    if declared != expected {
        return Err(AuthError::invalid_signature(format!(
            "algorithm '{declared}' does not match the permitted algorithm '{expected}'"
        )));
    }

    Ok(())
}

/// Ensure an algorithm may be configured as the permitted algorithm.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if the algorithm is not in
/// [`ACCEPTED_ALGORITHMS`].
pub fn ensure_accepted_algorithm(alg: Algorithm) -> Result<(), ConfigError> {
    if ACCEPTED_ALGORITHMS.contains(&alg) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "algorithm",
            format!("'{}' is not an accepted asymmetric algorithm", algorithm_name(alg)),
        ))
    }
}

/// Validate a `kid` header value before it reaches the key cache.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the key id is empty, longer than
/// [`MAX_KID_LENGTH`] bytes, or contains control characters.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::malformed("'kid' header is empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::malformed(format!(
            "'kid' header exceeds {MAX_KID_LENGTH} bytes"
        )));
    }
    if kid.chars().any(char::is_control) {
        return Err(AuthError::malformed("'kid' header contains control characters"));
    }
    Ok(())
}
