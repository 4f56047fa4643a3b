//! # JWKS Authentication
//!
//! Bearer-token verification against an identity provider's JSON Web Key Set,
//! and role-based authorization of the verified claims.
//!
//! This crate provides:
//! - **Key resolution**: JWKS fetching with TTL caching, rotation handling, single-flight refresh
//!   and a bounded stale fallback
//! - **Token verification**: Algorithm pinning, signature verification, `exp`/`nbf`/`aud`/`iss`
//!   validation and optional replay detection
//! - **Role authorization**: Exact-match role checks that deny instead of failing
//! - **Request gating**: Bearer extraction and mapping of outcomes to 401/403
//!
//! ## Features
//!
//! - Only the single configured asymmetric algorithm is accepted
//! - Symmetric algorithms (HS256, etc.) and `none` are always rejected
//! - Failures keep their precise kind for logs while callers see a coarse message
//!
//! ## Example
//!
//! ```no_run
//! use jwks_authn::{AuthConfig, GateOutcome, RequestGate};
//!
//! # async fn example(authorization: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::builder()
//!     .jwks_url("https://idp.example.com/.well-known/jwks.json")
//!     .audience("https://api.example.com")
//!     .issuer("https://idp.example.com/")
//!     .build()?;
//! let gate = RequestGate::from_config(&config)?;
//!
//! match gate.check(authorization, "admin").await {
//!     GateOutcome::Authorized(claims) => println!("welcome {:?}", claims.sub),
//!     denied => println!("{}: {}", denied.status_code(), denied.public_message()),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Role authorization.
pub mod authz;
/// Configuration.
pub mod config;
/// Error types.
pub mod error;
/// Request gate.
pub mod gate;
/// JWKS sources and key parsing.
pub mod jwks;
/// JWT verification and claims.
pub mod jwt;
/// Cached key resolution.
pub mod key_resolver;
/// Replay detection.
pub mod replay;
/// Test helpers.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Algorithm and header validation.
pub mod validation;

// Re-export key types for convenience
pub use authz::{AuthzDecision, authorize, authorize_any};
pub use config::AuthConfig;
pub use error::{AuthError, AuthErrorKind, ConfigError, JwksError, Result};
pub use gate::{GateOutcome, RequestGate};
pub use jwks::{HttpJwksSource, JwksDocument, JwksSource, SigningKey, StaticJwksSource};
pub use jwt::{Audience, TokenClaims, TokenVerifier};
pub use key_resolver::{KeyResolver, KeySet, ResolverMetrics};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
