//! Shared test utilities for token verification.
//!
//! Signing keys with matching JWKs, token builders, a scripted
//! [`JwksSource`](crate::jwks::JwksSource), and helpers for crafting raw
//! (possibly hostile) JWT strings. Feature-gated behind `testutil` to keep it
//! out of production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! jwks-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use jwks_authn::testutil::{TestKey, jwks, standard_claims};
//!
//! let key = TestKey::rsa_primary("key-1");
//! let token = key.sign(&standard_claims(&["admin"]));
//! let document = jwks(&[&key]);
//! ```

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rand_core::OsRng;
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::{
    error::JwksError,
    jwks::{JwksDocument, JwksSource},
};

/// Audience used by [`standard_claims`].
pub const TEST_AUDIENCE: &str = "https://api.example.com";

/// Issuer used by [`standard_claims`].
pub const TEST_ISSUER: &str = "https://idp.example.com/";

/// Subject used by [`standard_claims`].
pub const TEST_SUBJECT: &str = "user-123";

const RSA_PRIMARY_PEM: &str = include_str!("testutil_keys/rsa_primary.pem");
const RSA_PRIMARY_N: &str = include_str!("testutil_keys/rsa_primary.n");
const RSA_ROTATED_PEM: &str = include_str!("testutil_keys/rsa_rotated.pem");
const RSA_ROTATED_N: &str = include_str!("testutil_keys/rsa_rotated.n");

/// A private signing key paired with its public JWK.
pub struct TestKey {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    jwk: Value,
}

impl std::fmt::Debug for TestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TestKey {
    /// The primary 2048-bit RSA test key, published for RS256.
    ///
    /// # Panics
    ///
    /// Panics if the bundled PEM cannot be parsed.
    pub fn rsa_primary(kid: &str) -> Self {
        Self::rsa(kid, RSA_PRIMARY_PEM, RSA_PRIMARY_N)
    }

    /// A second RSA key, for rotation scenarios.
    ///
    /// # Panics
    ///
    /// Panics if the bundled PEM cannot be parsed.
    pub fn rsa_rotated(kid: &str) -> Self {
        Self::rsa(kid, RSA_ROTATED_PEM, RSA_ROTATED_N)
    }

    #[allow(clippy::expect_used)]
    fn rsa(kid: &str, pem: &str, modulus: &str) -> Self {
        let encoding_key =
            EncodingKey::from_rsa_pem(pem.as_bytes()).expect("bundled RSA test key must parse");
        let jwk = json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": modulus.trim(),
            "e": "AQAB",
        });
        Self { kid: kid.to_owned(), algorithm: Algorithm::RS256, encoding_key, jwk }
    }

    /// A freshly generated Ed25519 key, published for EdDSA.
    pub fn ed25519(kid: &str) -> Self {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
        let mut pkcs8_der = Zeroizing::new(vec![
            0x30, 0x2e, // SEQUENCE, 46 bytes
            0x02, 0x01, 0x00, // INTEGER version 0
            0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
            0x04, 0x22, // OCTET STRING, 34 bytes
            0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
        ]);
        pkcs8_der.extend_from_slice(&*private_bytes);

        let jwk = json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "use": "sig",
            "alg": "EdDSA",
            "kid": kid,
            "x": public_key,
        });
        Self {
            kid: kid.to_owned(),
            algorithm: Algorithm::EdDSA,
            encoding_key: EncodingKey::from_ed_der(&pkcs8_der),
            jwk,
        }
    }

    /// Key ID.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Algorithm this key signs with.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Public JWK for this key.
    #[must_use]
    pub fn jwk(&self) -> Value {
        self.jwk.clone()
    }

    /// Signs `claims` with this key's algorithm and `kid`.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails.
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        self.sign_with_header(&header, claims)
    }

    /// Signs `claims` with a header that carries no `kid`.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails.
    pub fn sign_without_kid(&self, claims: &Value) -> String {
        self.sign_with_header(&Header::new(self.algorithm), claims)
    }

    /// Signs `claims` with an arbitrary header.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails, e.g. if `header.alg` does not fit this key.
    #[allow(clippy::expect_used)]
    pub fn sign_with_header(&self, header: &Header, claims: &Value) -> String {
        jsonwebtoken::encode(header, claims, &self.encoding_key).expect("failed to encode test JWT")
    }
}

/// A JWKS JSON document publishing `keys`.
#[must_use]
pub fn jwks(keys: &[&TestKey]) -> Value {
    json!({ "keys": keys.iter().map(|key| key.jwk()).collect::<Vec<_>>() })
}

/// A [`JwksDocument`] publishing `keys`.
#[must_use]
pub fn jwks_document(keys: &[&TestKey]) -> JwksDocument {
    JwksDocument::new(keys.iter().map(|key| key.jwk()).collect())
}

/// Valid claims for [`TEST_AUDIENCE`] and [`TEST_ISSUER`], expiring in one hour.
#[must_use]
pub fn standard_claims(roles: &[&str]) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "sub": TEST_SUBJECT,
        "aud": TEST_AUDIENCE,
        "iss": TEST_ISSUER,
        "exp": now + 3600,
        "iat": now,
        "roles": roles,
    })
}

/// Builds `{header}.{payload}.{signature}` from arbitrary parts.
///
/// Useful for tokens no honest signer would produce (`alg: "none"`,
/// algorithm confusion, forged signatures).
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[allow(clippy::expect_used)]
pub fn craft_raw_jwt(header: &Value, payload: &Value, signature: &[u8]) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("header json"));
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).expect("payload json"));
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);
    format!("{header_b64}.{payload_b64}.{signature_b64}")
}

/// A [`JwksSource`] that counts fetches and can be told to stall or fail.
#[derive(Debug, Default)]
pub struct ScriptedJwksSource {
    document: Mutex<JwksDocument>,
    failure: Mutex<Option<String>>,
    delay: Duration,
    fetches: AtomicUsize,
}

impl ScriptedJwksSource {
    /// Creates a source serving `document`.
    #[must_use]
    pub fn new(document: JwksDocument) -> Self {
        Self { document: Mutex::new(document), ..Self::default() }
    }

    /// Makes every fetch wait `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the served document.
    pub fn set_document(&self, document: JwksDocument) {
        *self.document.lock() = document;
    }

    /// Makes fetches fail with `message`, or succeed again with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_owned);
    }

    /// Number of fetches so far, including failed ones.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JwksSource for ScriptedJwksSource {
    async fn fetch(&self) -> Result<JwksDocument, JwksError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failure = self.failure.lock().clone();
        match failure {
            Some(message) => Err(JwksError::Http { url: "scripted".to_owned(), message, source: None }),
            None => Ok(self.document.lock().clone()),
        }
    }

    fn describe(&self) -> &str {
        "scripted"
    }
}

/// Asserts that a [`Result<T, AuthError>`] is an `Err` matching the given
/// [`AuthError`](crate::error::AuthError) variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use jwks_authn::assert_auth_error;
/// use jwks_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::expired());
/// assert_auth_error!(result, Expired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
