//! JWKS documents, sources and signing keys.
//!
//! A [`JwksSource`] produces a raw [`JwksDocument`]; [`parse_key_set`] turns
//! it into verification keys indexed by key id. Entries that cannot be used
//! for signature verification are skipped individually, so one odd key in an
//! identity provider's set never takes the whole set down.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, jwk::Jwk};
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, JwksError};

/// Maximum accepted JWKS response body (1 MiB).
pub const MAX_JWKS_BODY_BYTES: usize = 1024 * 1024;

/// A JSON Web Key Set as published by an identity provider.
///
/// Keys are kept as raw JSON so each entry can be parsed on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwksDocument {
    /// The published keys.
    pub keys: Vec<Value>,
}

impl JwksDocument {
    /// Creates a document from raw JWK values.
    #[must_use]
    pub fn new(keys: Vec<Value>) -> Self {
        Self { keys }
    }
}

/// A public key able to verify token signatures.
///
/// Immutable once parsed; shared as `Arc<SigningKey>` between the key set
/// and in-flight verifications.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Option<Algorithm>,
    key: DecodingKey,
}

impl SigningKey {
    /// Creates a signing key from its parts.
    pub fn new(kid: impl Into<String>, algorithm: Option<Algorithm>, key: DecodingKey) -> Self {
        Self { kid: kid.into(), algorithm, key }
    }

    /// Key id (`kid`).
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Algorithm the JWK is restricted to, if it declares one.
    #[must_use]
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// The verification key material.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Where JWKS documents come from.
///
/// The resolver calls [`fetch`](Self::fetch) under its refresh permit, so an
/// implementation never sees concurrent fetches from the same resolver.
#[async_trait]
pub trait JwksSource: Send + Sync {
    /// Fetches the current key set.
    ///
    /// # Errors
    ///
    /// Returns a [`JwksError`] if the document could not be retrieved or is
    /// not a JWKS document.
    async fn fetch(&self) -> Result<JwksDocument, JwksError>;

    /// Human-readable location, used in logs.
    fn describe(&self) -> &str;
}

/// Fetches the key set from an HTTP(S) endpoint.
#[derive(Debug, Clone)]
pub struct HttpJwksSource {
    url: String,
    client: reqwest::Client,
}

impl HttpJwksSource {
    /// Creates a source for `url` whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;
        Ok(Self { url: url.into(), client })
    }

    /// Creates a source around an existing client.
    ///
    /// The client's own timeout applies to fetches.
    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self { url: url.into(), client }
    }

    fn transport_error(&self, err: reqwest::Error) -> JwksError {
        if err.is_timeout() {
            JwksError::Timeout { url: self.url.clone() }
        } else {
            JwksError::Http {
                url: self.url.clone(),
                message: err.to_string(),
                source: Some(Arc::new(err)),
            }
        }
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    #[tracing::instrument(skip(self), fields(jwks_url = %self.url))]
    async fn fetch(&self) -> Result<JwksDocument, JwksError> {
        let mut response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JwksError::Status { url: self.url.clone(), status: status.as_u16() });
        }

        let too_large =
            || JwksError::BodyTooLarge { url: self.url.clone(), limit: MAX_JWKS_BODY_BYTES };
        if response.content_length().is_some_and(|len| len > MAX_JWKS_BODY_BYTES as u64) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            if body.len() + chunk.len() > MAX_JWKS_BODY_BYTES {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        let document: JwksDocument = serde_json::from_slice(&body)
            .map_err(|e| JwksError::Parse { url: self.url.clone(), message: e.to_string() })?;

        tracing::debug!(keys = document.keys.len(), "fetched JWKS document");
        Ok(document)
    }

    fn describe(&self) -> &str {
        &self.url
    }
}

/// An in-memory key set, replaceable at runtime.
///
/// Useful for identity providers whose keys are distributed out of band, and
/// for tests that rotate keys.
#[derive(Debug, Default)]
pub struct StaticJwksSource {
    document: RwLock<JwksDocument>,
}

impl StaticJwksSource {
    /// Creates a source serving `document`.
    #[must_use]
    pub fn new(document: JwksDocument) -> Self {
        Self { document: RwLock::new(document) }
    }

    /// Replaces the served document. Takes effect on the resolver's next fetch.
    pub fn replace(&self, document: JwksDocument) {
        *self.document.write() = document;
    }
}

#[async_trait]
impl JwksSource for StaticJwksSource {
    async fn fetch(&self) -> Result<JwksDocument, JwksError> {
        Ok(self.document.read().clone())
    }

    fn describe(&self) -> &str {
        "static"
    }
}

/// Parses every usable entry of `document` into a signing key.
///
/// An entry is skipped (with a debug log) when it has no `kid`, declares a
/// `use` other than `sig`, carries symmetric (`oct`) material, names an
/// unknown `alg`, or its key material cannot be decoded. When two entries
/// share a `kid`, the first one wins.
#[must_use]
pub fn parse_key_set(document: &JwksDocument) -> HashMap<String, Arc<SigningKey>> {
    let mut keys = HashMap::with_capacity(document.keys.len());

    for (index, entry) in document.keys.iter().enumerate() {
        match parse_key(entry) {
            Ok(key) => {
                if keys.contains_key(key.kid()) {
                    tracing::warn!(kid = key.kid(), "duplicate kid in JWKS document, keeping first");
                    continue;
                }
                keys.insert(key.kid().to_owned(), Arc::new(key));
            },
            Err(reason) => {
                tracing::debug!(index, reason = %reason, "skipping unusable JWK");
            },
        }
    }

    keys
}

fn parse_key(entry: &Value) -> Result<SigningKey, String> {
    let kid = match entry.get("kid") {
        Some(Value::String(kid)) if !kid.is_empty() => kid.clone(),
        _ => return Err("missing kid".to_owned()),
    };

    if let Some(key_use) = entry.get("use")
        && key_use.as_str() != Some("sig")
    {
        return Err(format!("kid '{kid}' is not a signature key"));
    }

    if entry.get("kty").and_then(Value::as_str) == Some("oct") {
        return Err(format!("kid '{kid}' is a symmetric key"));
    }

    let algorithm = match entry.get("alg") {
        None | Some(Value::Null) => None,
        Some(Value::String(alg)) => Some(
            Algorithm::from_str(alg).map_err(|_| format!("kid '{kid}' has unknown alg '{alg}'"))?,
        ),
        Some(_) => return Err(format!("kid '{kid}' has a non-string alg")),
    };

    let jwk: Jwk = serde_json::from_value(entry.clone())
        .map_err(|e| format!("kid '{kid}' is not a supported JWK: {e}"))?;
    let key = DecodingKey::from_jwk(&jwk)
        .map_err(|e| format!("kid '{kid}' has unusable key material: {e}"))?;

    Ok(SigningKey::new(kid, algorithm, key))
}
