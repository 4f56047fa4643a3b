//! Configuration for bearer-token verification.
//!
//! [`AuthConfig`] carries everything the resolver, verifier and gate need:
//! where to fetch keys, which algorithm to accept, which audience and issuer
//! to expect, and how to cache keys.
//!
//! It can be built in code with [`AuthConfig::builder`] or deserialized from
//! any serde format, with durations written in humantime form (`"10m"`,
//! `"5s"`). Deserialized configurations should be checked with
//! [`AuthConfig::validate`]; the builder validates on `build()`.

use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, validation::ensure_accepted_algorithm};

/// Default key cache TTL (10 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Default JWKS fetch timeout (5 seconds).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default minimum interval between miss-triggered refreshes (5 seconds).
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Default maximum age of a key set served while the JWKS endpoint is down (1 hour).
///
/// This bounds the window during which a removed key could still be trusted
/// during an outage.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(3_600);

/// Default claim carrying the role list.
pub const DEFAULT_ROLES_CLAIM: &str = "roles";

/// Configuration for [`RequestGate`](crate::gate::RequestGate) and its collaborators.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use jsonwebtoken::Algorithm;
/// use jwks_authn::AuthConfig;
///
/// let config = AuthConfig::builder()
///     .jwks_url("https://idp.example.com/.well-known/jwks.json")
///     .algorithm(Algorithm::RS256)
///     .audience("my-api")
///     .issuer("https://idp.example.com/")
///     .cache_ttl(Duration::from_secs(300))
///     .build()?;
/// # Ok::<(), jwks_authn::ConfigError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// JWKS endpoint URL.
    pub(crate) jwks_url: String,

    /// The single permitted signing algorithm.
    #[serde(default = "default_algorithm")]
    pub(crate) algorithm: Algorithm,

    /// Expected `aud` claim.
    pub(crate) audience: String,

    /// Expected `iss` claim.
    pub(crate) issuer: String,

    /// Key cache TTL.
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub(crate) cache_ttl: Duration,

    /// Maximum wait for a JWKS fetch.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    pub(crate) fetch_timeout: Duration,

    /// Minimum interval between refreshes triggered by an unknown `kid`.
    #[serde(with = "humantime_serde", default = "default_min_refresh_interval")]
    pub(crate) min_refresh_interval: Duration,

    /// Maximum age of a key set served while refreshes fail.
    #[serde(with = "humantime_serde", default = "default_max_stale")]
    pub(crate) max_stale: Duration,

    /// Clock skew tolerance for `exp` and `nbf`.
    #[serde(with = "humantime_serde", default)]
    pub(crate) leeway: Duration,

    /// Name of the claim carrying the role list.
    #[serde(default = "default_roles_claim")]
    pub(crate) roles_claim: String,

    /// Optional interval for proactive background refresh.
    #[serde(with = "humantime_serde", default)]
    pub(crate) refresh_interval: Option<Duration>,
}

fn default_algorithm() -> Algorithm {
    Algorithm::RS256
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_min_refresh_interval() -> Duration {
    DEFAULT_MIN_REFRESH_INTERVAL
}

fn default_max_stale() -> Duration {
    DEFAULT_MAX_STALE
}

fn default_roles_claim() -> String {
    DEFAULT_ROLES_CLAIM.to_owned()
}

#[bon::bon]
impl AuthConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Arguments
    ///
    /// * `jwks_url` - JWKS endpoint URL (`http` or `https`).
    /// * `audience` - Expected `aud` claim.
    /// * `issuer` - Expected `iss` claim.
    ///
    /// # Optional Fields
    ///
    /// * `algorithm` - Permitted algorithm (default: RS256).
    /// * `cache_ttl` - Key cache TTL (default: 10 minutes).
    /// * `fetch_timeout` - JWKS fetch timeout (default: 5 seconds).
    /// * `min_refresh_interval` - Unknown-`kid` refresh rate limit (default: 5 seconds).
    /// * `max_stale` - Stale key set bound during outages (default: 1 hour).
    /// * `leeway` - Clock skew tolerance (default: zero).
    /// * `roles_claim` - Role list claim (default: `roles`).
    /// * `refresh_interval` - Background refresh interval (default: disabled).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any field fails [`validate`](Self::validate).
    #[builder]
    pub fn new(
        #[builder(into)] jwks_url: String,
        #[builder(default = default_algorithm())] algorithm: Algorithm,
        #[builder(into)] audience: String,
        #[builder(into)] issuer: String,
        #[builder(default = DEFAULT_CACHE_TTL)] cache_ttl: Duration,
        #[builder(default = DEFAULT_FETCH_TIMEOUT)] fetch_timeout: Duration,
        #[builder(default = DEFAULT_MIN_REFRESH_INTERVAL)] min_refresh_interval: Duration,
        #[builder(default = DEFAULT_MAX_STALE)] max_stale: Duration,
        #[builder(default)] leeway: Duration,
        #[builder(into, default = default_roles_claim())] roles_claim: String,
        refresh_interval: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            jwks_url,
            algorithm,
            audience,
            issuer,
            cache_ttl,
            fetch_timeout,
            min_refresh_interval,
            max_stale,
            leeway,
            roles_claim,
            refresh_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if:
    /// - `jwks_url` is not an absolute `http`/`https` URL
    /// - `algorithm` is symmetric or otherwise not accepted
    /// - `audience`, `issuer` or `roles_claim` is empty
    /// - `cache_ttl` or `fetch_timeout` is zero
    /// - `refresh_interval` is set to zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.jwks_url)
            .map_err(|e| ConfigError::invalid("jwks_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "jwks_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        ensure_accepted_algorithm(self.algorithm)?;

        if self.audience.is_empty() {
            return Err(ConfigError::invalid("audience", "must not be empty"));
        }
        if self.issuer.is_empty() {
            return Err(ConfigError::invalid("issuer", "must not be empty"));
        }
        if self.roles_claim.is_empty() {
            return Err(ConfigError::invalid("roles_claim", "must not be empty"));
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::invalid("cache_ttl", "must be greater than zero"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::invalid("fetch_timeout", "must be greater than zero"));
        }
        if self.refresh_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::invalid("refresh_interval", "must be greater than zero"));
        }

        Ok(())
    }

    /// Returns the JWKS endpoint URL.
    #[must_use]
    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Returns the permitted signing algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the expected audience.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Returns the expected issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the key cache TTL.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Returns the JWKS fetch timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Returns the minimum interval between miss-triggered refreshes.
    #[must_use]
    pub fn min_refresh_interval(&self) -> Duration {
        self.min_refresh_interval
    }

    /// Returns the stale key set bound.
    #[must_use]
    pub fn max_stale(&self) -> Duration {
        self.max_stale
    }

    /// Returns the clock skew tolerance.
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Returns the role list claim name.
    #[must_use]
    pub fn roles_claim(&self) -> &str {
        &self.roles_claim
    }

    /// Returns the background refresh interval, if enabled.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    macro_rules! base_builder {
        () => {
            AuthConfig::builder()
                .jwks_url("https://idp.example.com/.well-known/jwks.json")
                .audience("my-api")
                .issuer("https://idp.example.com/")
        };
    }

    #[test]
    fn test_valid_config_defaults() {
        let config = base_builder!().build().unwrap();

        assert_eq!(config.jwks_url(), "https://idp.example.com/.well-known/jwks.json");
        assert_eq!(config.algorithm(), Algorithm::RS256);
        assert_eq!(config.audience(), "my-api");
        assert_eq!(config.issuer(), "https://idp.example.com/");
        assert_eq!(config.cache_ttl(), DEFAULT_CACHE_TTL);
        assert_eq!(config.fetch_timeout(), DEFAULT_FETCH_TIMEOUT);
        assert_eq!(config.min_refresh_interval(), DEFAULT_MIN_REFRESH_INTERVAL);
        assert_eq!(config.max_stale(), DEFAULT_MAX_STALE);
        assert_eq!(config.leeway(), Duration::ZERO);
        assert_eq!(config.roles_claim(), "roles");
        assert!(config.refresh_interval().is_none());
    }

    #[test]
    fn test_custom_values() {
        let config = base_builder!()
            .algorithm(Algorithm::EdDSA)
            .cache_ttl(Duration::from_secs(60))
            .fetch_timeout(Duration::from_secs(2))
            .leeway(Duration::from_secs(30))
            .roles_claim("https://example.com/roles")
            .refresh_interval(Duration::from_secs(120))
            .build()
            .unwrap();

        assert_eq!(config.algorithm(), Algorithm::EdDSA);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(2));
        assert_eq!(config.leeway(), Duration::from_secs(30));
        assert_eq!(config.roles_claim(), "https://example.com/roles");
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_validation_rejects_symmetric_algorithm() {
        let result = base_builder!().algorithm(Algorithm::HS256).build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "algorithm", .. })));
    }

    #[test]
    fn test_validation_rejects_bad_url() {
        let result = AuthConfig::builder()
            .jwks_url("not a url")
            .audience("my-api")
            .issuer("https://idp.example.com/")
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "jwks_url", .. })));

        let result = AuthConfig::builder()
            .jwks_url("ftp://idp.example.com/jwks.json")
            .audience("my-api")
            .issuer("https://idp.example.com/")
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "jwks_url", .. })));
    }

    #[test]
    fn test_validation_rejects_empty_audience_and_issuer() {
        let result = AuthConfig::builder()
            .jwks_url("https://idp.example.com/jwks.json")
            .audience("")
            .issuer("https://idp.example.com/")
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "audience", .. })));

        let result = AuthConfig::builder()
            .jwks_url("https://idp.example.com/jwks.json")
            .audience("my-api")
            .issuer("")
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "issuer", .. })));
    }

    #[test]
    fn test_validation_rejects_zero_durations() {
        let result = base_builder!().cache_ttl(Duration::ZERO).build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "cache_ttl", .. })));

        let result = base_builder!().fetch_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "fetch_timeout", .. })));

        let result = base_builder!().refresh_interval(Duration::ZERO).build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "refresh_interval", .. })));
    }

    #[test]
    fn test_deserialization_with_defaults() {
        let json = r#"{
            "jwks_url": "https://idp.example.com/.well-known/jwks.json",
            "audience": "my-api",
            "issuer": "https://idp.example.com/"
        }"#;

        let config: AuthConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.algorithm, Algorithm::RS256);
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(config.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        assert_eq!(config.roles_claim, DEFAULT_ROLES_CLAIM);
    }

    #[test]
    fn test_deserialization_humantime_durations() {
        let json = r#"{
            "jwks_url": "https://idp.example.com/.well-known/jwks.json",
            "algorithm": "ES256",
            "audience": "my-api",
            "issuer": "https://idp.example.com/",
            "cache_ttl": "15m",
            "fetch_timeout": "2s",
            "leeway": "30s",
            "refresh_interval": "5m"
        }"#;

        let config: AuthConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.algorithm(), Algorithm::ES256);
        assert_eq!(config.cache_ttl(), Duration::from_secs(900));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(2));
        assert_eq!(config.leeway(), Duration::from_secs(30));
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_deserialization_rejects_unknown_fields() {
        let json = r#"{
            "jwks_url": "https://idp.example.com/.well-known/jwks.json",
            "audience": "my-api",
            "issuer": "https://idp.example.com/",
            "algorithms": ["RS256"]
        }"#;

        assert!(serde_json::from_str::<AuthConfig>(json).is_err());
    }
}
