//! Configuration management for Sentinel.
//!
//! The raw configuration is what operators write (YAML file plus
//! `SENTINEL_*` environment overrides). Durations are humantime strings
//! such as `"4s"` or `"10m"`; [`RateLimitingConfig::validate`] turns the
//! raw values into typed [`LimiterSettings`] and is the only place a
//! malformed value is reported.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SentinelError};
use crate::ratelimit::LimitConfig;

/// Main configuration for the Sentinel service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

/// How requests bearing a token are grouped into counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    /// One counter per source address and token pair.
    Address,
    /// One counter per token, shared by every address presenting it.
    Token,
}

/// What the limiter answers when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request.
    Open,
    /// Reject the request.
    Closed,
}

/// Rate limiting configuration as written by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per window for anonymous clients
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Disable duration for anonymous clients
    #[serde(default = "default_window")]
    pub window: String,

    /// Requests admitted per window for token-bearing clients
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// Disable duration for token-bearing clients
    #[serde(default = "default_window")]
    pub token_window: String,

    /// Interval between eviction sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,

    /// Inactivity after which a record may be evicted
    #[serde(default = "default_ttl")]
    pub ttl: String,

    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Connection URL of the external store
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix used in the external store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Request header carrying the client token
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Take the client address from `X-Forwarded-For` when present
    #[serde(default = "default_trust_forwarded_for")]
    pub trust_forwarded_for: bool,

    #[serde(default = "default_token_scope")]
    pub token_scope: TokenScope,

    #[serde(default = "default_failure_policy")]
    pub on_backend_error: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window: default_window(),
            token_limit: default_token_limit(),
            token_window: default_window(),
            cleanup_interval: default_cleanup_interval(),
            ttl: default_ttl(),
            backend: default_backend(),
            redis_url: default_redis_url(),
            namespace: default_namespace(),
            token_header: default_token_header(),
            trust_forwarded_for: default_trust_forwarded_for(),
            token_scope: default_token_scope(),
            on_backend_error: default_failure_policy(),
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_token_limit() -> u64 {
    100
}

fn default_window() -> String {
    "1s".to_string()
}

fn default_cleanup_interval() -> String {
    "1m".to_string()
}

fn default_ttl() -> String {
    "10m".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "sentinel".to_string()
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

fn default_trust_forwarded_for() -> bool {
    true
}

fn default_token_scope() -> TokenScope {
    TokenScope::Address
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Open
}

/// Typed counter store selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis { url: String, namespace: String },
}

/// Validated, immutable limiter settings.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Limit and window for clients without a token
    pub anonymous: LimitConfig,
    /// Limit and window for clients presenting a token
    pub token: LimitConfig,
    pub cleanup_interval: Duration,
    pub ttl: Duration,
    pub backend: StorageBackend,
    pub token_header: String,
    pub trust_forwarded_for: bool,
    pub token_scope: TokenScope,
    pub on_backend_error: FailurePolicy,
}

impl LimiterSettings {
    /// Settings for an in-memory limiter with the given limit classes and
    /// default values for everything else.
    pub fn in_memory(anonymous: LimitConfig, token: LimitConfig) -> Self {
        Self {
            anonymous,
            token,
            cleanup_interval: Duration::from_secs(60),
            ttl: Duration::from_secs(600),
            backend: StorageBackend::Memory,
            token_header: default_token_header(),
            trust_forwarded_for: default_trust_forwarded_for(),
            token_scope: default_token_scope(),
            on_backend_error: default_failure_policy(),
        }
    }
}

impl RateLimitingConfig {
    /// Check every field and convert durations.
    pub fn validate(&self) -> Result<LimiterSettings> {
        let anonymous = LimitConfig {
            limit: positive("limit", self.limit)?,
            window: parse_duration("window", &self.window)?,
        };
        let token = LimitConfig {
            limit: positive("token_limit", self.token_limit)?,
            window: parse_duration("token_window", &self.token_window)?,
        };
        let cleanup_interval = parse_duration("cleanup_interval", &self.cleanup_interval)?;
        let ttl = parse_duration("ttl", &self.ttl)?;

        let backend = match self.backend {
            BackendKind::Memory => StorageBackend::Memory,
            BackendKind::Redis => {
                if self.redis_url.trim().is_empty() {
                    return Err(SentinelError::Config(
                        "redis_url is required when backend is redis".to_string(),
                    ));
                }
                if self.namespace.trim().is_empty() {
                    return Err(SentinelError::Config(
                        "namespace must not be empty".to_string(),
                    ));
                }
                StorageBackend::Redis {
                    url: self.redis_url.trim().to_string(),
                    namespace: self.namespace.trim().to_string(),
                }
            }
        };

        if self.token_header.trim().is_empty() {
            return Err(SentinelError::Config(
                "token_header must not be empty".to_string(),
            ));
        }

        Ok(LimiterSettings {
            anonymous,
            token,
            cleanup_interval,
            ttl,
            backend,
            token_header: self.token_header.trim().to_string(),
            trust_forwarded_for: self.trust_forwarded_for,
            token_scope: self.token_scope,
            on_backend_error: self.on_backend_error,
        })
    }
}

fn positive(field: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(SentinelError::Config(format!("{} must be greater than zero", field)));
    }
    Ok(value)
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value.trim())
        .map_err(|e| SentinelError::Config(format!("invalid {} {:?}: {}", field, value, e)))?;
    if duration.is_zero() {
        return Err(SentinelError::Config(format!("{} must be greater than zero", field)));
    }
    Ok(duration)
}

impl SentinelConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SentinelConfig = serde_yaml::from_str(&contents)
            .map_err(|e| SentinelError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file and the
    /// environment, in increasing order of precedence.
    ///
    /// Environment keys use `SENTINEL_` followed by the section and field
    /// joined with `__`, e.g. `SENTINEL_RATE_LIMITING__LIMIT=5`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&SentinelConfig::default())
            .map_err(|e| SentinelError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SENTINEL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SentinelError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let settings = tokio_test::assert_ok!(RateLimitingConfig::default().validate());

        assert_eq!(settings.anonymous.limit, 10);
        assert_eq!(settings.anonymous.window, Duration::from_secs(1));
        assert_eq!(settings.token.limit, 100);
        assert_eq!(settings.cleanup_interval, Duration::from_secs(60));
        assert_eq!(settings.ttl, Duration::from_secs(600));
        assert_eq!(settings.backend, StorageBackend::Memory);
        assert_eq!(settings.token_scope, TokenScope::Address);
        assert_eq!(settings.on_backend_error, FailurePolicy::Open);
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
rate_limiting:
  limit: 5
  window: 4s
  token_limit: 20
  token_window: 500ms
  backend: redis
  redis_url: redis://cache:6379
  token_scope: token
  on_backend_error: closed
"#;
        let config: SentinelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);

        let settings = config.rate_limiting.validate().unwrap();
        assert_eq!(settings.anonymous.limit, 5);
        assert_eq!(settings.anonymous.window, Duration::from_secs(4));
        assert_eq!(settings.token.window, Duration::from_millis(500));
        assert_eq!(
            settings.backend,
            StorageBackend::Redis {
                url: "redis://cache:6379".to_string(),
                namespace: "sentinel".to_string(),
            }
        );
        assert_eq!(settings.token_scope, TokenScope::Token);
        assert_eq!(settings.on_backend_error, FailurePolicy::Closed);
    }

    #[test]
    fn test_malformed_duration_rejected() {
        let config = RateLimitingConfig {
            window: "four seconds".to_string(),
            ..Default::default()
        };

        let err = tokio_test::assert_err!(config.validate());
        assert!(matches!(err, SentinelError::Config(_)));
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let zero_limit = RateLimitingConfig {
            token_limit: 0,
            ..Default::default()
        };
        assert!(zero_limit.validate().is_err());

        let zero_interval = RateLimitingConfig {
            cleanup_interval: "0s".to_string(),
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_redis_requires_url() {
        let config = RateLimitingConfig {
            backend: BackendKind::Redis,
            redis_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = SentinelConfig::load(None).unwrap();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.rate_limiting.namespace, "sentinel");
    }
}
