//! Configuration management for Linkguard.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `LINKGUARD__`-prefixed environment variables (`LINKGUARD__BACKEND__URL`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{LinkguardError, Result};
use crate::ratelimit::Environment;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "LINKGUARD";

/// Main configuration for the Linkguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkguardConfig {
    /// Selects the degradation policy
    #[serde(default)]
    pub environment: Environment,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Durable counter store configuration
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Shared secret for the internal state endpoints
    #[serde(default)]
    pub api_key: Option<String>,

    /// Take the client address from the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            api_key: None,
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Durable counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Redis connection URL; `rediss://` enables TLS
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key written by this service
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "linkguard:".to_string()
}

impl LinkguardConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        Self::from_builder(builder)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let builder = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml));
        Self::from_builder(builder)
    }

    fn from_builder(builder: ::config::ConfigBuilder<::config::builder::DefaultState>) -> Result<Self> {
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LinkguardError::Config(e.to_string()))
    }

    /// Reject configurations the process must not serve traffic with.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.backend.url {
            redis::Client::open(url.as_str()).map_err(|e| {
                LinkguardError::Config(format!("malformed backend URL: {}", e))
            })?;
        }

        if self.environment == Environment::Production {
            if self.backend.url.is_none() {
                return Err(LinkguardError::Config(
                    "backend.url is required in production".to_string(),
                ));
            }
            if self.server.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(LinkguardError::Config(
                    "server.api_key is required in production".to_string(),
                ));
            }
        }

        Ok(())
    }
}
