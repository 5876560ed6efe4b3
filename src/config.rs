//! Bridge configuration
//!
//! Settings are read from the environment (a `.env` file is loaded first when
//! present). Only the management API URL and credentials are required; every
//! other knob has a default.

use crate::error::ConfigError;
use std::time::Duration;
use url::Url;

/// Management API base URL
pub const ENV_API_URL: &str = "EMQX_API_URL";
/// API key (or dashboard username in bearer mode)
pub const ENV_API_KEY: &str = "EMQX_API_KEY";
/// API secret (or dashboard password in bearer mode)
pub const ENV_API_SECRET: &str = "EMQX_API_SECRET";
const ENV_AUTH_MODE: &str = "EMQX_AUTH_MODE";
const ENV_MQTT_URL: &str = "EMQX_MQTT_URL";
const ENV_MQTT_USERNAME: &str = "EMQX_MQTT_USERNAME";
const ENV_MQTT_PASSWORD: &str = "EMQX_MQTT_PASSWORD";
const ENV_MQTT_CLIENT_PREFIX: &str = "EMQX_MQTT_CLIENT_PREFIX";
const ENV_HTTP_POOL_SIZE: &str = "EMQX_HTTP_POOL_SIZE";
const ENV_MQTT_POOL_SIZE: &str = "EMQX_MQTT_POOL_SIZE";
const ENV_REQUEST_TIMEOUT_MS: &str = "EMQX_REQUEST_TIMEOUT_MS";
const ENV_MAX_RETRIES: &str = "EMQX_MAX_RETRIES";
const ENV_RETRY_BASE_MS: &str = "EMQX_RETRY_BASE_MS";
const ENV_RETRY_MAX_MS: &str = "EMQX_RETRY_MAX_MS";
const ENV_QUEUE_CAPACITY: &str = "EMQX_QUEUE_CAPACITY";

/// Default per-subscription queue bound
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How requests to the management API are authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// `Authorization: Basic base64(key:secret)` (EMQX API keys)
    #[default]
    Basic,
    /// `POST /login` with key/secret as username/password, then `Bearer <token>`
    Bearer,
}

impl std::str::FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "" => Ok(AuthMode::Basic),
            "bearer" | "token" => Ok(AuthMode::Bearer),
            other => Err(ConfigError::Invalid {
                var: ENV_AUTH_MODE.to_string(),
                message: format!("unknown auth mode '{}'", other),
            }),
        }
    }
}

/// Full bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Management API base URL, e.g. `https://host:18083/api/v5`
    pub api_url: String,
    /// API key
    pub api_key: String,
    /// API secret
    pub api_secret: String,
    /// Authentication scheme
    pub auth_mode: AuthMode,
    /// MQTT listener URL (`mqtt://host:1883`); relay disabled when absent
    pub mqtt_url: Option<String>,
    /// MQTT username
    pub mqtt_username: Option<String>,
    /// MQTT password
    pub mqtt_password: Option<String>,
    /// Client id prefix for relay connections
    pub mqtt_client_prefix: String,
    /// Max idle and max in-flight HTTP connections
    pub http_pool_size: usize,
    /// Number of relay MQTT connections
    pub mqtt_pool_size: usize,
    /// Deadline for each management API call
    pub request_timeout: Duration,
    /// Retries for idempotent management API calls
    pub max_retries: u32,
    /// First retry delay
    pub retry_base: Duration,
    /// Retry delay ceiling
    pub retry_max: Duration,
    /// Per-subscription event queue bound
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            auth_mode: AuthMode::Basic,
            mqtt_url: None,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_prefix: "emqx-mcp".to_string(),
            http_pool_size: 8,
            mqtt_pool_size: 2,
            request_timeout: Duration::from_millis(30_000),
            max_retries: 3,
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_millis(5_000),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Create a new config builder
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            api_url: lookup(ENV_API_URL).unwrap_or_default(),
            api_key: lookup(ENV_API_KEY).unwrap_or_default(),
            api_secret: lookup(ENV_API_SECRET).unwrap_or_default(),
            auth_mode: match non_empty(ENV_AUTH_MODE) {
                Some(v) => v.parse()?,
                None => defaults.auth_mode,
            },
            mqtt_url: non_empty(ENV_MQTT_URL),
            mqtt_username: non_empty(ENV_MQTT_USERNAME),
            mqtt_password: non_empty(ENV_MQTT_PASSWORD),
            mqtt_client_prefix: non_empty(ENV_MQTT_CLIENT_PREFIX)
                .unwrap_or(defaults.mqtt_client_prefix),
            http_pool_size: parse_num(&lookup, ENV_HTTP_POOL_SIZE, defaults.http_pool_size)?,
            mqtt_pool_size: parse_num(&lookup, ENV_MQTT_POOL_SIZE, defaults.mqtt_pool_size)?,
            request_timeout: Duration::from_millis(parse_num(
                &lookup,
                ENV_REQUEST_TIMEOUT_MS,
                defaults.request_timeout.as_millis() as u64,
            )?),
            max_retries: parse_num(&lookup, ENV_MAX_RETRIES, defaults.max_retries)?,
            retry_base: Duration::from_millis(parse_num(
                &lookup,
                ENV_RETRY_BASE_MS,
                defaults.retry_base.as_millis() as u64,
            )?),
            retry_max: Duration::from_millis(parse_num(
                &lookup,
                ENV_RETRY_MAX_MS,
                defaults.retry_max.as_millis() as u64,
            )?),
            queue_capacity: parse_num(&lookup, ENV_QUEUE_CAPACITY, defaults.queue_capacity)?,
        })
    }

    /// Check that all required settings are present and usable
    ///
    /// Every missing required variable is reported in a single error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.api_url.is_empty() {
            missing.push(ENV_API_URL.to_string());
        }
        if self.api_key.is_empty() {
            missing.push(ENV_API_KEY.to_string());
        }
        if self.api_secret.is_empty() {
            missing.push(ENV_API_SECRET.to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Url::parse(&self.api_url).map_err(|e| ConfigError::Invalid {
            var: ENV_API_URL.to_string(),
            message: e.to_string(),
        })?;

        if let Some(ref mqtt) = self.mqtt_url {
            let url = Url::parse(mqtt).map_err(|e| ConfigError::Invalid {
                var: ENV_MQTT_URL.to_string(),
                message: e.to_string(),
            })?;
            if !matches!(url.scheme(), "mqtt" | "tcp") {
                return Err(ConfigError::Invalid {
                    var: ENV_MQTT_URL.to_string(),
                    message: format!("unsupported scheme '{}'", url.scheme()),
                });
            }
        }

        for (var, value) in [
            (ENV_HTTP_POOL_SIZE, self.http_pool_size),
            (ENV_MQTT_POOL_SIZE, self.mqtt_pool_size),
            (ENV_QUEUE_CAPACITY, self.queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    var: var.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Whether the live MQTT relay is enabled
    pub fn relay_enabled(&self) -> bool {
        self.mqtt_url.is_some()
    }
}

fn parse_num<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Builder for BridgeConfig
#[derive(Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Set management API URL
    pub fn api_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_url = url.into();
        self
    }

    /// Set API key and secret
    pub fn credentials<K: Into<String>, S: Into<String>>(mut self, key: K, secret: S) -> Self {
        self.config.api_key = key.into();
        self.config.api_secret = secret.into();
        self
    }

    /// Set auth mode
    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.config.auth_mode = mode;
        self
    }

    /// Enable the relay against this MQTT URL
    pub fn mqtt_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.mqtt_url = Some(url.into());
        self
    }

    /// Set HTTP pool size
    pub fn http_pool_size(mut self, size: usize) -> Self {
        self.config.http_pool_size = size;
        self
    }

    /// Set relay connection count
    pub fn mqtt_pool_size(mut self, size: usize) -> Self {
        self.config.mqtt_pool_size = size;
        self
    }

    /// Set per-call deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set retry policy for idempotent calls
    pub fn retries(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_base = base;
        self.config.retry_max = max;
        self
    }

    /// Set per-subscription queue bound
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Build the config
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}
