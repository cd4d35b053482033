//! Process-wide configuration (C14, §4.16). Layered `File` + `Environment`
//! sources via the `config` crate, matching the teacher's
//! `engine/src/settings.rs` pattern: one `Settings` root struct, deserialized
//! once at startup, then passed down by reference.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::circuit_breaker::BreakerConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::registry::{ConfigError, ProviderName, ProviderRegistry, ProviderRuntimeConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub name: ProviderName,
    pub enabled: bool,
    pub priority: u32,
    pub network: String,
    #[serde(default)]
    pub timeout_override_ms: Option<u64>,
    #[serde(default)]
    pub retries_override: Option<u32>,
    #[serde(default)]
    pub rate_limit_override: Option<RateLimitSettings>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitSettings {
    pub per_second: Option<u32>,
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub burst: Option<u32>,
}

impl From<RateLimitSettings> for RateLimitConfig {
    fn from(s: RateLimitSettings) -> Self {
        RateLimitConfig { per_second: s.per_second, per_minute: s.per_minute, per_hour: s.per_hour, burst: s.burst }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_backoff_factor() -> u32 {
    2
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl From<&HttpSettings> for crate::http_client::HttpClientConfig {
    fn from(s: &HttpSettings) -> Self {
        crate::http_client::HttpClientConfig {
            timeout: Duration::from_secs(s.timeout_secs),
            max_attempts: s.max_attempts,
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            backoff_factor: s.backoff_factor,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_half_open_probe_count")]
    pub half_open_probe_count: u32,
}

fn default_max_failures() -> u32 {
    5
}
fn default_open_timeout_secs() -> u64 {
    60
}
fn default_half_open_probe_count() -> u32 {
    1
}

impl From<&CircuitBreakerSettings> for BreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        BreakerConfig {
            max_failures: s.max_failures,
            open_timeout: Duration::from_secs(s.open_timeout_secs),
            half_open_probe_count: s.half_open_probe_count,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    1024
}
fn default_cache_ttl_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkingSettings {
    #[serde(default = "default_min_amount_similarity")]
    pub min_amount_similarity: f64,
    #[serde(default = "default_max_variance")]
    pub max_variance: f64,
    #[serde(default = "default_time_window_hours")]
    pub time_window_hours: i64,
}

fn default_min_amount_similarity() -> f64 {
    0.95
}
fn default_max_variance() -> f64 {
    0.10
}
fn default_time_window_hours() -> i64 {
    24
}

impl Default for LinkingSettings {
    fn default() -> Self {
        LinkingSettings {
            min_amount_similarity: default_min_amount_similarity(),
            max_variance: default_max_variance(),
            time_window_hours: default_time_window_hours(),
        }
    }
}

/// Process-wide root settings object (§4.16, §6). Loaded once at process
/// start via [`Settings::load`] and shared read-only thereafter, the same
/// discipline the provider registry follows.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub linking: LinkingSettings,
    /// Per-blockchain ordered provider lists (§6 "Configuration file").
    pub providers: HashMap<String, Vec<ProviderSettings>>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        CircuitBreakerSettings {
            max_failures: default_max_failures(),
            open_timeout_secs: default_open_timeout_secs(),
            half_open_probe_count: default_half_open_probe_count(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings { capacity: default_cache_capacity(), ttl_secs: default_cache_ttl_secs() }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("configuration references unknown providers: {0:?}")]
    InvalidProviders(Vec<ConfigError>),
}

impl Settings {
    /// Layers, in increasing priority: an optional `config/default.{json,
    /// toml}` file, an optional file named by `APP_ENV` (e.g.
    /// `config/production.json`), then `APP_`-prefixed environment
    /// variables (`APP_DATABASE_URL`, `APP_LOG_LEVEL`, …), matching the
    /// teacher's settings-loading convention.
    pub fn load() -> Result<Self, SettingsError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));
        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Validates every configured provider name against the registry
    /// (§6: "unknown provider names are fatal").
    pub fn validate_against_registry(&self, registry: &ProviderRegistry) -> Result<(), SettingsError> {
        let mut all_errors = Vec::new();
        for (blockchain, providers) in &self.providers {
            let configured: Vec<(ProviderName, ProviderRuntimeConfig)> = providers
                .iter()
                .map(|p| {
                    (
                        p.name.clone(),
                        ProviderRuntimeConfig {
                            enabled: p.enabled,
                            priority: p.priority,
                            timeout_override: p.timeout_override_ms.map(Duration::from_millis),
                            retries_override: p.retries_override,
                            rate_limit_override: p.rate_limit_override.map(Into::into),
                            api_key: provider_api_key(&p.name),
                            network: p.network.clone(),
                        },
                    )
                })
                .collect();
            if let Err(errors) = registry.validate_config(blockchain, &configured) {
                all_errors.extend(errors);
            }
        }
        if all_errors.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::InvalidProviders(all_errors))
        }
    }
}

/// Provider API keys are read from descriptor-declared environment
/// variables (§6); this resolves the conventional `<PROVIDER>_API_KEY`
/// shape used by every provider in this crate.
fn provider_api_key(provider_name: &str) -> Option<String> {
    let env_var = format!("{}_API_KEY", provider_name.to_uppercase());
    std::env::var(env_var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_settings_default_matches_http_client_default() {
        let settings = HttpSettings::default();
        let config: crate::http_client::HttpClientConfig = (&settings).into();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn linking_settings_default_matches_spec_defaults() {
        let settings = LinkingSettings::default();
        assert_eq!(settings.min_amount_similarity, 0.95);
        assert_eq!(settings.max_variance, 0.10);
        assert_eq!(settings.time_window_hours, 24);
    }
}
