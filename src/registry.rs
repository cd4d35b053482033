//! Process-wide, immutable-after-init catalog of provider descriptors (C5,
//! §4.5). Mirrors the teacher's static chain/network tables: a fixed set of
//! entries keyed by `(blockchain, name)`, looked up read-only for the life
//! of the process.

use crate::providers::{ApiClient, ApiClientError};
use crate::rate_limiter::RateLimitConfig;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

pub type Blockchain = String;
pub type ProviderName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    GetAddressTransactions,
    GetAddressInternalTransactions,
    GetAddressTokenTransactions,
    GetAddressBalances,
    AddressExists,
    SendRawTransaction,
    GetLedgerEntries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Rest,
    Rpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    PageToken,
    BlockNumber,
    Timestamp,
}

#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub supported_operations: HashSet<OperationKind>,
    pub supports_pagination: bool,
    pub cursor_types: Vec<CursorKind>,
    pub preferred_cursor_type: Option<CursorKind>,
    pub replay_window_blocks: Option<u64>,
}

impl ProviderCapabilities {
    pub fn supports(&self, op: OperationKind) -> bool {
        self.supported_operations.contains(&op)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub rate_limit: RateLimitConfig,
    pub timeout: Duration,
    pub retries: u32,
}

/// Runtime configuration for a single provider, as loaded from §6's JSON
/// config file (one entry per configured `(blockchain, provider)` pair).
#[derive(Debug, Clone)]
pub struct ProviderRuntimeConfig {
    pub enabled: bool,
    pub priority: u32,
    pub timeout_override: Option<Duration>,
    pub retries_override: Option<u32>,
    pub rate_limit_override: Option<RateLimitConfig>,
    pub api_key: Option<String>,
    pub network: String,
}

pub type ConstructorFn =
    fn(&ProviderDescriptor, &ProviderRuntimeConfig) -> Result<Box<dyn ApiClient>, ApiClientError>;

/// Static description of one provider for one blockchain: capabilities,
/// default tuning, base URLs per network, and a factory function.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: ProviderName,
    pub blockchain: Blockchain,
    pub display_name: &'static str,
    pub transport: TransportType,
    pub capabilities: ProviderCapabilities,
    pub default_config: ProviderDefaultsHandle,
    pub base_urls: HashMap<String, String>,
    pub api_key_env_var: Option<&'static str>,
    pub supported_networks: Vec<String>,
    pub constructor: ConstructorFn,
}

/// `ProviderDefaults` behind a clone-friendly handle (capabilities and rate
/// limits are small and cheap to copy per descriptor).
pub type ProviderDefaultsHandle = ProviderDefaults;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("unknown provider '{provider}' configured for blockchain '{blockchain}'")]
    UnknownProvider { blockchain: String, provider: String },
    #[error("provider '{provider}' requires environment variable '{env_var}' to be set")]
    MissingApiKey { provider: String, env_var: String },
    #[error("provider '{provider}' does not support network '{network}'")]
    UnsupportedNetwork { provider: String, network: String },
}

/// Process-wide catalog. Built once via [`ProviderRegistry::bootstrap`] and
/// shared read-only thereafter (§9: "global currency cache"-style
/// read-heavy immutable map, applied here to providers instead).
pub struct ProviderRegistry {
    descriptors: HashMap<(Blockchain, ProviderName), ProviderDescriptor>,
}

impl ProviderRegistry {
    pub fn new(descriptors: Vec<ProviderDescriptor>) -> Self {
        let mut map = HashMap::new();
        for d in descriptors {
            map.insert((d.blockchain.clone(), d.name.clone()), d);
        }
        ProviderRegistry { descriptors: map }
    }

    pub fn get_metadata(&self, blockchain: &str, name: &str) -> Option<&ProviderDescriptor> {
        self.descriptors.get(&(blockchain.to_string(), name.to_string()))
    }

    pub fn list_available(&self, blockchain: &str) -> Vec<&ProviderDescriptor> {
        self.descriptors
            .values()
            .filter(|d| d.blockchain == blockchain)
            .collect()
    }

    pub fn create_provider(
        &self,
        blockchain: &str,
        name: &str,
        config: &ProviderRuntimeConfig,
    ) -> Result<Box<dyn ApiClient>, ApiClientError> {
        let descriptor = self
            .get_metadata(blockchain, name)
            .ok_or_else(|| ApiClientError::UnknownProvider(name.to_string()))?;
        (descriptor.constructor)(descriptor, config)
    }

    /// Validates a user-supplied per-blockchain ordered provider list
    /// against the registry (§6: "unknown provider names are fatal").
    pub fn validate_config(
        &self,
        blockchain: &str,
        configured: &[(ProviderName, ProviderRuntimeConfig)],
    ) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        for (name, runtime) in configured {
            match self.get_metadata(blockchain, name) {
                None => errors.push(ConfigError::UnknownProvider {
                    blockchain: blockchain.to_string(),
                    provider: name.clone(),
                }),
                Some(descriptor) => {
                    if let Some(env_var) = descriptor.api_key_env_var {
                        if runtime.api_key.is_none() {
                            errors.push(ConfigError::MissingApiKey {
                                provider: name.clone(),
                                env_var: env_var.to_string(),
                            });
                        }
                    }
                    if !descriptor.supported_networks.is_empty()
                        && !descriptor.supported_networks.contains(&runtime.network)
                    {
                        errors.push(ConfigError::UnsupportedNetwork {
                            provider: name.clone(),
                            network: runtime.network.clone(),
                        });
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::always_ok_descriptor;

    #[test]
    fn unknown_provider_name_is_rejected() {
        let registry = ProviderRegistry::new(vec![always_ok_descriptor("bitcoin", "blockstream")]);
        let configured = vec![(
            "not-a-real-provider".to_string(),
            ProviderRuntimeConfig {
                enabled: true,
                priority: 0,
                timeout_override: None,
                retries_override: None,
                rate_limit_override: None,
                api_key: None,
                network: "mainnet".to_string(),
            },
        )];
        let result = registry.validate_config("bitcoin", &configured);
        assert!(matches!(
            result,
            Err(errors) if matches!(&errors[0], ConfigError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn missing_api_key_env_var_is_rejected() {
        let registry =
            ProviderRegistry::new(vec![crate::providers::test_support::descriptor_requiring_key(
                "ethereum",
                "etherscan",
                "ETHERSCAN_API_KEY",
            )]);
        let configured = vec![(
            "etherscan".to_string(),
            ProviderRuntimeConfig {
                enabled: true,
                priority: 0,
                timeout_override: None,
                retries_override: None,
                rate_limit_override: None,
                api_key: None,
                network: "mainnet".to_string(),
            },
        )];
        let result = registry.validate_config("ethereum", &configured);
        assert!(result.is_err());
    }
}
