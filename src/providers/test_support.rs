//! Fakes shared by unit and scenario tests: a scriptable [`ApiClient`] and
//! minimal provider descriptors, so tests never need real network access.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::providers::{ApiClient, Operation, RawPage, RawRecord};
use crate::rate_limiter::RateLimitConfig;
use crate::registry::{
    OperationKind, ProviderCapabilities, ProviderDefaults, ProviderDescriptor, ProviderName,
};
use std::time::Duration;

/// One scripted outcome for a [`FakeApiClient`] call.
pub enum Scripted {
    Ok(RawRecord),
    Err(ProviderError),
}

/// An `ApiClient` whose `execute` responses are a fixed, consumed-in-order
/// script. Used to deterministically drive failover and retry scenarios
/// without any real I/O (§8 scenario 4: "Provider failover").
pub struct FakeApiClient {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    pub call_count: std::sync::atomic::AtomicU32,
}

impl FakeApiClient {
    pub fn new(name: impl Into<String>, script: Vec<Scripted>) -> Self {
        FakeApiClient {
            name: name.into(),
            script: Mutex::new(script.into_iter().collect()),
            call_count: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _op: &Operation,
        _cancel: &CancellationToken,
    ) -> Result<RawRecord, ProviderError> {
        self.call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(Scripted::Ok(record)) => Ok(record),
            Some(Scripted::Err(e)) => Err(e),
            None => Err(ProviderError::ProviderLogic("fake script exhausted".to_string())),
        }
    }

    async fn execute_page(
        &self,
        _op: &Operation,
        _cursor: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<RawPage, ProviderError> {
        Err(ProviderError::ProviderLogic("FakeApiClient does not support pagination".to_string()))
    }
}

fn base_capabilities(ops: &[OperationKind]) -> ProviderCapabilities {
    ProviderCapabilities {
        supported_operations: ops.iter().copied().collect::<HashSet<_>>(),
        supports_pagination: true,
        cursor_types: vec![],
        preferred_cursor_type: None,
        replay_window_blocks: None,
    }
}

fn noop_constructor(
    _descriptor: &ProviderDescriptor,
    _config: &crate::registry::ProviderRuntimeConfig,
) -> Result<Box<dyn ApiClient>, crate::providers::ApiClientError> {
    Err(crate::providers::ApiClientError::InvalidConfig(
        "test descriptors are not constructible".to_string(),
    ))
}

pub fn always_ok_descriptor(blockchain: &str, name: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.to_string() as ProviderName,
        blockchain: blockchain.to_string(),
        display_name: "Test Provider",
        transport: crate::registry::TransportType::Rest,
        capabilities: base_capabilities(&[OperationKind::GetAddressBalances]),
        default_config: ProviderDefaults {
            rate_limit: RateLimitConfig::unlimited(),
            timeout: Duration::from_secs(5),
            retries: 3,
        },
        base_urls: Default::default(),
        api_key_env_var: None,
        supported_networks: vec!["mainnet".to_string()],
        constructor: noop_constructor,
    }
}

pub fn descriptor_requiring_key(
    blockchain: &str,
    name: &str,
    env_var: &'static str,
) -> ProviderDescriptor {
    ProviderDescriptor { api_key_env_var: Some(env_var), ..always_ok_descriptor(blockchain, name) }
}
