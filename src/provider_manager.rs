//! Per-blockchain provider manager (C6, §4.6): failover across providers,
//! capability-based routing, response caching, and health tracking.
//!
//! One instance exists per blockchain (the spec is explicit: "One instance
//! per blockchain"). Each provider's breaker, limiter, and health counters
//! are small, independently-locked pieces of state — no lock here is ever
//! held across the `ApiClient::execute` await point (§9 design note).

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::errors::{AllProvidersFailed, ProviderError};
use crate::providers::{ApiClient, Operation, RawRecord};
use crate::rate_limiter::RateLimiter;
use crate::registry::{OperationKind, ProviderName};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderHealth {
    pub total_successes: u64,
    pub total_failures: u64,
    pub rate_limited_events: u64,
}

struct ProviderSlot {
    name: ProviderName,
    priority: u32,
    capabilities_check: Box<dyn Fn(OperationKind) -> bool + Send + Sync>,
    client: Box<dyn ApiClient>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    health: Mutex<ProviderHealth>,
}

struct CacheEntry {
    value: RawRecord,
    provider_name: ProviderName,
    expires_at: Instant,
}

pub struct ProviderManagerConfig {
    pub cache_capacity: NonZeroUsize,
    pub default_cache_ttl: Duration,
}

impl Default for ProviderManagerConfig {
    fn default() -> Self {
        ProviderManagerConfig {
            cache_capacity: NonZeroUsize::new(1024).unwrap(),
            default_cache_ttl: Duration::from_secs(30),
        }
    }
}

/// One blockchain's provider fleet. Construct via [`ProviderManagerBuilder`].
pub struct ProviderManager {
    blockchain: String,
    slots: Vec<ProviderSlot>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    cache_ttl: Duration,
}

pub struct ProviderManagerBuilder {
    blockchain: String,
    slots: Vec<ProviderSlot>,
    config: ProviderManagerConfig,
}

impl ProviderManagerBuilder {
    pub fn new(blockchain: impl Into<String>, config: ProviderManagerConfig) -> Self {
        ProviderManagerBuilder { blockchain: blockchain.into(), slots: Vec::new(), config }
    }

    /// Registers a provider at the given priority (lower index wins ties,
    /// §4.6 "Tie-breaking: configured priority only").
    pub fn add_provider(
        mut self,
        name: impl Into<String>,
        priority: u32,
        client: Box<dyn ApiClient>,
        breaker_config: BreakerConfig,
        capabilities: impl Fn(OperationKind) -> bool + Send + Sync + 'static,
        rate_limit: crate::rate_limiter::RateLimitConfig,
    ) -> Self {
        self.slots.push(ProviderSlot {
            name: name.into(),
            priority,
            capabilities_check: Box::new(capabilities),
            client,
            breaker: CircuitBreaker::new(breaker_config),
            limiter: RateLimiter::new(rate_limit),
            health: Mutex::new(ProviderHealth::default()),
        });
        self
    }

    pub fn build(mut self) -> ProviderManager {
        self.slots.sort_by_key(|s| s.priority);
        ProviderManager {
            blockchain: self.blockchain,
            slots: self.slots,
            cache: Mutex::new(LruCache::new(self.config.cache_capacity)),
            cache_ttl: self.config.default_cache_ttl,
        }
    }
}

impl ProviderManager {
    pub fn blockchain(&self) -> &str {
        &self.blockchain
    }

    pub fn health_of(&self, provider_name: &str) -> Option<ProviderHealth> {
        self.slots
            .iter()
            .find(|s| s.name == provider_name)
            .map(|s| *s.health.lock().unwrap())
    }

    pub fn breaker_state_of(&self, provider_name: &str) -> Option<crate::circuit_breaker::BreakerState> {
        self.slots.iter().find(|s| s.name == provider_name).map(|s| s.breaker.current_state())
    }

    /// Implements the failover algorithm of §4.6 exactly:
    /// cache check → candidate filtering (capability + breaker) → ordered
    /// dispatch with rate limiting → cache on success → failover on
    /// transient failure → surface on exhaustion.
    pub async fn execute_with_failover(
        &self,
        op: Operation,
        cancel: &CancellationToken,
    ) -> Result<(RawRecord, ProviderName), AllProvidersFailed> {
        if let Some(key) = op.cache_key() {
            if let Some(hit) = self.cache_lookup(&key) {
                return Ok(hit);
            }
        }

        let kind = op.kind();
        let candidates: Vec<&ProviderSlot> = self
            .slots
            .iter()
            .filter(|s| (s.capabilities_check)(kind))
            .filter(|s| s.breaker.should_attempt())
            .collect();

        if candidates.is_empty() {
            return Err(AllProvidersFailed::NoEligible);
        }

        let mut last_error: Option<ProviderError> = None;
        for slot in candidates {
            if cancel.is_cancelled() {
                last_error = Some(ProviderError::Cancelled);
                break;
            }
            if let Err(e) = slot.limiter.acquire(cancel).await {
                last_error = Some(e);
                continue;
            }
            let result = slot.client.execute(&op, cancel).await;
            match result {
                Ok(record) => {
                    slot.breaker.record_success();
                    let mut health = slot.health.lock().unwrap();
                    health.total_successes += 1;
                    drop(health);
                    info!(provider = %slot.name, blockchain = %self.blockchain, "provider request succeeded");
                    if let Some(key) = op.cache_key() {
                        self.cache_store(key, record.clone(), slot.name.clone());
                    }
                    return Ok((record, slot.name.clone()));
                }
                Err(ProviderError::Cancelled) => {
                    return Err(AllProvidersFailed::AllErrored { last_error: ProviderError::Cancelled });
                }
                Err(e) => {
                    let mut health = slot.health.lock().unwrap();
                    health.total_failures += 1;
                    if matches!(e, ProviderError::RateLimited { .. }) {
                        health.rate_limited_events += 1;
                    }
                    drop(health);
                    slot.breaker.record_failure();
                    warn!(provider = %slot.name, blockchain = %self.blockchain, error = %e, "provider request failed");
                    last_error = Some(e);
                }
            }
        }

        Err(AllProvidersFailed::AllErrored {
            last_error: last_error.unwrap_or(ProviderError::ProviderLogic("no candidates attempted".into())),
        })
    }

    /// Dispatches one page of a paginated operation through the same
    /// candidate filtering and failover as [`Self::execute_with_failover`],
    /// but never consults the single-shot cache: paginated operations are
    /// cursor-addressed, not cacheable by a single key (§4.6, §4.8).
    pub async fn execute_page_with_failover(
        &self,
        op: Operation,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(crate::providers::RawPage, ProviderName), AllProvidersFailed> {
        let kind = op.kind();
        let candidates: Vec<&ProviderSlot> = self
            .slots
            .iter()
            .filter(|s| (s.capabilities_check)(kind))
            .filter(|s| s.breaker.should_attempt())
            .collect();

        if candidates.is_empty() {
            return Err(AllProvidersFailed::NoEligible);
        }

        let mut last_error: Option<ProviderError> = None;
        for slot in candidates {
            if cancel.is_cancelled() {
                last_error = Some(ProviderError::Cancelled);
                break;
            }
            if let Err(e) = slot.limiter.acquire(cancel).await {
                last_error = Some(e);
                continue;
            }
            let result = slot.client.execute_page(&op, cursor.clone(), cancel).await;
            match result {
                Ok(page) => {
                    slot.breaker.record_success();
                    slot.health.lock().unwrap().total_successes += 1;
                    info!(provider = %slot.name, blockchain = %self.blockchain, page_len = page.records.len(), "provider page fetch succeeded");
                    return Ok((page, slot.name.clone()));
                }
                Err(ProviderError::Cancelled) => {
                    return Err(AllProvidersFailed::AllErrored { last_error: ProviderError::Cancelled });
                }
                Err(e) => {
                    let mut health = slot.health.lock().unwrap();
                    health.total_failures += 1;
                    if matches!(e, ProviderError::RateLimited { .. }) {
                        health.rate_limited_events += 1;
                    }
                    drop(health);
                    slot.breaker.record_failure();
                    warn!(provider = %slot.name, blockchain = %self.blockchain, error = %e, "provider page fetch failed");
                    last_error = Some(e);
                }
            }
        }

        Err(AllProvidersFailed::AllErrored {
            last_error: last_error.unwrap_or(ProviderError::ProviderLogic("no candidates attempted".into())),
        })
    }

    fn cache_lookup(&self, key: &str) -> Option<(RawRecord, ProviderName)> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                Some((entry.value.clone(), entry.provider_name.clone()))
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_store(&self, key: String, value: RawRecord, provider_name: ProviderName) {
        let mut cache = self.cache.lock().unwrap();
        cache.put(key, CacheEntry { value, provider_name, expires_at: Instant::now() + self.cache_ttl });
    }
}

/// Aggregates one [`ProviderManager`] per blockchain, analogous to the
/// teacher running one retry-RPC client per chain under a shared engine.
pub struct ProviderManagerRegistry {
    managers: HashMap<String, ProviderManager>,
}

impl ProviderManagerRegistry {
    pub fn new() -> Self {
        ProviderManagerRegistry { managers: HashMap::new() }
    }

    pub fn insert(&mut self, manager: ProviderManager) {
        self.managers.insert(manager.blockchain().to_string(), manager);
    }

    pub fn get(&self, blockchain: &str) -> Option<&ProviderManager> {
        self.managers.get(blockchain)
    }
}

impl Default for ProviderManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::providers::test_support::{FakeApiClient, Scripted};
    use crate::providers::RawRecord;
    use crate::rate_limiter::RateLimitConfig;

    fn record(v: &str) -> RawRecord {
        RawRecord { provider_id: v.to_string(), payload: serde_json::json!({ "v": v }) }
    }

    #[tokio::test]
    async fn fails_over_to_next_provider_and_opens_breaker_on_first() {
        let provider_a = FakeApiClient::new(
            "A",
            vec![
                Scripted::Err(ProviderError::Http { status: 503 }),
                Scripted::Err(ProviderError::Http { status: 503 }),
                Scripted::Err(ProviderError::Http { status: 503 }),
            ],
        );
        let provider_b = FakeApiClient::new("B", vec![Scripted::Ok(record("0.25 BTC"))]);

        let manager = ProviderManagerBuilder::new("bitcoin", ProviderManagerConfig::default())
            .add_provider(
                "A",
                1,
                Box::new(provider_a),
                BreakerConfig { max_failures: 3, ..BreakerConfig::default() },
                |_| true,
                RateLimitConfig::unlimited(),
            )
            .add_provider(
                "B",
                2,
                Box::new(provider_b),
                BreakerConfig::default(),
                |_| true,
                RateLimitConfig::unlimited(),
            )
            .build();

        let cancel = CancellationToken::new();
        let op = Operation::GetAddressBalances { address: "addr".to_string() };

        // First three calls only ever reach A (cache key is shared, but we
        // use distinct ops by varying the address to avoid cache hits).
        for i in 0..3 {
            let op = Operation::GetAddressBalances { address: format!("addr{i}") };
            let result = manager.execute_with_failover(op, &cancel).await;
            assert!(result.is_ok(), "expected B to serve after A fails");
            assert_eq!(result.unwrap().1, "B");
        }

        assert_eq!(
            manager.breaker_state_of("A"),
            Some(crate::circuit_breaker::BreakerState::Open)
        );
        assert_eq!(manager.health_of("B").unwrap().total_successes, 3);
        let _ = op;
    }

    #[tokio::test]
    async fn open_breaker_excludes_provider_from_candidates() {
        let provider_a = FakeApiClient::new("A", vec![]);
        let manager = ProviderManagerBuilder::new("bitcoin", ProviderManagerConfig::default())
            .add_provider(
                "A",
                1,
                Box::new(provider_a),
                BreakerConfig { max_failures: 1, ..BreakerConfig::default() },
                |_| true,
                RateLimitConfig::unlimited(),
            )
            .build();
        manager.slots[0].breaker.record_failure();
        assert_eq!(manager.breaker_state_of("A"), Some(crate::circuit_breaker::BreakerState::Open));

        let cancel = CancellationToken::new();
        let op = Operation::GetAddressBalances { address: "addr".to_string() };
        let result = manager.execute_with_failover(op, &cancel).await;
        assert_eq!(result, Err(AllProvidersFailed::NoEligible));
    }

    #[tokio::test]
    async fn capability_routing_excludes_ineligible_providers() {
        let provider_a = FakeApiClient::new("A", vec![]);
        let manager = ProviderManagerBuilder::new("ethereum", ProviderManagerConfig::default())
            .add_provider(
                "A",
                1,
                Box::new(provider_a),
                BreakerConfig::default(),
                |kind| kind == OperationKind::GetAddressBalances,
                RateLimitConfig::unlimited(),
            )
            .build();
        let cancel = CancellationToken::new();
        let op = Operation::GetAddressTokenTransactions { address: "addr".to_string(), cursor: None };
        let result = manager.execute_with_failover(op, &cancel).await;
        assert_eq!(result, Err(AllProvidersFailed::NoEligible));
    }

    #[tokio::test]
    async fn cache_hit_skips_provider_dispatch() {
        let provider_a = FakeApiClient::new("A", vec![Scripted::Ok(record("first"))]);
        let manager = ProviderManagerBuilder::new("bitcoin", ProviderManagerConfig::default())
            .add_provider(
                "A",
                1,
                Box::new(provider_a),
                BreakerConfig::default(),
                |_| true,
                RateLimitConfig::unlimited(),
            )
            .build();
        let cancel = CancellationToken::new();
        let op = Operation::GetAddressBalances { address: "addr".to_string() };
        let first = manager.execute_with_failover(op.clone(), &cancel).await.unwrap();
        let second = manager.execute_with_failover(op, &cancel).await.unwrap();
        assert_eq!(first.0.payload, second.0.payload);
        assert_eq!(manager.health_of("A").unwrap().total_successes, 1);
    }
}
