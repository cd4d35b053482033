//! Api clients and mappers (C7, §4.7).
//!
//! Every external provider implements two small, separately testable
//! halves: an [`ApiClient`] that does I/O and maps transport-level errors
//! onto [`ProviderError`], and a [`Mapper`] that is a pure, total function
//! from a provider's raw payload to a [`NormalizedRecord`]. Mappers never
//! perform I/O, matching the teacher's separation between an RPC client
//! (`btc::rpc::BtcRpcClient`) and the pure decoding logic layered on top of
//! it.

pub mod blockstream;
pub mod etherscan;
pub mod kraken;

#[cfg(test)]
pub mod test_support;

use crate::errors::ProviderError;
use crate::registry::OperationKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ApiClientError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

/// A request the provider manager dispatches to an eligible [`ApiClient`].
/// Deliberately a closed enum (not a duck-typed trait object) so every
/// variant's `cache_key`/`kind` is exhaustively handled — see §9's design
/// note on preferring tagged variants over dynamic dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAddressBalances { address: String },
    GetAddressTransactions { address: String, cursor: Option<String> },
    GetAddressInternalTransactions { address: String, cursor: Option<String> },
    GetAddressTokenTransactions { address: String, cursor: Option<String> },
    AddressExists { address: String },
    GetLedgerEntries { since_ms: Option<i64>, cursor: Option<String> },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::GetAddressBalances { .. } => OperationKind::GetAddressBalances,
            Operation::GetAddressTransactions { .. } => OperationKind::GetAddressTransactions,
            Operation::GetAddressInternalTransactions { .. } => {
                OperationKind::GetAddressInternalTransactions
            }
            Operation::GetAddressTokenTransactions { .. } => {
                OperationKind::GetAddressTokenTransactions
            }
            Operation::AddressExists { .. } => OperationKind::AddressExists,
            Operation::GetLedgerEntries { .. } => OperationKind::GetLedgerEntries,
        }
    }

    /// Cache keys are stable over retries and process restarts; operations
    /// with no sensible single-shot cache (paginated streams, cheap
    /// existence probes) return `None` (§4.6 cache semantics).
    pub fn cache_key(&self) -> Option<String> {
        match self {
            Operation::GetAddressBalances { address } => Some(format!("balances:{address}")),
            _ => None,
        }
    }
}

/// One raw, provider-tagged record as returned by an [`ApiClient`], prior to
/// mapping. `payload` is deliberately opaque JSON (§3 Raw Data Record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub provider_id: String,
    pub payload: serde_json::Value,
}

/// One page of a paginated/streamed operation.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    fn name(&self) -> &str;

    /// Dispatches a single-shot (non-paginated) operation.
    async fn execute(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<RawRecord, ProviderError>;

    /// Dispatches one page of a paginated operation, returning the page and
    /// the cursor to resume from (`None` once exhausted).
    async fn execute_page(
        &self,
        op: &Operation,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RawPage, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    In,
    Out,
    InternalIn,
    InternalOut,
}

/// Provider-agnostic representation of one raw record (§4.7, §ξ GLOSSARY
/// "Normalized record"). Produced by a [`Mapper`]; consumed by a processor
/// (C9).
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub provider_id: String,
    pub external_id: String,
    pub timestamp_ms: i64,
    pub asset: String,
    /// Signed, wallet-relative amount: positive for inflows, negative for
    /// outflows.
    pub amount: crate::money::Decimal,
    pub direction: TransferDirection,
    pub fee: Option<(String, crate::money::Decimal)>,
    pub correlation_id: Option<String>,
    pub order_id: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum MappingError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Context a mapper needs beyond the raw payload itself: which addresses
/// belong to the importing wallet (for UTXO direction inference, §4.7) and
/// the chain's native decimals for unit conversion.
pub struct MappingContext {
    pub wallet_addresses: HashSet<String>,
    pub native_decimals: u32,
    pub session_id: String,
}

/// Pure `(raw, context) -> normalized` transform. Must be total over every
/// schema-valid input for its provider; never performs I/O.
pub trait Mapper: Send + Sync {
    fn provider_id(&self) -> &'static str;
    fn map(
        &self,
        raw: &RawRecord,
        ctx: &MappingContext,
    ) -> Result<NormalizedRecord, MappingError>;
}
