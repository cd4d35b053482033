//! Structured error taxonomy shared across the crate.
//!
//! Every fallible boundary returns one of these enums rather than a single
//! catch-all error type, so callers can match on error kind instead of
//! parsing messages.

use crate::money::CurrencyTicker;
use std::time::Duration;
use thiserror::Error;

/// Validation errors raised before any network or database I/O is attempted.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("schema validation failed: {0}")]
    SchemaError(String),
}

/// Ledger / domain invariant violations.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum DomainError {
    #[error("ledger transaction is unbalanced: {unbalanced:?}")]
    LedgerUnbalanced {
        unbalanced: Vec<(CurrencyTicker, num_bigint::BigInt)>,
    },
    #[error("entry currency {entry} does not match account currency {account}")]
    CurrencyMismatch {
        entry: CurrencyTicker,
        account: CurrencyTicker,
    },
    #[error("entry direction does not match amount sign")]
    DirectionMismatch,
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("currency {0} not found")]
    CurrencyNotFound(String),
    #[error("failed to transform universal transaction {universal_tx_id}: {reason}")]
    TransformationFailed {
        universal_tx_id: String,
        reason: String,
    },
}

/// Transport/provider-facing failures. These are the only errors the
/// provider manager is allowed to retry or fail over on.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("http error, status {status}")]
    Http { status: u16 },
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("response failed schema validation: {0}")]
    Schema(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("provider rejected the request: {0}")]
    ProviderLogic(String),
}

impl ProviderError {
    /// Transient errors are eligible for retry/failover; everything else is
    /// a hard failure the caller must handle explicitly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout
                | ProviderError::Http { status: 500..=599 }
                | ProviderError::RateLimited { .. }
        )
    }
}

/// The outcome of exhausting every eligible provider for an operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllProvidersFailed {
    #[error("no provider is eligible for this operation")]
    NoEligible,
    #[error("all eligible providers errored, last error: {last_error}")]
    AllErrored { last_error: ProviderError },
}

/// Error surfaced by an importer's `run` (C8, §4.8): either the input
/// failed validation before any I/O was attempted, or every eligible
/// provider failed during fetch. Kept as a tagged union of the two rather
/// than collapsing both into `AllProvidersFailed`, so callers can match on
/// which happened (§9 "Dynamic error unions → tagged variants").
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ImporterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Provider(#[from] AllProvidersFailed),
}

impl From<ImporterError> for ImportError {
    fn from(e: ImporterError) -> Self {
        match e {
            ImporterError::Validation(v) => ImportError::Validation(v),
            ImporterError::Provider(p) => ImportError::Import(p),
        }
    }
}

/// Persistence-layer failures surfaced by repository ports.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum RepoError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("foreign key violated: {0}")]
    ForeignKeyViolation(String),
    #[error("database error: {0}")]
    DatabaseError(String),
}

/// Lifecycle / session-management failures.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("idempotency conflict for external_id={external_id} source={source}")]
    IdempotencyConflict { external_id: String, source: String },
}

/// One group a processor failed to consolidate into a `UniversalTransaction`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupFailure {
    pub correlation_id: Option<String>,
    pub entry_count: usize,
    pub error: String,
}

/// Raised by a processor when one or more groups fail to consolidate.
/// Losing entries silently is prohibited (§4.9): every dropped entry is
/// accounted for in `lost_entries`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessingError {
    #[error("{failed_groups} of {total_groups} groups failed to process, {lost_entries} entries lost")]
    GroupsFailed {
        failures: Vec<GroupFailure>,
        lost_entries: usize,
        failed_groups: usize,
        total_groups: usize,
    },
}

/// Raised by the ledger transformer (C10) when a universal transaction
/// cannot be turned into a balanced `CreateLedgerTransaction`.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransformationError {
    #[error("unsupported operation type {0:?} for transformation")]
    UnsupportedOperation(String),
    #[error("{0}")]
    Domain(#[from] DomainError),
    #[error("account lookup failed: {0}")]
    AccountLookup(String),
}

/// Top-level error returned by the pipeline orchestrator. Wraps the
/// component-level taxonomies rather than re-declaring their variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImportError {
    #[error("import phase failed: {0}")]
    Import(#[from] AllProvidersFailed),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error("transformation failed: {0}")]
    Transformation(#[from] TransformationError),
    #[error("no raw data could be fetched for this session")]
    NothingFetched,
}
