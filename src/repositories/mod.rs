//! Repository ports (C11, §4.11). These are behavioral contracts, not a
//! concrete persistence technology — any store may implement them provided
//! it enforces the uniqueness and invariant checks described here and in
//! §3/§8. [`in_memory`] is the reference implementation used by tests.

pub mod in_memory;

use async_trait::async_trait;
use num_bigint::BigInt;

use crate::domain::{
    Account, AccountId, AccountSpec, CreateLedgerTransaction, Currency, CurrencyTicker,
    ImportSession, LedgerTransaction, ProviderCursor, RawDataRecord, SessionId, UserId,
};
use crate::errors::RepoError;

/// Either a freshly persisted transaction, or the already-committed one
/// returned for an idempotent re-save (§4.11, §8 "Idempotent re-import").
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Created(LedgerTransaction),
    AlreadyExists(LedgerTransaction),
}

impl SaveOutcome {
    pub fn transaction(&self) -> &LedgerTransaction {
        match self {
            SaveOutcome::Created(t) | SaveOutcome::AlreadyExists(t) => t,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, SaveOutcome::Created(_))
    }
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Validates balance, direction, and currency invariants, then inserts
    /// the transaction and its entries atomically. On a unique-constraint
    /// hit for `(user_id, external_id, source)`, returns the existing
    /// transaction instead of erroring (§4.11 step 5).
    async fn save(
        &self,
        user_id: &UserId,
        create: CreateLedgerTransaction,
        data_source_id: &str,
    ) -> Result<SaveOutcome, RepoError>;

    async fn find_by_external_id(
        &self,
        user_id: &UserId,
        source: &str,
        external_id: &str,
    ) -> Result<Option<LedgerTransaction>, RepoError>;

    async fn find_by_id(
        &self,
        user_id: &UserId,
        id: &crate::domain::TransactionId,
    ) -> Result<Option<LedgerTransaction>, RepoError>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Race-tolerant find-or-create: concurrent callers racing on the same
    /// spec must converge on a single account row, enforced by the backing
    /// store's unique constraint rather than by locking here.
    async fn find_or_create(&self, spec: AccountSpec) -> Result<Account, RepoError>;

    async fn get_balance(&self, user_id: &UserId, account_id: &AccountId) -> Result<BigInt, RepoError>;

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Account>, RepoError>;
}

#[async_trait]
pub trait CurrencyRepository: Send + Sync {
    async fn find_by_ticker(&self, ticker: &CurrencyTicker) -> Option<Currency>;

    /// Admin-only path; the only way the process-level cache is
    /// invalidated (§3, §9).
    async fn create(&self, currency: Currency) -> Result<(), RepoError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: ImportSession) -> Result<(), RepoError>;

    async fn finalize(
        &self,
        session_id: &SessionId,
        status: crate::domain::SessionStatus,
        error_message: Option<String>,
    ) -> Result<(), RepoError>;

    async fn find_by_id(&self, session_id: &SessionId) -> Result<Option<ImportSession>, RepoError>;
}

#[async_trait]
pub trait CursorRepository: Send + Sync {
    async fn load(
        &self,
        user_id: &UserId,
        source: &str,
        provider: &str,
        operation: &str,
        address: Option<&str>,
    ) -> Result<Option<ProviderCursor>, RepoError>;

    async fn save(&self, cursor: ProviderCursor) -> Result<(), RepoError>;
}

#[async_trait]
pub trait RawDataRepository: Send + Sync {
    async fn append(&self, record: RawDataRecord) -> Result<(), RepoError>;
}

/// Bundles the ports the transformer and orchestrator need; lets call
/// sites take one object instead of five separate trait references.
pub struct RepositorySet {
    pub transactions: std::sync::Arc<dyn TransactionRepository>,
    pub accounts: std::sync::Arc<dyn AccountRepository>,
    pub currencies: std::sync::Arc<dyn CurrencyRepository>,
    pub sessions: std::sync::Arc<dyn SessionRepository>,
    pub cursors: std::sync::Arc<dyn CursorRepository>,
    pub raw_data: std::sync::Arc<dyn RawDataRepository>,
}
