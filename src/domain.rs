//! Core data model (§3): currencies, accounts, ledger transactions, entries,
//! universal transactions, import sessions, raw data records, cursors, and
//! wallet descriptors.
//!
//! Currencies are process-global and immutable after creation; every other
//! entity here is user-scoped. Accounts form an arena addressed by id with
//! an optional `parent_id` for xpub-derived children — never an owning
//! reference, so the graph can be cyclic-free without lifetime gymnastics
//! (§9 design notes).

use crate::money::CurrencyTicker;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type UserId = String;
pub type AccountId = uuid::Uuid;
pub type TransactionId = uuid::Uuid;
pub type SessionId = uuid::Uuid;
pub type CurrencyId = CurrencyTicker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetClass {
    Crypto,
    Fiat,
    Nft,
    Stock,
}

/// Globally shared, keyed by uppercase ticker, immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    pub ticker: CurrencyTicker,
    pub display_name: String,
    pub decimals: u32,
    pub asset_class: AssetClass,
    pub network: Option<String>,
    pub contract_address: Option<String>,
    pub is_native: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    AssetWallet,
    AssetExchange,
    AssetDefiLp,
    LiabilityLoan,
    EquityOpeningBalance,
    EquityManualAdjustment,
    IncomeStaking,
    IncomeTrading,
    IncomeAirdrop,
    IncomeMining,
    ExpenseFeesGas,
    ExpenseFeesTrade,
}

/// User-scoped account. Invariant: every entry posted against this account
/// must carry the same currency as `currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub display_name: String,
    pub currency: CurrencyTicker,
    pub account_type: AccountType,
    pub network: Option<String>,
    pub external_address: Option<String>,
    pub parent_account_id: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Specification used to find-or-create an account (§4.10, §4.11).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountSpec {
    pub user_id: UserId,
    pub currency: CurrencyTicker,
    pub account_type: AccountTypeKey,
    pub source: Option<String>,
    pub network: Option<String>,
    pub external_address: Option<String>,
}

/// `AccountType` without the `Eq`/`Hash`-unfriendly payload, used purely as a
/// find-or-create dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountTypeKey {
    AssetWallet,
    AssetExchange,
    AssetDefiLp,
    LiabilityLoan,
    EquityOpeningBalance,
    EquityManualAdjustment,
    IncomeStaking,
    IncomeTrading,
    IncomeAirdrop,
    IncomeMining,
    ExpenseFeesGas,
    ExpenseFeesTrade,
}

impl From<AccountTypeKey> for AccountType {
    fn from(k: AccountTypeKey) -> Self {
        match k {
            AccountTypeKey::AssetWallet => AccountType::AssetWallet,
            AccountTypeKey::AssetExchange => AccountType::AssetExchange,
            AccountTypeKey::AssetDefiLp => AccountType::AssetDefiLp,
            AccountTypeKey::LiabilityLoan => AccountType::LiabilityLoan,
            AccountTypeKey::EquityOpeningBalance => AccountType::EquityOpeningBalance,
            AccountTypeKey::EquityManualAdjustment => AccountType::EquityManualAdjustment,
            AccountTypeKey::IncomeStaking => AccountType::IncomeStaking,
            AccountTypeKey::IncomeTrading => AccountType::IncomeTrading,
            AccountTypeKey::IncomeAirdrop => AccountType::IncomeAirdrop,
            AccountTypeKey::IncomeMining => AccountType::IncomeMining,
            AccountTypeKey::ExpenseFeesGas => AccountType::ExpenseFeesGas,
            AccountTypeKey::ExpenseFeesTrade => AccountType::ExpenseFeesTrade,
        }
    }
}

/// User-scoped atomic fact. Unique per `(user_id, external_id, source)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub external_id: String,
    pub source: String,
    pub description: String,
    pub transaction_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Trade,
    Deposit,
    Withdrawal,
    Fee,
    Reward,
    Staking,
    Airdrop,
    Mining,
    Loan,
    Repayment,
    Transfer,
    Gas,
}

/// Child of a ledger transaction. `amount` is signed, in smallest currency
/// units. Invariants enforced by the repository at commit time (§3, §4.11):
/// `direction = credit ⇔ amount >= 0`, and per-currency sums across a
/// transaction's entries are zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub currency_id: CurrencyId,
    pub amount: BigInt,
    pub direction: Direction,
    pub entry_type: EntryType,
    pub price_amount: Option<BigInt>,
    pub price_currency_id: Option<CurrencyId>,
}

impl Entry {
    pub fn direction_matches_amount(&self) -> bool {
        match self.direction {
            Direction::Credit => self.amount >= BigInt::from(0),
            Direction::Debit => self.amount <= BigInt::from(0),
        }
    }
}

/// The payload handed to `TransactionRepository::save`: a transaction plus
/// its not-yet-persisted entries. Produced by the ledger transformer (C10)
/// or directly by `RecordTransaction` callers (§6).
#[derive(Debug, Clone, PartialEq)]
pub struct CreateLedgerTransaction {
    pub external_id: String,
    pub source: String,
    pub description: String,
    pub transaction_date: DateTime<Utc>,
    pub entries: Vec<Entry>,
}

impl CreateLedgerTransaction {
    /// Per-currency signed sum of every entry's amount. A balanced
    /// transaction has every value in this map equal to zero (§3, §8).
    pub fn per_currency_sums(&self) -> BTreeMap<CurrencyId, BigInt> {
        let mut sums: BTreeMap<CurrencyId, BigInt> = BTreeMap::new();
        for entry in &self.entries {
            *sums.entry(entry.currency_id.clone()).or_insert_with(|| BigInt::from(0)) +=
                &entry.amount;
        }
        sums
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniversalTxStatus {
    Ok,
    Pending,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryDirection {
    In,
    Out,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Trade,
    Transfer,
    Fee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Swap,
    Deposit,
    Withdrawal,
    Transfer,
    Fee,
}

/// A single `(asset, amount)` movement, decimal-valued (pre-ledger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub asset: CurrencyTicker,
    pub amount: crate::money::Decimal,
}

/// Pipeline-internal, pre-ledger economic event produced by a processor
/// (§3 Universal Transaction, §4.9). Does not yet satisfy the double-entry
/// balance invariant — that is established by the ledger transformer.
#[derive(Debug, Clone)]
pub struct UniversalTransaction {
    pub id: String,
    pub source_id: String,
    pub status: UniversalTxStatus,
    pub timestamp: DateTime<Utc>,
    pub inflows: Vec<Movement>,
    pub outflows: Vec<Movement>,
    pub primary: Movement,
    pub primary_direction: PrimaryDirection,
    pub network_fee: Option<Movement>,
    pub platform_fee: Option<Movement>,
    pub category: Category,
    pub operation_type: OperationType,
    pub classification_note: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// Per-user run token (§3 Import Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub source_id: String,
    pub source_type: String,
    pub provider_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub imported_count: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    pub error_message: Option<String>,
}

impl ImportSession {
    pub fn new(user_id: UserId, source_id: String, source_type: String) -> Self {
        ImportSession {
            id: uuid::Uuid::new_v4(),
            user_id,
            source_id,
            source_type,
            provider_id: None,
            status: SessionStatus::Started,
            started_at: Utc::now(),
            ended_at: None,
            imported_count: 0,
            processed_count: 0,
            failed_count: 0,
            error_message: None,
        }
    }
}

/// Per-session provenance record (§3 Raw Data Record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDataRecord {
    pub id: uuid::Uuid,
    pub session_id: SessionId,
    pub provider_id: String,
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
    pub fetched_by_address: Option<String>,
}

/// User-supplied address or extended public key (§3 Wallet Descriptor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletDescriptor {
    Address(String),
    Xpub(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CursorValue {
    PageToken(String),
    BlockNumber(u64),
    Timestamp(i64),
}

/// Persisted per `(user, source, provider, operation, address)`, used to
/// resume streaming imports (§3 Provider Cursor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCursor {
    pub user_id: UserId,
    pub source: String,
    pub provider: String,
    pub operation: String,
    pub address: Option<String>,
    pub value: CursorValue,
}
