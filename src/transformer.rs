//! Ledger transformer (C10, §4.10): the pure boundary between a pre-ledger
//! `UniversalTransaction` and a balanced `CreateLedgerTransaction`. This is
//! the last place an unbalanced transaction can be caught before the
//! repository asserts the invariant at commit.

use async_trait::async_trait;
use num_bigint::BigInt;

use crate::domain::{
    Account, AccountSpec, AccountTypeKey, Category, CreateLedgerTransaction, Currency, Direction,
    Entry, EntryType, OperationType, UniversalTransaction, UserId,
};
use crate::errors::{DomainError, TransformationError};
use crate::money::{self, Decimal};

/// Account lookup the transformer needs, kept narrow and separate from the
/// full `AccountRepository` port so the transformer stays testable with a
/// minimal fake (§4.10: "queries/creates accounts via an injected
/// repository port").
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn find_or_create(&self, spec: AccountSpec) -> Result<Account, TransformationError>;
    async fn currency(&self, ticker: &str) -> Result<Currency, TransformationError>;
}

pub struct LedgerTransformer<'a> {
    resolver: &'a dyn AccountResolver,
}

impl<'a> LedgerTransformer<'a> {
    pub fn new(resolver: &'a dyn AccountResolver) -> Self {
        LedgerTransformer { resolver }
    }

    pub async fn transform(
        &self,
        user_id: &UserId,
        tx: &UniversalTransaction,
    ) -> Result<CreateLedgerTransaction, TransformationError> {
        let entries = match tx.category {
            Category::Trade => self.transform_trade(user_id, tx).await?,
            Category::Transfer => match tx.operation_type {
                OperationType::Deposit => self.transform_deposit(user_id, tx).await?,
                OperationType::Withdrawal => self.transform_withdrawal(user_id, tx).await?,
                OperationType::Transfer => self.transform_reward_like(user_id, tx).await?,
                other => {
                    return Err(TransformationError::UnsupportedOperation(format!("{other:?}")))
                }
            },
            Category::Fee => self.transform_fee_only(user_id, tx).await?,
        };

        let create = CreateLedgerTransaction {
            external_id: tx.id.clone(),
            source: tx.source_id.clone(),
            description: describe(tx),
            transaction_date: tx.timestamp,
            entries,
        };

        let unbalanced: Vec<_> = create
            .per_currency_sums()
            .into_iter()
            .filter(|(_, v)| *v != BigInt::from(0))
            .collect();
        if !unbalanced.is_empty() {
            return Err(TransformationError::Domain(DomainError::LedgerUnbalanced { unbalanced }));
        }

        Ok(create)
    }

    async fn account(
        &self,
        user_id: &UserId,
        currency: &str,
        account_type: AccountTypeKey,
    ) -> Result<Account, TransformationError> {
        self.resolver
            .find_or_create(AccountSpec {
                user_id: user_id.clone(),
                currency: currency.to_string(),
                account_type,
                source: None,
                network: None,
                external_address: None,
            })
            .await
    }

    async fn decimals(&self, ticker: &str) -> Result<u32, TransformationError> {
        Ok(self.resolver.currency(ticker).await?.decimals)
    }

    async fn transform_trade(
        &self,
        user_id: &UserId,
        tx: &UniversalTransaction,
    ) -> Result<Vec<Entry>, TransformationError> {
        let cost = tx
            .outflows
            .first()
            .ok_or_else(|| TransformationError::UnsupportedOperation("swap missing outflow".to_string()))?;
        let proceeds = tx
            .inflows
            .first()
            .ok_or_else(|| TransformationError::UnsupportedOperation("swap missing inflow".to_string()))?;

        let source_account = self.account(user_id, &cost.asset, AccountTypeKey::AssetWallet).await?;
        let target_account = self.account(user_id, &proceeds.asset, AccountTypeKey::AssetWallet).await?;
        // A swap moves two different currencies in the same transaction, so
        // each currency needs its own offsetting leg to sum to zero — a
        // per-currency trading-clearing account bridges the two wallet
        // movements (the same role `EquityOpeningBalance` plays for a
        // deposit's single currency).
        let source_trading = self.account(user_id, &cost.asset, AccountTypeKey::IncomeTrading).await?;
        let target_trading = self.account(user_id, &proceeds.asset, AccountTypeKey::IncomeTrading).await?;

        let source_decimals = self.decimals(&cost.asset).await?;
        let target_decimals = self.decimals(&proceeds.asset).await?;

        let mut entries = vec![
            debit(user_id, &source_account, &cost.asset, &cost.amount, source_decimals, EntryType::Trade),
            credit(user_id, &source_trading, &cost.asset, &cost.amount, source_decimals, EntryType::Trade),
            credit(user_id, &target_account, &proceeds.asset, &proceeds.amount, target_decimals, EntryType::Trade),
            debit(user_id, &target_trading, &proceeds.asset, &proceeds.amount, target_decimals, EntryType::Trade),
        ];

        if let Some(fee) = &tx.platform_fee {
            let fee_account = self.account(user_id, &fee.asset, AccountTypeKey::ExpenseFeesTrade).await?;
            let fee_decimals = self.decimals(&fee.asset).await?;
            entries.push(debit(user_id, &fee_account, &fee.asset, &fee.amount, fee_decimals, EntryType::Fee));
            // The balancing entry must sit on the clearing account for the
            // fee's own currency, never the opposite leg — crediting a BTC
            // account with a USD-denominated amount would break the
            // entry/account currency invariant (§8).
            let balancing_account = if fee.asset == cost.asset {
                source_trading.clone()
            } else if fee.asset == proceeds.asset {
                target_trading.clone()
            } else {
                self.account(user_id, &fee.asset, AccountTypeKey::IncomeTrading).await?
            };
            entries.push(credit(
                user_id,
                &balancing_account,
                &fee.asset,
                &fee.amount,
                fee_decimals,
                EntryType::Fee,
            ));
        }

        Ok(entries)
    }

    async fn transform_deposit(
        &self,
        user_id: &UserId,
        tx: &UniversalTransaction,
    ) -> Result<Vec<Entry>, TransformationError> {
        let movement = tx
            .inflows
            .first()
            .ok_or_else(|| TransformationError::UnsupportedOperation("deposit missing inflow".to_string()))?;
        let asset_account = self.account(user_id, &movement.asset, AccountTypeKey::AssetWallet).await?;
        let equity_account =
            self.account(user_id, &movement.asset, AccountTypeKey::EquityOpeningBalance).await?;
        let decimals = self.decimals(&movement.asset).await?;

        let mut entries = vec![
            credit(user_id, &asset_account, &movement.asset, &movement.amount, decimals, EntryType::Deposit),
            debit(user_id, &equity_account, &movement.asset, &movement.amount, decimals, EntryType::Deposit),
        ];

        // Gross credit, fee expensed separately rather than subtracted from
        // the credited amount (DESIGN.md's resolution of the deposit-fee
        // open question) — a second, independently-balanced debit/credit
        // pair in the fee's own currency.
        if let Some(fee) = tx.network_fee.clone().or_else(|| tx.platform_fee.clone()) {
            let fee_account = self.account(user_id, &fee.asset, AccountTypeKey::ExpenseFeesGas).await?;
            let fee_equity = self.account(user_id, &fee.asset, AccountTypeKey::EquityOpeningBalance).await?;
            let fee_decimals = self.decimals(&fee.asset).await?;
            entries.push(debit(user_id, &fee_account, &fee.asset, &fee.amount, fee_decimals, EntryType::Gas));
            entries.push(credit(user_id, &fee_equity, &fee.asset, &fee.amount, fee_decimals, EntryType::Gas));
        }

        Ok(entries)
    }

    async fn transform_withdrawal(
        &self,
        user_id: &UserId,
        tx: &UniversalTransaction,
    ) -> Result<Vec<Entry>, TransformationError> {
        let movement = tx.outflows.first().ok_or_else(|| {
            TransformationError::UnsupportedOperation("withdrawal missing outflow".to_string())
        })?;
        let fee = tx.network_fee.clone().or_else(|| tx.platform_fee.clone());

        // §4.10: "debit the asset account for the net (gross - fee)". A fee
        // denominated in the movement's own currency is subtracted from the
        // wallet debit here; a fee in a different currency cannot reduce a
        // balance denominated in another asset, so it is left out of this
        // net and expensed purely through its own fee entries below.
        let net_amount = match &fee {
            Some(f) if f.asset == movement.asset => money::sub(&movement.amount, &f.amount),
            _ => movement.amount.clone(),
        };

        let asset_account = self.account(user_id, &movement.asset, AccountTypeKey::AssetWallet).await?;
        let equity_account =
            self.account(user_id, &movement.asset, AccountTypeKey::EquityOpeningBalance).await?;
        let decimals = self.decimals(&movement.asset).await?;

        let mut entries = vec![
            debit(user_id, &asset_account, &movement.asset, &net_amount, decimals, EntryType::Withdrawal),
            credit(user_id, &equity_account, &movement.asset, &net_amount, decimals, EntryType::Withdrawal),
        ];

        if let Some(fee) = fee {
            let fee_account = self.account(user_id, &fee.asset, AccountTypeKey::ExpenseFeesGas).await?;
            let fee_equity = self.account(user_id, &fee.asset, AccountTypeKey::EquityOpeningBalance).await?;
            let fee_decimals = self.decimals(&fee.asset).await?;
            entries.push(debit(user_id, &fee_account, &fee.asset, &fee.amount, fee_decimals, EntryType::Gas));
            entries.push(credit(user_id, &fee_equity, &fee.asset, &fee.amount, fee_decimals, EntryType::Gas));
        }

        Ok(entries)
    }

    /// Reward, staking, airdrop, and mining income all share the same
    /// shape: credit the asset account, debit the matching income account
    /// (§4.10). The processor reports these as plain inflow-only transfers;
    /// the entry type distinguishes them for reporting.
    async fn transform_reward_like(
        &self,
        user_id: &UserId,
        tx: &UniversalTransaction,
    ) -> Result<Vec<Entry>, TransformationError> {
        let movement = tx.inflows.first().ok_or_else(|| {
            TransformationError::UnsupportedOperation("reward missing inflow".to_string())
        })?;
        let asset_account = self.account(user_id, &movement.asset, AccountTypeKey::AssetWallet).await?;
        let income_account = self.account(user_id, &movement.asset, AccountTypeKey::IncomeStaking).await?;
        let decimals = self.decimals(&movement.asset).await?;

        Ok(vec![
            credit(user_id, &asset_account, &movement.asset, &movement.amount, decimals, EntryType::Reward),
            debit(user_id, &income_account, &movement.asset, &movement.amount, decimals, EntryType::Reward),
        ])
    }

    async fn transform_fee_only(
        &self,
        user_id: &UserId,
        tx: &UniversalTransaction,
    ) -> Result<Vec<Entry>, TransformationError> {
        let fee = tx.network_fee.clone().or_else(|| tx.platform_fee.clone()).ok_or_else(|| {
            TransformationError::UnsupportedOperation("fee-only transaction missing fee".to_string())
        })?;
        let fee_account = self.account(user_id, &fee.asset, AccountTypeKey::ExpenseFeesGas).await?;
        let asset_account = self.account(user_id, &fee.asset, AccountTypeKey::AssetWallet).await?;
        let decimals = self.decimals(&fee.asset).await?;

        Ok(vec![
            credit(user_id, &fee_account, &fee.asset, &fee.amount, decimals, EntryType::Fee),
            debit(user_id, &asset_account, &fee.asset, &fee.amount, decimals, EntryType::Fee),
        ])
    }
}

fn describe(tx: &UniversalTransaction) -> String {
    match &tx.classification_note {
        Some(note) => format!("{:?} {:?} ({note})", tx.category, tx.operation_type),
        None => format!("{:?} {:?}", tx.category, tx.operation_type),
    }
}

fn credit(
    user_id: &UserId,
    account: &Account,
    asset: &str,
    amount: &Decimal,
    decimals: u32,
    entry_type: EntryType,
) -> Entry {
    Entry {
        user_id: user_id.clone(),
        account_id: account.id,
        currency_id: asset.to_string(),
        amount: amount.to_smallest_unit(decimals),
        direction: Direction::Credit,
        entry_type,
        price_amount: None,
        price_currency_id: None,
    }
}

fn debit(
    user_id: &UserId,
    account: &Account,
    asset: &str,
    amount: &Decimal,
    decimals: u32,
    entry_type: EntryType,
) -> Entry {
    Entry {
        user_id: user_id.clone(),
        account_id: account.id,
        currency_id: asset.to_string(),
        amount: amount.neg().to_smallest_unit(decimals),
        direction: Direction::Debit,
        entry_type,
        price_amount: None,
        price_currency_id: None,
    }
}
