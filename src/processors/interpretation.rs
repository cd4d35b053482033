//! Interpretation strategies (C9, §4.9): per-record contribution to a
//! group's fund flow, expressed as inflows/outflows/fees of `(asset,
//! amount)`.

use crate::money::Decimal;
use crate::providers::{NormalizedRecord, TransferDirection};

#[derive(Debug, Clone, Default)]
pub struct Contribution {
    pub inflows: Vec<(String, Decimal)>,
    pub outflows: Vec<(String, Decimal)>,
    /// Network-level fee (gas, miner fee); distinguished from
    /// `platform_fees` per the Universal Transaction's two fee totals (§3).
    pub network_fees: Vec<(String, Decimal)>,
    pub platform_fees: Vec<(String, Decimal)>,
}

pub trait InterpretationStrategy: Send + Sync {
    fn interpret(&self, record: &NormalizedRecord) -> Contribution;
}

/// Derives inflow/outflow from the mapper's already-computed signed amount
/// and direction, and attributes any fee to the network-fee slot. Fits
/// every blockchain mapper in this crate, since §4.7 requires mappers to
/// produce wallet-relative signed amounts already.
pub struct DefaultInterpretation;

impl InterpretationStrategy for DefaultInterpretation {
    fn interpret(&self, record: &NormalizedRecord) -> Contribution {
        let mut contribution = Contribution::default();
        match record.direction {
            TransferDirection::In | TransferDirection::InternalIn => {
                contribution.inflows.push((record.asset.clone(), record.amount.abs()));
            }
            TransferDirection::Out | TransferDirection::InternalOut => {
                contribution.outflows.push((record.asset.clone(), record.amount.abs()));
            }
        }
        if let Some((asset, amount)) = &record.fee {
            contribution.network_fees.push((asset.clone(), amount.abs()));
        }
        contribution
    }
}

/// Exchange ledger rows attribute their fee to the platform, not the
/// network; otherwise identical to [`DefaultInterpretation`].
pub struct ExchangeInterpretation;

impl InterpretationStrategy for ExchangeInterpretation {
    fn interpret(&self, record: &NormalizedRecord) -> Contribution {
        let mut contribution = Contribution::default();
        match record.direction {
            TransferDirection::In | TransferDirection::InternalIn => {
                contribution.inflows.push((record.asset.clone(), record.amount.abs()));
            }
            TransferDirection::Out | TransferDirection::InternalOut => {
                contribution.outflows.push((record.asset.clone(), record.amount.abs()));
            }
        }
        if let Some((asset, amount)) = &record.fee {
            contribution.platform_fees.push((asset.clone(), amount.abs()));
        }
        contribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflow_record_contributes_to_inflows_only() {
        let record = NormalizedRecord {
            provider_id: "blockstream".to_string(),
            external_id: "tx1".to_string(),
            timestamp_ms: 0,
            asset: "BTC".to_string(),
            amount: Decimal::from_str("0.5").unwrap(),
            direction: TransferDirection::In,
            fee: None,
            correlation_id: None,
            order_id: None,
            raw: serde_json::json!({}),
        };
        let contribution = DefaultInterpretation.interpret(&record);
        assert_eq!(contribution.inflows.len(), 1);
        assert!(contribution.outflows.is_empty());
    }
}
