//! Grouping strategies (C9, §4.9): partition a list of normalized records
//! into correlated groups, each consolidated into exactly one
//! `UniversalTransaction`.

use crate::providers::NormalizedRecord;
use std::collections::BTreeMap;

pub trait GroupingStrategy: Send + Sync {
    fn group(&self, records: Vec<NormalizedRecord>) -> Vec<Vec<NormalizedRecord>>;
}

/// Groups records sharing a `correlation_id` (e.g. Kraken's `refid`);
/// records with no correlation id each get their own group.
pub struct ByCorrelationId;

impl GroupingStrategy for ByCorrelationId {
    fn group(&self, records: Vec<NormalizedRecord>) -> Vec<Vec<NormalizedRecord>> {
        let mut groups: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();
        let mut singles = Vec::new();
        for record in records {
            match &record.correlation_id {
                Some(id) => groups.entry(id.clone()).or_default().push(record),
                None => singles.push(vec![record]),
            }
        }
        let mut out: Vec<Vec<NormalizedRecord>> = groups.into_values().collect();
        out.extend(singles);
        out
    }
}

/// Groups records sharing the same `(timestamp_ms, order_id)` pair.
pub struct ByTimestampAndOrderId;

impl GroupingStrategy for ByTimestampAndOrderId {
    fn group(&self, records: Vec<NormalizedRecord>) -> Vec<Vec<NormalizedRecord>> {
        let mut groups: BTreeMap<(i64, String), Vec<NormalizedRecord>> = BTreeMap::new();
        let mut singles = Vec::new();
        for record in records {
            match &record.order_id {
                Some(order_id) => {
                    groups.entry((record.timestamp_ms, order_id.clone())).or_default().push(record)
                }
                None => singles.push(vec![record]),
            }
        }
        let mut out: Vec<Vec<NormalizedRecord>> = groups.into_values().collect();
        out.extend(singles);
        out
    }
}

/// Each record is its own group; used for chains with no natural
/// correlation (e.g. a blockchain address's plain transaction list).
pub struct NoGrouping;

impl GroupingStrategy for NoGrouping {
    fn group(&self, records: Vec<NormalizedRecord>) -> Vec<Vec<NormalizedRecord>> {
        records.into_iter().map(|r| vec![r]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Decimal;
    use crate::providers::TransferDirection;

    fn record(correlation_id: Option<&str>) -> NormalizedRecord {
        NormalizedRecord {
            provider_id: "kraken".to_string(),
            external_id: "e".to_string(),
            timestamp_ms: 0,
            asset: "BTC".to_string(),
            amount: Decimal::from_str("1").unwrap(),
            direction: TransferDirection::In,
            fee: None,
            correlation_id: correlation_id.map(|s| s.to_string()),
            order_id: None,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn correlation_id_grouping_merges_matching_rows() {
        let records = vec![record(Some("R1")), record(Some("R1")), record(Some("R2"))];
        let groups = ByCorrelationId.group(records);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|g| g.len() == 2));
    }

    #[test]
    fn no_grouping_keeps_every_record_separate() {
        let records = vec![record(Some("R1")), record(Some("R1"))];
        let groups = NoGrouping.group(records);
        assert_eq!(groups.len(), 2);
    }
}
