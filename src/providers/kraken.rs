//! Exchange-side provider: a Kraken-style `ledgers` feed, consumed either
//! from an exported CSV (the exchange-CSV importer, C8) or the
//! authenticated REST endpoint (the exchange-API importer, C8), sharing the
//! same pure mapper either way.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::http_client::HttpClient;
use crate::money::Decimal;
use crate::providers::{
    ApiClient, Mapper, MappingContext, MappingError, NormalizedRecord, Operation, RawPage,
    RawRecord, TransferDirection,
};

pub const PROVIDER_ID: &str = "kraken";

/// One row of Kraken's `ledgers.csv` export, or one entry of the `Ledgers`
/// REST response — both use the same field set.
#[derive(Debug, Deserialize, Clone, serde::Serialize)]
pub struct KrakenLedgerRow {
    #[serde(rename = "refid")]
    pub ref_id: String,
    pub time: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub asset: String,
    pub amount: String,
    pub fee: String,
}

pub struct KrakenApiClient {
    http: HttpClient,
    api_key: String,
    api_secret: String,
}

impl KrakenApiClient {
    pub fn new(http: HttpClient, api_key: String, api_secret: String) -> Self {
        KrakenApiClient { http, api_key, api_secret }
    }
}

#[async_trait]
impl ApiClient for KrakenApiClient {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    async fn execute(
        &self,
        op: &Operation,
        _cancel: &CancellationToken,
    ) -> Result<RawRecord, ProviderError> {
        Err(ProviderError::ProviderLogic(format!(
            "kraken only supports paginated ledger fetches, got {op:?}"
        )))
    }

    async fn execute_page(
        &self,
        op: &Operation,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RawPage, ProviderError> {
        let Operation::GetLedgerEntries { since_ms, .. } = op else {
            return Err(ProviderError::ProviderLogic(
                "kraken only paginates getLedgerEntries".to_string(),
            ));
        };
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(ProviderError::ProviderLogic("missing kraken API credentials".to_string()));
        }
        let offset = cursor.as_deref().unwrap_or("0");
        let since = since_ms.map(|ms| (ms / 1000).to_string()).unwrap_or_default();
        let resp: KrakenLedgersEnvelope = self
            .http
            .post(
                "0/private/Ledgers",
                &serde_json::json!({ "ofs": offset, "start": since }),
                cancel,
            )
            .await?;
        let rows: Vec<_> = resp.result.ledger.into_values().collect();
        let next_cursor = if rows.len() >= 50 {
            Some((offset.parse::<u64>().unwrap_or(0) + rows.len() as u64).to_string())
        } else {
            None
        };
        let records = rows
            .into_iter()
            .map(|row| RawRecord {
                provider_id: PROVIDER_ID.to_string(),
                payload: serde_json::to_value(row).expect("KrakenLedgerRow always serializes"),
            })
            .collect();
        Ok(RawPage { records, next_cursor })
    }
}

#[derive(Debug, Deserialize)]
struct KrakenLedgersEnvelope {
    result: KrakenLedgersResult,
}

#[derive(Debug, Deserialize)]
struct KrakenLedgersResult {
    ledger: std::collections::HashMap<String, KrakenLedgerRow>,
}

pub struct KrakenMapper;

impl Mapper for KrakenMapper {
    fn provider_id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn map(
        &self,
        raw: &RawRecord,
        _ctx: &MappingContext,
    ) -> Result<NormalizedRecord, MappingError> {
        let row: KrakenLedgerRow = serde_json::from_value(raw.payload.clone())
            .map_err(|e| MappingError::Malformed(e.to_string()))?;

        let amount = Decimal::from_str(&row.amount)
            .map_err(|e| MappingError::Malformed(format!("bad amount {}: {e}", row.amount)))?;
        let fee_amount = Decimal::from_str(&row.fee)
            .map_err(|e| MappingError::Malformed(format!("bad fee {}: {e}", row.fee)))?;

        let direction = if amount.is_negative() { TransferDirection::Out } else { TransferDirection::In };

        let timestamp_ms = parse_kraken_time_to_epoch_ms(&row.time)
            .ok_or_else(|| MappingError::Malformed(format!("bad time {}", row.time)))?;

        Ok(NormalizedRecord {
            provider_id: PROVIDER_ID.to_string(),
            external_id: format!("{}:{}", row.ref_id, row.asset),
            timestamp_ms,
            asset: normalize_kraken_asset(&row.asset),
            amount,
            direction,
            fee: if fee_amount.is_zero() {
                None
            } else {
                Some((normalize_kraken_asset(&row.asset), fee_amount))
            },
            correlation_id: Some(row.ref_id.clone()),
            order_id: None,
            raw: raw.payload.clone(),
        })
    }
}

/// Kraken prefixes some legacy tickers (`XXBT`, `ZUSD`); strip them to the
/// plain ticker our currency table uses.
fn normalize_kraken_asset(asset: &str) -> String {
    match asset {
        "XXBT" => "BTC".to_string(),
        "XETH" => "ETH".to_string(),
        "ZUSD" => "USD".to_string(),
        "ZEUR" => "EUR".to_string(),
        other => other.to_string(),
    }
}

fn parse_kraken_time_to_epoch_ms(time: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(time, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ref_id: &str, entry_type: &str, asset: &str, amount: &str, fee: &str) -> RawRecord {
        RawRecord {
            provider_id: PROVIDER_ID.to_string(),
            payload: serde_json::json!({
                "refid": ref_id,
                "time": "2024-01-15 10:30:00.0000",
                "type": entry_type,
                "asset": asset,
                "amount": amount,
                "fee": fee,
            }),
        }
    }

    #[test]
    fn normalizes_legacy_tickers_and_signed_amount() {
        let ctx = MappingContext {
            wallet_addresses: Default::default(),
            native_decimals: 8,
            session_id: "s".to_string(),
        };
        let normalized = KrakenMapper.map(&row("R1", "trade", "XXBT", "0.5", "0.0001"), &ctx).unwrap();
        assert_eq!(normalized.asset, "BTC");
        assert_eq!(normalized.direction, TransferDirection::In);
        assert_eq!(normalized.correlation_id, Some("R1".to_string()));
        assert!(normalized.fee.is_some());
    }
}
