//! Blockstream Esplora-style REST client and mapper for Bitcoin (a
//! representative UTXO-chain provider, §4.7 "For UTXO chains specifically").
//!
//! The registry can host any number of additional Bitcoin providers behind
//! the same `ApiClient`/`Mapper` pair (mempool.space, a self-hosted Esplora
//! instance, …) — this module is the reference implementation new
//! providers are grounded on, not an exhaustive catalog.

use async_trait::async_trait;
use num_bigint::BigInt;
use serde::Deserialize;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::http_client::HttpClient;
use crate::money::Decimal;
use crate::providers::{
    ApiClient, Mapper, MappingContext, MappingError, NormalizedRecord, Operation, RawPage,
    RawRecord, TransferDirection,
};

pub const PROVIDER_ID: &str = "blockstream";
const BTC_DECIMALS: u32 = 8;

pub struct BlockstreamClient {
    http: HttpClient,
}

impl BlockstreamClient {
    pub fn new(http: HttpClient) -> Self {
        BlockstreamClient { http }
    }
}

#[async_trait]
impl ApiClient for BlockstreamClient {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    async fn execute(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<RawRecord, ProviderError> {
        match op {
            Operation::GetAddressBalances { address } => {
                let stats: EsploraAddressStats = self
                    .http
                    .get(&format!("address/{address}"), &[], cancel)
                    .await?;
                Ok(RawRecord {
                    provider_id: PROVIDER_ID.to_string(),
                    payload: serde_json::to_value(stats)
                        .map_err(|e| ProviderError::Schema(e.to_string()))?,
                })
            }
            Operation::AddressExists { address } => {
                let txs: Vec<EsploraTx> = self
                    .http
                    .get(&format!("address/{address}/txs"), &[], cancel)
                    .await?;
                Ok(RawRecord {
                    provider_id: PROVIDER_ID.to_string(),
                    payload: serde_json::json!({ "has_transactions": !txs.is_empty() }),
                })
            }
            other => Err(ProviderError::ProviderLogic(format!(
                "blockstream does not support single-shot {other:?}"
            ))),
        }
    }

    async fn execute_page(
        &self,
        op: &Operation,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RawPage, ProviderError> {
        let Operation::GetAddressTransactions { address, .. } = op else {
            return Err(ProviderError::ProviderLogic(
                "blockstream only paginates getAddressTransactions".to_string(),
            ));
        };
        let path = match &cursor {
            Some(last_seen_txid) => format!("address/{address}/txs/chain/{last_seen_txid}"),
            None => format!("address/{address}/txs"),
        };
        let txs: Vec<EsploraTx> = self.http.get(&path, &[], cancel).await?;
        let next_cursor = txs.last().map(|t| t.txid.clone());
        let records = txs
            .into_iter()
            .map(|tx| RawRecord {
                provider_id: PROVIDER_ID.to_string(),
                payload: serde_json::to_value(tx).expect("EsploraTx always serializes"),
            })
            .collect();
        Ok(RawPage { records, next_cursor })
    }
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct EsploraAddressStats {
    chain_stats: ChainStats,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct ChainStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct EsploraTx {
    txid: String,
    fee: u64,
    status: EsploraTxStatus,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct EsploraTxStatus {
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct EsploraVin {
    prevout: Option<EsploraVout>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

pub struct BlockstreamMapper;

impl Mapper for BlockstreamMapper {
    fn provider_id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn map(
        &self,
        raw: &RawRecord,
        ctx: &MappingContext,
    ) -> Result<NormalizedRecord, MappingError> {
        let tx: EsploraTx = serde_json::from_value(raw.payload.clone())
            .map_err(|e| MappingError::Malformed(e.to_string()))?;

        let wallet_hit = |addr: &Option<String>| -> bool {
            addr.as_deref().map(|a| ctx.wallet_addresses.contains(a)).unwrap_or(false)
        };

        // Wallet-relative net change: sum outputs landing in the wallet,
        // subtract inputs sourced from the wallet (§4.7 UTXO direction
        // inference).
        let inflow_sats: u64 = tx
            .vout
            .iter()
            .filter(|o| wallet_hit(&o.scriptpubkey_address))
            .map(|o| o.value)
            .sum();
        let outflow_sats: u64 = tx
            .vin
            .iter()
            .filter_map(|i| i.prevout.as_ref())
            .filter(|o| wallet_hit(&o.scriptpubkey_address))
            .map(|o| o.value)
            .sum();

        let net_sats = inflow_sats as i128 - outflow_sats as i128;
        let direction = if outflow_sats > 0 && inflow_sats > 0 {
            // The wallet appears on both sides: a consolidation or a
            // same-wallet self-transfer. Net change still tells us which
            // way value moved.
            if net_sats >= 0 {
                TransferDirection::InternalIn
            } else {
                TransferDirection::InternalOut
            }
        } else if inflow_sats > 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        };

        let amount = Decimal::from_smallest_unit(&BigInt::from(net_sats), BTC_DECIMALS);
        // Fee is attributed to the sending side only (§4.7).
        let fee = if outflow_sats > 0 {
            Some((
                "BTC".to_string(),
                Decimal::from_smallest_unit(&BigInt::from(tx.fee), BTC_DECIMALS),
            ))
        } else {
            None
        };

        Ok(NormalizedRecord {
            provider_id: PROVIDER_ID.to_string(),
            external_id: tx.txid.clone(),
            timestamp_ms: tx.status.block_time.map(|t| t * 1000).unwrap_or(0),
            asset: "BTC".to_string(),
            amount,
            direction,
            fee,
            correlation_id: None,
            order_id: None,
            raw: raw.payload.clone(),
        })
    }
}

pub fn wallet_address_set(addresses: &[String]) -> HashSet<String> {
    addresses.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(addresses: &[&str]) -> MappingContext {
        MappingContext {
            wallet_addresses: addresses.iter().map(|s| s.to_string()).collect(),
            native_decimals: BTC_DECIMALS,
            session_id: "s1".to_string(),
        }
    }

    fn raw_tx(json: serde_json::Value) -> RawRecord {
        RawRecord { provider_id: PROVIDER_ID.to_string(), payload: json }
    }

    #[test]
    fn classifies_receive_as_transfer_in() {
        let raw = raw_tx(serde_json::json!({
            "txid": "abc",
            "fee": 500,
            "status": { "block_time": 1_700_000_000 },
            "vin": [{ "prevout": { "scriptpubkey_address": "other", "value": 100_500 } }],
            "vout": [{ "scriptpubkey_address": "mine", "value": 50_000_000 }],
        }));
        let normalized = BlockstreamMapper.map(&raw, &ctx(&["mine"])).unwrap();
        assert_eq!(normalized.direction, TransferDirection::In);
        assert!(normalized.amount.is_zero() == false && !normalized.amount.is_negative());
        assert!(normalized.fee.is_none());
    }

    #[test]
    fn classifies_send_as_transfer_out_and_attributes_fee() {
        let raw = raw_tx(serde_json::json!({
            "txid": "def",
            "fee": 1_000,
            "status": { "block_time": 1_700_000_000 },
            "vin": [{ "prevout": { "scriptpubkey_address": "mine", "value": 50_000_000 } }],
            "vout": [{ "scriptpubkey_address": "other", "value": 49_999_000 }],
        }));
        let normalized = BlockstreamMapper.map(&raw, &ctx(&["mine"])).unwrap();
        assert_eq!(normalized.direction, TransferDirection::Out);
        assert!(normalized.amount.is_negative());
        assert!(normalized.fee.is_some());
    }
}
