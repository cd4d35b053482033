//! Etherscan-style REST client and mapper for account-based EVM chains.
//! Representative of the `getAddressTransactions` / `getAddressTokenTransactions`
//! capability split that account-model chains need, in contrast to
//! Bitcoin's UTXO model in [`crate::providers::blockstream`].

use async_trait::async_trait;
use num_bigint::BigInt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::http_client::HttpClient;
use crate::money::Decimal;
use crate::providers::{
    ApiClient, Mapper, MappingContext, MappingError, NormalizedRecord, Operation, RawPage,
    RawRecord, TransferDirection,
};

pub const PROVIDER_ID: &str = "etherscan";
const ETH_DECIMALS: u32 = 18;

pub struct EtherscanClient {
    http: HttpClient,
    api_key: String,
}

impl EtherscanClient {
    pub fn new(http: HttpClient, api_key: String) -> Self {
        EtherscanClient { http, api_key }
    }
}

#[async_trait]
impl ApiClient for EtherscanClient {
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
                let resp: EtherscanEnvelope<String> = self
                    .http
                    .get(
                        "api",
                        &[
                            ("module", "account"),
                            ("action", "balance"),
                            ("address", address),
                            ("apikey", &self.api_key),
                        ],
                        cancel,
                    )
                    .await?;
                if resp.status != "1" {
                    return Err(ProviderError::ProviderLogic(resp.message));
                }
                Ok(RawRecord {
                    provider_id: PROVIDER_ID.to_string(),
                    payload: serde_json::json!({ "balance_wei": resp.result }),
                })
            }
            Operation::AddressExists { address } => {
                let resp: EtherscanEnvelope<Vec<EtherscanTx>> = self
                    .http
                    .get(
                        "api",
                        &[
                            ("module", "account"),
                            ("action", "txlist"),
                            ("address", address),
                            ("page", "1"),
                            ("offset", "1"),
                            ("apikey", &self.api_key),
                        ],
                        cancel,
                    )
                    .await?;
                Ok(RawRecord {
                    provider_id: PROVIDER_ID.to_string(),
                    payload: serde_json::json!({ "has_transactions": !resp.result.is_empty() }),
                })
            }
            other => Err(ProviderError::ProviderLogic(format!(
                "etherscan does not support single-shot {other:?}"
            ))),
        }
    }

    async fn execute_page(
        &self,
        op: &Operation,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RawPage, ProviderError> {
        let (address, action) = match op {
            Operation::GetAddressTransactions { address, .. } => (address, "txlist"),
            Operation::GetAddressInternalTransactions { address, .. } => (address, "txlistinternal"),
            Operation::GetAddressTokenTransactions { address, .. } => (address, "tokentx"),
            _ => {
                return Err(ProviderError::ProviderLogic(
                    "etherscan only paginates address-scoped transaction lists".to_string(),
                ))
            }
        };
        let page: u64 = cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(1);
        let page_str = page.to_string();
        let resp: EtherscanEnvelope<Vec<EtherscanTx>> = self
            .http
            .get(
                "api",
                &[
                    ("module", "account"),
                    ("action", action),
                    ("address", address),
                    ("page", &page_str),
                    ("offset", "100"),
                    ("apikey", &self.api_key),
                ],
                cancel,
            )
            .await?;
        let next_cursor = if resp.result.len() == 100 {
            Some((page + 1).to_string())
        } else {
            None
        };
        let records = resp
            .result
            .into_iter()
            .map(|tx| RawRecord {
                provider_id: PROVIDER_ID.to_string(),
                payload: serde_json::to_value(tx).expect("EtherscanTx always serializes"),
            })
            .collect();
        Ok(RawPage { records, next_cursor })
    }
}

#[derive(Debug, Deserialize)]
struct EtherscanEnvelope<T> {
    status: String,
    message: String,
    result: T,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct EtherscanTx {
    hash: String,
    #[serde(rename = "timeStamp")]
    time_stamp: String,
    from: String,
    to: String,
    value: String,
    #[serde(rename = "gasUsed")]
    gas_used: String,
    #[serde(rename = "gasPrice")]
    gas_price: String,
}

pub struct EtherscanMapper;

impl Mapper for EtherscanMapper {
    fn provider_id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn map(
        &self,
        raw: &RawRecord,
        ctx: &MappingContext,
    ) -> Result<NormalizedRecord, MappingError> {
        let tx: EtherscanTx = serde_json::from_value(raw.payload.clone())
            .map_err(|e| MappingError::Malformed(e.to_string()))?;

        let from_is_wallet = ctx.wallet_addresses.contains(&tx.from.to_lowercase());
        let to_is_wallet = ctx.wallet_addresses.contains(&tx.to.to_lowercase());
        let direction = match (from_is_wallet, to_is_wallet) {
            (true, true) => TransferDirection::InternalOut,
            (true, false) => TransferDirection::Out,
            (false, true) => TransferDirection::In,
            (false, false) => {
                return Err(MappingError::Malformed(
                    "transaction does not involve any wallet address".to_string(),
                ))
            }
        };

        let value_wei: BigInt = tx
            .value
            .parse()
            .map_err(|_| MappingError::Malformed("non-numeric value".to_string()))?;
        let signed_wei = if matches!(direction, TransferDirection::Out | TransferDirection::InternalOut) {
            -value_wei
        } else {
            value_wei
        };
        let amount = Decimal::from_smallest_unit(&signed_wei, ETH_DECIMALS);

        let fee = if from_is_wallet {
            let gas_used: BigInt = tx
                .gas_used
                .parse()
                .map_err(|_| MappingError::Malformed("non-numeric gasUsed".to_string()))?;
            let gas_price: BigInt = tx
                .gas_price
                .parse()
                .map_err(|_| MappingError::Malformed("non-numeric gasPrice".to_string()))?;
            Some(("ETH".to_string(), Decimal::from_smallest_unit(&(gas_used * gas_price), ETH_DECIMALS)))
        } else {
            None
        };

        let timestamp_ms = tx
            .time_stamp
            .parse::<i64>()
            .map_err(|_| MappingError::Malformed("non-numeric timeStamp".to_string()))?
            * 1000;

        Ok(NormalizedRecord {
            provider_id: PROVIDER_ID.to_string(),
            external_id: tx.hash.clone(),
            timestamp_ms,
            asset: "ETH".to_string(),
            amount,
            direction,
            fee,
            correlation_id: None,
            order_id: None,
            raw: raw.payload.clone(),
        })
    }
}
