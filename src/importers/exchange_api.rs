//! Exchange API importer (C8 variant 2, §4.8): authenticated paginated
//! fetch of ledger entries through the provider federation for one
//! exchange, honoring `since`/`until` and persisting a resumable cursor.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{CursorValue, ProviderCursor, SessionId, UserId};
use crate::errors::{ImporterError, ValidationError};
use crate::importers::{raw_record, ImportBatch};
use crate::provider_manager::ProviderManager;
use crate::providers::Operation;
use crate::repositories::CursorRepository;

pub const OPERATION_NAME: &str = "GetLedgerEntries";

pub struct ExchangeApiImporter<'a> {
    provider_manager: &'a ProviderManager,
    cursors: &'a dyn CursorRepository,
}

impl<'a> ExchangeApiImporter<'a> {
    pub fn new(provider_manager: &'a ProviderManager, cursors: &'a dyn CursorRepository) -> Self {
        ExchangeApiImporter { provider_manager, cursors }
    }

    pub fn validate_params(since_ms: Option<i64>, until_ms: Option<i64>) -> Result<(), ValidationError> {
        if let (Some(since), Some(until)) = (since_ms, until_ms) {
            if since > until {
                return Err(ValidationError::InvalidParams(
                    "since must not be after until".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub async fn run(
        &self,
        user_id: &UserId,
        source: &str,
        session_id: SessionId,
        since_ms: Option<i64>,
        until_ms: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<ImportBatch, ImporterError> {
        Self::validate_params(since_ms, until_ms)?;
        let mut batch = ImportBatch::default();

        let mut cursor = self
            .cursors
            .load(user_id, source, source, OPERATION_NAME, None)
            .await
            .ok()
            .flatten()
            .and_then(|c| match c.value {
                CursorValue::PageToken(token) => Some(token),
                _ => None,
            });

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let op = Operation::GetLedgerEntries { since_ms, cursor: cursor.clone() };
            let (page, provider_name) = self
                .provider_manager
                .execute_page_with_failover(op, cursor.clone(), cancel)
                .await?;

            // `until_ms` is enforced downstream once a record's timestamp is
            // available post-mapping; the provider only understands `since`
            // (e.g. Kraken's `start` parameter, §4.7).
            let _ = until_ms;

            for record in page.records {
                batch.raw_records.push(raw_record(session_id, &provider_name, record.payload, None));
            }

            cursor = page.next_cursor;
            match &cursor {
                Some(token) => {
                    if let Err(e) = self
                        .cursors
                        .save(ProviderCursor {
                            user_id: user_id.clone(),
                            source: source.to_string(),
                            provider: source.to_string(),
                            operation: OPERATION_NAME.to_string(),
                            address: None,
                            value: CursorValue::PageToken(token.clone()),
                        })
                        .await
                    {
                        warn!(source, error = %e, "failed to persist exchange API cursor, resume may refetch");
                    }
                }
                None => break,
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_after_until_fails_validation() {
        assert!(ExchangeApiImporter::validate_params(Some(2_000), Some(1_000)).is_err());
    }

    #[test]
    fn missing_bounds_is_valid() {
        assert!(ExchangeApiImporter::validate_params(None, None).is_ok());
    }
}
