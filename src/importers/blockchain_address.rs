//! Blockchain address importer (C8 variant 3, §4.8): single-address fetch
//! across one or more operations through the provider manager. Each
//! operation yields its own normalized stream; all raw records for the
//! address are tagged with the provider that actually served them.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{ProviderCursor, SessionId, UserId};
use crate::errors::{AllProvidersFailed, ImporterError, ValidationError};
use crate::importers::{raw_record, ImportBatch};
use crate::provider_manager::ProviderManager;
use crate::registry::OperationKind;
use crate::repositories::CursorRepository;
use crate::domain::CursorValue;
use crate::providers::Operation;

pub struct BlockchainAddressImporter<'a> {
    provider_manager: &'a ProviderManager,
    cursors: &'a dyn CursorRepository,
}

impl<'a> BlockchainAddressImporter<'a> {
    pub fn new(provider_manager: &'a ProviderManager, cursors: &'a dyn CursorRepository) -> Self {
        BlockchainAddressImporter { provider_manager, cursors }
    }

    pub fn validate_params(address: &str) -> Result<(), ValidationError> {
        if address.trim().is_empty() {
            return Err(ValidationError::InvalidAddress("address must not be empty".to_string()));
        }
        Ok(())
    }

    /// Fetches `operations` for a single address, resuming each from its
    /// persisted cursor and persisting progress after every page so a
    /// crash mid-scan resumes rather than re-fetching from scratch.
    pub async fn run(
        &self,
        user_id: &UserId,
        source: &str,
        session_id: SessionId,
        address: &str,
        operations: &[OperationKind],
        cancel: &CancellationToken,
    ) -> Result<ImportBatch, ImporterError> {
        Self::validate_params(address)?;
        let mut batch = ImportBatch::default();

        for kind in operations {
            if cancel.is_cancelled() {
                break;
            }
            match kind {
                OperationKind::GetAddressBalances => {
                    let op = Operation::GetAddressBalances { address: address.to_string() };
                    let (record, provider_name) =
                        self.provider_manager.execute_with_failover(op, cancel).await?;
                    batch.raw_records.push(raw_record(
                        session_id,
                        &provider_name,
                        record.payload,
                        Some(address.to_string()),
                    ));
                }
                OperationKind::GetAddressTransactions
                | OperationKind::GetAddressInternalTransactions
                | OperationKind::GetAddressTokenTransactions => {
                    self.run_paginated(user_id, source, session_id, address, *kind, cancel, &mut batch)
                        .await?;
                }
                _ => continue,
            }
        }

        Ok(batch)
    }

    async fn run_paginated(
        &self,
        user_id: &UserId,
        source: &str,
        session_id: SessionId,
        address: &str,
        kind: OperationKind,
        cancel: &CancellationToken,
        batch: &mut ImportBatch,
    ) -> Result<(), AllProvidersFailed> {
        let operation_name = format!("{kind:?}");
        // Cursor identity does not key on which provider ultimately serves
        // the request (failover can switch providers mid-scan), so a fixed
        // placeholder is used here rather than the serving provider's name.
        const CURSOR_PROVIDER: &str = "any";
        let mut cursor = self
            .cursors
            .load(user_id, source, CURSOR_PROVIDER, &operation_name, Some(address))
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
            let op = match kind {
                OperationKind::GetAddressTransactions => Operation::GetAddressTransactions {
                    address: address.to_string(),
                    cursor: cursor.clone(),
                },
                OperationKind::GetAddressInternalTransactions => {
                    Operation::GetAddressInternalTransactions {
                        address: address.to_string(),
                        cursor: cursor.clone(),
                    }
                }
                OperationKind::GetAddressTokenTransactions => Operation::GetAddressTokenTransactions {
                    address: address.to_string(),
                    cursor: cursor.clone(),
                },
                _ => unreachable!("caller only dispatches address-list operation kinds"),
            };

            let (page, provider_name) = self
                .provider_manager
                .execute_page_with_failover(op, cursor.clone(), cancel)
                .await?;

            for record in page.records {
                batch.raw_records.push(raw_record(
                    session_id,
                    &provider_name,
                    record.payload,
                    Some(address.to_string()),
                ));
            }

            cursor = page.next_cursor;
            if let Some(token) = &cursor {
                if let Err(e) = self
                    .cursors
                    .save(ProviderCursor {
                        user_id: user_id.clone(),
                        source: source.to_string(),
                        provider: CURSOR_PROVIDER.to_string(),
                        operation: operation_name.clone(),
                        address: Some(address.to_string()),
                        value: CursorValue::PageToken(token.clone()),
                    })
                    .await
                {
                    warn!(address, operation = %operation_name, error = %e, "failed to persist address cursor, resume may refetch");
                }
            } else {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_fails_validation() {
        assert!(BlockchainAddressImporter::validate_params("").is_err());
    }
}
