//! Source-type-specific import orchestration (C8, §4.8). Four variants,
//! selected by `(source_type, source_name)`: exchange CSV, exchange API,
//! blockchain address, and blockchain xpub.
//!
//! Every importer validates its parameters before any I/O and validates
//! each raw record before emission; a per-record validation failure drops
//! that record with a diagnostic rather than aborting the whole import
//! (§4.8 "Validation").

pub mod blockchain_address;
pub mod exchange_api;
pub mod exchange_csv;
pub mod xpub;

use crate::domain::{RawDataRecord, SessionId};
use crate::errors::ValidationError;

/// One record that failed validation and was dropped, with enough context
/// to diagnose why.
#[derive(Debug, Clone)]
pub struct ValidationDiagnostic {
    pub record_excerpt: String,
    pub error: ValidationError,
}

/// The result of running one importer to completion (or to cancellation).
#[derive(Debug, Clone, Default)]
pub struct ImportBatch {
    pub raw_records: Vec<RawDataRecord>,
    pub diagnostics: Vec<ValidationDiagnostic>,
}

impl ImportBatch {
    pub fn merge(&mut self, other: ImportBatch) {
        self.raw_records.extend(other.raw_records);
        self.diagnostics.extend(other.diagnostics);
    }
}

pub(crate) fn raw_record(
    session_id: SessionId,
    provider_id: &str,
    payload: serde_json::Value,
    fetched_by_address: Option<String>,
) -> RawDataRecord {
    RawDataRecord {
        id: uuid::Uuid::new_v4(),
        session_id,
        provider_id: provider_id.to_string(),
        payload,
        ingested_at: chrono::Utc::now(),
        fetched_by_address,
    }
}
