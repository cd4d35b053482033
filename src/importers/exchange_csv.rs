//! Exchange CSV importer: consumes a directory of exported ledger CSVs.
//! Pure local I/O, no rate limiting, no provider manager involvement
//! (§4.8 variant 1).

use std::path::{Path, PathBuf};

use crate::domain::SessionId;
use crate::errors::ValidationError;
use crate::importers::{raw_record, ImportBatch, ValidationDiagnostic};
use crate::providers::kraken::KrakenLedgerRow;

pub const PROVIDER_ID: &str = "csv";

pub struct ExchangeCsvImporter {
    directory: PathBuf,
}

impl ExchangeCsvImporter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        ExchangeCsvImporter { directory: directory.into() }
    }

    /// Validates the directory exists before touching any file
    /// (§4.8: "validates its parameters before any network I/O").
    pub fn validate_params(&self) -> Result<(), ValidationError> {
        if !self.directory.is_dir() {
            return Err(ValidationError::InvalidParams(format!(
                "{} is not a directory",
                self.directory.display()
            )));
        }
        Ok(())
    }

    /// Directory listing and CSV parsing are blocking std I/O (§5); both
    /// run on the blocking thread pool via `spawn_blocking` rather than
    /// inline on the async task.
    pub async fn run(&self, session_id: SessionId) -> Result<ImportBatch, ValidationError> {
        self.validate_params()?;
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || Self::import_directory(&directory, session_id))
            .await
            .map_err(|e| ValidationError::InvalidParams(format!("csv import task panicked: {e}")))?
    }

    fn import_directory(directory: &Path, session_id: SessionId) -> Result<ImportBatch, ValidationError> {
        let mut batch = ImportBatch::default();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(directory)
            .map_err(|e| ValidationError::InvalidParams(e.to_string()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "csv").unwrap_or(false))
            .collect();
        entries.sort();

        for path in entries {
            Self::import_file(&path, session_id, &mut batch);
        }
        Ok(batch)
    }

    fn import_file(path: &Path, session_id: SessionId, batch: &mut ImportBatch) {
        let mut reader = match csv::Reader::from_path(path) {
            Ok(r) => r,
            Err(e) => {
                batch.diagnostics.push(ValidationDiagnostic {
                    record_excerpt: path.display().to_string(),
                    error: ValidationError::InvalidParams(e.to_string()),
                });
                return;
            }
        };
        for result in reader.deserialize::<KrakenLedgerRow>() {
            match result {
                Ok(row) => {
                    let payload = serde_json::to_value(&row).expect("row always serializes");
                    batch.raw_records.push(raw_record(session_id, PROVIDER_ID, payload, None));
                }
                Err(e) => {
                    batch.diagnostics.push(ValidationDiagnostic {
                        record_excerpt: format!("{}:{}", path.display(), e),
                        error: ValidationError::SchemaError(e.to_string()),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_fails_validation_before_any_io() {
        let importer = ExchangeCsvImporter::new("/definitely/not/a/real/path");
        assert!(importer.validate_params().is_err());
    }
}
