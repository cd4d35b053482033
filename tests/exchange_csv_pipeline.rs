//! End-to-end exercise of the full Import -> Normalize -> Process ->
//! Ledgerize pipeline (§4.12, §8 "End-to-end scenarios") against a directory
//! of exported Kraken-style CSV ledgers, using the in-memory repository
//! implementations. Mirrors the teacher's `engine/tests/integration_test.rs`
//! convention of exercising whole subsystems rather than single functions.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use ledger_ingest_engine::domain::{AssetClass, Currency};
use ledger_ingest_engine::orchestrator::{ImportParams, PipelineOrchestrator};
use ledger_ingest_engine::processors::grouping::ByCorrelationId;
use ledger_ingest_engine::processors::interpretation::ExchangeInterpretation;
use ledger_ingest_engine::processors::Processor;
use ledger_ingest_engine::provider_manager::{ProviderManager, ProviderManagerBuilder, ProviderManagerConfig};
use ledger_ingest_engine::providers::kraken::KrakenMapper;
use ledger_ingest_engine::providers::Mapper;
use ledger_ingest_engine::repositories::in_memory::{
    InMemoryCurrencyRepository, InMemoryCursorRepository, InMemoryLedgerStore,
    InMemoryRawDataRepository, InMemorySessionRepository,
};
use ledger_ingest_engine::repositories::RepositorySet;

fn write_ledger_csv(dir: &std::path::Path, name: &str, rows: &[&str]) {
    let mut file = std::fs::File::create(dir.join(name)).unwrap();
    writeln!(file, "refid,time,type,asset,amount,fee").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
}

fn empty_provider_manager() -> ProviderManager {
    ProviderManagerBuilder::new("none", ProviderManagerConfig::default()).build()
}

fn repos() -> (RepositorySet, Arc<InMemoryRawDataRepository>) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let raw_data = Arc::new(InMemoryRawDataRepository::new());
    let currencies = Arc::new(InMemoryCurrencyRepository::seeded(vec![
        Currency {
            ticker: "BTC".to_string(),
            display_name: "Bitcoin".to_string(),
            decimals: 8,
            asset_class: AssetClass::Crypto,
            network: Some("bitcoin".to_string()),
            contract_address: None,
            is_native: true,
        },
        Currency {
            ticker: "USD".to_string(),
            display_name: "US Dollar".to_string(),
            decimals: 2,
            asset_class: AssetClass::Fiat,
            network: None,
            contract_address: None,
            is_native: false,
        },
    ]));

    let repos = RepositorySet {
        transactions: store.clone(),
        accounts: store.clone(),
        currencies,
        sessions: Arc::new(InMemorySessionRepository::new()),
        cursors: Arc::new(InMemoryCursorRepository::new()),
        raw_data: raw_data.clone(),
    };
    (repos, raw_data)
}

fn kraken_mappers() -> HashMap<String, Box<dyn Mapper>> {
    // The CSV importer tags every row with provider id "csv" (§4.8 variant
    // 1); the normalize phase looks mappers up by that tag, so the Kraken
    // mapper (which otherwise also backs the authenticated exchange-API
    // importer) is registered under the same key here.
    let mut mappers: HashMap<String, Box<dyn Mapper>> = HashMap::new();
    mappers.insert("csv".to_string(), Box::new(KrakenMapper));
    mappers
}

#[tokio::test]
async fn balanced_deposit_and_swap_round_trip_through_the_whole_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    write_ledger_csv(
        dir.path(),
        "ledgers.csv",
        &[
            // A plain BTC deposit: one row, its own group.
            "R-DEPOSIT,2024-01-15 09:00:00.0000,deposit,XXBT,0.5,0",
            // A BTC -> USD swap: two rows sharing refid, consolidated into
            // one UniversalTransaction by ByCorrelationId (§4.9 scenario 2).
            "R-SWAP,2024-01-15 10:30:00.0000,trade,XXBT,-0.1,0",
            "R-SWAP,2024-01-15 10:30:00.0000,trade,ZUSD,6000,10",
        ],
    );

    let (repos, raw_data) = repos();
    let provider_manager = empty_provider_manager();
    let mappers = kraken_mappers();
    let processor = Processor::new(Box::new(ByCorrelationId), Box::new(ExchangeInterpretation));
    let orchestrator = PipelineOrchestrator::new(&provider_manager, &mappers, &repos, processor);
    let cancel = CancellationToken::new();

    let outcome = orchestrator
        .run_import(
            &"user-1".to_string(),
            "kraken",
            "exchange_csv",
            ImportParams::ExchangeCsv { directory: dir.path().to_path_buf() },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(outcome.raw_record_count, 3);
    assert_eq!(outcome.universal_tx_count, 2);
    assert!(outcome.batch.failed.is_empty());
    assert_eq!(outcome.batch.successful.len(), 2);
    assert_eq!(raw_data.count(), 3);

    // The swap transaction balances per currency: BTC sums to zero and USD
    // sums to zero once the platform fee is expensed (§8 scenario 2). The
    // consolidated group's id is its first record's external id, i.e. the
    // BTC leg (the CSV's row order), not the USD leg.
    let swap_tx = repos
        .transactions
        .find_by_external_id(&"user-1".to_string(), "kraken", "R-SWAP:BTC")
        .await
        .unwrap()
        .expect("swap transaction committed");
    assert_eq!(swap_tx.source, "kraken");

    let deposit_tx = repos
        .transactions
        .find_by_external_id(&"user-1".to_string(), "kraken", "R-DEPOSIT:BTC")
        .await
        .unwrap()
        .expect("deposit transaction committed");
    assert_eq!(deposit_tx.source, "kraken");
}

#[tokio::test]
async fn reimporting_the_same_directory_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_ledger_csv(
        dir.path(),
        "ledgers.csv",
        &["R-DEPOSIT,2024-01-15 09:00:00.0000,deposit,XXBT,0.5,0"],
    );

    let (repos, _raw_data) = repos();
    let provider_manager = empty_provider_manager();
    let mappers = kraken_mappers();

    let processor = Processor::new(Box::new(ByCorrelationId), Box::new(ExchangeInterpretation));
    let orchestrator = PipelineOrchestrator::new(&provider_manager, &mappers, &repos, processor);
    let cancel = CancellationToken::new();

    let first = orchestrator
        .run_import(
            &"user-1".to_string(),
            "kraken",
            "exchange_csv",
            ImportParams::ExchangeCsv { directory: dir.path().to_path_buf() },
            &cancel,
        )
        .await
        .unwrap();
    let second = orchestrator
        .run_import(
            &"user-1".to_string(),
            "kraken",
            "exchange_csv",
            ImportParams::ExchangeCsv { directory: dir.path().to_path_buf() },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(first.batch.successful.len(), 1);
    assert_eq!(second.batch.successful.len(), 1);
    assert!(second.batch.failed.is_empty());
    // Re-importing produced no new transaction: the same id comes back both
    // times (§8 scenario 6, §4.11 idempotency).
    assert_eq!(first.batch.successful[0], second.batch.successful[0]);
}

#[tokio::test]
async fn unknown_provider_tag_is_collected_as_a_diagnostic_not_an_abort() {
    let dir = tempfile::tempdir().unwrap();
    write_ledger_csv(
        dir.path(),
        "ledgers.csv",
        &["R1,2024-01-15 09:00:00.0000,deposit,XXBT,0.5,0"],
    );

    let (repos, _raw_data) = repos();
    let provider_manager = empty_provider_manager();
    // No mapper registered for "csv" at all: every record should be
    // reported as a diagnostic, not abort the whole import.
    let mappers: HashMap<String, Box<dyn Mapper>> = HashMap::new();
    let processor = Processor::new(Box::new(ByCorrelationId), Box::new(ExchangeInterpretation));
    let orchestrator = PipelineOrchestrator::new(&provider_manager, &mappers, &repos, processor);
    let cancel = CancellationToken::new();

    let outcome = orchestrator
        .run_import(
            &"user-1".to_string(),
            "kraken",
            "exchange_csv",
            ImportParams::ExchangeCsv { directory: dir.path().to_path_buf() },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(outcome.raw_record_count, 1);
    assert_eq!(outcome.normalized_count, 0);
    assert_eq!(outcome.universal_tx_count, 0);
    assert_eq!(outcome.import_diagnostics.len(), 1);
}
