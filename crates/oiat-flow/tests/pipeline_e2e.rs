//! End-to-end pipeline runs against a mocked remote accounting service.
//!
//! Covers the happy path, future-spill creation, spill merge on the next
//! day, and idempotent re-runs, all through the real orchestrator with a
//! fixture downloader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use wiremock::matchers::{method, path, query_param_contains};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oiat_core::{CompanyConfig, StateDir, TenantKey};
use oiat_flow::events::{CollectingSink, PipelineEventData};
use oiat_flow::pipeline::{Pipeline, RunOptions, RunScope};
use oiat_flow::upload::ReconcileOutcome;
use oiat_flow::{CsvTransformer, FixtureDownloader, Ledger};
use oiat_qbo::refresh::{OAuthCredentials, TokenManager};
use oiat_qbo::store::{TokenRecord, TokenStore};
use oiat_qbo::QboClient;

const RAW_HEADER: &str = "Product,Category,Date/Time,TOTAL Sales,Quantity,Tax,Tender\n";

fn tenant() -> TenantKey {
    TenantKey::new("company_a").unwrap()
}

fn config() -> CompanyConfig {
    let raw = serde_json::json!({
        "company_key": "company_a",
        "display_name": "Main Store",
        "qbo": {
            "realm_id": "realm-1",
            "deposit_account": "Undeposited Funds",
            "tax": {"mode": "none"},
            "bypass_income_account_id": "77"
        },
        "epos": {"username_env_key": "EPOS_U", "password_env_key": "EPOS_P"},
        "transform": {
            "group_by": "date_tender",
            "date_format": "%Y-%m-%d",
            "receipt_prefix": "SR"
        },
        "output": {
            "csv_prefix": "single_sales_receipts",
            "metadata_file": "last_epos_transform.json",
            "ledger_file": "uploaded_docnumbers.json"
        }
    })
    .to_string();
    CompanyConfig::from_json(&raw, None).unwrap()
}

/// Writes a raw POS fixture: `counts` pairs of (date `dd/mm/yyyy`, rows),
/// each row worth 100.0.
fn write_fixture(path: &Path, counts: &[(&str, usize)]) {
    let mut contents = RAW_HEADER.to_string();
    for (date, rows) in counts {
        for i in 0..*rows {
            contents.push_str(&format!(
                "Water,Drinks,{date} {:02}:10:00,100,1,0,Cash\n",
                8 + (i % 12)
            ));
        }
    }
    std::fs::write(path, contents).unwrap();
}

async fn remote_with_items(existing_docs: &[(&str, &str, f64)], items: &[(&str, &str)]) -> MockServer {
    let server = MockServer::start().await;

    let receipts: Vec<serde_json::Value> = existing_docs
        .iter()
        .map(|(doc, date, total)| {
            serde_json::json!({"Id": "1", "DocNumber": doc, "TxnDate": date, "TotalAmt": total})
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/v3/company/realm-1/query"))
        .and(query_param_contains("query", "DocNumber IN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "QueryResponse": {"SalesReceipt": receipts}
        })))
        .mount(&server)
        .await;

    let item_values: Vec<serde_json::Value> = items
        .iter()
        .map(|(id, name)| serde_json::json!({"Id": id, "Name": name, "Type": "Service"}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/v3/company/realm-1/query"))
        .and(query_param_contains("query", "FROM Item"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "QueryResponse": {"Item": item_values}
        })))
        .mount(&server)
        .await;

    server
}

async fn mount_reconcile_total(server: &MockServer, total: f64) {
    Mock::given(method("GET"))
        .and(path("/v3/company/realm-1/query"))
        .and(query_param_contains("query", "TxnDate ="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "QueryResponse": {"SalesReceipt": [{"Id": "1", "TotalAmt": total}]}
        })))
        .mount(server)
        .await;
}

async fn mount_create_receipt(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/v3/company/realm-1/salesreceipt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "SalesReceipt": {"Id": "900", "DocNumber": "SR"}
        })))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_create_item(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/v3/company/realm-1/item"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Item": {"Id": "42", "Name": "Water", "Type": "Service"}
        })))
        .expect(expected)
        .mount(server)
        .await;
}

async fn client_for(server: &MockServer, state: &StateDir) -> QboClient {
    let store = Arc::new(TokenStore::open(&state.token_db()).unwrap());
    store
        .save(
            &tenant(),
            "realm-1",
            &TokenRecord {
                access_token: "tok".into(),
                refresh_token: "refresh".into(),
                access_expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                refresh_expires_at: None,
                environment: "production".into(),
            },
        )
        .unwrap();
    let manager = Arc::new(TokenManager::with_token_url(
        store,
        OAuthCredentials::new("id", "secret"),
        format!("{}/oauth2/v1/tokens/bearer", server.uri()),
    ));
    QboClient::connect_to(manager, tenant(), "realm-1", server.uri())
        .await
        .unwrap()
}

fn pipeline_for(
    state: &StateDir,
    client: QboClient,
    fixture: &Path,
    sink: Arc<CollectingSink>,
) -> Pipeline {
    Pipeline::new(
        state.clone(),
        config(),
        Arc::new(FixtureDownloader::new(fixture)),
        Arc::new(CsvTransformer),
        client,
        sink,
    )
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn spill_path(state: &StateDir, d: &str) -> PathBuf {
    state.spill_file(&config().dir_name(), date(d))
}

#[tokio::test]
async fn happy_path_single_date() {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());

    let server = remote_with_items(&[], &[]).await;
    mount_create_item(&server, 1).await;
    mount_create_receipt(&server, 1).await;
    mount_reconcile_total(&server, 500.0).await;

    let fixture = dir.path().join("fixture.csv");
    write_fixture(&fixture, &[("27/12/2025", 5)]);

    let sink = Arc::new(CollectingSink::new());
    let client = client_for(&server, &state).await;
    let pipeline = pipeline_for(&state, client, &fixture, Arc::clone(&sink));

    let report = pipeline
        .run(RunScope::single(date("2025-12-27")), &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.dates.len(), 1);
    let day = &report.dates[0];
    assert_eq!(day.rows_in, 5);
    assert_eq!(day.upload.created, 1);
    assert_eq!(day.upload.failed, 0);
    assert_eq!(day.upload.reconcile, ReconcileOutcome::Match);
    assert!((day.upload.source_total - 500.0).abs() < 1e-9);

    // Ledger carries the document number.
    let ledger = Ledger::load(
        state.ledger_file(&config().dir_name(), "uploaded_docnumbers.json"),
    )
    .unwrap();
    assert!(ledger.contains("SR-20251227-0001"));

    // Archive holds the split file, the normalized CSV, the metadata, and
    // the original download; staging is gone.
    let archive = state.archive_dir(date("2025-12-27"));
    let archived: Vec<String> = std::fs::read_dir(&archive)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(archived.iter().any(|n| n.starts_with("RAW_SPLIT_")));
    assert!(archived.iter().any(|n| n.starts_with("single_sales_receipts_")));
    assert!(archived.iter().any(|n| n == "transform_metadata.json"));
    assert!(archived.iter().any(|n| n.starts_with("ORIGINAL_")));
    assert!(!state
        .staging_dir(&config().dir_name(), date("2025-12-27"), date("2025-12-27"))
        .exists());

    // Event stream bookends.
    let events = sink.snapshot();
    assert!(matches!(events.first().unwrap().data, PipelineEventData::PipelineStarted));
    assert!(events
        .iter()
        .any(|e| matches!(e.data, PipelineEventData::UploadSummary { created: 1, .. })));
    assert!(matches!(
        events.last().unwrap().data,
        PipelineEventData::PipelineSucceeded
    ));
}

#[tokio::test]
async fn future_rows_spill_and_are_not_archived() {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());

    let server = remote_with_items(&[], &[]).await;
    mount_create_item(&server, 1).await;
    mount_create_receipt(&server, 1).await;
    mount_reconcile_total(&server, 500.0).await;

    let fixture = dir.path().join("fixture.csv");
    write_fixture(&fixture, &[("27/12/2025", 5), ("28/12/2025", 2)]);

    let sink = Arc::new(CollectingSink::new());
    let client = client_for(&server, &state).await;
    let pipeline = pipeline_for(&state, client, &fixture, Arc::clone(&sink));

    let report = pipeline
        .run(RunScope::single(date("2025-12-27")), &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.dates.len(), 1);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("future raw spill: 2025-12-28 (2 rows)")));

    // The spill stays in place, unarchived, for the next run.
    let spill = spill_path(&state, "2025-12-28");
    assert!(spill.is_file());

    let events = sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e.data,
        PipelineEventData::SpillCreated { rows: 2, .. }
    )));
}

#[tokio::test]
async fn spill_merges_on_its_day_and_archives() {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());

    // Day one: produce the 2025-12-28 spill.
    {
        let server = remote_with_items(&[], &[]).await;
        mount_create_item(&server, 1).await;
        mount_create_receipt(&server, 1).await;
        mount_reconcile_total(&server, 500.0).await;

        let fixture = dir.path().join("day1.csv");
        write_fixture(&fixture, &[("27/12/2025", 5), ("28/12/2025", 2)]);
        let client = client_for(&server, &state).await;
        let pipeline =
            pipeline_for(&state, client, &fixture, Arc::new(CollectingSink::new()));
        pipeline
            .run(RunScope::single(date("2025-12-27")), &RunOptions::default())
            .await
            .unwrap();
    }
    assert!(spill_path(&state, "2025-12-28").is_file());

    // Day two: a fresh download with 12-28 and 12-29 rows; the 12-28 spill
    // merges in and a new 12-29 spill appears.
    let server = remote_with_items(&[], &[("42", "Water")]).await;
    // Water resolves from the prefetched catalog; no item create happens.
    mount_create_item(&server, 0).await;
    mount_create_receipt(&server, 1).await;
    mount_reconcile_total(&server, 500.0).await;

    let fixture = dir.path().join("day2.csv");
    write_fixture(&fixture, &[("28/12/2025", 3), ("29/12/2025", 1)]);

    let sink = Arc::new(CollectingSink::new());
    let client = client_for(&server, &state).await;
    let pipeline = pipeline_for(&state, client, &fixture, Arc::clone(&sink));
    let report = pipeline
        .run(RunScope::single(date("2025-12-28")), &RunOptions::default())
        .await
        .unwrap();

    // 3 fresh rows + 2 spilled rows feed the transformer.
    assert_eq!(report.dates[0].rows_in, 5);
    assert!((report.dates[0].upload.source_total - 500.0).abs() < 1e-9);

    let events = sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e.data,
        PipelineEventData::SpillMerged {
            target_rows: 3,
            spill_rows: 2,
            final_rows: 5,
            ..
        }
    )));

    // The consumed spill moved into the archive; the new one remains.
    assert!(!spill_path(&state, "2025-12-28").exists());
    let archive = state.archive_dir(date("2025-12-28"));
    let archived: Vec<String> = std::fs::read_dir(&archive)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(archived.iter().any(|n| n.starts_with("RAW_SPILL_")));
    assert!(archived.iter().any(|n| n.starts_with("RAW_COMBINED_")));
    assert!(spill_path(&state, "2025-12-29").is_file());
}

#[tokio::test]
async fn rerun_is_idempotent_with_zero_new_documents() {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());
    let fixture = dir.path().join("fixture.csv");
    write_fixture(&fixture, &[("27/12/2025", 5)]);

    // First run uploads normally.
    {
        let server = remote_with_items(&[], &[]).await;
        mount_create_item(&server, 1).await;
        mount_create_receipt(&server, 1).await;
        mount_reconcile_total(&server, 500.0).await;

        let client = client_for(&server, &state).await;
        let pipeline =
            pipeline_for(&state, client, &fixture, Arc::new(CollectingSink::new()));
        let report = pipeline
            .run(RunScope::single(date("2025-12-27")), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.dates[0].upload.created, 1);
    }

    // Second run: the ledger and the remote both vouch for the document;
    // zero POSTs are issued (expect(0) enforces it).
    let server = remote_with_items(
        &[("SR-20251227-0001", "2025-12-27", 500.0)],
        &[("42", "Water")],
    )
    .await;
    mount_create_item(&server, 0).await;
    mount_create_receipt(&server, 0).await;
    mount_reconcile_total(&server, 500.0).await;

    let client = client_for(&server, &state).await;
    let pipeline = pipeline_for(&state, client, &fixture, Arc::new(CollectingSink::new()));
    let report = pipeline
        .run(RunScope::single(date("2025-12-27")), &RunOptions::default())
        .await
        .unwrap();

    let day = &report.dates[0];
    assert_eq!(day.upload.created, 0);
    assert_eq!(day.upload.skipped_dup, 1);
    assert_eq!(day.upload.reconcile, ReconcileOutcome::Match);
}

#[tokio::test]
async fn empty_raw_file_succeeds_with_match() {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());

    let server = remote_with_items(&[], &[]).await;
    let fixture = dir.path().join("empty.csv");
    write_fixture(&fixture, &[]);

    let client = client_for(&server, &state).await;
    let pipeline = pipeline_for(&state, client, &fixture, Arc::new(CollectingSink::new()));
    let report = pipeline
        .run(RunScope::single(date("2025-12-27")), &RunOptions::default())
        .await
        .unwrap();

    let day = &report.dates[0];
    assert_eq!(day.rows_in, 0);
    assert_eq!(day.upload.attempted, 0);
    assert_eq!(day.upload.reconcile, ReconcileOutcome::Match);
}

#[tokio::test]
async fn range_mode_processes_each_date() {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());

    let server = remote_with_items(&[], &[]).await;
    // The catalog is prefetched per date, so the second date re-creates
    // the item its prefetch still cannot see (the mock stays empty).
    mount_create_item(&server, 2).await;
    mount_create_receipt(&server, 2).await;
    mount_reconcile_total(&server, 300.0).await;

    let fixture = dir.path().join("range.csv");
    write_fixture(&fixture, &[("27/12/2025", 3), ("28/12/2025", 3)]);

    let client = client_for(&server, &state).await;
    let pipeline = pipeline_for(&state, client, &fixture, Arc::new(CollectingSink::new()));
    let report = pipeline
        .run(
            RunScope {
                from: date("2025-12-27"),
                to: date("2025-12-28"),
            },
            &RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.dates.len(), 2);
    assert!(report.dates.iter().all(|d| d.upload.created == 1));
    assert!(state.archive_dir(date("2025-12-27")).is_dir());
    assert!(state.archive_dir(date("2025-12-28")).is_dir());
}
