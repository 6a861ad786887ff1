//! Idempotent upload engine.
//!
//! Documents are deduplicated through two layers before any write: the
//! local ledger (layer A) and a bulk remote existence check (layer B).
//! Layer B also heals the ledger in both directions: documents found
//! remotely are back-filled into the ledger, and ledger entries the
//! remote does not know ("stale ledger") are removed and retried.
//!
//! Creates are strictly serial; document-number uniqueness makes
//! parallel writes pointless and retry-hostile. Prefetch reads may fan
//! out (bounded) before the serial phase starts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::NaiveDate;
use metrics::counter;
use tracing::{info, warn};

use oiat_core::{CompanyConfig, Error, Result, TaxMode};
use oiat_qbo::types::{
    escape_query_literal, Ref, ReceiptLine, SalesItemLineDetail, SalesReceiptPayload, TaxLine,
    TaxLineDetail, TxnTaxDetail,
};
use oiat_qbo::QboClient;

use crate::inventory::{
    self, get_or_create_bypass_item, needs_bypass, ItemCatalog, ItemFacts, ProductMapping,
    ResolvedItem,
};
use crate::ledger::Ledger;

/// Batch size for the remote existence query.
const EXISTENCE_BATCH: usize = 50;

/// Name of the fallback service item used by the bypass path.
const BYPASS_ITEM_NAME: &str = "Backdated Sale (Service)";

/// Tender → remote payment method id.
///
/// Ids come from the remote company's payment-method list; tenants that
/// differ simply miss the reference (the document still uploads).
const PAYMENT_METHOD_BY_NAME: [(&str, &str); 10] = [
    ("Card", "5"),
    ("Cash", "1"),
    ("Cash/Transfer", "8"),
    ("Cheque", "2"),
    ("Credit Card", "3"),
    ("Direct Debit", "4"),
    ("Transfer", "6"),
    ("Card/Transfer", "9"),
    ("Card/Cash", "7"),
    ("Card/Cash/Transfer", "10"),
];

/// Knobs for one upload invocation.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Compute everything but issue no remote writes.
    pub dry_run: bool,
    /// Match existence-check hits on transaction date as well.
    pub trading_day_mode: bool,
    /// Swap lines on backdated inventory items to the fallback service item.
    pub bypass_inventory_start_date: bool,
    /// Reconciliation tolerance in currency units.
    pub reconcile_tolerance: f64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            trading_day_mode: false,
            bypass_inventory_start_date: false,
            reconcile_tolerance: 1.0,
        }
    }
}

/// Reconciliation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Totals agree within tolerance.
    Match,
    /// Totals disagree.
    Mismatch,
    /// Reconciliation did not run (dry run, query failure).
    NotRun,
}

/// Result of one upload invocation.
#[derive(Debug, Clone)]
pub struct UploadResult {
    /// Documents considered.
    pub attempted: u64,
    /// Documents skipped by either dedup layer.
    pub skipped_dup: u64,
    /// Documents created remotely.
    pub created: u64,
    /// Documents that failed remote validation.
    pub failed: u64,
    /// Document numbers created in this run.
    pub created_doc_numbers: Vec<String>,
    /// Source-side monetary total (sum of gross line amounts).
    pub source_total: f64,
    /// Remote-side total for the date, from the reconciliation query.
    pub remote_total: f64,
    /// |source - remote|.
    pub difference: f64,
    /// Reconciliation verdict.
    pub reconcile: ReconcileOutcome,
    /// Operator-facing warnings accumulated along the way.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct NormalizedRow {
    doc_number: String,
    date_str: String,
    memo: String,
    location: String,
    item_name: String,
    description: String,
    quantity: f64,
    amount: f64,
    tax: f64,
}

/// Uploads one normalized CSV for one (tenant, date).
///
/// # Errors
///
/// Fatal errors (token, storage, malformed input) abort the run.
/// Per-document validation failures do not; they are counted and
/// reported in the result.
pub async fn upload(
    client: &QboClient,
    ledger: &mut Ledger,
    normalized_csv: &Path,
    config: &CompanyConfig,
    target_date: NaiveDate,
    options: &UploadOptions,
) -> Result<UploadResult> {
    let rows = read_normalized(normalized_csv)?;
    let mut groups: BTreeMap<String, Vec<NormalizedRow>> = BTreeMap::new();
    let mut source_total = 0.0;
    for row in rows {
        source_total += row.amount;
        groups.entry(row.doc_number.clone()).or_default().push(row);
    }

    let mut result = UploadResult {
        attempted: groups.len() as u64,
        skipped_dup: 0,
        created: 0,
        failed: 0,
        created_doc_numbers: Vec::new(),
        source_total,
        remote_total: 0.0,
        difference: 0.0,
        reconcile: ReconcileOutcome::NotRun,
        warnings: Vec::new(),
    };

    if groups.is_empty() {
        // Nothing to post; an empty day reconciles trivially.
        result.reconcile = ReconcileOutcome::Match;
        return Ok(result);
    }

    // Layer B: bulk existence check against the remote, batched.
    let candidates: BTreeSet<String> = groups.keys().cloned().collect();
    let remote_existing =
        query_existing_docnumbers(client, &candidates, target_date, options).await?;

    // Heal direction 1: remote has documents the ledger forgot.
    let missing_from_ledger: Vec<String> = remote_existing
        .iter()
        .filter(|doc| !ledger.contains(doc))
        .cloned()
        .collect();
    if !missing_from_ledger.is_empty() {
        warn!(
            count = missing_from_ledger.len(),
            "documents exist remotely but were missing from the ledger; back-filling"
        );
        ledger.add_all(missing_from_ledger.iter().cloned())?;
    }

    // Heal direction 2: ledger entries the remote does not know are stale;
    // drop them so this run retries the upload.
    let stale = ledger.heal_stale(&candidates, &remote_existing)?;
    for doc in &stale {
        warn!(doc_number = %doc, "stale ledger entry removed; document will be retried");
        result
            .warnings
            .push(format!("stale ledger entry retried: {doc}"));
    }

    // Inventory resolution: one prefetch, then map lookups only.
    let inventory_cfg = config.inventory();
    let mut resolved: HashMap<String, ResolvedItem> = HashMap::new();
    if !options.dry_run {
        let facts: Vec<(String, ItemFacts)> = groups
            .values()
            .flatten()
            .map(|row| {
                (
                    row.item_name.clone(),
                    ItemFacts {
                        category: row.description.clone(),
                        price: if row.quantity > 0.0 {
                            round2(net_amount(row, config) / row.quantity)
                        } else {
                            0.0
                        },
                        cost: 0.0,
                    },
                )
            })
            .collect();
        let names = inventory::unique_item_names(&facts);

        let mapping = if inventory_cfg.enabled {
            let path = oiat_core::StateDir::from_env()
                .root()
                .join(&inventory_cfg.product_mapping_file);
            Some(ProductMapping::load(&path)?)
        } else {
            None
        };

        let mut catalog = ItemCatalog::prefetch(client).await?;
        let (map, _stats) =
            inventory::resolve_items(client, &mut catalog, config, mapping.as_ref(), &names)
                .await?;
        resolved = map;
    }

    let bypass_item = if options.bypass_inventory_start_date && !options.dry_run {
        let blocked = resolved
            .values()
            .any(|item| needs_bypass(item, target_date));
        if blocked {
            Some(get_or_create_bypass_item(client, config, BYPASS_ITEM_NAME).await?)
        } else {
            None
        }
    } else {
        None
    };

    // Serial create phase.
    let mut department_cache: HashMap<String, Option<String>> = HashMap::new();
    for (doc_number, rows) in &groups {
        // Layer A (including layer-B back-fill): skip anything the ledger
        // now vouches for.
        if ledger.contains(doc_number) {
            info!(%doc_number, "skipping duplicate (ledger)");
            result.skipped_dup += 1;
            counter!("oiat_upload_documents_total", "outcome" => "skipped").increment(1);
            continue;
        }

        if options.dry_run {
            info!(%doc_number, "dry run: would create document");
            continue;
        }

        let payload = match build_payload(
            client,
            config,
            doc_number,
            rows,
            &resolved,
            bypass_item.as_ref(),
            target_date,
            options,
            &mut department_cache,
            &mut result.warnings,
        )
        .await
        {
            Ok(payload) => payload,
            Err(e) => {
                result.failed += 1;
                result.warnings.push(format!("{doc_number}: {e}"));
                counter!("oiat_upload_documents_total", "outcome" => "failed").increment(1);
                continue;
            }
        };

        match client.create_sales_receipt(&payload).await {
            Ok(_receipt) => {
                ledger.add(doc_number.clone())?;
                result.created += 1;
                result.created_doc_numbers.push(doc_number.clone());
                counter!("oiat_upload_documents_total", "outcome" => "created").increment(1);
            }
            Err(Error::RemoteValidation { code, message }) => {
                let err = classify_validation(&inventory_cfg, &code, &message);
                warn!(%doc_number, %code, "document rejected: {message}");
                result.failed += 1;
                result.warnings.push(format!("{doc_number}: {err}"));
                counter!("oiat_upload_documents_total", "outcome" => "failed").increment(1);
            }
            Err(fatal) => return Err(fatal),
        }
    }

    // Reconciliation arithmetic.
    if options.dry_run {
        result.reconcile = ReconcileOutcome::NotRun;
    } else {
        match remote_total_for_date(client, target_date).await {
            Ok(remote_total) => {
                result.remote_total = remote_total;
                result.difference = (result.source_total - remote_total).abs();
                result.reconcile = if result.difference <= options.reconcile_tolerance {
                    ReconcileOutcome::Match
                } else {
                    ReconcileOutcome::Mismatch
                };
            }
            Err(e) => {
                warn!("reconciliation query failed: {e}");
                result
                    .warnings
                    .push(format!("reconciliation not run: {}", e.failure_reason()));
                result.reconcile = ReconcileOutcome::NotRun;
            }
        }
    }

    info!(
        attempted = result.attempted,
        created = result.created,
        skipped = result.skipped_dup,
        failed = result.failed,
        source_total = result.source_total,
        "upload finished"
    );
    Ok(result)
}

/// Queries the remote for which candidate document numbers already exist.
async fn query_existing_docnumbers(
    client: &QboClient,
    candidates: &BTreeSet<String>,
    target_date: NaiveDate,
    options: &UploadOptions,
) -> Result<BTreeSet<String>> {
    let all: Vec<&String> = candidates.iter().collect();
    let mut existing = BTreeSet::new();

    for batch in all.chunks(EXISTENCE_BATCH) {
        let list = batch
            .iter()
            .map(|doc| format!("'{}'", escape_query_literal(doc)))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "SELECT Id, DocNumber, TxnDate FROM SalesReceipt WHERE DocNumber IN ({list})"
        );
        let envelope = client.query(&statement).await?;
        for receipt in envelope.query_response.sales_receipts {
            let Some(doc) = receipt.doc_number else {
                continue;
            };
            if options.trading_day_mode {
                // In trading-day mode a recycled document number on a
                // different date is not the same document.
                let matches_date = receipt
                    .txn_date
                    .as_deref()
                    .and_then(|s| s.parse::<NaiveDate>().ok())
                    .is_some_and(|d| d == target_date);
                if !matches_date {
                    continue;
                }
            }
            existing.insert(doc);
        }
    }
    Ok(existing)
}

/// Sums the remote's per-date total for reconciliation.
async fn remote_total_for_date(client: &QboClient, date: NaiveDate) -> Result<f64> {
    let statement = format!("SELECT Id, TotalAmt FROM SalesReceipt WHERE TxnDate = '{date}'");
    let envelope = client.query(&statement).await?;
    Ok(envelope
        .query_response
        .sales_receipts
        .iter()
        .filter_map(|r| r.total_amt)
        .sum())
}

#[allow(clippy::too_many_arguments)]
async fn build_payload(
    client: &QboClient,
    config: &CompanyConfig,
    doc_number: &str,
    rows: &[NormalizedRow],
    resolved: &HashMap<String, ResolvedItem>,
    bypass_item: Option<&ResolvedItem>,
    target_date: NaiveDate,
    options: &UploadOptions,
    department_cache: &mut HashMap<String, Option<String>>,
    warnings: &mut Vec<String>,
) -> Result<SalesReceiptPayload> {
    let first = rows.first().ok_or_else(|| Error::Internal {
        message: format!("empty document group {doc_number}"),
    })?;

    let tax_ref = tax_code_ref(config);
    let mut lines = Vec::with_capacity(rows.len());
    let mut gross_total = 0.0;
    let mut net_total = 0.0;

    for row in rows {
        let item = resolved.get(row.item_name.trim()).ok_or_else(|| Error::Config {
            message: format!("line references unresolved item '{}'", row.item_name),
        })?;

        let (item_ref, description) = if needs_bypass(item, target_date) {
            if let (true, Some(bypass)) = (options.bypass_inventory_start_date, bypass_item) {
                let note = format!(
                    "{} [bypass: original item '{}' tracks inventory from {}]",
                    row.description,
                    row.item_name,
                    item.inv_start_date.map(|d| d.to_string()).unwrap_or_default()
                );
                warnings.push(format!(
                    "{doc_number}: line '{}' swapped to fallback service item",
                    row.item_name
                ));
                (Ref::id(&bypass.id), note)
            } else {
                return Err(Error::InventoryBlocked {
                    message: format!(
                        "item '{}' starts inventory tracking on {} (after document date {target_date}); \
                         enable the start-date bypass or adjust the item's start date",
                        row.item_name,
                        item.inv_start_date.map(|d| d.to_string()).unwrap_or_default()
                    ),
                });
            }
        } else {
            (Ref::id(&item.id), row.description.clone())
        };

        let quantity = if row.quantity > 0.0 { row.quantity } else { 1.0 };
        let gross = row.amount;
        let net = net_amount(row, config);
        let unit_price = round2(net / quantity);
        let amount_net = round2(unit_price * quantity);

        lines.push(ReceiptLine {
            detail_type: "SalesItemLineDetail".to_string(),
            amount: amount_net,
            description: (!description.is_empty()).then_some(description),
            sales_item_line_detail: SalesItemLineDetail {
                item_ref,
                qty: quantity,
                unit_price,
                service_date: Some(row.date_str.clone()),
                tax_code_ref: tax_ref.clone(),
                tax_inclusive_amt: matches!(config.qbo.tax, TaxMode::VatInclusive { .. })
                    .then_some(gross),
            },
        });
        gross_total += gross;
        net_total += amount_net;
    }

    let txn_tax_detail = match &config.qbo.tax {
        TaxMode::VatInclusive { tax_code_id, rate } => {
            let net_base = round2(if net_total > 0.0 {
                net_total
            } else {
                gross_total / (1.0 + rate)
            });
            let total_tax = round2(gross_total - net_base);
            Some(TxnTaxDetail {
                total_tax,
                tax_line: vec![TaxLine {
                    amount: total_tax,
                    detail_type: "TaxLineDetail".to_string(),
                    tax_line_detail: TaxLineDetail {
                        tax_rate_ref: Ref::id(tax_code_id),
                        percent_based: true,
                        tax_percent: rate * 100.0,
                        net_amount_taxable: net_base,
                    },
                }],
            })
        }
        _ => None,
    };

    let department_ref = if first.location.is_empty() {
        None
    } else {
        department_id(client, &first.location, department_cache)
            .await?
            .map(Ref::id)
    };

    Ok(SalesReceiptPayload {
        txn_date: target_date.to_string(),
        doc_number: doc_number.to_string(),
        private_note: (!first.memo.is_empty()).then(|| first.memo.clone()),
        global_tax_calculation: matches!(config.qbo.tax, TaxMode::VatInclusive { .. })
            .then(|| "TaxInclusive".to_string()),
        line: lines,
        txn_tax_detail,
        payment_method_ref: payment_method_id(&first.memo).map(Ref::id),
        department_ref,
    })
}

/// Resolves a location name to a remote department id, cached per run.
async fn department_id(
    client: &QboClient,
    name: &str,
    cache: &mut HashMap<String, Option<String>>,
) -> Result<Option<String>> {
    let key = name.trim().to_string();
    if key.is_empty() {
        return Ok(None);
    }
    if let Some(cached) = cache.get(&key) {
        return Ok(cached.clone());
    }
    let statement = format!(
        "SELECT Id, Name FROM Department WHERE Name = '{}'",
        escape_query_literal(&key)
    );
    let id = client
        .query(&statement)
        .await?
        .query_response
        .departments
        .first()
        .map(|d| d.id.clone());
    if id.is_none() {
        warn!(location = %key, "location not found remotely; document keeps no department ref");
    }
    cache.insert(key, id.clone());
    Ok(id)
}

fn payment_method_id(memo: &str) -> Option<&'static str> {
    let cleaned = memo.trim();
    PAYMENT_METHOD_BY_NAME
        .iter()
        .find(|(name, _)| *name == cleaned)
        .map(|(_, id)| *id)
}

fn tax_code_ref(config: &CompanyConfig) -> Option<Ref> {
    match &config.qbo.tax {
        TaxMode::VatInclusive { tax_code_id, .. } => Some(Ref::id(tax_code_id)),
        TaxMode::SalesTax { tax_code_name, .. } => Some(Ref::id(tax_code_name)),
        TaxMode::None => None,
    }
}

/// Gross-to-net: the CSV carries gross amounts and per-line tax.
fn net_amount(row: &NormalizedRow, config: &CompanyConfig) -> f64 {
    match &config.qbo.tax {
        TaxMode::VatInclusive { .. } | TaxMode::SalesTax { .. } => {
            (row.amount - row.tax).max(0.0)
        }
        TaxMode::None => row.amount,
    }
}

fn classify_validation(
    inventory: &oiat_core::config::InventorySection,
    code: &str,
    message: &str,
) -> Error {
    let lowered = message.to_ascii_lowercase();
    let inventory_related = lowered.contains("quantity on hand")
        || lowered.contains("negative inventory")
        || lowered.contains("inventory");
    if inventory.enabled && inventory_related {
        let remediation = if inventory.allow_negative {
            "negative inventory is allowed for this tenant; the remote still rejected the \
             document, so stock levels need correcting before retry"
        } else {
            "receive stock for the item or enable allow_negative before retrying"
        };
        Error::InventoryBlocked {
            message: format!("{message} ({remediation})"),
        }
    } else {
        Error::RemoteValidation {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn read_normalized(path: &Path) -> Result<Vec<NormalizedRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::storage(format!("open normalized csv {}: {e}", path.display())))?;
    let headers = reader
        .headers()
        .map_err(|e| Error::storage(format!("read normalized headers: {e}")))?
        .clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let doc_col = col("*SalesReceiptNo").ok_or_else(|| {
        Error::InvalidInput("normalized CSV missing *SalesReceiptNo".to_string())
    })?;
    let date_col = col("*SalesReceiptDate").ok_or_else(|| {
        Error::InvalidInput("normalized CSV missing *SalesReceiptDate".to_string())
    })?;
    let amount_col = col("*ItemAmount").ok_or_else(|| {
        Error::InvalidInput("normalized CSV missing *ItemAmount".to_string())
    })?;
    let memo_col = col("Memo");
    let location_col = col("Location");
    let item_col = col("Item(Product/Service)");
    let desc_col = col("ItemDescription");
    let qty_col = col("ItemQuantity");
    let tax_col = col("ItemTaxAmount");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::storage(format!("read normalized row: {e}")))?;
        let get = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();
        let number = |i: Option<usize>| get(i).replace(',', "").parse::<f64>().unwrap_or(0.0);
        rows.push(NormalizedRow {
            doc_number: record.get(doc_col).unwrap_or("").trim().to_string(),
            date_str: record.get(date_col).unwrap_or("").trim().to_string(),
            memo: get(memo_col).to_string(),
            location: get(location_col).to_string(),
            item_name: get(item_col).to_string(),
            description: get(desc_col).to_string(),
            quantity: number(qty_col),
            amount: number(Some(amount_col)),
            tax: number(tax_col),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oiat_qbo::refresh::{OAuthCredentials, TokenManager};
    use oiat_qbo::store::{TokenRecord, TokenStore};
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> CompanyConfig {
        let raw = serde_json::json!({
            "company_key": "company_a",
            "display_name": "Main Store",
            "qbo": {
                "realm_id": "realm-1",
                "deposit_account": "Undeposited Funds",
                "tax": {"mode": "vat_inclusive", "tax_code_id": "2", "rate": 0.075},
                "bypass_income_account_id": "77"
            },
            "epos": {"username_env_key": "U", "password_env_key": "P"},
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

    async fn client(server: &MockServer, dir: &Path) -> QboClient {
        let store = Arc::new(TokenStore::open(&dir.join("tokens.sqlite")).unwrap());
        store
            .save(
                &oiat_core::TenantKey::new("company_a").unwrap(),
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
        QboClient::connect_to(
            manager,
            oiat_core::TenantKey::new("company_a").unwrap(),
            "realm-1",
            server.uri(),
        )
        .await
        .unwrap()
    }

    const NORMALIZED_HEADER: &str = "*SalesReceiptNo,Customer,*SalesReceiptDate,*DepositAccount,Location,Memo,Item(Product/Service),ItemDescription,ItemQuantity,ItemRate,*ItemAmount,*ItemTaxCode,ItemTaxAmount,Service Date\n";

    fn write_normalized(dir: &Path, rows: &[&str]) -> std::path::PathBuf {
        let path = dir.join("single_sales_receipts_20251227.csv");
        let mut contents = NORMALIZED_HEADER.to_string();
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn mount_empty_query(server: &MockServer) -> impl std::future::Future<Output = ()> + '_ {
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "QueryResponse": {}
            })))
            .mount(server)
    }

    #[tokio::test]
    async fn empty_input_reconciles_as_match() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let client = client(&server, dir.path()).await;
        let csv = write_normalized(dir.path(), &[]);
        let mut ledger = Ledger::load(dir.path().join("ledger.json")).unwrap();

        let result = upload(
            &client,
            &mut ledger,
            &csv,
            &config(),
            "2025-12-27".parse().unwrap(),
            &UploadOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.attempted, 0);
        assert_eq!(result.created, 0);
        assert_eq!(result.reconcile, ReconcileOutcome::Match);
    }

    #[tokio::test]
    async fn dry_run_issues_no_posts() {
        let server = MockServer::start().await;
        mount_empty_query(&server).await;
        // No POST mock mounted: a create would 404 and fail the test.

        let dir = tempfile::tempdir().unwrap();
        let client = client(&server, dir.path()).await;
        let csv = write_normalized(
            dir.path(),
            &["SR-20251227-0001,,2025-12-27,Undeposited Funds,,Cash,Water,Drinks,2,,1000,2,70,2025-12-27"],
        );
        let mut ledger = Ledger::load(dir.path().join("ledger.json")).unwrap();

        let options = UploadOptions {
            dry_run: true,
            ..UploadOptions::default()
        };
        let result = upload(
            &client,
            &mut ledger,
            &csv,
            &config(),
            "2025-12-27".parse().unwrap(),
            &options,
        )
        .await
        .unwrap();

        assert_eq!(result.attempted, 1);
        assert_eq!(result.created, 0);
        assert_eq!(result.reconcile, ReconcileOutcome::NotRun);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn ledger_hits_are_skipped_without_posting() {
        let server = MockServer::start().await;
        // Existence query confirms the document also exists remotely.
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "DocNumber IN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "QueryResponse": {"SalesReceipt": [
                    {"Id": "5", "DocNumber": "SR-20251227-0001", "TxnDate": "2025-12-27", "TotalAmt": 1000.0}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "TxnDate ="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "QueryResponse": {"SalesReceipt": [
                    {"Id": "5", "DocNumber": "SR-20251227-0001", "TotalAmt": 1000.0}
                ]}
            })))
            .mount(&server)
            .await;
        // Item prefetch page.
        Mock::given(method("GET"))
            .and(path("/v3/company/realm-1/query"))
            .and(query_param_contains("query", "FROM Item"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "QueryResponse": {"Item": [{"Id": "42", "Name": "Water", "Type": "Service"}]}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client(&server, dir.path()).await;
        let csv = write_normalized(
            dir.path(),
            &["SR-20251227-0001,,2025-12-27,Undeposited Funds,,Cash,Water,Drinks,2,,1000,2,70,2025-12-27"],
        );
        let mut ledger = Ledger::load(dir.path().join("ledger.json")).unwrap();
        ledger.add("SR-20251227-0001").unwrap();

        let result = upload(
            &client,
            &mut ledger,
            &csv,
            &config(),
            "2025-12-27".parse().unwrap(),
            &UploadOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.skipped_dup, 1);
        assert_eq!(result.created, 0);
        assert_eq!(result.reconcile, ReconcileOutcome::Match);
    }

    #[tokio::test]
    async fn stale_ledger_entry_is_healed_and_retried() {
        let server = MockServer::start().await;
        // Remote knows nothing: existence check comes back empty.
        mount_empty_query(&server).await;
        Mock::given(method("POST"))
            .and(path("/v3/company/realm-1/salesreceipt"))
            .and(body_string_contains("SR-20251227-0001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "SalesReceipt": {"Id": "90", "DocNumber": "SR-20251227-0001", "TotalAmt": 930.0}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/company/realm-1/item"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Item": {"Id": "42", "Name": "Water", "Type": "Service"}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client(&server, dir.path()).await;
        let csv = write_normalized(
            dir.path(),
            &["SR-20251227-0001,,2025-12-27,Undeposited Funds,,Cash,Water,Drinks,2,,1000,2,70,2025-12-27"],
        );
        let mut ledger = Ledger::load(dir.path().join("ledger.json")).unwrap();
        // The ledger claims success, but the remote disagrees.
        ledger.add("SR-20251227-0001").unwrap();

        let result = upload(
            &client,
            &mut ledger,
            &csv,
            &config(),
            "2025-12-27".parse().unwrap(),
            &UploadOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.created, 1, "stale entry must be retried");
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("stale ledger")));
        assert!(ledger.contains("SR-20251227-0001"));
    }

    #[tokio::test]
    async fn validation_failure_marks_document_failed_and_continues() {
        let server = MockServer::start().await;
        mount_empty_query(&server).await;
        Mock::given(method("POST"))
            .and(path("/v3/company/realm-1/item"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Item": {"Id": "42", "Name": "Water", "Type": "Service"}
            })))
            .mount(&server)
            .await;
        // First doc rejected, second accepted.
        Mock::given(method("POST"))
            .and(path("/v3/company/realm-1/salesreceipt"))
            .and(body_string_contains("SR-20251227-0001"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "Fault": {"Error": [{"Message": "Business Validation Error", "code": "6000"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/company/realm-1/salesreceipt"))
            .and(body_string_contains("SR-20251227-0002"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "SalesReceipt": {"Id": "91", "DocNumber": "SR-20251227-0002"}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client(&server, dir.path()).await;
        let csv = write_normalized(
            dir.path(),
            &[
                "SR-20251227-0001,,2025-12-27,Undeposited Funds,,Cash,Water,Drinks,1,,500,2,35,2025-12-27",
                "SR-20251227-0002,,2025-12-27,Undeposited Funds,,Card,Water,Drinks,1,,700,2,49,2025-12-27",
            ],
        );
        let mut ledger = Ledger::load(dir.path().join("ledger.json")).unwrap();

        let result = upload(
            &client,
            &mut ledger,
            &csv,
            &config(),
            "2025-12-27".parse().unwrap(),
            &UploadOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.created, 1);
        // Failed documents never enter the ledger.
        assert!(!ledger.contains("SR-20251227-0001"));
        assert!(ledger.contains("SR-20251227-0002"));
    }

    #[test]
    fn payment_methods_map_exact_tender_names() {
        assert_eq!(payment_method_id("Cash"), Some("1"));
        assert_eq!(payment_method_id(" Card "), Some("5"));
        assert_eq!(payment_method_id("Card/Cash/Transfer"), Some("10"));
        assert_eq!(payment_method_id("Barter"), None);
    }

    #[test]
    fn inventory_faults_are_classified() {
        let mut section = oiat_core::config::InventorySection::default();
        section.enabled = true;

        let err = classify_validation(&section, "6240", "Quantity on hand is insufficient");
        assert!(matches!(err, Error::InventoryBlocked { .. }));
        assert!(err.to_string().contains("receive stock"));

        section.allow_negative = true;
        let err = classify_validation(&section, "6240", "negative inventory warning");
        assert!(err.to_string().contains("negative inventory is allowed"));

        let err = classify_validation(&section, "6000", "Some other validation");
        assert!(matches!(err, Error::RemoteValidation { .. }));
    }

    #[test]
    fn net_amounts_back_out_tax() {
        let row = NormalizedRow {
            doc_number: "SR-1".into(),
            date_str: "2025-12-27".into(),
            memo: "Cash".into(),
            location: String::new(),
            item_name: "Water".into(),
            description: "Drinks".into(),
            quantity: 2.0,
            amount: 1075.0,
            tax: 75.0,
        };
        assert!((net_amount(&row, &config()) - 1000.0).abs() < 1e-9);
    }
}
