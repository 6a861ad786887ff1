//! Raw-to-normalized CSV transformation.
//!
//! The transformer is a pure function: one single-date raw file plus the
//! tenant's transform settings in, one normalized document CSV plus stats
//! out. No network, no shared state. The orchestrator treats it as a
//! single step; a failure is fatal for that (tenant, date).
//!
//! Rows are grouped by the configured key and every group becomes one
//! document with a deterministic number, so re-transforming the same
//! input always yields the same document numbers (which is what makes the
//! upload idempotent).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use oiat_core::{CompanyConfig, Error, GroupBy, Result, TaxMode};

/// Output columns of the normalized CSV, in order.
pub const NORMALIZED_COLUMNS: [&str; 14] = [
    "*SalesReceiptNo",
    "Customer",
    "*SalesReceiptDate",
    "*DepositAccount",
    "Location",
    "Memo",
    "Item(Product/Service)",
    "ItemDescription",
    "ItemQuantity",
    "ItemRate",
    "*ItemAmount",
    "*ItemTaxCode",
    "ItemTaxAmount",
    "Service Date",
];

/// Raw columns the transformer requires.
const REQUIRED_COLUMNS: [&str; 4] = ["Product", "Category", "Date/Time", "TOTAL Sales"];

/// Stats and outputs of one transform invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformOutcome {
    /// Path of the normalized CSV.
    pub normalized_path: PathBuf,
    /// Path of the metadata JSON written alongside.
    pub metadata_path: PathBuf,
    /// Rows read from the raw file.
    pub rows_in: u64,
    /// Rows kept (target date).
    pub rows_kept: u64,
    /// Rows ignored because their date was not the target.
    pub rows_non_target: u64,
    /// Distinct documents produced.
    pub documents: u64,
    /// Sum of `*ItemAmount` over kept rows.
    pub source_total: f64,
}

/// Metadata file written next to the normalized CSV for the archive step.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransformMetadata {
    /// Target date in ISO form.
    pub normalized_date: String,
    /// Raw file the transform consumed.
    pub raw_file: String,
    /// Normalized files produced.
    pub processed_files: Vec<String>,
    /// Rows read.
    pub rows_total: u64,
    /// Rows kept.
    pub rows_kept: u64,
    /// Rows outside the target date.
    pub rows_non_target: u64,
}

/// Pure transformation seam used by the orchestrator.
pub trait Transformer: Send + Sync {
    /// Transforms one single-date raw CSV into a normalized document CSV
    /// under `out_dir`.
    ///
    /// # Errors
    ///
    /// Implementations fail the (tenant, date) on malformed input.
    fn transform(
        &self,
        raw_file: &Path,
        config: &CompanyConfig,
        target_date: NaiveDate,
        out_dir: &Path,
    ) -> Result<TransformOutcome>;
}

/// The stock CSV transformer.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvTransformer;

struct RawRow {
    date: NaiveDate,
    customer: String,
    location: String,
    tender: String,
    product: String,
    category: String,
    quantity: f64,
    amount: f64,
    tax: f64,
}

impl Transformer for CsvTransformer {
    fn transform(
        &self,
        raw_file: &Path,
        config: &CompanyConfig,
        target_date: NaiveDate,
        out_dir: &Path,
    ) -> Result<TransformOutcome> {
        fs::create_dir_all(out_dir).map_err(|e| Error::io(out_dir.display().to_string(), e))?;

        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(raw_file)
            .map_err(|e| Error::storage(format!("open raw file {}: {e}", raw_file.display())))?;
        let headers = reader
            .headers()
            .map_err(|e| Error::storage(format!("read raw headers: {e}")))?
            .clone();

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !headers.iter().any(|h| h == **c))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "raw file missing required column(s): {}",
                missing.join(", ")
            )));
        }

        let col = |name: &str| headers.iter().position(|h| h == name);
        let date_col = col("Date/Time").expect("checked above");
        let product_col = col("Product").expect("checked above");
        let category_col = col("Category").expect("checked above");
        let amount_col = col("TOTAL Sales").expect("checked above");
        let quantity_col = col("Quantity");
        let tax_col = col("Tax");
        let tender_col = col("Tender");
        let location_col = col("Location Name");
        let customer_col = col("Customer Full Name");
        let staff_col = col("Staff");

        let mut rows_in = 0;
        let mut rows_non_target = 0;
        let mut kept: Vec<RawRow> = Vec::new();

        for record in reader.records() {
            let record =
                record.map_err(|e| Error::storage(format!("read raw record: {e}")))?;

            // Summary lines have an empty date and a "Total:" staff cell.
            let staff = staff_col
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            let raw_date = record.get(date_col).unwrap_or("").trim();
            if raw_date.is_empty() && (staff == "total:" || staff == "total") {
                continue;
            }
            rows_in += 1;

            let Some(date) = parse_row_date(raw_date) else {
                rows_non_target += 1;
                continue;
            };
            if date != target_date {
                rows_non_target += 1;
                continue;
            }

            let get = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();
            kept.push(RawRow {
                date,
                customer: get(customer_col).to_string(),
                location: get(location_col).to_string(),
                tender: get(tender_col).to_string(),
                product: record.get(product_col).unwrap_or("").trim().to_string(),
                category: record.get(category_col).unwrap_or("").trim().to_string(),
                quantity: parse_number(get(quantity_col)),
                amount: parse_number(record.get(amount_col).unwrap_or("")),
                tax: parse_number(get(tax_col)),
            });
        }

        // Deterministic document numbers: sequence over sorted group keys.
        let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (idx, row) in kept.iter().enumerate() {
            let key = match config.transform.group_by {
                GroupBy::DateTender => (row.tender.clone(), String::new()),
                GroupBy::DateLocationTender => (row.location.clone(), row.tender.clone()),
            };
            groups.entry(key).or_default().push(idx);
        }

        let mut doc_numbers = vec![String::new(); kept.len()];
        for (seq, (key, indexes)) in groups.iter().enumerate() {
            let doc_number = document_number(config, target_date, key, seq as u32 + 1);
            for idx in indexes {
                doc_numbers[*idx] = doc_number.clone();
            }
        }

        let normalized_name = format!(
            "{}_{}.csv",
            config.output.csv_prefix,
            target_date.format("%Y%m%d")
        );
        let normalized_path = out_dir.join(&normalized_name);
        let mut writer = WriterBuilder::new()
            .from_path(&normalized_path)
            .map_err(|e| Error::io(normalized_path.display().to_string(), e.into()))?;
        writer
            .write_record(NORMALIZED_COLUMNS)
            .map_err(|e| Error::storage(format!("write normalized header: {e}")))?;

        let mut source_total = 0.0;
        let date_str_for = |row: &RawRow| {
            row.date
                .format(&config.transform.date_format)
                .to_string()
        };
        for (row, doc_number) in kept.iter().zip(&doc_numbers) {
            let date_str = date_str_for(row);
            let quantity = format_number(row.quantity);
            let amount = format_number(row.amount);
            let tax = format_number(row.tax);
            let tax_code = tax_code_for(config, row);
            source_total += row.amount;
            writer
                .write_record([
                    doc_number.as_str(),
                    row.customer.as_str(),
                    date_str.as_str(),
                    config.qbo.deposit_account.as_str(),
                    row.location.as_str(),
                    row.tender.as_str(),
                    row.product.as_str(),
                    row.category.as_str(),
                    quantity.as_str(),
                    "",
                    amount.as_str(),
                    tax_code.as_str(),
                    tax.as_str(),
                    date_str.as_str(),
                ])
                .map_err(|e| Error::storage(format!("write normalized row: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| Error::storage(format!("flush normalized csv: {e}")))?;

        let metadata = TransformMetadata {
            normalized_date: target_date.to_string(),
            raw_file: raw_file.display().to_string(),
            processed_files: vec![normalized_name],
            rows_total: rows_in,
            rows_kept: kept.len() as u64,
            rows_non_target,
        };
        let metadata_path = out_dir.join("transform_metadata.json");
        fs::write(
            &metadata_path,
            serde_json::to_vec_pretty(&metadata).map_err(|e| Error::Internal {
                message: format!("serialize transform metadata: {e}"),
            })?,
        )
        .map_err(|e| Error::io(metadata_path.display().to_string(), e))?;

        info!(
            tenant = %config.company_key,
            date = %target_date,
            rows_in,
            rows_kept = kept.len() as u64,
            documents = groups.len() as u64,
            "transform complete"
        );

        Ok(TransformOutcome {
            normalized_path,
            metadata_path,
            rows_in,
            rows_kept: kept.len() as u64,
            rows_non_target,
            documents: groups.len() as u64,
            source_total,
        })
    }
}

fn document_number(
    config: &CompanyConfig,
    date: NaiveDate,
    key: &(String, String),
    seq: u32,
) -> String {
    let prefix = &config.transform.receipt_prefix;
    let stamp = date.format("%Y%m%d");
    match config.transform.group_by {
        GroupBy::DateTender => format!("{prefix}-{stamp}-{seq:04}"),
        GroupBy::DateLocationTender => {
            let location = &key.0;
            let code = config
                .transform
                .location_mapping
                .get(location)
                .cloned()
                .unwrap_or_else(|| {
                    location
                        .chars()
                        .filter(|c| c.is_ascii_alphanumeric())
                        .take(3)
                        .collect::<String>()
                        .to_ascii_uppercase()
                });
            format!("{prefix}-{stamp}-{code}-{seq:04}")
        }
    }
}

fn tax_code_for(config: &CompanyConfig, row: &RawRow) -> String {
    match &config.qbo.tax {
        TaxMode::VatInclusive { tax_code_id, .. } => tax_code_id.clone(),
        TaxMode::SalesTax { tax_code_name, .. } => tax_code_name.clone(),
        TaxMode::None => {
            if row.tax > 0.0 {
                "Sales Tax".to_string()
            } else {
                "No VAT".to_string()
            }
        }
    }
}

fn parse_row_date(value: &str) -> Option<NaiveDate> {
    for format in ["%d/%m/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.date());
        }
    }
    for format in ["%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    None
}

fn parse_number(value: &str) -> f64 {
    let cleaned = value.replace(',', "");
    cleaned.trim().parse().unwrap_or(0.0)
}

fn format_number(value: f64) -> String {
    if (value - value.trunc()).abs() < f64::EPSILON {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}
