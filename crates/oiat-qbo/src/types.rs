//! Wire shapes for the remote accounting REST API.
//!
//! The API is treated as opaque beyond auth, query, create, and
//! lookup-by-id; these types mirror only the fields the engine actually
//! reads or writes. Everything else passes through untouched.

use serde::{Deserialize, Serialize};

/// Reference by id (`{"value": "..", "name": ".."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    /// Remote identifier.
    pub value: String,
    /// Display name, when the remote includes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Ref {
    /// Builds a reference from an id.
    #[must_use]
    pub fn id(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            name: None,
        }
    }
}

/// One line of a sales receipt payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceiptLine {
    /// Always `SalesItemLineDetail` for our uploads.
    pub detail_type: String,
    /// Net line amount.
    pub amount: f64,
    /// Line description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Item detail.
    pub sales_item_line_detail: SalesItemLineDetail,
}

/// Item-level detail of a receipt line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SalesItemLineDetail {
    /// Item reference.
    pub item_ref: Ref,
    /// Quantity sold.
    pub qty: f64,
    /// Net unit price (`Amount == UnitPrice * Qty` must hold remotely).
    pub unit_price: f64,
    /// Per-line service date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_date: Option<String>,
    /// Tax code reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_code_ref: Option<Ref>,
    /// Gross (tax-inclusive) line amount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_inclusive_amt: Option<f64>,
}

/// Explicit tax summary on a receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TxnTaxDetail {
    /// Total backed-out tax.
    pub total_tax: f64,
    /// Tax breakdown lines.
    pub tax_line: Vec<TaxLine>,
}

/// One tax summary line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaxLine {
    /// Tax amount.
    pub amount: f64,
    /// Always `TaxLineDetail`.
    pub detail_type: String,
    /// Rate detail.
    pub tax_line_detail: TaxLineDetail,
}

/// Rate detail of a tax line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaxLineDetail {
    /// Tax rate reference.
    pub tax_rate_ref: Ref,
    /// Whether the tax is percent-based.
    pub percent_based: bool,
    /// Tax percentage.
    pub tax_percent: f64,
    /// Net amount the tax applies to.
    pub net_amount_taxable: f64,
}

/// Sales receipt create payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SalesReceiptPayload {
    /// Transaction date (YYYY-MM-DD).
    pub txn_date: String,
    /// Deterministic document number.
    pub doc_number: String,
    /// Memo (tender description).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_note: Option<String>,
    /// `TaxInclusive` when amounts carry tax.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_tax_calculation: Option<String>,
    /// Receipt lines.
    pub line: Vec<ReceiptLine>,
    /// Explicit tax summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_tax_detail: Option<TxnTaxDetail>,
    /// Payment method reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method_ref: Option<Ref>,
    /// Location (department) reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_ref: Option<Ref>,
}

/// Sales receipt fields read back from queries and creates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SalesReceipt {
    /// Remote identifier.
    pub id: Option<String>,
    /// Document number.
    pub doc_number: Option<String>,
    /// Total amount as stored remotely.
    #[serde(default)]
    pub total_amt: Option<f64>,
    /// Transaction date.
    pub txn_date: Option<String>,
}

/// Item fields the engine reads and writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Item {
    /// Remote identifier (absent on create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item name.
    pub name: String,
    /// `Inventory` or `Service`.
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    /// Whether the item is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Sale price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    /// Purchase cost.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_cost: Option<f64>,
    /// Quantity on hand (inventory items).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty_on_hand: Option<f64>,
    /// Inventory tracking start date (inventory items).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inv_start_date: Option<String>,
    /// Income account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub income_account_ref: Option<Ref>,
    /// Inventory asset account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_account_ref: Option<Ref>,
    /// Cost-of-goods-sold account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expense_account_ref: Option<Ref>,
    /// Whether sales of the item are taxed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxable: Option<bool>,
    /// Whether to track quantity on hand.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_qty_on_hand: Option<bool>,
    /// Sync token required by sparse updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
    /// Sparse-update marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
}

/// Department (location) fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Department {
    /// Remote identifier.
    pub id: String,
    /// Department name.
    pub name: String,
}

/// Inner query response listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    /// Sales receipts, when selected.
    #[serde(rename = "SalesReceipt", default)]
    pub sales_receipts: Vec<SalesReceipt>,
    /// Items, when selected.
    #[serde(rename = "Item", default)]
    pub items: Vec<Item>,
    /// Departments, when selected.
    #[serde(rename = "Department", default)]
    pub departments: Vec<Department>,
    /// Paging start position.
    #[serde(rename = "startPosition", default)]
    pub start_position: Option<i64>,
    /// Page size actually returned.
    #[serde(rename = "maxResults", default)]
    pub max_results: Option<i64>,
}

/// Top-level query envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryEnvelope {
    /// Query listing.
    #[serde(rename = "QueryResponse", default)]
    pub query_response: QueryResponse,
}

/// Create/read envelope for a sales receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct SalesReceiptEnvelope {
    /// The created or fetched receipt.
    #[serde(rename = "SalesReceipt")]
    pub sales_receipt: SalesReceipt,
}

/// Create/read envelope for an item.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemEnvelope {
    /// The created or fetched item.
    #[serde(rename = "Item")]
    pub item: Item,
}

/// One remote fault error.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultError {
    /// Short message.
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    /// Detailed message.
    #[serde(rename = "Detail", default)]
    pub detail: Option<String>,
    /// Remote error code.
    #[serde(rename = "code", default)]
    pub code: Option<String>,
}

/// Fault body returned on validation failures.
#[derive(Debug, Clone, Deserialize)]
pub struct Fault {
    /// Individual errors.
    #[serde(rename = "Error", default)]
    pub errors: Vec<FaultError>,
}

/// Top-level fault envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultEnvelope {
    /// The fault, under either capitalization the remote uses.
    #[serde(rename = "Fault", alias = "fault")]
    pub fault: Fault,
}

/// Escapes single quotes for embedding a value in a query literal.
#[must_use]
pub fn escape_query_literal(value: &str) -> String {
    value.replace('\'', "''")
}
