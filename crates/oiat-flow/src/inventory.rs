//! Inventory item resolution for the upload engine.
//!
//! Item lookups are front-loaded: one paged prefetch pulls the whole
//! remote item catalog into a name-keyed map, item creation fills the
//! gaps, and per-line lookups during document building never touch the
//! network. Price/cost patching of existing items only happens in
//! `inline` sync mode and only when the drift is material.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::NaiveDate;
use tracing::{info, warn};

use oiat_core::config::{InventorySection, InventorySyncMode};
use oiat_core::{CompanyConfig, Error, Result, TaxMode};
use oiat_qbo::types::{escape_query_literal, Item, Ref};
use oiat_qbo::QboClient;

/// Price drift below this is noise, not a patch.
const PRICE_PATCH_THRESHOLD: f64 = 0.01;

/// Page size for the catalog prefetch.
const PREFETCH_PAGE_SIZE: usize = 1000;

/// Account triple for one product category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryAccounts {
    /// Income account id.
    pub income: String,
    /// Inventory asset account id.
    pub asset: String,
    /// Cost-of-goods-sold account id.
    pub cogs: String,
}

/// Category → account-triple mapping loaded from the tenant's mapping CSV.
#[derive(Debug, Clone, Default)]
pub struct ProductMapping {
    by_category: BTreeMap<String, CategoryAccounts>,
}

impl ProductMapping {
    /// Loads the mapping CSV (`Category,IncomeAccountId,AssetAccountId,ExpenseAccountId`).
    ///
    /// # Errors
    ///
    /// Returns `Config` when the file is missing or malformed; inventory
    /// mode cannot run without it.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| Error::Config {
            message: format!("product mapping CSV {}: {e}", path.display()),
        })?;
        let headers = reader
            .headers()
            .map_err(|e| Error::Config {
                message: format!("product mapping headers: {e}"),
            })?
            .clone();
        let col = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| Error::Config {
                message: format!("product mapping CSV missing column '{name}'"),
            })
        };
        let category = col("Category")?;
        let income = col("IncomeAccountId")?;
        let asset = col("AssetAccountId")?;
        let cogs = col("ExpenseAccountId")?;

        let mut by_category = BTreeMap::new();
        for record in reader.records() {
            let record = record.map_err(|e| Error::Config {
                message: format!("product mapping row: {e}"),
            })?;
            let key = record.get(category).unwrap_or("").trim();
            if key.is_empty() {
                continue;
            }
            by_category.insert(
                key.to_string(),
                CategoryAccounts {
                    income: record.get(income).unwrap_or("").trim().to_string(),
                    asset: record.get(asset).unwrap_or("").trim().to_string(),
                    cogs: record.get(cogs).unwrap_or("").trim().to_string(),
                },
            );
        }
        Ok(Self { by_category })
    }

    /// Looks up the account triple for a category.
    #[must_use]
    pub fn accounts_for(&self, category: &str) -> Option<&CategoryAccounts> {
        self.by_category.get(category.trim())
    }

    /// Number of mapped categories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_category.len()
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_category.is_empty()
    }
}

/// Prefetched item catalog keyed by exact item name.
#[derive(Debug, Default)]
pub struct ItemCatalog {
    by_name: HashMap<String, Item>,
}

impl ItemCatalog {
    /// Builds a catalog from already-fetched items (tests).
    #[must_use]
    pub fn from_items(items: Vec<Item>) -> Self {
        let by_name = items
            .into_iter()
            .map(|item| (item.name.trim().to_string(), item))
            .collect();
        Self { by_name }
    }

    /// Pulls every remote item in pages.
    ///
    /// # Errors
    ///
    /// Propagates client errors.
    pub async fn prefetch(client: &QboClient) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut start = 1usize;
        loop {
            let statement = format!(
                "SELECT * FROM Item STARTPOSITION {start} MAXRESULTS {PREFETCH_PAGE_SIZE}"
            );
            let envelope = client.query(&statement).await?;
            let items = envelope.query_response.items;
            let fetched = items.len();
            for item in items {
                by_name.insert(item.name.trim().to_string(), item);
            }
            if fetched < PREFETCH_PAGE_SIZE {
                break;
            }
            start += fetched;
        }
        info!(items = by_name.len(), "prefetched remote item catalog");
        Ok(Self { by_name })
    }

    /// Looks up an item by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Item> {
        self.by_name.get(name.trim())
    }

    /// Number of items in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn insert(&mut self, item: Item) {
        self.by_name.insert(item.name.trim().to_string(), item);
    }
}

/// One line's worth of item facts needed to build a document line.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    /// Remote item id.
    pub id: String,
    /// Inventory tracking start date, when the item is inventory-typed.
    pub inv_start_date: Option<NaiveDate>,
}

/// Counters from one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    /// Items created as `Inventory`.
    pub created_inventory: u64,
    /// Items created as `Service`.
    pub created_service: u64,
    /// Existing items patched for price/cost drift.
    pub patched: u64,
}

/// Resolves every unique (item name, category) pair up front.
///
/// Missing items are created: `Inventory`-typed when the tenant's
/// inventory policy is enabled (requires the category mapping), otherwise
/// `Service` with the default income account from the mapping or bypass
/// account. Existing items are patched in `inline` mode when price drift
/// exceeds the threshold or the cost is zero/missing.
///
/// # Errors
///
/// Returns `Config` for unmapped categories in inventory mode and
/// propagates client errors.
pub async fn resolve_items(
    client: &QboClient,
    catalog: &mut ItemCatalog,
    config: &CompanyConfig,
    mapping: Option<&ProductMapping>,
    names: &BTreeMap<String, ItemFacts>,
) -> Result<(HashMap<String, ResolvedItem>, ResolutionStats)> {
    let inventory = config.inventory();
    let mut resolved = HashMap::new();
    let mut stats = ResolutionStats::default();

    for (name, facts) in names {
        if name.trim().is_empty() {
            continue;
        }
        let existing = catalog.get(name).cloned();
        let item = match existing {
            Some(mut item) => {
                if inventory.enabled
                    && inventory.sync_mode == InventorySyncMode::Inline
                    && patch_needed(&item, facts)
                {
                    item.unit_price = Some(facts.price);
                    if facts.cost > 0.0 {
                        item.purchase_cost = Some(facts.cost);
                    }
                    let patched = client.sparse_update_item(&item).await?;
                    stats.patched += 1;
                    catalog.insert(patched.clone());
                    patched
                } else {
                    item
                }
            }
            None => {
                let created = if inventory.enabled {
                    let mapping = mapping.ok_or_else(|| Error::Config {
                        message: "inventory mode requires the product mapping CSV".to_string(),
                    })?;
                    stats.created_inventory += 1;
                    create_inventory_item(client, config, &inventory, mapping, name, facts).await?
                } else {
                    stats.created_service += 1;
                    create_service_item(client, config, name, facts).await?
                };
                catalog.insert(created.clone());
                created
            }
        };

        resolved.insert(
            name.clone(),
            ResolvedItem {
                id: item.id.clone().unwrap_or_default(),
                inv_start_date: item
                    .inv_start_date
                    .as_deref()
                    .and_then(|s| s.parse().ok()),
            },
        );
    }

    if stats.created_inventory + stats.created_service + stats.patched > 0 {
        info!(
            created_inventory = stats.created_inventory,
            created_service = stats.created_service,
            patched = stats.patched,
            "item catalog synchronized"
        );
    }
    Ok((resolved, stats))
}

/// Observed facts about an item, accumulated from the normalized CSV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFacts {
    /// Product category (drives the account triple).
    pub category: String,
    /// Latest observed unit price.
    pub price: f64,
    /// Latest observed unit cost, when known.
    pub cost: f64,
}

fn patch_needed(item: &Item, facts: &ItemFacts) -> bool {
    if facts.price > 0.0 {
        let drift = (item.unit_price.unwrap_or(0.0) - facts.price).abs();
        if drift > PRICE_PATCH_THRESHOLD {
            return true;
        }
    }
    facts.cost > 0.0 && item.purchase_cost.unwrap_or(0.0) <= 0.0
}

async fn create_inventory_item(
    client: &QboClient,
    config: &CompanyConfig,
    inventory: &InventorySection,
    mapping: &ProductMapping,
    name: &str,
    facts: &ItemFacts,
) -> Result<Item> {
    let accounts = mapping.accounts_for(&facts.category).ok_or_else(|| {
        Error::Config {
            message: format!(
                "category '{}' has no account mapping in {}; cannot create inventory item '{name}'",
                facts.category, inventory.product_mapping_file
            ),
        }
    })?;

    let start_date = inventory
        .start_date
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().date_naive().to_string());

    client
        .create_item(&Item {
            name: name.to_string(),
            item_type: Some("Inventory".to_string()),
            active: Some(true),
            unit_price: (facts.price > 0.0).then_some(facts.price),
            purchase_cost: (facts.cost > 0.0).then_some(facts.cost),
            qty_on_hand: Some(inventory.default_qty_on_hand as f64),
            inv_start_date: Some(start_date),
            income_account_ref: Some(Ref::id(&accounts.income)),
            asset_account_ref: Some(Ref::id(&accounts.asset)),
            expense_account_ref: Some(Ref::id(&accounts.cogs)),
            track_qty_on_hand: Some(true),
            taxable: Some(tax_code_id(config).is_some()),
            ..Item::default()
        })
        .await
}

async fn create_service_item(
    client: &QboClient,
    config: &CompanyConfig,
    name: &str,
    facts: &ItemFacts,
) -> Result<Item> {
    let income = config.bypass_income_account_id().ok_or_else(|| Error::Config {
        message: format!(
            "no income account configured for auto-created service item '{name}' \
             (set qbo.bypass_income_account_id)"
        ),
    })?;
    client
        .create_item(&Item {
            name: name.to_string(),
            item_type: Some("Service".to_string()),
            active: Some(true),
            unit_price: (facts.price > 0.0).then_some(facts.price),
            income_account_ref: Some(Ref::id(income)),
            taxable: Some(tax_code_id(config).is_some()),
            ..Item::default()
        })
        .await
}

/// Gets or creates the single fallback service item for the backdated
/// inventory bypass.
///
/// # Errors
///
/// Returns `Config` when no bypass income account is configured.
pub async fn get_or_create_bypass_item(
    client: &QboClient,
    config: &CompanyConfig,
    name: &str,
) -> Result<ResolvedItem> {
    let income = config.bypass_income_account_id().ok_or_else(|| Error::Config {
        message: "bypass mode requires qbo.bypass_income_account_id \
                  (or the COMPANY_<KEY>_BYPASS_INCOME_ACCOUNT_ID override)"
            .to_string(),
    })?;

    let statement = format!(
        "SELECT Id, Name, Type FROM Item WHERE Name = '{}' MAXRESULTS 5",
        escape_query_literal(name)
    );
    let envelope = client.query(&statement).await?;
    if let Some(found) = envelope
        .query_response
        .items
        .iter()
        .find(|item| item.name.trim() == name.trim())
    {
        if let Some(id) = &found.id {
            return Ok(ResolvedItem {
                id: id.clone(),
                inv_start_date: None,
            });
        }
    }

    let mut item = Item {
        name: name.to_string(),
        item_type: Some("Service".to_string()),
        active: Some(true),
        income_account_ref: Some(Ref::id(income)),
        ..Item::default()
    };
    if tax_code_id(config).is_some() {
        item.taxable = Some(true);
    }
    let created = client.create_item(&item).await?;
    let id = created.id.ok_or_else(|| Error::Internal {
        message: format!("created bypass item '{name}' has no id"),
    })?;
    warn!(item = name, %id, "created fallback service item for inventory bypass");
    Ok(ResolvedItem {
        id,
        inv_start_date: None,
    })
}

/// Collects the distinct item names a run will touch.
#[must_use]
pub fn unique_item_names(rows: &[(String, ItemFacts)]) -> BTreeMap<String, ItemFacts> {
    let mut names: BTreeMap<String, ItemFacts> = BTreeMap::new();
    for (name, facts) in rows {
        if name.trim().is_empty() {
            continue;
        }
        names.insert(name.clone(), facts.clone());
    }
    names
}

fn tax_code_id(config: &CompanyConfig) -> Option<&str> {
    match &config.qbo.tax {
        TaxMode::VatInclusive { tax_code_id, .. } => Some(tax_code_id),
        TaxMode::SalesTax { tax_code_name, .. } => Some(tax_code_name),
        TaxMode::None => None,
    }
}

/// Whether a line must be swapped to the bypass item: the item tracks
/// inventory starting after the document's date.
#[must_use]
pub fn needs_bypass(item: &ResolvedItem, doc_date: NaiveDate) -> bool {
    item.inv_start_date.is_some_and(|start| start > doc_date)
}

/// Names the set of blocked item ids for a document, for diagnostics.
#[must_use]
pub fn blocked_items<'a>(
    resolved: &'a HashMap<String, ResolvedItem>,
    doc_date: NaiveDate,
) -> BTreeSet<&'a str> {
    resolved
        .iter()
        .filter(|(_, item)| needs_bypass(item, doc_date))
        .map(|(name, _)| name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_mapping_parses_and_looks_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Product.Mapping.csv");
        std::fs::write(
            &path,
            "Category,IncomeAccountId,AssetAccountId,ExpenseAccountId\n\
             Drinks,44,81,92\n\
             Bakery,45,82,93\n",
        )
        .unwrap();

        let mapping = ProductMapping::load(&path).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(
            mapping.accounts_for("Drinks"),
            Some(&CategoryAccounts {
                income: "44".into(),
                asset: "81".into(),
                cogs: "92".into(),
            })
        );
        assert!(mapping.accounts_for("Unknown").is_none());
    }

    #[test]
    fn mapping_missing_column_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "Category,IncomeAccountId\nDrinks,44\n").unwrap();
        let err = ProductMapping::load(&path).unwrap_err();
        assert!(err.to_string().contains("AssetAccountId"));
    }

    #[test]
    fn patch_threshold_is_one_cent() {
        let item = Item {
            unit_price: Some(100.0),
            purchase_cost: Some(60.0),
            ..Item::default()
        };
        let close = ItemFacts {
            price: 100.005,
            ..ItemFacts::default()
        };
        let drifted = ItemFacts {
            price: 100.02,
            ..ItemFacts::default()
        };
        assert!(!patch_needed(&item, &close));
        assert!(patch_needed(&item, &drifted));

        let missing_cost = Item {
            unit_price: Some(100.0),
            purchase_cost: None,
            ..Item::default()
        };
        let with_cost = ItemFacts {
            price: 100.0,
            cost: 55.0,
            ..ItemFacts::default()
        };
        assert!(patch_needed(&missing_cost, &with_cost));
    }

    #[test]
    fn bypass_detection_compares_start_date() {
        let backdated = ResolvedItem {
            id: "9".into(),
            inv_start_date: Some("2025-12-30".parse().unwrap()),
        };
        let ok = ResolvedItem {
            id: "10".into(),
            inv_start_date: Some("2025-12-01".parse().unwrap()),
        };
        let service = ResolvedItem {
            id: "11".into(),
            inv_start_date: None,
        };
        let doc_date: NaiveDate = "2025-12-27".parse().unwrap();
        assert!(needs_bypass(&backdated, doc_date));
        assert!(!needs_bypass(&ok, doc_date));
        assert!(!needs_bypass(&service, doc_date));
    }

    #[test]
    fn catalog_lookup_trims_names() {
        let catalog = ItemCatalog::from_items(vec![Item {
            id: Some("1".into()),
            name: " Bottled Water ".into(),
            ..Item::default()
        }]);
        assert!(catalog.get("Bottled Water").is_some());
        assert!(catalog.get("  Bottled Water  ").is_some());
        assert!(catalog.get("Other").is_none());
    }

    #[test]
    fn unique_names_deduplicate() {
        let rows = vec![
            ("Water".to_string(), ItemFacts::default()),
            ("Water".to_string(), ItemFacts::default()),
            ("".to_string(), ItemFacts::default()),
            ("Bread".to_string(), ItemFacts::default()),
        ];
        let names = unique_item_names(&rows);
        assert_eq!(names.len(), 2);
    }
}
