//! Strongly-typed per-tenant configuration.
//!
//! Company configuration lives in `<companies_dir>/<tenant_key>.json`.
//! Unknown fields are rejected so config drift surfaces immediately;
//! missing optional sections fall back to defaults. A small set of knobs
//! can be overridden per tenant through `COMPANY_<KEY>_*` environment
//! variables (env wins over file, file over default).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tenant::{dir_name_for_display, TenantKey};

/// Tax treatment applied when building documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TaxMode {
    /// Line amounts are gross; the remote service backs out VAT at `rate`.
    VatInclusive {
        /// Remote tax code identifier.
        tax_code_id: String,
        /// Tax rate as a decimal (e.g. 0.075 for 7.5%).
        rate: f64,
    },
    /// Sales tax applied by named tax code.
    SalesTax {
        /// Remote tax code name.
        tax_code_name: String,
        /// Tax rate as a decimal.
        rate: f64,
    },
    /// No tax treatment; amounts pass through unchanged.
    None,
}

impl Default for TaxMode {
    fn default() -> Self {
        Self::None
    }
}

/// Document grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One document per (date, tender).
    DateTender,
    /// One document per (date, location, tender).
    DateLocationTender,
}

/// Inventory catalog sync behaviour during upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventorySyncMode {
    /// Patch existing items whose price or cost drifted.
    #[default]
    Inline,
    /// Never patch existing items; only create missing ones.
    UploadFast,
}

/// Remote accounting settings for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QboSection {
    /// Remote company (realm) identifier.
    pub realm_id: String,
    /// Deposit account name used on documents.
    pub deposit_account: String,
    /// Tax treatment.
    #[serde(default)]
    pub tax: TaxMode,
    /// Income account for the bypass service item; required when the
    /// backdated-inventory bypass is enabled.
    #[serde(default)]
    pub bypass_income_account_id: Option<String>,
}

/// POS portal credential key names. The values live in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EposSection {
    /// Environment variable holding the POS username.
    pub username_env_key: String,
    /// Environment variable holding the POS password.
    pub password_env_key: String,
}

/// Normalization settings consumed by the transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformSection {
    /// Document grouping key.
    pub group_by: GroupBy,
    /// strftime-style date format for the normalized CSV.
    pub date_format: String,
    /// Prefix for generated document numbers (e.g. "SR").
    pub receipt_prefix: String,
    /// Location name → short code, used in document numbers when grouping
    /// by location.
    #[serde(default)]
    pub location_mapping: BTreeMap<String, String>,
}

/// Output file naming for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    /// Prefix for normalized CSV files.
    pub csv_prefix: String,
    /// Name of the per-run transform metadata file.
    pub metadata_file: String,
    /// Name of the uploaded-document-number ledger file.
    pub ledger_file: String,
}

/// Chat notification routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackSection {
    /// Either a webhook URL directly, or the name of an environment
    /// variable that holds one.
    pub webhook_env_key: String,
}

/// Trading-day cutoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradingDaySection {
    /// Whether trading-day date assignment is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Cutoff hour in the business timezone.
    #[serde(default = "default_cutoff_hour")]
    pub start_hour: u8,
    /// Cutoff minute.
    #[serde(default)]
    pub start_minute: u8,
}

fn default_cutoff_hour() -> u8 {
    5
}

impl Default for TradingDaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: default_cutoff_hour(),
            start_minute: 0,
        }
    }
}

/// Inventory item policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventorySection {
    /// Whether inventory-type items are created for products.
    #[serde(default)]
    pub enabled: bool,
    /// Whether documents may proceed on negative-quantity warnings.
    #[serde(default)]
    pub allow_negative: bool,
    /// Catalog sync behaviour during upload.
    #[serde(default)]
    pub sync_mode: InventorySyncMode,
    /// Inventory start date (YYYY-MM-DD) for newly created items.
    #[serde(default)]
    pub start_date: Option<String>,
    /// Default quantity on hand for newly created items.
    #[serde(default)]
    pub default_qty_on_hand: i64,
    /// Product category mapping CSV (category → account triple), relative
    /// to the state directory.
    #[serde(default = "default_product_mapping_file")]
    pub product_mapping_file: String,
}

fn default_product_mapping_file() -> String {
    "mappings/Product.Mapping.csv".to_string()
}

impl Default for InventorySection {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_negative: false,
            sync_mode: InventorySyncMode::default(),
            start_date: None,
            default_qty_on_hand: 0,
            product_mapping_file: default_product_mapping_file(),
        }
    }
}

/// Complete configuration for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompanyConfig {
    /// Stable tenant identifier.
    pub company_key: TenantKey,
    /// Human-readable company name.
    pub display_name: String,
    /// Remote accounting settings.
    pub qbo: QboSection,
    /// POS credential key names.
    pub epos: EposSection,
    /// Normalization settings.
    pub transform: TransformSection,
    /// Output file naming.
    pub output: OutputSection,
    /// Chat notification routing.
    #[serde(default)]
    pub slack: Option<SlackSection>,
    /// Trading-day cutoff settings.
    #[serde(default)]
    pub trading_day: Option<TradingDaySection>,
    /// Inventory item policy.
    #[serde(default)]
    pub inventory: Option<InventorySection>,
}

impl CompanyConfig {
    /// Parses a configuration from JSON and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the JSON is malformed, contains unknown
    /// fields, or the embedded key does not match `expected_key`.
    pub fn from_json(raw: &str, expected_key: Option<&TenantKey>) -> Result<Self> {
        let mut config: Self = serde_json::from_str(raw).map_err(|e| Error::Config {
            message: format!("invalid company config: {e}"),
        })?;
        if let Some(expected) = expected_key {
            if &config.company_key != expected {
                return Err(Error::Config {
                    message: format!(
                        "config company_key '{}' does not match requested tenant '{expected}'",
                        config.company_key
                    ),
                });
            }
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Filesystem folder name for this tenant (derived from display name).
    #[must_use]
    pub fn dir_name(&self) -> String {
        dir_name_for_display(&self.display_name)
    }

    /// Effective trading-day settings (defaults when the section is absent).
    #[must_use]
    pub fn trading_day(&self) -> TradingDaySection {
        self.trading_day.clone().unwrap_or_default()
    }

    /// Effective inventory settings (defaults when the section is absent).
    #[must_use]
    pub fn inventory(&self) -> InventorySection {
        self.inventory.clone().unwrap_or_default()
    }

    /// Resolves the POS username from the configured environment key.
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` when the variable is unset.
    pub fn epos_username(&self) -> Result<String> {
        require_env(&self.epos.username_env_key)
    }

    /// Resolves the POS password from the configured environment key.
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` when the variable is unset.
    pub fn epos_password(&self) -> Result<String> {
        require_env(&self.epos.password_env_key)
    }

    /// Resolves the webhook URL, if notification routing is configured.
    ///
    /// The configured value may be a literal URL or the name of an
    /// environment variable holding one. Missing env vars yield `None`
    /// (notifications are best-effort).
    #[must_use]
    pub fn webhook_url(&self) -> Option<String> {
        let value = &self.slack.as_ref()?.webhook_env_key;
        if value.starts_with("http://") || value.starts_with("https://") {
            Some(value.clone())
        } else {
            env::var(value).ok()
        }
    }

    /// Income account for the bypass service item, with env override
    /// `COMPANY_<KEY>_BYPASS_INCOME_ACCOUNT_ID`.
    #[must_use]
    pub fn bypass_income_account_id(&self) -> Option<String> {
        let env_key = format!(
            "COMPANY_{}_BYPASS_INCOME_ACCOUNT_ID",
            self.company_key.env_suffix()
        );
        match env::var(&env_key) {
            Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
            _ => self.qbo.bypass_income_account_id.clone(),
        }
    }

    fn apply_env_overrides(&mut self) {
        let suffix = self.company_key.env_suffix();
        let inv = self.inventory.get_or_insert_with(InventorySection::default);

        if let Some(flag) = env_flag(&format!("COMPANY_{suffix}_ENABLE_INVENTORY_ITEMS")) {
            inv.enabled = flag;
        }
        if let Some(flag) = env_flag(&format!("COMPANY_{suffix}_ALLOW_NEGATIVE_INVENTORY")) {
            inv.allow_negative = flag;
        }
        if let Ok(mode) = env::var(format!("COMPANY_{suffix}_INVENTORY_SYNC_MODE")) {
            match mode.trim().to_ascii_lowercase().as_str() {
                "inline" => inv.sync_mode = InventorySyncMode::Inline,
                "upload_fast" => inv.sync_mode = InventorySyncMode::UploadFast,
                _ => {}
            }
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::CredentialMissing {
            env_key: key.to_string(),
        }),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    Some(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

/// Loads the configuration for one tenant from `<dir>/<key>.json`.
///
/// # Errors
///
/// Returns `Config` for missing files or invalid contents.
pub fn load_company_config(companies_dir: &Path, key: &TenantKey) -> Result<CompanyConfig> {
    let path = companies_dir.join(format!("{key}.json"));
    let raw = fs::read_to_string(&path).map_err(|e| Error::Config {
        message: format!("company config not found at {}: {e}", path.display()),
    })?;
    CompanyConfig::from_json(&raw, Some(key))
}

/// Lists the tenant keys with a config file present, sorted.
///
/// Files whose key ends in `_example` are skipped.
#[must_use]
pub fn available_companies(companies_dir: &Path) -> Vec<TenantKey> {
    let mut keys = Vec::new();
    let Ok(entries) = fs::read_dir(companies_dir) else {
        return keys;
    };
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.ends_with("_example") {
            continue;
        }
        if let Ok(key) = TenantKey::new(stem) {
            keys.push(key);
        }
    }
    keys.sort();
    keys
}
