//! Tenant identity primitives.
//!
//! Every business entity ("company") is identified by a stable tenant key.
//! The key appears in configuration file names, environment variable
//! suffixes, ledger paths, and run records, so it is validated once at the
//! boundary and treated as trusted everywhere else.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A unique identifier for a tenant.
///
/// Tenant keys must be:
/// - Non-empty, at most 64 characters
/// - Lowercase alphanumeric with underscores
/// - Not starting or ending with an underscore
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantKey(String);

impl TenantKey {
    /// Creates a new tenant key after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Creates a tenant key without validation.
    ///
    /// Intended for keys that have already been validated (e.g. read back
    /// from the database).
    #[must_use]
    pub fn new_unchecked(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Environment variable suffix for per-tenant credentials
    /// (e.g. `EPOS_USERNAME_<SUFFIX>`).
    #[must_use]
    pub fn env_suffix(&self) -> String {
        self.0.to_ascii_uppercase()
    }

    fn validate(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidId {
                message: "tenant key cannot be empty".to_string(),
            });
        }
        if key.len() > 64 {
            return Err(Error::InvalidId {
                message: format!("tenant key '{key}' is too long (maximum 64 characters)"),
            });
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::InvalidId {
                message: format!(
                    "tenant key '{key}' contains invalid characters (only lowercase letters, digits, and underscores allowed)"
                ),
            });
        }
        if key.starts_with('_') || key.ends_with('_') {
            return Err(Error::InvalidId {
                message: format!("tenant key '{key}' cannot start or end with an underscore"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TenantKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Converts a company display name to `Title_Case_With_Underscores`.
///
/// Used for filesystem folder names so staging and archive paths stay
/// readable across operating systems. Non-alphanumeric characters are
/// stripped and runs of whitespace collapse to one separator.
#[must_use]
pub fn dir_name_for_display(display_name: &str) -> String {
    let cleaned: String = display_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    let words: Vec<String> = cleaned
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        "Company".to_string()
    } else {
        words.join("_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_tenant_keys() {
        assert!(TenantKey::new("company_a").is_ok());
        assert!(TenantKey::new("tenant123").is_ok());
        assert!(TenantKey::new("a").is_ok());
    }

    #[test]
    fn invalid_tenant_keys() {
        assert!(TenantKey::new("").is_err());
        assert!(TenantKey::new("UPPER").is_err());
        assert!(TenantKey::new("_leading").is_err());
        assert!(TenantKey::new("trailing_").is_err());
        assert!(TenantKey::new("has-hyphen").is_err());
        assert!(TenantKey::new("has space").is_err());
        assert!(TenantKey::new(&"x".repeat(65)).is_err());
    }

    #[test]
    fn env_suffix_uppercases() {
        let key = TenantKey::new("company_a").unwrap();
        assert_eq!(key.env_suffix(), "COMPANY_A");
    }

    #[test]
    fn dir_name_title_cases_and_strips() {
        assert_eq!(
            dir_name_for_display("Akponora Ventures Ltd"),
            "Akponora_Ventures_Ltd"
        );
        assert_eq!(
            dir_name_for_display("Precious & Sons Nigeria"),
            "Precious_Sons_Nigeria"
        );
        assert_eq!(dir_name_for_display("MAIN STORE (HQ)"), "Main_Store_Hq");
        assert_eq!(dir_name_for_display("  !!  "), "Company");
    }
}
