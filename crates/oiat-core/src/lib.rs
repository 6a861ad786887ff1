//! # oiat-core
//!
//! Shared types for the OIAT automation platform: tenant identity,
//! strongly-typed company configuration, business-date arithmetic, the
//! persisted state layout, and the error taxonomy used by every other
//! crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod business_date;
pub mod config;
pub mod error;
pub mod id;
pub mod observability;
pub mod paths;
pub mod tenant;

pub use config::{CompanyConfig, GroupBy, InventorySyncMode, TaxMode};
pub use error::{Error, Result};
pub use id::RunJobId;
pub use paths::StateDir;
pub use tenant::TenantKey;
