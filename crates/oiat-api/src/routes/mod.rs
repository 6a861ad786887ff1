//! Route modules, one per resource.

pub mod companies;
pub mod runs;
pub mod schedules;
pub mod settings;
