//! # oiat-api
//!
//! The operator HTTP API: run history and triggering, live log tailing,
//! schedule management, company configuration, and portal settings.
//! Session-cookie auth with per-route permissions; every mutation
//! validates a CSRF double-submit header.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use auth::{Permission, Session, SessionStore, CSRF_HEADER, SESSION_COOKIE};
pub use error::{ApiError, ApiResult};
pub use server::{app, serve};
pub use state::{AppState, PortalSettings};
