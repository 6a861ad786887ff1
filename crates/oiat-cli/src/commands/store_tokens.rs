//! `oiat store-tokens` - OAuth bootstrap into the token store.
//!
//! The operator completes the OAuth consent flow out of band (the
//! provider's playground or a one-off helper) and pastes the resulting
//! tokens here. Refreshes are automatic from then on.

use clap::Args;
use tracing::error;

use oiat_core::{StateDir, TenantKey};
use oiat_qbo::TokenStore;

use super::{EXIT_FAILURE, EXIT_OK};

/// Arguments for `oiat store-tokens`.
#[derive(Debug, Args)]
pub struct StoreTokensArgs {
    /// Tenant key the tokens belong to.
    #[arg(long)]
    pub tenant: String,

    /// Remote realm id the tokens are scoped to.
    #[arg(long)]
    pub realm_id: String,

    /// Access token from the OAuth flow.
    #[arg(long)]
    pub access_token: String,

    /// Refresh token from the OAuth flow.
    #[arg(long)]
    pub refresh_token: String,

    /// Access token lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    pub expires_in: i64,

    /// Environment tag.
    #[arg(long, default_value = "production", value_parser = ["production", "sandbox"])]
    pub environment: String,
}

/// Stores the tokens and confirms.
pub async fn execute(args: StoreTokensArgs) -> i32 {
    let state = StateDir::from_env();
    let result = (|| {
        let tenant = TenantKey::new(args.tenant.clone())?;
        let store = TokenStore::open(&state.token_db())?;
        store.store_from_oauth(
            &tenant,
            &args.realm_id,
            &args.access_token,
            &args.refresh_token,
            args.expires_in,
            &args.environment,
        )
    })();

    match result {
        Ok(()) => {
            println!(
                "tokens stored for {} (realm {}) in {}",
                args.tenant,
                args.realm_id,
                state.token_db().display()
            );
            EXIT_OK
        }
        Err(e) => {
            error!("could not store tokens: {e}");
            EXIT_FAILURE
        }
    }
}
