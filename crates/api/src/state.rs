//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use streamline_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::new(pool));
        tracing::info!("Billing service initialized");

        if config.internal_api_token.is_empty() {
            tracing::warn!(
                "Internal order routes disabled (missing INTERNAL_API_TOKEN)"
            );
        }

        Self {
            config,
            billing,
        }
    }
}
