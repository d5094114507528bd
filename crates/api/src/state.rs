//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use vitrina_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("billing service init failed: {}", e))?;
        tracing::info!("Mercado Pago billing service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
        })
    }
}
