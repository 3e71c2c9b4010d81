use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{info, warn};

use crate::app_config::InventoryConfig;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Operator overrides stored in `inventory_settings` win over the file
    /// config. Rows are `{"value": ...}` documents keyed by field name.
    pub async fn fetch_inventory_overrides(&self, defaults: InventoryConfig) -> Result<InventoryConfig, sqlx::Error> {
        let rows: Vec<(String, Value)> =
            sqlx::query_as("SELECT setting_key, setting_value FROM inventory_settings")
                .fetch_all(&self.pool)
                .await?;

        let mut settings = defaults;
        for (key, doc) in rows {
            if !apply_override(&mut settings, &key, &doc) {
                warn!(setting = %key, "Ignoring unknown or malformed inventory setting");
            }
        }
        Ok(settings)
    }
}

fn apply_override(settings: &mut InventoryConfig, key: &str, doc: &Value) -> bool {
    let Some(v) = doc.get("value") else {
        return false;
    };
    match key {
        "claim_timeout_minutes" => v.as_i64().map(|n| settings.claim_timeout_minutes = n).is_some(),
        "redistribution_window_quantity" => v
            .as_i64()
            .map(|n| settings.redistribution_window_quantity = n)
            .is_some(),
        "window_days" => v.as_i64().map(|n| settings.window_days = n).is_some(),
        "window_gap_minutes" => v.as_i64().map(|n| settings.window_gap_minutes = n).is_some(),
        "max_days" => {
            settings.max_days = v.as_i64();
            true
        }
        "auto_correct_budget" => v.as_bool().map(|b| settings.auto_correct_budget = b).is_some(),
        "batch_lock_seconds" => v.as_u64().map(|n| settings.batch_lock_seconds = n).is_some(),
        _ => false,
    }
}
