use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Tunables of the inventory engine. Every field can be overridden per
/// environment, e.g. `TALLY__INVENTORY__CLAIM_TIMEOUT_MINUTES=15`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InventoryConfig {
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_minutes: i64,
    #[serde(default = "default_window_quantity")]
    pub redistribution_window_quantity: i64,
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default)]
    pub window_gap_minutes: i64,
    /// Hard cap on how far ahead the planner may schedule.
    #[serde(default)]
    pub max_days: Option<i64>,
    #[serde(default)]
    pub auto_correct_budget: bool,
    #[serde(default = "default_batch_lock")]
    pub batch_lock_seconds: u64,
}

fn default_claim_timeout() -> i64 { 30 }
fn default_window_quantity() -> i64 { 100 }
fn default_window_days() -> i64 { 3 }
fn default_batch_lock() -> u64 { 300 }

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            claim_timeout_minutes: default_claim_timeout(),
            redistribution_window_quantity: default_window_quantity(),
            window_days: default_window_days(),
            window_gap_minutes: 0,
            max_days: None,
            auto_correct_budget: false,
            batch_lock_seconds: default_batch_lock(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WorkerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_batch_interval")]
    pub batch_interval_seconds: u64,
}

fn default_enabled() -> bool { true }
fn default_sweep_interval() -> u64 { 60 }
fn default_batch_interval() -> u64 { 3600 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_seconds: default_sweep_interval(),
            batch_interval_seconds: default_batch_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 { 120 }

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per environment, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `TALLY__SERVER__PORT=9090`
            .add_source(config::Environment::with_prefix("TALLY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        port = 8080

        [database]
        url = "postgres://localhost/tally"

        [redis]
        url = "redis://localhost"

        [kafka]
        brokers = "localhost:9092"

        [auth]
        jwt_secret = "secret"
        jwt_expiration_seconds = 60
    "#;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_inventory_section_defaults() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.inventory, InventoryConfig::default());
        assert_eq!(cfg.inventory.claim_timeout_minutes, 30);
        assert_eq!(cfg.server.rate_limit_per_minute, 120);
        assert!(cfg.worker.enabled);
    }

    #[test]
    fn test_inventory_overrides() {
        let toml = format!(
            "{}\n[inventory]\nwindow_days = 7\nmax_days = 30\nauto_correct_budget = true\n",
            MINIMAL
        );
        let cfg = parse(&toml);
        assert_eq!(cfg.inventory.window_days, 7);
        assert_eq!(cfg.inventory.max_days, Some(30));
        assert!(cfg.inventory.auto_correct_budget);
        assert_eq!(cfg.inventory.redistribution_window_quantity, 100);
    }
}
