pub mod app_config;
pub mod database;
pub mod events;
pub mod inventory_repo;
pub mod redis_repo;

pub use database::DbClient;
pub use events::{EventProducer, KafkaReindexSink};
pub use inventory_repo::PostgresInventoryRepository;
pub use redis_repo::RedisClient;
