pub mod app_config;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod redis_repo;
#[cfg(feature = "kafka")]
pub mod events;

pub use database::{DbClient, PgStore};
pub use gateway::HttpPaymentGateway;
pub use memory::{MemoryEventLog, MemoryStore};
pub use redis_repo::RedisClient;
#[cfg(feature = "kafka")]
pub use events::EventProducer;
