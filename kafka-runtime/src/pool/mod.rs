//! The client pool: generic rent/return engine plus producer/consumer
//! specializations, maintenance loop, and pool health.

mod client_pool;
mod health;
mod maintenance;
mod metrics;
mod pooled_client;

pub use client_pool::{ClientPool, ConsumerPool, KafkaContext, ProducerPool};
pub use health::{PoolHealth, PoolIssue, PoolLevel};
pub use maintenance::{maintenance_loop, rebalance_monitor_loop};
pub use metrics::{PoolDiagnostics, PoolMetrics};
pub use pooled_client::PooledClient;
