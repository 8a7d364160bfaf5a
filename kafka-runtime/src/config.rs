//! Component-scoped configuration structs.
//!
//! Each piece of the runtime owns a small `Envconfig`-derived struct with
//! explicit defaults, the same way the reference codebase scopes a
//! `KafkaConfig`/`ConsumerConfig` to the component that actually uses it
//! rather than threading one giant settings blob everywhere. Populating
//! these from the environment (`Envconfig::init_from_env`) is the embedding
//! application's job; the runtime only needs the struct.

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct BrokerConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub compression_codec: String,

    #[envconfig(default = "true")]
    pub enable_idempotence: bool,

    #[envconfig(default = "5000")]
    pub session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub heartbeat_interval_ms: u32,

    #[envconfig(default = "300000")]
    pub max_poll_interval_ms: u32,
}

impl BrokerConfig {
    /// The key/value pairs this config contributes to an `rdkafka::ClientConfig`,
    /// in a fixed order so the pool's fingerprint hash is stable regardless of
    /// how the struct was built.
    pub fn as_kv_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("bootstrap.servers", self.kafka_hosts.clone()),
            ("linger.ms", self.producer_linger_ms.to_string()),
            (
                "message.timeout.ms",
                self.message_timeout_ms.to_string(),
            ),
            ("compression.codec", self.compression_codec.clone()),
            (
                "queue.buffering.max.kbytes",
                (self.producer_queue_mib * 1024).to_string(),
            ),
            (
                "queue.buffering.max.messages",
                self.producer_queue_messages.to_string(),
            ),
            (
                "enable.idempotence",
                self.enable_idempotence.to_string(),
            ),
            ("security.protocol", if self.kafka_tls { "ssl" } else { "plaintext" }.to_string()),
        ]
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct PoolConfig {
    /// Minimum resident clients per key; the optimize pass never shrinks below this.
    #[envconfig(default = "1")]
    pub min_pool_size: usize,

    /// Maximum resident clients per key; overflow returns are discarded past this.
    #[envconfig(default = "10")]
    pub max_pool_size: usize,

    /// A pooled consumer idle longer than this is evicted on the next trim pass.
    #[envconfig(default = "600")]
    pub idle_timeout_secs: u64,

    /// How often the maintenance loop (trim + optimize) runs.
    #[envconfig(default = "30")]
    pub maintenance_interval_secs: u64,

    /// How often the rebalance-monitor loop inspects consumer-group load.
    #[envconfig(default = "60")]
    pub rebalance_monitor_interval_secs: u64,

    /// A bucket is "overloaded" once its active count exceeds this fraction of max_pool_size.
    #[envconfig(default = "0.8")]
    pub overload_threshold: f64,

    /// A bucket is a candidate for shrinking once rolling utilization drops below this fraction.
    #[envconfig(default = "0.1")]
    pub low_utilization_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 10,
            idle_timeout_secs: 600,
            maintenance_interval_secs: 30,
            rebalance_monitor_interval_secs: 60,
            overload_threshold: 0.8,
            low_utilization_threshold: 0.1,
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct SchemaRegistryConfig {
    #[envconfig(default = "http://localhost:8081")]
    pub url: String,

    #[envconfig(default = "5000")]
    pub request_timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_pairs_are_stable_order() {
        let cfg = BrokerConfig::init_from_hashmap(&Default::default()).unwrap();
        let first = cfg.as_kv_pairs();
        let second = cfg.as_kv_pairs();
        assert_eq!(first, second);
        assert_eq!(first[0].0, "bootstrap.servers");
    }
}
