use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use health::HealthHandle;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;

use crate::config::BrokerConfig;
use crate::error::PoolError;
use crate::keys::{ConsumerKey, ProducerKey};

use super::health::{PoolHealth, PoolLevel};
use super::metrics::{PoolDiagnostics, PoolMetrics};
use super::pooled_client::PooledClient;

/// Reports liveness on every `rdkafka::Statistics` callback, the same way
/// the reference codebase's producer context does: the stats callback fires
/// only while the client's internal poll loop is actually running, so it
/// doubles as a liveness signal independent of whether any application code
/// is currently renting the client.
pub struct KafkaContext {
    liveness: HealthHandle,
}

impl KafkaContext {
    pub fn new(liveness: HealthHandle) -> Self {
        Self { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy_blocking();
    }
}

impl rdkafka::consumer::ConsumerContext for KafkaContext {}

struct Bucket<T> {
    queue: Mutex<VecDeque<PooledClient<T>>>,
    metrics: PoolMetrics,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            metrics: PoolMetrics::default(),
        }
    }
}

/// Generic rent/return engine, bucketed by key. Producers and consumers are
/// thin specializations (`ProducerPool`/`ConsumerPool` below) that supply
/// the key type, the construction closure, and whether idle clients in this
/// pool are subject to eviction.
pub struct ClientPool<K, T> {
    buckets: DashMap<K, Arc<Bucket<T>>>,
    max_pool_size: usize,
}

impl<K: Eq + Hash + Clone + Debug, T> ClientPool<K, T> {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            max_pool_size,
        }
    }

    fn bucket(&self, key: &K) -> Arc<Bucket<T>> {
        self.buckets.entry(key.clone()).or_default().clone()
    }

    /// Dequeue a healthy client, or construct a fresh one via `factory` if
    /// the bucket is empty or every queued client turned out unhealthy.
    pub fn rent(
        &self,
        key: &K,
        idle_timeout: Option<Duration>,
        factory: impl Fn() -> Result<T, rdkafka::error::KafkaError>,
    ) -> Result<PooledClient<T>, PoolError> {
        let bucket = self.bucket(key);
        loop {
            let popped = {
                let mut queue = bucket.queue.lock().unwrap();
                queue.pop_front()
            };
            match popped {
                Some(mut client) if client.is_healthy(idle_timeout) => {
                    bucket.metrics.record_rent_from_bucket();
                    client.touch();
                    tracing::debug!(key = ?key, bucket_size = bucket.queue.lock().unwrap().len(), "pool rent: reused client");
                    return Ok(client);
                }
                Some(_unhealthy) => {
                    bucket.metrics.record_discarded_resident(1);
                    continue;
                }
                None => break,
            }
        }

        if bucket.metrics.active() as usize >= self.max_pool_size {
            tracing::debug!(key = ?key, "pool rent: exhausted");
            return Err(PoolError::PoolExhausted {
                key: format!("{key:?}"),
            });
        }

        match factory() {
            Ok(client) => {
                bucket.metrics.record_created();
                tracing::debug!(key = ?key, "pool rent: constructed new client");
                Ok(PooledClient::new(client))
            }
            Err(source) => {
                bucket.metrics.record_creation_failure();
                Err(PoolError::ClientInitFailed {
                    key: format!("{key:?}"),
                    source,
                })
            }
        }
    }

    /// Return a rented client to its bucket. Unhealthy clients and overflow
    /// (bucket already at capacity) are destroyed instead of enqueued; an
    /// overflowing return discards the client being returned, not an
    /// existing resident, preserving the warmth of clients already queued.
    pub fn return_client(&self, key: &K, mut client: PooledClient<T>, idle_timeout: Option<Duration>) {
        let bucket = self.bucket(key);
        if !client.is_healthy(idle_timeout) {
            bucket.metrics.record_discarded_active();
            tracing::debug!(key = ?key, "pool return: unhealthy, discarding");
            return;
        }
        if bucket.metrics.resident() as usize >= self.max_pool_size {
            bucket.metrics.record_discarded_active();
            tracing::debug!(key = ?key, "pool return: overflow, discarding");
            return;
        }
        client.touch();
        bucket.metrics.record_returned_to_bucket();
        bucket.queue.lock().unwrap().push_back(client);
    }

    /// Consumers are never returned to the bucket; their owning subscription
    /// or fetch always destroys the rented instance on completion. This
    /// just retires the bookkeeping.
    pub fn discard_active(&self, key: &K) {
        let bucket = self.bucket(key);
        bucket.metrics.record_discarded_active();
    }

    /// One pass per bucket: drop clients that fail the health predicate,
    /// re-enqueue survivors in original order.
    pub fn trim(&self, idle_timeout: Option<Duration>) {
        for entry in self.buckets.iter() {
            let bucket = entry.value();
            let drained: Vec<_> = {
                let mut queue = bucket.queue.lock().unwrap();
                queue.drain(..).collect()
            };
            let mut survivors = VecDeque::with_capacity(drained.len());
            let mut discarded = 0u64;
            for client in drained {
                if client.is_healthy(idle_timeout) {
                    survivors.push_back(client);
                } else {
                    discarded += 1;
                }
            }
            if discarded > 0 {
                bucket.metrics.record_discarded_resident(discarded);
                tracing::debug!(key = ?entry.key(), discarded, "pool trim: evicted clients");
            }
            *bucket.queue.lock().unwrap() = survivors;
        }
    }

    /// Shrink buckets whose instantaneous utilization has dropped below
    /// `low_utilization_threshold` toward `max(min_pool_size, size/2)`.
    pub fn optimize(&self, min_pool_size: usize, low_utilization_threshold: f64) {
        for entry in self.buckets.iter() {
            let bucket = entry.value();
            let resident = bucket.metrics.resident();
            let active = bucket.metrics.active();
            let total = resident + active;
            if total == 0 {
                continue;
            }
            let utilization = active as f64 / total as f64;
            if utilization >= low_utilization_threshold {
                continue;
            }
            let target_total = std::cmp::max(min_pool_size as u64, total / 2);
            let target_resident = target_total.saturating_sub(active);
            let mut discarded = 0u64;
            {
                let mut queue = bucket.queue.lock().unwrap();
                while queue.len() as u64 > target_resident {
                    if queue.pop_front().is_none() {
                        break;
                    }
                    discarded += 1;
                }
            }
            if discarded > 0 {
                bucket.metrics.record_discarded_resident(discarded);
                tracing::debug!(key = ?entry.key(), discarded, "pool optimize: shrank bucket");
            }
        }
    }

    /// Aggregated health: a bucket that's empty while its active count
    /// exceeds `overload_threshold` of max capacity is a Warning; any
    /// recorded creation failures are also surfaced.
    pub fn health(&self, overload_threshold: f64) -> PoolHealth {
        let mut health = PoolHealth::healthy();
        for entry in self.buckets.iter() {
            let key_desc = format!("{:?}", entry.key());
            let bucket = entry.value();
            let resident = bucket.metrics.resident();
            let active = bucket.metrics.active();
            if resident == 0 && (active as f64) > (self.max_pool_size as f64) * overload_threshold {
                health.add_issue(
                    PoolLevel::Warning,
                    key_desc.clone(),
                    format!(
                        "bucket empty with {active} active clients (over {:.0}% of max {})",
                        overload_threshold * 100.0,
                        self.max_pool_size
                    ),
                );
            }
            let failures = bucket.metrics.creation_failures_total();
            if failures > 0 {
                health.add_issue(
                    PoolLevel::Warning,
                    key_desc,
                    format!("{failures} client creation failures recorded"),
                );
            }
        }
        health
    }

    pub fn diagnostics(&self) -> PoolDiagnostics {
        self.buckets.iter().fold(PoolDiagnostics::default(), |acc, entry| {
            acc + PoolDiagnostics {
                resident: entry.value().metrics.resident(),
                active: entry.value().metrics.active(),
                max: self.max_pool_size as u64,
            }
        })
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Publishes pool-wide gauges under the `pool` label. Called from the
    /// maintenance/rebalance-monitor loops on their regular tick rather than
    /// on every rent/return, since a gauge only needs to be as fresh as the
    /// next scrape.
    pub fn publish_metrics(&self, pool_name: &'static str) {
        let diagnostics = self.diagnostics();
        let (mut created, mut failures, mut discarded) = (0u64, 0u64, 0u64);
        for entry in self.buckets.iter() {
            created += entry.value().metrics.created_total();
            failures += entry.value().metrics.creation_failures_total();
            discarded += entry.value().metrics.discarded_total();
        }
        metrics::gauge!("pool_resident_clients", "pool" => pool_name).set(diagnostics.resident as f64);
        metrics::gauge!("pool_active_clients", "pool" => pool_name).set(diagnostics.active as f64);
        metrics::gauge!("pool_clients_created_total", "pool" => pool_name).set(created as f64);
        metrics::gauge!("pool_client_creation_failures_total", "pool" => pool_name).set(failures as f64);
        metrics::gauge!("pool_clients_discarded_total", "pool" => pool_name).set(discarded as f64);
    }

    /// Destroys every resident client in every bucket. Idempotent: a bucket
    /// that's already empty (including on a second `dispose` call) simply
    /// drains nothing.
    pub fn dispose(&self) {
        for entry in self.buckets.iter() {
            let bucket = entry.value();
            let drained: Vec<_> = {
                let mut queue = bucket.queue.lock().unwrap();
                queue.drain(..).collect()
            };
            if !drained.is_empty() {
                bucket.metrics.record_disposed(drained.len() as u64);
                tracing::debug!(key = ?entry.key(), count = drained.len(), "pool dispose: destroyed resident clients");
            }
        }
    }
}

fn client_config_from(broker: &BrokerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("statistics.interval.ms", "10000");
    for (k, v) in broker.as_kv_pairs() {
        client_config.set(k, v);
    }
    client_config
}

/// Producer specialization: idle clients are never evicted purely for being
/// idle (the health predicate's idle check is consumer-only), only for
/// overflow on return or an unhealthy flag.
pub struct ProducerPool {
    inner: ClientPool<ProducerKey, FutureProducer<KafkaContext>>,
}

impl ProducerPool {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            inner: ClientPool::new(max_pool_size),
        }
    }

    pub fn rent(
        &self,
        key: ProducerKey,
        broker: &BrokerConfig,
        liveness: HealthHandle,
    ) -> Result<PooledClient<FutureProducer<KafkaContext>>, PoolError> {
        self.inner.rent(&key, None, || {
            client_config_from(broker).create_with_context(KafkaContext::new(liveness.clone()))
        })
    }

    pub fn return_client(&self, key: ProducerKey, client: PooledClient<FutureProducer<KafkaContext>>) {
        self.inner.return_client(&key, client, None);
    }

    pub fn trim(&self) {
        self.inner.trim(None);
    }

    pub fn optimize(&self, min_pool_size: usize, low_utilization_threshold: f64) {
        self.inner.optimize(min_pool_size, low_utilization_threshold);
    }

    pub fn health(&self, overload_threshold: f64) -> PoolHealth {
        self.inner.health(overload_threshold)
    }

    pub fn diagnostics(&self) -> PoolDiagnostics {
        self.inner.diagnostics()
    }

    pub fn publish_metrics(&self) {
        self.inner.publish_metrics("producer");
    }

    /// Destroys every resident producer. Safe to call more than once.
    pub async fn dispose(&self) {
        self.inner.dispose();
    }
}

/// Consumer specialization. Idle clients are evicted by `idle_timeout`;
/// rented instances are never returned to the bucket (see
/// `ClientPool::discard_active`) — a subscription or fetch always destroys
/// its consumer on completion rather than recycling it, since a resumed
/// consumer would need to re-join its group anyway.
pub struct ConsumerPool {
    inner: ClientPool<ConsumerKey, StreamConsumer<KafkaContext>>,
    idle_timeout: Duration,
}

impl ConsumerPool {
    pub fn new(max_pool_size: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: ClientPool::new(max_pool_size),
            idle_timeout,
        }
    }

    pub fn rent(
        &self,
        key: ConsumerKey,
        broker: &BrokerConfig,
        group_id: &str,
        liveness: HealthHandle,
    ) -> Result<PooledClient<StreamConsumer<KafkaContext>>, PoolError> {
        self.inner.rent(&key, Some(self.idle_timeout), || {
            let mut client_config = client_config_from(broker);
            client_config
                .set("group.id", group_id)
                .set("enable.auto.offset.store", "false");
            client_config.create_with_context(KafkaContext::new(liveness.clone()))
        })
    }

    pub fn release(&self, key: ConsumerKey) {
        self.inner.discard_active(&key);
    }

    pub fn trim(&self) {
        self.inner.trim(Some(self.idle_timeout));
    }

    pub fn health(&self, overload_threshold: f64) -> PoolHealth {
        self.inner.health(overload_threshold)
    }

    pub fn diagnostics(&self) -> PoolDiagnostics {
        self.inner.diagnostics()
    }

    pub fn key_count(&self) -> usize {
        self.inner.key_count()
    }

    pub fn publish_metrics(&self) {
        self.inner.publish_metrics("consumer");
    }

    /// Destroys every resident consumer. Safe to call more than once.
    pub async fn dispose(&self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn factory_ok(calls: &AtomicUsize) -> Result<u32, rdkafka::error::KafkaError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(42)
    }

    #[test]
    fn rent_constructs_on_empty_bucket_then_reuses_on_return() {
        let pool: ClientPool<&str, u32> = ClientPool::new(2);
        let calls = AtomicUsize::new(0);

        let client = pool.rent(&"k", None, || factory_ok(&calls)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        pool.return_client(&"k", client, None);
        let reused = pool.rent(&"k", None, || factory_ok(&calls)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "factory should not run again");
        pool.return_client(&"k", reused, None);
    }

    #[test]
    fn rent_fails_with_pool_exhausted_at_capacity() {
        let pool: ClientPool<&str, u32> = ClientPool::new(1);
        let calls = AtomicUsize::new(0);
        let _first = pool.rent(&"k", None, || factory_ok(&calls)).unwrap();
        let second = pool.rent(&"k", None, || factory_ok(&calls));
        assert!(matches!(second, Err(PoolError::PoolExhausted { .. })));
    }

    #[test]
    fn return_past_capacity_discards_instead_of_enqueuing() {
        // A resident bucket already at max_pool_size only happens under a
        // race between two concurrent returns (rent's own capacity check
        // prevents it through legitimate sequential use), so we drive the
        // bucket's metrics directly to land it in that state.
        let pool: ClientPool<&str, u32> = ClientPool::new(1);
        let bucket = pool.bucket(&"k");
        bucket.metrics.record_created(); // client A becomes active
        bucket.metrics.record_returned_to_bucket(); // A returns: resident=1
        bucket.metrics.record_created(); // client B becomes active

        pool.return_client(&"k", PooledClient::new(99u32), None);
        assert_eq!(pool.diagnostics().resident, 1, "the existing resident must survive");
        assert_eq!(pool.diagnostics().active, 0, "B's active slot is retired on discard");
    }

    #[test]
    fn trim_evicts_idle_consumers_only_when_timeout_given() {
        let pool: ClientPool<&str, u32> = ClientPool::new(2);
        let calls = AtomicUsize::new(0);
        let client = pool.rent(&"k", None, || factory_ok(&calls)).unwrap();
        pool.return_client(&"k", client, None);
        pool.trim(Some(Duration::from_secs(0)));
        assert_eq!(pool.diagnostics().resident, 0, "zero idle_timeout evicts immediately");
    }

    #[test]
    fn dispose_destroys_resident_clients_and_is_idempotent() {
        let pool: ClientPool<&str, u32> = ClientPool::new(2);
        let calls = AtomicUsize::new(0);
        let client = pool.rent(&"k", None, || factory_ok(&calls)).unwrap();
        pool.return_client(&"k", client, None);
        assert_eq!(pool.diagnostics().resident, 1);

        pool.dispose();
        assert_eq!(pool.diagnostics().resident, 0);
        pool.dispose();
        assert_eq!(pool.diagnostics().resident, 0, "disposing twice is a no-op");
    }

    /// Drives an arbitrary sequence of rent/return ops against a single key
    /// and checks §8's universal invariants 1 and 2 hold at every step, not
    /// just in the handful of sequences the example-based tests above cover.
    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Rent,
            Return,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![Just(Op::Rent), Just(Op::Return)]
        }

        proptest! {
            #[test]
            fn rent_return_sequence_upholds_capacity_and_creation_invariants(
                ops in proptest::collection::vec(op_strategy(), 0..200),
                max_pool_size in 1usize..8,
            ) {
                let pool: ClientPool<&str, u32> = ClientPool::new(max_pool_size);
                let calls = AtomicUsize::new(0);
                let mut held = Vec::new();
                let mut in_flight_rents = 0usize;

                for op in ops {
                    match op {
                        Op::Rent => {
                            in_flight_rents += 1;
                            if let Ok(client) = pool.rent(&"k", None, || factory_ok(&calls)) {
                                held.push(client);
                            }
                            in_flight_rents -= 1;
                        }
                        Op::Return => {
                            if let Some(client) = held.pop() {
                                pool.return_client(&"k", client, None);
                            }
                        }
                    }

                    let diagnostics = pool.diagnostics();
                    prop_assert_eq!(diagnostics.active as usize, held.len());
                    prop_assert!(
                        diagnostics.resident as usize + diagnostics.active as usize
                            <= max_pool_size + in_flight_rents
                    );
                }

                let bucket = pool.bucket(&"k");
                let created = bucket.metrics.created_total();
                prop_assert!(created >= bucket.metrics.disposed_total());

                pool.dispose();
                let diagnostics = pool.diagnostics();
                prop_assert_eq!(
                    bucket.metrics.disposed_total() + diagnostics.active,
                    created,
                    "disposed + still-active must equal everything ever created"
                );
            }
        }
    }
}
