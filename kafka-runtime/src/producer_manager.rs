//! Caches one typed producer per entity type; aggregates process-wide
//! producer stats.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use health::HealthHandle;
use serde::Serialize;
use tracing::Instrument;

use crate::config::BrokerConfig;
use crate::descriptor::Entity;
use crate::error::MessagingResult;
use crate::keys::ProducerKey;
use crate::observability;
use crate::pool::{PoolHealth, ProducerPool};
use crate::producer::TypedProducer;
use crate::schema::SchemaBinder;
use crate::types::{BatchDeliveryResult, BatchOptions, DeliveryResult, MessageEnvelope};

/// Process-wide totals, recomputed into a throughput figure at most once
/// every 60s from accumulated counts, per §4.E.
#[derive(Default)]
pub struct ProcessProducerStats {
    total_producers_created: AtomicU64,
    total_messages: AtomicU64,
    total_batches: AtomicU64,
    total_send_time_micros: AtomicU64,
    last_throughput_calc: std::sync::Mutex<Option<(Instant, u64, f64)>>,
}

impl ProcessProducerStats {
    pub fn total_producers_created(&self) -> u64 {
        self.total_producers_created.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn total_batches(&self) -> u64 {
        self.total_batches.load(Ordering::Relaxed)
    }

    pub fn average_latency(&self) -> Duration {
        let total = self.total_messages.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_send_time_micros.load(Ordering::Relaxed) / total)
    }

    /// Throughput in messages/sec, recomputed at most once per 60s; returns
    /// the memoized value in between.
    pub fn throughput_per_second(&self) -> f64 {
        let mut guard = self.last_throughput_calc.lock().unwrap();
        let now = Instant::now();
        let current_total = self.total_messages.load(Ordering::Relaxed);
        match *guard {
            Some((last_calc, _, last_value)) if now.duration_since(last_calc) < Duration::from_secs(60) => {
                last_value
            }
            Some((last_calc, last_total, _)) => {
                let elapsed = now.duration_since(last_calc).as_secs_f64().max(1.0);
                let value = (current_total.saturating_sub(last_total)) as f64 / elapsed;
                *guard = Some((now, current_total, value));
                value
            }
            None => {
                *guard = Some((now, current_total, 0.0));
                0.0
            }
        }
    }

    fn record(&self, messages: u64, elapsed_micros: u64, is_batch: bool) {
        self.total_messages.fetch_add(messages, Ordering::Relaxed);
        self.total_send_time_micros.fetch_add(elapsed_micros, Ordering::Relaxed);
        if is_batch {
            self.total_batches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Type-erased holder so the manager's cache can store `TypedProducer<T>`
/// for arbitrary `T` behind one `DashMap`.
struct ErasedProducer {
    producer: Box<dyn Any + Send + Sync>,
}

/// Holds one typed producer per entity type; disposing the manager disposes
/// the pool and clears the cache.
pub struct ProducerManager {
    pool: Arc<ProducerPool>,
    binder: Arc<SchemaBinder>,
    broker: BrokerConfig,
    liveness: HealthHandle,
    producers: DashMap<TypeId, ErasedProducer>,
    stats: ProcessProducerStats,
}

impl ProducerManager {
    pub fn new(pool: Arc<ProducerPool>, binder: Arc<SchemaBinder>, broker: BrokerConfig, liveness: HealthHandle) -> Self {
        Self {
            pool,
            binder,
            broker,
            liveness,
            producers: DashMap::new(),
            stats: ProcessProducerStats::default(),
        }
    }

    pub fn stats(&self) -> &ProcessProducerStats {
        &self.stats
    }

    pub fn pool(&self) -> &Arc<ProducerPool> {
        &self.pool
    }

    pub fn health(&self, overload_threshold: f64) -> PoolHealth {
        self.pool.health(overload_threshold)
    }

    /// Returns the cached typed producer for `T`, constructing (and
    /// renting a client for) it on first use.
    pub fn get_producer<T>(&self) -> MessagingResult<Arc<TypedProducer<T>>>
    where
        T: Entity + Serialize,
    {
        if let Some(entry) = self.producers.get(&TypeId::of::<T>()) {
            if let Some(producer) = entry.producer.downcast_ref::<Arc<TypedProducer<T>>>() {
                return Ok(producer.clone());
            }
        }

        let key = ProducerKey::new::<T>(&self.broker, &T::descriptor().topic_name);
        let client = self.pool.rent(key, &self.broker, self.liveness.clone())?;
        let producer = Arc::new(TypedProducer::<T>::new(client, self.binder.clone()));
        self.producers.insert(
            TypeId::of::<T>(),
            ErasedProducer {
                producer: Box::new(producer.clone()),
            },
        );
        self.stats.total_producers_created.fetch_add(1, Ordering::Relaxed);
        Ok(producer)
    }

    pub async fn send<T>(&self, envelope: MessageEnvelope<T>) -> MessagingResult<DeliveryResult>
    where
        T: Entity + Serialize,
    {
        let producer = self.get_producer::<T>()?;
        let started = Instant::now();
        let result = producer.send(envelope).await;
        self.stats.record(1, started.elapsed().as_micros() as u64, false);
        result
    }

    /// Grounded as this manager's `SendBatchOptimized` proxy (§4.E): it's
    /// the thing `MessagingFacade::send_batch` actually delegates to, so it
    /// gets its own nested span (`kafka.batch_send_optimized`) under the
    /// façade's `kafka.send_batch`, distinguishing "the façade operation
    /// was called" from "the concurrent multi-item publish actually ran."
    pub async fn send_batch<T>(
        &self,
        values: Vec<MessageEnvelope<T>>,
        options: &BatchOptions,
    ) -> MessagingResult<BatchDeliveryResult>
    where
        T: Entity + Serialize,
    {
        let span = observability::batch_send_optimized_span(None);
        async move {
            let producer = self.get_producer::<T>()?;
            let count = values.len() as u64;
            let started = Instant::now();
            let result = producer.send_batch(values, options).await;
            self.stats.record(count, started.elapsed().as_micros() as u64, true);
            observability::record_outcome(&tracing::Span::current(), &result);
            result
        }
        .instrument(span)
        .await
    }

    /// Clears the typed-producer cache and disposes the underlying pool.
    /// Idempotent: a second call finds an empty cache and an already-empty
    /// pool, which is a no-op on both.
    pub async fn dispose(&self) {
        self.producers.clear();
        self.pool.dispose().await;
    }
}
