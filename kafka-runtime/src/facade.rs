//! The messaging façade: the single entry point application code talks to
//! (§4.G). Everything else in this crate is a collaborator the façade wires
//! together — the pool, the schema binder, and the two managers — and
//! instruments with the spans/metrics in `observability`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use health::HealthRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{BrokerConfig, PoolConfig, SchemaRegistryConfig};
use crate::consumer_manager::{ConsumerManager, SubscriptionInfo};
use crate::descriptor::Entity;
use crate::error::{MessagingError, MessagingResult};
use crate::observability;
use crate::pool::{ConsumerPool, PoolDiagnostics, PoolHealth, PoolLevel, ProducerPool};
use crate::producer_manager::ProducerManager;
use crate::schema::{HttpSchemaRegistryClient, SchemaBinder, SchemaRegistryClient};
use crate::types::{
    BatchDeliveryResult, BatchOptions, ConsumedMessage, DeliveryResult, FetchOptions, MessageEnvelope,
    SendContext, SubscriptionOptions,
};

/// Overall health verdict merging producer pool, consumer pool, and schema
/// cache health; the worst of the three wins, per §4.G.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub level: PoolLevel,
    pub producer: PoolHealth,
    pub consumer: PoolHealth,
    pub schema_registry_failures: u64,
}

/// Process-level figures that only exist "if available" (§2.2): RSS reading
/// depends on `/proc` being mounted (Linux only), and the Tokio task count
/// depends on running inside a Tokio runtime with metrics enabled.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessDiagnostics {
    pub uptime: Duration,
    pub rss_bytes_if_available: Option<u64>,
    pub tokio_active_tasks_if_available: Option<u64>,
}

/// Process-wide producer figures, per §4.E.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProducerDiagnostics {
    pub total_producers_created: u64,
    pub total_messages_sent: u64,
    pub total_batches_sent: u64,
    pub average_send_latency: Duration,
    pub throughput_per_second: f64,
}

/// Process-wide consumer figures, mirroring `ProducerDiagnostics`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsumerDiagnostics {
    pub total_messages_consumed: u64,
    pub average_processing_time: Duration,
    pub throughput_per_second: f64,
}

/// `Diagnostics()`'s shape, per the §2.2 expansion: process-level counters
/// plus both pools' and both managers' state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostics {
    pub process: ProcessDiagnostics,
    pub producer_pool: PoolDiagnostics,
    pub consumer_pool: PoolDiagnostics,
    pub producers: ProducerDiagnostics,
    pub consumers: ConsumerDiagnostics,
    pub cached_schema_types: usize,
    pub subscriptions: Vec<SubscriptionInfo>,
}

/// Reads resident set size from `/proc/self/status`. `None` on any platform
/// or sandbox where that file doesn't exist or doesn't parse, per the
/// "if available" contract — this is not a fatal diagnostics failure.
fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.trim_start_matches("VmRSS:").trim().split_whitespace().next()?.parse().ok()?;
    Some(kb * 1024)
}

/// Single surface for application code: send, send-batch, streaming
/// consume, batch fetch, health, and diagnostics.
pub struct MessagingFacade {
    producers: Arc<ProducerManager>,
    consumers: Arc<ConsumerManager>,
    binder: Arc<SchemaBinder>,
    pool_config: PoolConfig,
    started_at: Instant,
    maintenance_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl MessagingFacade {
    /// Builds every collaborator and starts the pool's background loops
    /// (maintenance + rebalance-monitor), the same way `AppContext::new`
    /// wires up a process's long-running tasks in the reference codebase.
    pub async fn new(
        broker: BrokerConfig,
        pool_config: PoolConfig,
        schema_registry: SchemaRegistryConfig,
        health_registry: &HealthRegistry,
    ) -> MessagingResult<Self> {
        let registry_client: Arc<dyn SchemaRegistryClient> = Arc::new(
            HttpSchemaRegistryClient::new(&schema_registry)
                .map_err(MessagingError::from)?,
        );
        Self::with_registry_client(broker, pool_config, registry_client, health_registry).await
    }

    /// Same as `new`, but with an already-constructed registry client —
    /// lets callers substitute `MockSchemaRegistryClient` in tests that
    /// still need a real broker, or a custom implementation in production.
    pub async fn with_registry_client(
        broker: BrokerConfig,
        pool_config: PoolConfig,
        registry_client: Arc<dyn SchemaRegistryClient>,
        health_registry: &HealthRegistry,
    ) -> MessagingResult<Self> {
        let binder = Arc::new(SchemaBinder::new(registry_client));

        let producer_pool = Arc::new(ProducerPool::new(pool_config.max_pool_size));
        let consumer_pool = Arc::new(ConsumerPool::new(
            pool_config.max_pool_size,
            Duration::from_secs(pool_config.idle_timeout_secs),
        ));

        let producer_liveness = health_registry
            .register("kafka-producer-pool".to_string(), Duration::from_secs(60))
            .await;
        let consumer_liveness = health_registry
            .register("kafka-consumer-pool".to_string(), Duration::from_secs(60))
            .await;

        let producers = Arc::new(ProducerManager::new(
            producer_pool.clone(),
            binder.clone(),
            broker.clone(),
            producer_liveness.clone(),
        ));
        let consumers = Arc::new(ConsumerManager::new(
            consumer_pool.clone(),
            binder.clone(),
            broker,
            consumer_liveness.clone(),
        ));

        let maintenance_tasks = vec![
            tokio::spawn(crate::pool::maintenance_loop(
                producer_pool,
                pool_config.clone(),
                producer_liveness,
            )),
            tokio::spawn(crate::pool::rebalance_monitor_loop(
                consumer_pool,
                pool_config.rebalance_monitor_interval_secs,
                pool_config.overload_threshold,
                consumer_liveness,
            )),
        ];

        Ok(Self {
            producers,
            consumers,
            binder,
            pool_config,
            started_at: Instant::now(),
            maintenance_tasks,
        })
    }

    /// Sends a single value. Returns once the broker has acknowledged
    /// delivery (or the call fails); `context.timeout`, when set, bounds
    /// the wait with `MessagingError::Timeout`.
    pub async fn send<T>(&self, value: T, context: Option<SendContext>) -> MessagingResult<DeliveryResult>
    where
        T: Entity + Serialize,
    {
        let descriptor = T::descriptor();
        let span = observability::send_span(context.as_ref().and_then(|c| c.trace_context.as_deref()));
        let timeout = context.as_ref().and_then(|c| c.timeout);
        let envelope = build_envelope(value, context);

        async move {
            let started = Instant::now();
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.producers.send(envelope))
                    .await
                    .unwrap_or(Err(MessagingError::Timeout)),
                None => self.producers.send(envelope).await,
            };
            observability::record_send(
                &descriptor.topic_name,
                descriptor.entity_name.as_str(),
                result.is_ok(),
                started.elapsed(),
            );
            observability::record_outcome(&tracing::Span::current(), &result);
            result
        }
        .instrument(span)
        .await
    }

    /// Sends every value, never aborting on a partial failure. Empty input
    /// is a no-op that still records one zero-count batch metric (§8
    /// boundary behavior). A batch with `≥1` failure fails the call with
    /// `BatchPartiallyFailed`, carrying the full per-index result set.
    pub async fn send_batch<T>(
        &self,
        values: Vec<T>,
        context: Option<SendContext>,
    ) -> MessagingResult<BatchDeliveryResult>
    where
        T: Entity + Serialize,
    {
        let descriptor = T::descriptor();
        let span = observability::send_batch_span(context.as_ref().and_then(|c| c.trace_context.as_deref()));

        async move {
            if values.is_empty() {
                observability::record_batch(&descriptor.topic_name, descriptor.entity_name.as_str(), true);
                return Ok(BatchDeliveryResult::from_results(Vec::new()));
            }

            let envelopes: Vec<_> = values
                .into_iter()
                .map(|value| build_envelope(value, context.clone()))
                .collect();
            let options = BatchOptions::default();
            let result = self.producers.send_batch(envelopes, &options).await;

            let all_successful = !matches!(result, Err(MessagingError::BatchPartiallyFailed { .. }));
            observability::record_batch(&descriptor.topic_name, descriptor.entity_name.as_str(), all_successful);
            observability::record_outcome(&tracing::Span::current(), &result);
            result
        }
        .instrument(span)
        .await
    }

    /// Streams decoded values (not envelopes) for `T` under
    /// `options.group_id`, recording a receive metric every message and a
    /// throughput log line every 100. Infinite: restartable only by calling
    /// `consume` again with a fresh `CancellationToken`.
    pub fn consume<T>(
        &self,
        options: SubscriptionOptions,
        cancel: CancellationToken,
    ) -> MessagingResult<impl futures::Stream<Item = MessagingResult<T>>>
    where
        T: Entity + DeserializeOwned,
    {
        use futures::StreamExt;

        let descriptor = T::descriptor();
        let topic = descriptor.topic_name.clone();
        let entity_name = descriptor.entity_name.clone();
        let group_id = options.group_id.clone();

        let span = observability::consume_stream_span(None);
        let inner = span.in_scope(|| self.consumers.consume_stream::<T>(&group_id, cancel))?;
        let consumers = self.consumers.clone();

        let mut received: u64 = 0;
        Ok(inner.map(move |outcome: MessagingResult<ConsumedMessage<T>>| {
            let _guard = span.enter();
            let started = Instant::now();
            let result = outcome.map(|message| message.envelope.value);
            let elapsed = started.elapsed();
            observability::record_receive(&topic, &entity_name, elapsed);
            consumers.record_consumed(elapsed);
            received += 1;
            if received % 100 == 0 {
                tracing::info!(topic = %topic, entity_type = %entity_name, received, "consume throughput checkpoint");
            }
            observability::record_outcome(&span, &result);
            result
        }))
    }

    /// One-shot bounded pull: builds a disposable consumer, drains a single
    /// batch, and disposes it. `max_messages=0` returns `[]` without
    /// opening a consumer at all.
    pub async fn fetch<T>(&self, options: FetchOptions, group_id: &str) -> MessagingResult<Vec<T>>
    where
        T: Entity + DeserializeOwned,
    {
        let descriptor = T::descriptor();
        let span = observability::fetch_batch_span(None);

        async move {
            if options.max_messages == 0 {
                return Ok(Vec::new());
            }
            let batch = self.consumers.fetch::<T>(group_id, &options).await?;
            for _ in &batch.messages {
                observability::record_receive(&descriptor.topic_name, &descriptor.entity_name, Duration::ZERO);
            }
            Ok(batch.messages.into_iter().map(|m| m.envelope.value).collect())
        }
        .instrument(span)
        .await
    }

    /// Merges producer, consumer, and schema-cache health; the overall
    /// level is the worst of the three.
    pub fn health_report(&self) -> HealthReport {
        let producer = self.producers.health(self.pool_config.overload_threshold);
        let consumer = self.consumers.health(self.pool_config.overload_threshold);
        let schema_registry_failures = self.binder.registry_failures();

        let mut level = producer.level.max(consumer.level);
        if schema_registry_failures > 0 && level < PoolLevel::Warning {
            level = PoolLevel::Warning;
        }

        HealthReport {
            level,
            producer,
            consumer,
            schema_registry_failures,
        }
    }

    /// Process memory (RSS) and active-instance counters, merged with both
    /// pools' diagnostics and producer/consumer stats, per the §2.2
    /// expansion.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            process: ProcessDiagnostics {
                uptime: self.started_at.elapsed(),
                rss_bytes_if_available: read_rss_bytes(),
                tokio_active_tasks_if_available: tokio::runtime::Handle::try_current()
                    .ok()
                    .map(|handle| handle.metrics().num_alive_tasks() as u64),
            },
            producer_pool: self.producers.pool().diagnostics(),
            consumer_pool: self.consumers.pool().diagnostics(),
            producers: ProducerDiagnostics {
                total_producers_created: self.producers.stats().total_producers_created(),
                total_messages_sent: self.producers.stats().total_messages(),
                total_batches_sent: self.producers.stats().total_batches(),
                average_send_latency: self.producers.stats().average_latency(),
                throughput_per_second: self.producers.stats().throughput_per_second(),
            },
            consumers: ConsumerDiagnostics {
                total_messages_consumed: self.consumers.stats().total_messages_consumed(),
                average_processing_time: self.consumers.stats().average_processing_time(),
                throughput_per_second: self.consumers.stats().throughput_per_second(),
            },
            cached_schema_types: self.binder.cached_type_count(),
            subscriptions: self.consumers.subscription_snapshot(),
        }
    }

    /// Disposes both managers (which cancels subscriptions, waits for
    /// draining, and disposes both pools) and stops the background
    /// maintenance tasks. Idempotent.
    pub async fn dispose(&mut self) {
        self.consumers.dispose().await;
        self.producers.dispose().await;
        for task in self.maintenance_tasks.drain(..) {
            task.abort();
        }
    }
}

fn build_envelope<T: Entity>(value: T, context: Option<SendContext>) -> MessageEnvelope<T> {
    let mut envelope = MessageEnvelope::new(value);
    let message_id = context
        .as_ref()
        .and_then(|c| c.message_id.clone())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    envelope = envelope.with_header("message-id", message_id);

    if let Some(context) = context {
        if let Some(partition) = context.target_partition {
            envelope = envelope.with_partition(partition);
        }
        if let Some(correlation_id) = context.correlation_id {
            envelope = envelope.with_header("correlation-id", correlation_id);
        }
        for (name, value) in context.headers {
            envelope = envelope.with_header(name, value);
        }
    }
    envelope
}
