//! The typed producer: encode, publish, and report deliveries for a single
//! entity type, backed by a pool-rented raw client.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{Entity, EntityDescriptor};
use crate::error::{MessagingError, MessagingResult};
use crate::pool::{KafkaContext, PooledClient};
use crate::schema::SchemaBinder;
use crate::types::{BatchDeliveryResult, BatchOptions, DeliveryResult, MessageEnvelope};

/// Atomic per-type counters mirroring the pool's metrics pattern: plain
/// atomics rather than a lock, since each field updates independently.
#[derive(Default)]
pub struct ProducerTypeStats {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    total_send_time_micros: AtomicU64,
}

impl ProducerTypeStats {
    pub fn total_messages(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed) + self.messages_failed.load(Ordering::Relaxed)
    }

    pub fn successful_messages(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn failed_messages(&self) -> u64 {
        self.messages_failed.load(Ordering::Relaxed)
    }

    pub fn average_send_time(&self) -> std::time::Duration {
        let total = self.total_messages();
        if total == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_micros(self.total_send_time_micros.load(Ordering::Relaxed) / total)
    }

    fn record_send(&self, elapsed: std::time::Duration, success: bool) {
        self.total_send_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if success {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_batch(&self, all_successful: bool) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        if !all_successful {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Encodes, publishes, and tracks delivery for a single entity type. Always
/// constructed around a pool-rented client (see the reference codebase's
/// note that the "enhanced" and "plain" wrapper split collapses to one type
/// whose only construction-time choice is who owns the raw client — here,
/// always the pool).
pub struct TypedProducer<T: Entity> {
    descriptor: &'static EntityDescriptor,
    client: PooledClient<FutureProducer<KafkaContext>>,
    binder: Arc<SchemaBinder>,
    stats: ProducerTypeStats,
    _marker: PhantomData<T>,
}

impl<T: Entity + Serialize> TypedProducer<T> {
    pub fn new(client: PooledClient<FutureProducer<KafkaContext>>, binder: Arc<SchemaBinder>) -> Self {
        Self {
            descriptor: T::descriptor(),
            client,
            binder,
            stats: ProducerTypeStats::default(),
            _marker: PhantomData,
        }
    }

    pub fn stats(&self) -> &ProducerTypeStats {
        &self.stats
    }

    pub fn into_client(self) -> PooledClient<FutureProducer<KafkaContext>> {
        self.client
    }

    pub async fn send(&self, envelope: MessageEnvelope<T>) -> MessagingResult<DeliveryResult> {
        let started = Instant::now();
        let result = self.send_inner(&envelope).await;
        self.stats.record_send(started.elapsed(), result.is_ok());
        result
    }

    async fn send_inner(&self, envelope: &MessageEnvelope<T>) -> MessagingResult<DeliveryResult> {
        let key = if self.descriptor.key_fields.is_empty() {
            envelope
                .key
                .clone()
                .or_else(|| envelope.value.key())
                .map(String::into_bytes)
        } else {
            self.binder
                .encode_key(self.descriptor, &envelope.value)
                .await
                .map_err(MessagingError::from)?
        };
        let payload = self
            .binder
            .encode_value(self.descriptor, &envelope.value)
            .await
            .map_err(MessagingError::from)?;

        let headers = if envelope.headers.is_empty() {
            None
        } else {
            let mut h = rdkafka::message::OwnedHeaders::new();
            for (name, value) in &envelope.headers {
                h = h.insert(rdkafka::message::Header {
                    key: name.as_str(),
                    value: Some(value.as_str()),
                });
            }
            Some(h)
        };

        let record = FutureRecord {
            topic: &self.descriptor.topic_name,
            partition: envelope.partition,
            payload: Some(payload.as_slice()),
            key: key.as_deref(),
            timestamp: None,
            headers,
        };

        match self.client.client.send(record, std::time::Duration::from_secs(0)).await {
            Ok((partition, offset)) => {
                debug!(topic = %self.descriptor.topic_name, partition, offset, "send delivered");
                Ok(DeliveryResult {
                    topic: self.descriptor.topic_name.clone(),
                    partition,
                    offset,
                })
            }
            Err((error, _owned)) => {
                warn!(topic = %self.descriptor.topic_name, %error, "send failed");
                Err(MessagingError::SendFailed(error.to_string()))
            }
        }
    }

    /// Publishes every item concurrently and waits for every delivery
    /// report; never aborts on a partial failure. Returns `Err` only when
    /// `≥1` item failed, carrying the full per-index result set.
    pub async fn send_batch(
        &self,
        values: Vec<MessageEnvelope<T>>,
        _options: &BatchOptions,
    ) -> MessagingResult<BatchDeliveryResult> {
        if values.is_empty() {
            return Ok(BatchDeliveryResult::from_results(Vec::new()));
        }

        let futures = values.into_iter().map(|envelope| async move {
            let started = Instant::now();
            let outcome = self.send_inner(&envelope).await.map_err(|e| crate::types::BatchItemError {
                error: e.to_string(),
                value: serde_json::to_value(&envelope.value).unwrap_or(serde_json::Value::Null),
            });
            (outcome, started.elapsed())
        });
        let timed_outcomes = join_all(futures).await;

        for (outcome, elapsed) in &timed_outcomes {
            self.stats.record_send(*elapsed, outcome.is_ok());
        }
        let outcomes: Vec<_> = timed_outcomes.into_iter().map(|(outcome, _)| outcome).collect();

        let result = BatchDeliveryResult::from_results(outcomes);
        self.stats.record_batch(result.all_successful());

        if result.all_successful() {
            Ok(result)
        } else {
            Err(MessagingError::BatchPartiallyFailed {
                successful: result.successful_count(),
                failed: result.failed_count(),
                result: Box::new(result),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_send_time_is_zero_with_no_messages() {
        let stats = ProducerTypeStats::default();
        assert_eq!(stats.average_send_time(), std::time::Duration::ZERO);
    }

    #[test]
    fn record_send_tracks_success_and_failure_counts() {
        let stats = ProducerTypeStats::default();
        stats.record_send(std::time::Duration::from_millis(10), true);
        stats.record_send(std::time::Duration::from_millis(20), false);
        assert_eq!(stats.successful_messages(), 1);
        assert_eq!(stats.failed_messages(), 1);
        assert_eq!(stats.total_messages(), 2);
    }
}
