//! The typed consumer: subscribe, poll, decode, and expose as a lazy
//! sequence or bounded batch.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::{Entity, EntityDescriptor};
use crate::error::{DecodeError, MessagingError, MessagingResult};
use crate::pool::{KafkaContext, PooledClient};
use crate::schema::SchemaBinder;
use crate::types::{ConsumedBatch, ConsumedMessage, FetchOptions, MessageContext, MessageEnvelope};
use std::sync::Arc;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Subscribes, polls, decodes, and exposes a single entity type's stream.
/// Never returned to the pool: the owning subscription or fetch always
/// destroys it on completion (see the pool's consumer-release policy).
pub struct TypedConsumer<T: Entity> {
    descriptor: &'static EntityDescriptor,
    client: PooledClient<StreamConsumer<KafkaContext>>,
    binder: Arc<SchemaBinder>,
    subscribed: AtomicBool,
    _marker: PhantomData<T>,
}

impl<T: Entity + DeserializeOwned> TypedConsumer<T> {
    pub fn new(client: PooledClient<StreamConsumer<KafkaContext>>, binder: Arc<SchemaBinder>) -> Self {
        Self {
            descriptor: T::descriptor(),
            client,
            binder,
            subscribed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    fn ensure_subscribed(&self) -> MessagingResult<()> {
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            self.client
                .client
                .subscribe(&[self.descriptor.topic_name.as_str()])
                .map_err(|e| MessagingError::ConsumeFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Polls until it has one decoded envelope to yield, the cancellation
    /// token fires, or a fatal broker error occurs. `None` means the
    /// sequence has ended (cancellation observed); any in-flight decoded
    /// message that hadn't been returned yet is simply dropped.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<MessagingResult<ConsumedMessage<T>>> {
        if let Err(e) = self.ensure_subscribed() {
            return Some(Err(e));
        }
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let poll = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = self.client.client.recv() => result,
            };
            match poll {
                Ok(message) => {
                    let Some(payload) = message.payload() else {
                        debug!(topic = %self.descriptor.topic_name, "skipping record with empty payload");
                        continue;
                    };
                    match self.binder.decode_value::<T>(self.descriptor, payload).await {
                        Ok(value) => {
                            let context = MessageContext {
                                topic: message.topic().to_string(),
                                partition: message.partition(),
                                offset: message.offset(),
                                timestamp_ms: message.timestamp().to_millis(),
                                schema_id: payload.get(1..5).map(|b| {
                                    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
                                }),
                            };
                            let mut envelope = MessageEnvelope::new(value)
                                .with_partition(message.partition());
                            if let Some(key_bytes) = message.key() {
                                if self.descriptor.key_fields.is_empty() {
                                    if let Ok(key) = std::str::from_utf8(key_bytes) {
                                        envelope = envelope.with_key(key);
                                    }
                                } else {
                                    match self.binder.decode_key::<T>(self.descriptor, key_bytes).await {
                                        Ok(key) => envelope = envelope.with_key(key),
                                        Err(decode_err) => {
                                            warn!(
                                                topic = %self.descriptor.topic_name,
                                                error = %decode_err,
                                                "dropping record with malformed key"
                                            );
                                            continue;
                                        }
                                    }
                                }
                            }
                            return Some(Ok(ConsumedMessage { envelope, context }));
                        }
                        Err(DecodeError::EmptyPayload) => continue,
                        Err(decode_err) => {
                            warn!(topic = %self.descriptor.topic_name, error = %decode_err, "dropping malformed record");
                            continue;
                        }
                    }
                }
                Err(rdkafka::error::KafkaError::PartitionEOF(_)) => continue,
                Err(e) => {
                    if self.client.client.client().fatal_error().is_some() {
                        return Some(Err(MessagingError::ConsumeFailed(e.to_string())));
                    }
                    warn!(topic = %self.descriptor.topic_name, error = %e, "non-fatal consume error, continuing");
                    continue;
                }
            }
        }
    }

    /// Accumulates envelopes until `options.max_messages` is reached or
    /// `options.timeout` elapses. `from_offset`/`to_offset`, when set, seek
    /// assigned partitions before reading and stop once every assigned
    /// partition has reached `to_offset`.
    pub async fn consume_batch(
        &self,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> MessagingResult<ConsumedBatch<T>> {
        self.ensure_subscribed()?;
        if let Some(from_offset) = options.from_offset {
            self.seek_all_assigned(from_offset)?;
        }

        let start_time = SystemTime::now();
        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut messages = Vec::new();

        while messages.len() < options.max_messages {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let recv_fut = self.recv(cancel);
            let outcome = tokio::time::timeout(remaining.min(POLL_TIMEOUT), recv_fut).await;
            match outcome {
                Ok(Some(Ok(message))) => {
                    if let Some(to_offset) = options.to_offset {
                        if message.context.offset > to_offset {
                            break;
                        }
                    }
                    messages.push(message);
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => break,
                Err(_elapsed) => continue,
            }
        }

        Ok(ConsumedBatch {
            messages,
            start_time,
            end_time: SystemTime::now(),
        })
    }

    pub fn commit(&self) -> MessagingResult<()> {
        self.client
            .client
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| MessagingError::ConsumeFailed(e.to_string()))
    }

    pub fn seek(&self, partition: i32, offset: i64) -> MessagingResult<()> {
        self.client
            .client
            .seek(
                &self.descriptor.topic_name,
                partition,
                Offset::Offset(offset),
                Duration::from_secs(5),
            )
            .map_err(|e| MessagingError::ConsumeFailed(e.to_string()))
    }

    fn seek_all_assigned(&self, offset: i64) -> MessagingResult<()> {
        let assignment = self.assignment()?;
        for element in assignment.elements() {
            self.seek(element.partition(), offset)?;
        }
        Ok(())
    }

    pub fn assignment(&self) -> MessagingResult<TopicPartitionList> {
        self.client
            .client
            .assignment()
            .map_err(|e| MessagingError::ConsumeFailed(e.to_string()))
    }

    pub fn into_client(self) -> PooledClient<StreamConsumer<KafkaContext>> {
        self.client
    }
}
