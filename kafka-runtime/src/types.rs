//! Core data model: envelopes, contexts, delivery results, and the option
//! structs passed into send/consume/fetch.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Caller-supplied correlation/control data for a façade-level `Send`. Never
/// mutated by the runtime; `target_partition` and `headers` are folded into
/// the `MessageEnvelope` built for the producer, while `message_id`,
/// `correlation_id`, and `trace_context` thread through as tracing-span
/// fields and `timeout` bounds the call.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub target_partition: Option<i32>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub trace_context: Option<String>,
}

/// A single message as handed to `TypedProducer::send` or yielded by
/// `TypedConsumer::consume`. `key` is `None` for topics with no declared key
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub key: Option<String>,
    pub value: T,
    pub headers: HashMap<String, String>,
    pub partition: Option<i32>,
}

impl<T> MessageEnvelope<T> {
    pub fn new(value: T) -> Self {
        Self {
            key: None,
            value,
            headers: HashMap::new(),
            partition: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Positional/offset metadata attached to a message as it's handed back from
/// consumption. Distinct from `MessageEnvelope` because producers never see
/// this (it doesn't exist until the broker assigns it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub schema_id: Option<i32>,
}

/// A consumed message paired with its positional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedMessage<T> {
    pub envelope: MessageEnvelope<T>,
    pub context: MessageContext,
}

/// Outcome of a single-message send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A single failed item inside a batch send: the rendered error plus the
/// original value (re-rendered as JSON rather than kept as `T`, so
/// `BatchDeliveryResult` doesn't need to be generic over the entity type),
/// so a caller inspecting `BatchPartiallyFailed` can recover what it tried
/// to send, not just that something failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemError {
    pub error: String,
    pub value: serde_json::Value,
}

/// Per-item outcome inside a batch send; `Err`'s index is implicit in its
/// position within `BatchDeliveryResult::results`.
pub type BatchItemResult = Result<DeliveryResult, BatchItemError>;

/// Aggregate outcome of `TypedProducer::send_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDeliveryResult {
    pub total: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchDeliveryResult {
    pub fn from_results(results: Vec<BatchItemResult>) -> Self {
        Self {
            total: results.len(),
            results,
        }
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }

    /// `(index, error)` pairs for every failed item, in original order.
    pub fn errors(&self) -> Vec<(usize, &BatchItemError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(index, result)| result.as_ref().err().map(|e| (index, e)))
            .collect()
    }

    pub fn all_successful(&self) -> bool {
        self.failed_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoOffsetReset {
    Latest,
    Earliest,
}

/// Options governing `ConsumerManager::subscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub group_id: String,
    pub auto_commit: bool,
    pub auto_offset_reset: AutoOffsetReset,
    pub enable_partition_eof: bool,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_poll_interval: Duration,
    /// Terminate the subscription loop on a handler error instead of
    /// logging it and continuing.
    pub stop_on_error: bool,
    pub max_poll_records: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            group_id: "default".to_string(),
            auto_commit: true,
            auto_offset_reset: AutoOffsetReset::Latest,
            enable_partition_eof: false,
            session_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            max_poll_interval: Duration::from_secs(300),
            stop_on_error: false,
            max_poll_records: 500,
        }
    }
}

/// Options governing `TypedProducer::send_batch`.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub flush_timeout: Duration,
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_timeout: Duration::from_secs(10),
            fail_fast: false,
        }
    }
}

/// Options governing a one-shot `TypedConsumer::fetch_batch` / `Fetch` call.
/// `from_offset`/`to_offset`, when set, seek the assigned partitions to
/// `from_offset` before reading and stop once every assigned partition has
/// reached `to_offset` (or the partition's high watermark, whichever comes
/// first).
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_messages: usize,
    pub timeout: Duration,
    pub from_offset: Option<i64>,
    pub to_offset: Option<i64>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_messages: 100,
            timeout: Duration::from_secs(5),
            from_offset: None,
            to_offset: None,
        }
    }
}

/// Outcome of `TypedConsumer::consume_batch` / the façade's `Fetch`.
#[derive(Debug, Clone)]
pub struct ConsumedBatch<T> {
    pub messages: Vec<ConsumedMessage<T>>,
    pub start_time: std::time::SystemTime,
    pub end_time: std::time::SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_delivery_result_counts_are_consistent() {
        let result = BatchDeliveryResult::from_results(vec![
            Ok(DeliveryResult {
                topic: "orders".into(),
                partition: 0,
                offset: 1,
            }),
            Err(BatchItemError {
                error: "boom".into(),
                value: serde_json::json!({"order_id": 2}),
            }),
        ]);
        assert_eq!(result.total, 2);
        assert_eq!(result.successful_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.all_successful());

        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 1);
        assert_eq!(errors[0].1.error, "boom");
    }

    #[test]
    fn envelope_builder_methods_compose() {
        let envelope = MessageEnvelope::new(42)
            .with_key("k1")
            .with_header("trace-id", "abc")
            .with_partition(3);
        assert_eq!(envelope.key.as_deref(), Some("k1"));
        assert_eq!(envelope.headers.get("trace-id").unwrap(), "abc");
        assert_eq!(envelope.partition, Some(3));
    }
}
