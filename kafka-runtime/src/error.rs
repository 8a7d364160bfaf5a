//! Error taxonomy for the messaging runtime.
//!
//! Each concern gets its own enum rather than one giant `MessagingError`, the
//! same way the reference codebase separates e.g. `DatabaseError` from
//! `ParseError` instead of folding everything into one type. `MessagingError`
//! at the bottom is the union the façade actually hands back to callers.

use std::fmt;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::BatchDeliveryResult;

/// Errors constructing or validating an `EntityDescriptor`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("topic name must not be empty")]
    EmptyTopicName,
    #[error("partition count must be >= 1, got {0}")]
    InvalidPartitionCount(u32),
    #[error("replication factor must be >= 1, got {0}")]
    InvalidReplicationFactor(u32),
    #[error("key field orders must be a contiguous permutation of 0..{expected}, got {got:?}")]
    InvalidKeyFieldOrders { expected: usize, got: Vec<usize> },
}

/// Errors from the client pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool exhausted for key {key}: capacity reached and no healthy client available")]
    PoolExhausted { key: String },
    #[error("failed to initialize client for key {key}: {source}")]
    ClientInitFailed {
        key: String,
        #[source]
        source: KafkaError,
    },
}

/// Errors from the schema binder / registry collaborator.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema registry request failed: {0}")]
    RegistryUnavailable(String),
    #[error("schema for subject {subject} is incompatible with the registered version: {detail}")]
    Incompatible { subject: String, detail: String },
    #[error("no schema registered for subject {0}")]
    NotFound(String),
    #[error("failed to derive an avro schema from the entity descriptor: {0}")]
    SchemaDerivation(String),
}

/// Errors encoding a value into wire bytes.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("avro encode failed: {0}")]
    Avro(String),
    #[error("failed to serialize value to an avro-compatible representation: {0}")]
    Serde(String),
}

/// Errors decoding wire bytes into a value.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is missing the confluent wire-format magic byte")]
    MissingMagicByte,
    #[error("unsupported wire-format magic byte: {0:#x}")]
    UnsupportedMagicByte(u8),
    #[error("avro decode failed: {0}")]
    Avro(String),
    #[error("failed to deserialize avro value into the target type: {0}")]
    Serde(String),
    #[error("schema id {0} referenced by the payload could not be resolved")]
    UnknownSchemaId(i32),
}

/// The full error taxonomy surfaced to callers of the messaging façade.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("client init failed: {0}")]
    ClientInitFailed(#[from] PoolErrorWrapped),
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(#[from] SchemaError),
    #[error("encode failed: {0}")]
    EncodeFailed(#[from] EncodeError),
    #[error("decode failed: {0}")]
    DecodeFailed(#[from] DecodeError),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("batch partially failed: {successful} succeeded, {failed} failed")]
    BatchPartiallyFailed {
        successful: usize,
        failed: usize,
        result: Box<BatchDeliveryResult>,
    },
    #[error("consume failed: {0}")]
    ConsumeFailed(String),
    #[error("a subscription with id {0} is already registered")]
    SubscriptionDuplicate(u64),
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

/// Newtype so `PoolError` can participate in `#[from]` without a cyclic
/// `impl From<PoolError> for MessagingError` fighting with `PoolExhausted`'s
/// distinct string-carrying variant (pool exhaustion is surfaced with just a
/// message, init failure carries the underlying `KafkaError`).
#[derive(Debug)]
pub struct PoolErrorWrapped(pub PoolError);

impl fmt::Display for PoolErrorWrapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PoolErrorWrapped {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<PoolError> for MessagingError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolExhausted { key } => {
                MessagingError::PoolExhausted(format!("key {key}"))
            }
            other => MessagingError::ClientInitFailed(PoolErrorWrapped(other)),
        }
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
