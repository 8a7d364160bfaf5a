//! The schema registry collaborator interface. Realized as a trait with an
//! HTTP (Confluent-protocol) implementation and an in-memory implementation
//! for tests, per the external-interfaces contract: `Register`, `Latest`,
//! `Compatible?`.

use async_trait::async_trait;

use crate::error::SchemaError;

#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    pub id: i32,
    pub version: i32,
    pub schema: String,
}

#[async_trait]
pub trait SchemaRegistryClient: Send + Sync {
    async fn register(&self, subject: &str, schema: &str) -> Result<i32, SchemaError>;
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, SchemaError>;
    async fn is_compatible(&self, subject: &str, schema: &str) -> Result<bool, SchemaError>;
    /// Resolve a schema by the registry-wide id embedded in a wire payload,
    /// used when decoding records written under a schema older than the
    /// entity's own current one.
    async fn by_id(&self, id: i32) -> Result<String, SchemaError>;
}
