use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::SchemaError;

use super::registry_client::{RegisteredSchema, SchemaRegistryClient};

/// In-memory registry used by tests that don't need a live broker/registry.
/// Registration is idempotent per (subject, schema text) pair, matching the
/// real registry's register-or-get-existing behavior.
#[derive(Default)]
pub struct MockSchemaRegistryClient {
    by_subject: DashMap<String, RegisteredSchema>,
    by_id: DashMap<i32, String>,
    next_id: AtomicI32,
}

impl MockSchemaRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaRegistryClient for MockSchemaRegistryClient {
    async fn register(&self, subject: &str, schema: &str) -> Result<i32, SchemaError> {
        if let Some(existing) = self.by_subject.get(subject) {
            if existing.schema == schema {
                return Ok(existing.id);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let registered = RegisteredSchema {
            id,
            version: self.by_subject.get(subject).map(|e| e.version + 1).unwrap_or(1),
            schema: schema.to_string(),
        };
        self.by_subject.insert(subject.to_string(), registered.clone());
        self.by_id.insert(id, schema.to_string());
        Ok(id)
    }

    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, SchemaError> {
        self.by_subject
            .get(subject)
            .map(|e| e.clone())
            .ok_or_else(|| SchemaError::NotFound(subject.to_string()))
    }

    async fn is_compatible(&self, subject: &str, schema: &str) -> Result<bool, SchemaError> {
        match self.by_subject.get(subject) {
            Some(existing) => Ok(existing.schema == schema),
            None => Ok(true),
        }
    }

    async fn by_id(&self, id: i32) -> Result<String, SchemaError> {
        self.by_id
            .get(&id)
            .map(|s| s.clone())
            .ok_or(SchemaError::NotFound(format!("schema id {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_for_identical_schema() {
        let registry = MockSchemaRegistryClient::new();
        let id1 = registry.register("orders-value", "{\"type\":\"record\"}").await.unwrap();
        let id2 = registry.register("orders-value", "{\"type\":\"record\"}").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn register_bumps_version_on_schema_change() {
        let registry = MockSchemaRegistryClient::new();
        registry.register("orders-value", "v1").await.unwrap();
        let id2 = registry.register("orders-value", "v2").await.unwrap();
        let latest = registry.latest("orders-value").await.unwrap();
        assert_eq!(latest.id, id2);
        assert_eq!(latest.version, 2);
    }

    #[tokio::test]
    async fn latest_on_unknown_subject_is_not_found() {
        let registry = MockSchemaRegistryClient::new();
        assert!(matches!(
            registry.latest("missing").await,
            Err(SchemaError::NotFound(_))
        ));
    }
}
