//! Entity descriptors: immutable per-type metadata (topic, keys, field
//! attributes, topic settings).
//!
//! The source this runtime generalizes from builds descriptors by scanning
//! class annotations at runtime (reflection). We don't have reflection, and
//! wouldn't want it if we did, so descriptors are produced one of two ways:
//! a type implements the `Entity` trait and hands back a `&'static
//! EntityDescriptor` it built once (typically via `OnceLock`/`Lazy`), or a
//! caller registers a descriptor for a `TypeId` directly into a
//! `DescriptorRegistry` at process start. Both paths converge on the same
//! immutable `EntityDescriptor`.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Per-field attributes beyond name and avro type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAttributes {
    pub max_length: Option<u32>,
    pub decimal_precision: Option<(u32, u32)>, // (precision, scale)
    pub default: Option<serde_json::Value>,
    pub ignore: bool,
}

/// A single key field: its position in the composite key and its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupPolicy {
    Delete,
    Compact,
    CompactAndDelete,
}

/// Declarative topic settings. Cluster administration (actually creating the
/// topic with these settings) is out of scope for this runtime; the entity
/// descriptor/DDL collaborator reads this struct to do that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSettings {
    pub partition_count: u32,
    pub replication_factor: u32,
    pub retention_ms: i64,
    pub cleanup_policy: CleanupPolicy,
    pub dead_letter_queue: bool,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            partition_count: 1,
            replication_factor: 1,
            retention_ms: -1,
            cleanup_policy: CleanupPolicy::Delete,
            dead_letter_queue: false,
        }
    }
}

/// Immutable per-type metadata. Constructed once (typically via
/// `EntityDescriptor::builder`) and never mutated after it's first handed to
/// a schema binder or pool key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity_name: String,
    pub topic_name: String,
    pub key_fields: Vec<KeyField>,
    pub field_attributes: std::collections::HashMap<String, FieldAttributes>,
    pub topic_settings: TopicSettings,
}

impl EntityDescriptor {
    pub fn builder(entity_name: impl Into<String>, topic_name: impl Into<String>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder::new(entity_name.into(), topic_name.into())
    }

    /// `{topic}-key` subject name used with the schema registry.
    pub fn key_subject(&self) -> String {
        format!("{}-key", self.topic_name)
    }

    /// `{topic}-value` subject name used with the schema registry.
    pub fn value_subject(&self) -> String {
        format!("{}-value", self.topic_name)
    }

    pub fn is_single_key(&self) -> bool {
        self.key_fields.len() == 1
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.topic_name.is_empty() {
            return Err(DescriptorError::EmptyTopicName);
        }
        if self.topic_settings.partition_count < 1 {
            return Err(DescriptorError::InvalidPartitionCount(
                self.topic_settings.partition_count,
            ));
        }
        if self.topic_settings.replication_factor < 1 {
            return Err(DescriptorError::InvalidReplicationFactor(
                self.topic_settings.replication_factor,
            ));
        }
        let mut orders: Vec<usize> = self.key_fields.iter().map(|f| f.order).collect();
        orders.sort_unstable();
        let expected: Vec<usize> = (0..self.key_fields.len()).collect();
        if orders != expected {
            return Err(DescriptorError::InvalidKeyFieldOrders {
                expected: self.key_fields.len(),
                got: orders,
            });
        }
        Ok(())
    }
}

pub struct EntityDescriptorBuilder {
    entity_name: String,
    topic_name: String,
    key_fields: Vec<KeyField>,
    field_attributes: std::collections::HashMap<String, FieldAttributes>,
    topic_settings: TopicSettings,
}

impl EntityDescriptorBuilder {
    fn new(entity_name: String, topic_name: String) -> Self {
        Self {
            entity_name,
            topic_name,
            key_fields: Vec::new(),
            field_attributes: Default::default(),
            topic_settings: TopicSettings::default(),
        }
    }

    pub fn key_field(mut self, name: impl Into<String>) -> Self {
        let order = self.key_fields.len();
        self.key_fields.push(KeyField {
            name: name.into(),
            order,
        });
        self
    }

    pub fn field_attributes(mut self, name: impl Into<String>, attrs: FieldAttributes) -> Self {
        self.field_attributes.insert(name.into(), attrs);
        self
    }

    pub fn topic_settings(mut self, settings: TopicSettings) -> Self {
        self.topic_settings = settings;
        self
    }

    pub fn build(self) -> Result<EntityDescriptor, DescriptorError> {
        let descriptor = EntityDescriptor {
            entity_name: self.entity_name,
            topic_name: self.topic_name,
            key_fields: self.key_fields,
            field_attributes: self.field_attributes,
            topic_settings: self.topic_settings,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Implemented by every typed record the runtime produces/consumes.
/// `descriptor()` is expected to be cheap (a cached `&'static` lookup); the
/// pool and schema binder call it on every `Rent`/`GetEncoders`, so it should
/// never itself perform I/O.
pub trait Entity: Send + Sync + 'static {
    fn descriptor() -> &'static EntityDescriptor;

    /// Projects this value down to a plain-string key for entities with no
    /// declared key fields (fine for single-partition or round-robin
    /// topics, where `MessageEnvelope::with_key` is the only way to set
    /// one). Entities that *do* declare key fields never consult this: the
    /// schema binder derives their wire key directly from the value's own
    /// fields (`SchemaBinder::encode_key`), per the descriptor's ordered
    /// `key_fields` — single value for a single key, an Avro record for a
    /// composite one.
    fn key(&self) -> Option<String> {
        None
    }
}

/// A runtime-registration alternative to the `Entity` trait, for
/// applications that build their descriptors dynamically (e.g. from an
/// external schema file) instead of compiling them in.
#[derive(Default)]
pub struct DescriptorRegistry {
    descriptors: DashMap<TypeId, Arc<EntityDescriptor>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any>(&self, descriptor: EntityDescriptor) -> Arc<EntityDescriptor> {
        let arc = Arc::new(descriptor);
        self.descriptors.insert(TypeId::of::<T>(), arc.clone());
        arc
    }

    pub fn get<T: Any>(&self) -> Option<Arc<EntityDescriptor>> {
        self.descriptors.get(&TypeId::of::<T>()).map(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_contiguous_key_orders() {
        let descriptor = EntityDescriptor::builder("Order", "orders")
            .key_field("order_id")
            .key_field("region")
            .build()
            .unwrap();
        assert_eq!(descriptor.key_fields[0].order, 0);
        assert_eq!(descriptor.key_fields[1].order, 1);
        assert_eq!(descriptor.key_subject(), "orders-key");
        assert_eq!(descriptor.value_subject(), "orders-value");
    }

    #[test]
    fn rejects_empty_topic_name() {
        let err = EntityDescriptor::builder("Order", "").build().unwrap_err();
        assert_eq!(err, DescriptorError::EmptyTopicName);
    }

    #[test]
    fn rejects_invalid_partition_count() {
        let err = EntityDescriptor::builder("Order", "orders")
            .topic_settings(TopicSettings {
                partition_count: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert_eq!(err, DescriptorError::InvalidPartitionCount(0));
    }

    struct Order;
    impl Entity for Order {
        fn descriptor() -> &'static EntityDescriptor {
            static DESCRIPTOR: once_cell::sync::Lazy<EntityDescriptor> =
                once_cell::sync::Lazy::new(|| {
                    EntityDescriptor::builder("Order", "orders")
                        .key_field("order_id")
                        .build()
                        .unwrap()
                });
            &DESCRIPTOR
        }
    }

    #[test]
    fn entity_trait_descriptor_is_stable() {
        let a = Order::descriptor();
        let b = Order::descriptor();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn registry_round_trips_by_type() {
        struct Payment;
        let registry = DescriptorRegistry::new();
        assert!(registry.get::<Payment>().is_none());
        let descriptor = EntityDescriptor::builder("Payment", "payments")
            .key_field("payment_id")
            .build()
            .unwrap();
        registry.register::<Payment>(descriptor.clone());
        assert_eq!(*registry.get::<Payment>().unwrap(), descriptor);
    }
}
