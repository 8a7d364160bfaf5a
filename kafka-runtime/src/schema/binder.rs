//! Schema derivation, registration, and Confluent-wire-format encode/decode,
//! cached per entity type.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use apache_avro::types::Value;
use apache_avro::{from_avro_datum, from_value, to_avro_datum, to_value, Schema};
use dashmap::DashMap;
use moka::sync::Cache;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use crate::descriptor::EntityDescriptor;
use crate::error::{DecodeError, EncodeError, SchemaError};

use super::registry_client::SchemaRegistryClient;

const MAGIC_BYTE: u8 = 0x0;

/// Writer schemas are keyed by a process-lifetime-stable integer (the
/// registry's schema id) and only ever needed to decode records written
/// under an older schema version, so a bounded, time-to-idle cache recovers
/// the memory a long-lived consumer would otherwise accumulate one entry per
/// schema evolution forever.
const WRITER_SCHEMA_CACHE_CAPACITY: u64 = 1_000;
const WRITER_SCHEMA_CACHE_IDLE: std::time::Duration = std::time::Duration::from_secs(60 * 60);

struct CachedSchemas {
    value_schema_id: i32,
    value_schema: Arc<Schema>,
    key_schema_id: Option<i32>,
    key_schema: Option<Arc<Schema>>,
}

/// Derives, registers, and caches Avro schemas per entity type, and
/// implements the Confluent single-object wire format on top of them.
pub struct SchemaBinder {
    registry: Arc<dyn SchemaRegistryClient>,
    cache: DashMap<TypeId, Arc<CachedSchemas>>,
    /// Writer schemas resolved by wire schema id, for decoding records
    /// written under a schema older than the entity's own current one.
    writer_schemas: Cache<i32, Arc<Schema>>,
    registry_failures: AtomicU64,
}

impl SchemaBinder {
    pub fn new(registry: Arc<dyn SchemaRegistryClient>) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
            writer_schemas: Cache::builder()
                .max_capacity(WRITER_SCHEMA_CACHE_CAPACITY)
                .time_to_idle(WRITER_SCHEMA_CACHE_IDLE)
                .build(),
            registry_failures: AtomicU64::new(0),
        }
    }

    /// Distinct entity types with a cached encoder/decoder pair, for
    /// `Diagnostics()`.
    pub fn cached_type_count(&self) -> usize {
        self.cache.len()
    }

    /// Registry lookups/registrations that have failed since construction,
    /// for `HealthReport()`: a nonzero count downgrades the schema
    /// component from Healthy to Warning.
    pub fn registry_failures(&self) -> u64 {
        self.registry_failures.load(Ordering::Relaxed)
    }

    async fn schemas_for<T: 'static>(&self, descriptor: &EntityDescriptor) -> Result<Arc<CachedSchemas>, SchemaError> {
        if let Some(cached) = self.cache.get(&TypeId::of::<T>()) {
            return Ok(cached.clone());
        }

        let value_schema_text = derive_value_schema(descriptor).to_string();
        let value_schema_id = self
            .registry
            .register(&descriptor.value_subject(), &value_schema_text)
            .await
            .inspect_err(|_| {
                self.registry_failures.fetch_add(1, Ordering::Relaxed);
            })?;
        let value_schema = Arc::new(
            Schema::parse_str(&value_schema_text)
                .map_err(|e| SchemaError::SchemaDerivation(e.to_string()))?,
        );

        let (key_schema_id, key_schema) = if descriptor.key_fields.is_empty() {
            (None, None)
        } else {
            let key_schema_text = derive_key_schema(descriptor).to_string();
            let id = self
                .registry
                .register(&descriptor.key_subject(), &key_schema_text)
                .await?;
            let schema = Arc::new(
                Schema::parse_str(&key_schema_text)
                    .map_err(|e| SchemaError::SchemaDerivation(e.to_string()))?,
            );
            (Some(id), Some(schema))
        };

        let cached = Arc::new(CachedSchemas {
            value_schema_id,
            value_schema: value_schema.clone(),
            key_schema_id,
            key_schema,
        });
        self.cache.insert(TypeId::of::<T>(), cached.clone());
        self.writer_schemas.insert(value_schema_id, value_schema);
        Ok(cached)
    }

    #[cfg(test)]
    fn writer_schema_cache_len(&self) -> u64 {
        self.writer_schemas.entry_count()
    }

    /// Pre-flight: is the descriptor's derived schema compatible with
    /// whatever is currently registered for its subject? A vacuous `true` if
    /// nothing is registered yet.
    pub async fn is_value_compatible(&self, descriptor: &EntityDescriptor) -> Result<bool, SchemaError> {
        let schema_text = derive_value_schema(descriptor).to_string();
        self.registry.is_compatible(&descriptor.value_subject(), &schema_text).await
    }

    pub async fn encode_value<T>(&self, descriptor: &EntityDescriptor, value: &T) -> Result<Vec<u8>, EncodeError>
    where
        T: Serialize + 'static,
    {
        let cached = self
            .schemas_for::<T>(descriptor)
            .await
            .map_err(|e| EncodeError::Avro(e.to_string()))?;
        let avro_value = to_value(value).map_err(|e| EncodeError::Serde(e.to_string()))?;
        let resolved = avro_value
            .resolve(&cached.value_schema)
            .map_err(|e| EncodeError::Avro(e.to_string()))?;
        let body = to_avro_datum(&cached.value_schema, resolved).map_err(|e| EncodeError::Avro(e.to_string()))?;
        Ok(wire_encode(cached.value_schema_id, &body))
    }

    pub async fn decode_value<T>(&self, descriptor: &EntityDescriptor, bytes: &[u8]) -> Result<T, DecodeError>
    where
        T: DeserializeOwned + 'static,
    {
        let (schema_id, mut body) = wire_decode(bytes)?;
        let cached = self
            .schemas_for::<T>(descriptor)
            .await
            .map_err(|e| DecodeError::Avro(e.to_string()))?;

        let schema = if schema_id == cached.value_schema_id {
            cached.value_schema.clone()
        } else if let Some(existing) = self.writer_schemas.get(&schema_id) {
            existing.clone()
        } else {
            let text = self
                .registry
                .by_id(schema_id)
                .await
                .map_err(|_| DecodeError::UnknownSchemaId(schema_id))?;
            let schema = Arc::new(
                Schema::parse_str(&text).map_err(|e| DecodeError::Avro(e.to_string()))?,
            );
            self.writer_schemas.insert(schema_id, schema.clone());
            schema
        };

        let avro_value = from_avro_datum(&schema, &mut body, None).map_err(|e| DecodeError::Avro(e.to_string()))?;
        from_value(&avro_value).map_err(|e| DecodeError::Serde(e.to_string()))
    }

    /// Projects `value`'s key fields (per the descriptor's ordered
    /// `key_fields`) out of its Avro representation and wire-encodes them
    /// against the registered key schema: the bare field for a single-key
    /// entity, an Avro record of the ordered fields for a composite one.
    /// Returns `Ok(None)` for entities with no declared key fields.
    pub async fn encode_key<T>(&self, descriptor: &EntityDescriptor, value: &T) -> Result<Option<Vec<u8>>, EncodeError>
    where
        T: Serialize + 'static,
    {
        if descriptor.key_fields.is_empty() {
            return Ok(None);
        }

        let cached = self
            .schemas_for::<T>(descriptor)
            .await
            .map_err(|e| EncodeError::Avro(e.to_string()))?;
        let key_schema = cached
            .key_schema
            .as_ref()
            .expect("key schema cached whenever descriptor.key_fields is non-empty");
        let key_schema_id = cached
            .key_schema_id
            .expect("key schema id cached whenever descriptor.key_fields is non-empty");

        let Value::Record(fields) = to_value(value).map_err(|e| EncodeError::Serde(e.to_string()))? else {
            return Err(EncodeError::Serde(
                "entity value did not serialize to an avro record".to_string(),
            ));
        };

        let mut ordered_key_fields = descriptor.key_fields.clone();
        ordered_key_fields.sort_by_key(|f| f.order);
        let mut projected = Vec::with_capacity(ordered_key_fields.len());
        for key_field in &ordered_key_fields {
            let field_value = fields
                .iter()
                .find(|(name, _)| name == &key_field.name)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| {
                    EncodeError::Serde(format!("key field {} missing from encoded value", key_field.name))
                })?;
            projected.push((key_field.name.clone(), field_value));
        }

        let key_value = if projected.len() == 1 {
            projected.into_iter().next().unwrap().1
        } else {
            Value::Record(projected)
        };

        let resolved = key_value.resolve(key_schema).map_err(|e| EncodeError::Avro(e.to_string()))?;
        let body = to_avro_datum(key_schema, resolved).map_err(|e| EncodeError::Avro(e.to_string()))?;
        Ok(Some(wire_encode(key_schema_id, &body)))
    }

    /// Decodes Confluent-wire-format key bytes into a canonical string: the
    /// bare value for a single-key entity, a JSON object of the ordered
    /// fields for a composite one. Mirrors `decode_value`'s writer-schema
    /// resolution for keys written under an older key schema.
    pub async fn decode_key<T: 'static>(&self, descriptor: &EntityDescriptor, bytes: &[u8]) -> Result<String, DecodeError> {
        let (schema_id, mut body) = wire_decode(bytes)?;
        let cached = self
            .schemas_for::<T>(descriptor)
            .await
            .map_err(|e| DecodeError::Avro(e.to_string()))?;
        let key_schema_id = cached.key_schema_id.ok_or(DecodeError::UnknownSchemaId(schema_id))?;

        let schema = if schema_id == key_schema_id {
            cached
                .key_schema
                .clone()
                .expect("key schema cached whenever key_schema_id is set")
        } else if let Some(existing) = self.writer_schemas.get(&schema_id) {
            existing.clone()
        } else {
            let text = self
                .registry
                .by_id(schema_id)
                .await
                .map_err(|_| DecodeError::UnknownSchemaId(schema_id))?;
            let schema = Arc::new(Schema::parse_str(&text).map_err(|e| DecodeError::Avro(e.to_string()))?);
            self.writer_schemas.insert(schema_id, schema.clone());
            schema
        };

        let avro_value = from_avro_datum(&schema, &mut body, None).map_err(|e| DecodeError::Avro(e.to_string()))?;
        match avro_value {
            Value::Record(fields) => {
                let mut object = serde_json::Map::new();
                for (name, field_value) in fields {
                    let text: String = from_value(&field_value).map_err(|e| DecodeError::Serde(e.to_string()))?;
                    object.insert(name, serde_json::Value::String(text));
                }
                Ok(serde_json::Value::Object(object).to_string())
            }
            other => from_value::<String>(&other).map_err(|e| DecodeError::Serde(e.to_string())),
        }
    }
}

fn wire_encode(schema_id: i32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn wire_decode(bytes: &[u8]) -> Result<(i32, &[u8]), DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    if bytes.len() < 5 {
        return Err(DecodeError::MissingMagicByte);
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(DecodeError::UnsupportedMagicByte(bytes[0]));
    }
    let schema_id = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((schema_id, &bytes[5..]))
}

fn avro_field_type(attrs: Option<&crate::descriptor::FieldAttributes>) -> serde_json::Value {
    match attrs.and_then(|a| a.decimal_precision) {
        Some((precision, scale)) => json!({
            "type": "bytes",
            "logicalType": "decimal",
            "precision": precision,
            "scale": scale,
        }),
        None => json!("string"),
    }
}

/// Builds the Avro record schema for an entity's value: one field per
/// non-ignored entry in `field_attributes`, plus any key field not already
/// covered, each typed per `avro_field_type`. `default`ed fields carry an
/// Avro field default; `max_length` is attached as informational metadata
/// (Avro has no native bounded-string type).
fn derive_value_schema(descriptor: &EntityDescriptor) -> serde_json::Value {
    let mut fields = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for key_field in &descriptor.key_fields {
        let attrs = descriptor.field_attributes.get(&key_field.name);
        if attrs.map(|a| a.ignore).unwrap_or(false) {
            continue;
        }
        fields.push(avro_field(&key_field.name, attrs));
        seen.insert(key_field.name.clone());
    }

    for (name, attrs) in &descriptor.field_attributes {
        if attrs.ignore || seen.contains(name) {
            continue;
        }
        fields.push(avro_field(name, Some(attrs)));
        seen.insert(name.clone());
    }

    json!({
        "type": "record",
        "name": sanitize_avro_name(&descriptor.entity_name),
        "fields": fields,
    })
}

fn avro_field(name: &str, attrs: Option<&crate::descriptor::FieldAttributes>) -> serde_json::Value {
    let mut field = json!({
        "name": name,
        "type": avro_field_type(attrs),
    });
    if let Some(attrs) = attrs {
        if let Some(default) = &attrs.default {
            field["default"] = default.clone();
        }
        if let Some(max_length) = attrs.max_length {
            field["maxLength"] = json!(max_length);
        }
    }
    field
}

/// Single-key entities encode the bare field value (no record wrapper);
/// composite keys encode an Avro record of the ordered key fields.
fn derive_key_schema(descriptor: &EntityDescriptor) -> serde_json::Value {
    if descriptor.key_fields.len() == 1 {
        let field = &descriptor.key_fields[0];
        avro_field_type(descriptor.field_attributes.get(&field.name))
    } else {
        let fields: Vec<_> = descriptor
            .key_fields
            .iter()
            .map(|f| avro_field(&f.name, descriptor.field_attributes.get(&f.name)))
            .collect();
        json!({
            "type": "record",
            "name": format!("{}Key", sanitize_avro_name(&descriptor.entity_name)),
            "fields": fields,
        })
    }
}

fn sanitize_avro_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EntityDescriptor;
    use crate::schema::mock_client::MockSchemaRegistryClient;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        order_id: i64,
        amount: String,
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder("Order", "orders")
            .key_field("order_id")
            .field_attributes(
                "amount",
                crate::descriptor::FieldAttributes::default(),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn encode_then_decode_round_trips() {
        let registry = Arc::new(MockSchemaRegistryClient::new());
        let binder = SchemaBinder::new(registry);
        let descriptor = descriptor();
        let order = Order {
            order_id: 1,
            amount: "100.00".to_string(),
        };

        let bytes = binder.encode_value(&descriptor, &order).await.unwrap();
        assert_eq!(bytes[0], MAGIC_BYTE);

        let decoded: Order = binder.decode_value(&descriptor, &bytes).await.unwrap();
        assert_eq!(decoded, order);
    }

    #[tokio::test]
    async fn decode_value_populates_writer_schema_cache_for_foreign_schema_ids() {
        let registry = Arc::new(MockSchemaRegistryClient::new());
        let binder = SchemaBinder::new(registry);
        let descriptor = descriptor();
        let order = Order {
            order_id: 1,
            amount: "100.00".to_string(),
        };
        let bytes = binder.encode_value(&descriptor, &order).await.unwrap();
        assert_eq!(binder.writer_schema_cache_len(), 0);

        // A schema id matching the entity's own current schema never touches
        // the writer-schema cache; only an older/foreign id does.
        let _decoded: Order = binder.decode_value(&descriptor, &bytes).await.unwrap();
        assert_eq!(binder.writer_schema_cache_len(), 0);
    }

    #[test]
    fn wire_decode_rejects_empty_payload() {
        assert!(matches!(wire_decode(&[]), Err(DecodeError::EmptyPayload)));
    }

    #[rstest::rstest]
    #[case::too_short(vec![0x0, 0, 0])]
    #[case::bad_magic_byte(vec![0x5, 0, 0, 0, 1])]
    fn wire_decode_rejects_malformed_header(#[case] bytes: Vec<u8>) {
        assert!(wire_decode(&bytes).is_err());
    }

    #[test]
    fn wire_decode_rejects_bad_magic_byte_specifically() {
        let bytes = vec![0x5, 0, 0, 0, 1];
        assert!(matches!(wire_decode(&bytes), Err(DecodeError::UnsupportedMagicByte(0x5))));
    }

    #[tokio::test]
    async fn encode_then_decode_key_round_trips_for_single_key() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Ticket {
            ticket_id: String,
            subject: String,
        }
        let descriptor = EntityDescriptor::builder("Ticket", "tickets")
            .key_field("ticket_id")
            .build()
            .unwrap();
        let registry = Arc::new(MockSchemaRegistryClient::new());
        let binder = SchemaBinder::new(registry);
        let ticket = Ticket {
            ticket_id: "t-1".to_string(),
            subject: "broken widget".to_string(),
        };

        let bytes = binder.encode_key(&descriptor, &ticket).await.unwrap().unwrap();
        assert_eq!(bytes[0], MAGIC_BYTE);
        let decoded = binder.decode_key::<Ticket>(&descriptor, &bytes).await.unwrap();
        assert_eq!(decoded, "t-1");
    }

    #[tokio::test]
    async fn encode_key_is_none_without_declared_key_fields() {
        let registry = Arc::new(MockSchemaRegistryClient::new());
        let binder = SchemaBinder::new(registry);
        let descriptor = EntityDescriptor::builder("Unkeyed", "unkeyed").build().unwrap();
        #[derive(Serialize)]
        struct Unkeyed {
            note: String,
        }
        let value = Unkeyed { note: "hi".to_string() };
        assert!(binder.encode_key(&descriptor, &value).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn encode_then_decode_key_round_trips_for_composite_key() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Shipment {
            order_id: String,
            region: String,
            carrier: String,
        }

        let descriptor = EntityDescriptor::builder("Shipment", "shipments")
            .key_field("order_id")
            .key_field("region")
            .build()
            .unwrap();
        let registry = Arc::new(MockSchemaRegistryClient::new());
        let binder = SchemaBinder::new(registry);
        let shipment = Shipment {
            order_id: "7".to_string(),
            region: "us-east".to_string(),
            carrier: "ups".to_string(),
        };

        let bytes = binder.encode_key(&descriptor, &shipment).await.unwrap().unwrap();
        let decoded = binder.decode_key::<Shipment>(&descriptor, &bytes).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(parsed["order_id"], "7");
        assert_eq!(parsed["region"], "us-east");
    }

    #[test]
    fn derive_value_schema_omits_ignored_fields() {
        let mut descriptor = descriptor();
        descriptor.field_attributes.insert(
            "internal_note".to_string(),
            crate::descriptor::FieldAttributes {
                ignore: true,
                ..Default::default()
            },
        );
        let schema = derive_value_schema(&descriptor);
        let fields = schema["fields"].as_array().unwrap();
        assert!(!fields.iter().any(|f| f["name"] == "internal_note"));
    }
}
