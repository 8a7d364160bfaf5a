//! Schema registry collaborator (register/latest/compatibility) and the
//! binder that turns entity descriptors into cached Avro encoders/decoders.

mod binder;
mod http_client;
mod mock_client;
mod registry_client;

pub use binder::SchemaBinder;
pub use http_client::HttpSchemaRegistryClient;
pub use mock_client::MockSchemaRegistryClient;
pub use registry_client::{RegisteredSchema, SchemaRegistryClient};
