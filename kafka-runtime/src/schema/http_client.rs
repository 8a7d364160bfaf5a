use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::SchemaRegistryConfig;
use crate::error::SchemaError;

use super::registry_client::{RegisteredSchema, SchemaRegistryClient};

/// Confluent-protocol schema registry client over `reqwest`.
pub struct HttpSchemaRegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistryClient {
    pub fn new(config: &SchemaRegistryConfig) -> Result<Self, SchemaError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: i32,
}

#[derive(Deserialize)]
struct SubjectVersionResponse {
    id: i32,
    version: i32,
    schema: String,
}

#[derive(Deserialize)]
struct CompatibilityResponse {
    is_compatible: bool,
}

#[derive(Deserialize)]
struct SchemaOnlyResponse {
    schema: String,
}

#[async_trait]
impl SchemaRegistryClient for HttpSchemaRegistryClient {
    async fn register(&self, subject: &str, schema: &str) -> Result<i32, SchemaError> {
        let url = format!("{}/subjects/{subject}/versions", self.base_url);
        debug!(subject, "registering schema");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/vnd.schemaregistry.v1+json")
            .json(&serde_json::json!({ "schema": schema }))
            .send()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SchemaError::RegistryUnavailable(format!(
                "registry returned {} for subject {subject}",
                response.status()
            )));
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;
        Ok(body.id)
    }

    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, SchemaError> {
        let url = format!("{}/subjects/{subject}/versions/latest", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SchemaError::NotFound(subject.to_string()));
        }
        if !response.status().is_success() {
            return Err(SchemaError::RegistryUnavailable(format!(
                "registry returned {} for subject {subject}",
                response.status()
            )));
        }

        let body: SubjectVersionResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;
        Ok(RegisteredSchema {
            id: body.id,
            version: body.version,
            schema: body.schema,
        })
    }

    async fn is_compatible(&self, subject: &str, schema: &str) -> Result<bool, SchemaError> {
        let url = format!("{}/compatibility/subjects/{subject}/versions/latest", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/vnd.schemaregistry.v1+json")
            .json(&serde_json::json!({ "schema": schema }))
            .send()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // No prior version registered is vacuously compatible.
            return Ok(true);
        }
        if !response.status().is_success() {
            warn!(subject, status = %response.status(), "compatibility check failed");
            return Err(SchemaError::RegistryUnavailable(format!(
                "registry returned {} for subject {subject}",
                response.status()
            )));
        }

        let body: CompatibilityResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;
        Ok(body.is_compatible)
    }

    async fn by_id(&self, id: i32) -> Result<String, SchemaError> {
        let url = format!("{}/schemas/ids/{id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SchemaError::NotFound(format!("schema id {id}")));
        }
        if !response.status().is_success() {
            return Err(SchemaError::RegistryUnavailable(format!(
                "registry returned {} for schema id {id}",
                response.status()
            )));
        }

        let body: SchemaOnlyResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;
        Ok(body.schema)
    }
}
