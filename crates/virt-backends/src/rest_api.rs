//! LXD / Incus REST client
//!
//! Mutual TLS with a client certificate on 8443; the server certificate is
//! self-signed as a rule and is not verified. Mutations are async on the
//! server side, so writes wait on the returned operation.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::profile::BackendProfile;

const API_TIMEOUT: Duration = Duration::from_secs(30);
const OPERATION_WAIT_SECS: u32 = 120;

pub struct ContainerRestApi {
    base: String,
    client: reqwest::Client,
}

impl ContainerRestApi {
    pub fn new(profile: &BackendProfile) -> Result<Self> {
        let cert = profile.api_cert.as_deref().ok_or_else(|| {
            DriverError::Validation("container API requested without a client certificate".into())
        })?;
        let key = profile.api_cert_key.as_deref().ok_or_else(|| {
            DriverError::Validation("container API requested without a client key".into())
        })?;

        let identity = reqwest::Identity::from_pem(format!("{}\n{}", cert, key).as_bytes())
            .map_err(|e| DriverError::Validation(format!("client identity rejected: {}", e)))?;

        let client = reqwest::Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(true)
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| DriverError::Fatal(format!("http client build failed: {}", e)))?;

        Ok(Self {
            base: profile.api_base(),
            client,
        })
    }

    async fn unwrap_envelope(response: reqwest::Response) -> Result<Value> {
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        match status {
            200..=299 => Ok(body),
            401 | 403 => Err(DriverError::Unauthorized(envelope_error(&body, status))),
            404 => Err(DriverError::NotFound(envelope_error(&body, status))),
            _ => Err(DriverError::Transient(envelope_error(&body, status))),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        debug!(%method, path, "container api request");
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let envelope = Self::unwrap_envelope(request.send().await?).await?;

        // Async operations return an operation path to wait on
        if envelope.get("type").and_then(Value::as_str) == Some("async") {
            if let Some(operation) = envelope.get("operation").and_then(Value::as_str) {
                return self.wait_operation(operation).await;
            }
        }
        Ok(envelope.get("metadata").cloned().unwrap_or(envelope))
    }

    async fn wait_operation(&self, operation: &str) -> Result<Value> {
        let path = format!("{}/wait?timeout={}", operation, OPERATION_WAIT_SECS);
        let envelope = Self::unwrap_envelope(
            self.client
                .get(format!("{}{}", self.base, path))
                .send()
                .await?,
        )
        .await?;
        let metadata = envelope.get("metadata").cloned().unwrap_or(Value::Null);
        if metadata.get("status").and_then(Value::as_str) == Some("Failure") {
            let err = metadata
                .get("err")
                .and_then(Value::as_str)
                .unwrap_or("operation failed");
            if err.contains("not found") {
                return Err(DriverError::NotFound(err.to_string()));
            }
            if err.contains("already exists") {
                return Err(DriverError::AlreadyExists(err.to_string()));
            }
            return Err(DriverError::Transient(err.to_string()));
        }
        Ok(metadata)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(reqwest::Method::GET, path, None).await
    }

    /// Full instance listing with expanded state
    pub async fn instances_recursion2(&self) -> Result<Vec<Value>> {
        let metadata = self.get("/1.0/instances?recursion=2").await?;
        Ok(metadata.as_array().cloned().unwrap_or_default())
    }

    pub async fn get_instance(&self, name: &str) -> Result<Value> {
        self.get(&format!("/1.0/instances/{}?recursion=1", name))
            .await
    }

    pub async fn create_instance(&self, body: Value) -> Result<Value> {
        self.request(reqwest::Method::POST, "/1.0/instances", Some(body))
            .await
    }

    pub async fn update_state(&self, name: &str, action: &str, force: bool) -> Result<Value> {
        self.request(
            reqwest::Method::PUT,
            &format!("/1.0/instances/{}/state", name),
            Some(json!({
                "action": action,
                "timeout": 30,
                "force": force,
            })),
        )
        .await
    }

    pub async fn delete_instance(&self, name: &str) -> Result<Value> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/1.0/instances/{}", name),
            None,
        )
        .await
    }

    pub async fn list_images(&self) -> Result<Vec<Value>> {
        let metadata = self.get("/1.0/images?recursion=1").await?;
        Ok(metadata.as_array().cloned().unwrap_or_default())
    }
}

fn envelope_error(body: &Value, status: u16) -> String {
    body.get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}
