//! Wire types and HTTP client for the backend runtime registry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model_runtime::ModelStatusReport;
use crate::plugin::PluginDescriptor;
use crate::resources::{DevicePreference, DeviceUsage};

/// One model version this runtime can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub model_id: String,
    pub version: String,
    pub event_types: Vec<String>,
    pub device: DevicePreference,
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub loaded: bool,
}

impl ModelCapability {
    pub fn from_descriptor(descriptor: &PluginDescriptor, loaded: bool) -> Self {
        Self {
            model_id: descriptor.model_id.clone(),
            version: descriptor.version.to_string(),
            event_types: descriptor.event_types.clone(),
            device: descriptor.requirements.device,
            memory_mb: descriptor.requirements.memory_mb,
            description: descriptor.description.clone(),
            loaded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub runtime_id: String,
    pub readiness: Readiness,
    pub models: Vec<ModelStatusReport>,
    pub devices: Vec<DeviceUsage>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    runtime_id: &'a str,
    capabilities: &'a [ModelCapability],
}

/// Backend-side registry of runtimes.
#[async_trait]
pub trait BackendRegistry: Send + Sync {
    async fn register(&self, runtime_id: &str, capabilities: &[ModelCapability]) -> anyhow::Result<()>;

    async fn health(&self, runtime_id: &str, snapshot: &HealthSnapshot) -> anyhow::Result<()>;

    async fn deregister(&self, runtime_id: &str) -> anyhow::Result<()>;

    async fn deregister_version(&self, runtime_id: &str, model_id: &str, version: &str) -> anyhow::Result<()>;
}

pub struct HttpBackendClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpBackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response, what: &str) -> anyhow::Result<()> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("{} returned {}: {}", what, status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendRegistry for HttpBackendClient {
    async fn register(&self, runtime_id: &str, capabilities: &[ModelCapability]) -> anyhow::Result<()> {
        debug!("Registering runtime {} ({} capabilities)", runtime_id, capabilities.len());
        let response = self
            .http_client
            .post(format!("{}/api/runtimes/register", self.base_url))
            .json(&RegisterRequest {
                runtime_id,
                capabilities,
            })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("register request failed: {}", e))?;
        Self::check(response, "register").await
    }

    async fn health(&self, runtime_id: &str, snapshot: &HealthSnapshot) -> anyhow::Result<()> {
        let response = self
            .http_client
            .post(format!("{}/api/runtimes/{}/health", self.base_url, runtime_id))
            .json(snapshot)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("health request failed: {}", e))?;
        Self::check(response, "health").await
    }

    async fn deregister(&self, runtime_id: &str) -> anyhow::Result<()> {
        let response = self
            .http_client
            .post(format!("{}/api/runtimes/{}/deregister", self.base_url, runtime_id))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("deregister request failed: {}", e))?;
        Self::check(response, "deregister").await
    }

    async fn deregister_version(&self, runtime_id: &str, model_id: &str, version: &str) -> anyhow::Result<()> {
        let response = self
            .http_client
            .delete(format!(
                "{}/api/runtimes/{}/models/{}/versions/{}",
                self.base_url, runtime_id, model_id, version
            ))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("deregister_version request failed: {}", e))?;
        Self::check(response, "deregister_version").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::descriptor_for;
    use mockito::Matcher;
    use serde_json::json;

    fn client(server: &mockito::ServerGuard) -> HttpBackendClient {
        HttpBackendClient::new(format!("{}/", server.url()), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_register_posts_capabilities() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/runtimes/register")
            .match_body(Matcher::PartialJson(json!({
                "runtime_id": "runtime-a",
                "capabilities": [{"model_id": "fall_detection", "version": "1.0.0", "loaded": true}]
            })))
            .with_status(201)
            .create_async()
            .await;

        let capability = ModelCapability::from_descriptor(&descriptor_for("fall_detection", "1.0.0"), true);
        client(&server).register("runtime-a", &[capability]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_push() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/runtimes/runtime-a/health")
            .match_body(Matcher::PartialJson(json!({
                "runtime_id": "runtime-a",
                "readiness": {"ready": false, "reasons": ["registry not initialized"]}
            })))
            .with_status(200)
            .create_async()
            .await;

        let snapshot = HealthSnapshot {
            runtime_id: "runtime-a".into(),
            readiness: Readiness {
                ready: false,
                reasons: vec!["registry not initialized".into()],
            },
            models: Vec::new(),
            devices: Vec::new(),
            reported_at: Utc::now(),
        };
        client(&server).health("runtime-a", &snapshot).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/runtimes/runtime-a/deregister")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = client(&server).deregister("runtime-a").await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_deregister_version_uses_delete() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/runtimes/runtime-a/models/fall_detection/versions/1.1.0")
            .with_status(204)
            .create_async()
            .await;

        client(&server)
            .deregister_version("runtime-a", "fall_detection", "1.1.0")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let backend = HttpBackendClient::new("http://127.0.0.1:9", Duration::from_millis(200));
        assert!(backend.deregister("runtime-a").await.is_err());
    }
}
