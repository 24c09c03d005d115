//! Home Assistant REST client.
//!
//! Calls `POST {base_url}/api/services/{domain}/{service}` with a long-lived
//! access token. When no instance is configured every call fails with an
//! upstream error, which the dispatcher reports back to the model.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{HomeAutomation, StoreError};

const SERVICE: &str = "home_assistant";

/// A single service invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

impl ServiceCall {
    /// `domain.service`, as Home Assistant names it.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Request body: service data with `entity_id` merged in.
    fn payload(&self) -> Value {
        let mut body = self.data.clone().unwrap_or_default();
        if let Some(ref entity) = self.entity_id {
            body.insert("entity_id".into(), Value::String(entity.clone()));
        }
        Value::Object(body)
    }
}

/// Connection details for one Home Assistant instance.
#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    token: String,
}

pub struct HomeAssistantClient {
    http: HttpClient,
    endpoint: Option<Endpoint>,
}

impl HomeAssistantClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Upstream {
                service: SERVICE.into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint: Some(Endpoint {
                base_url: base_url.trim_end_matches('/').to_string(),
                token: token.to_string(),
            }),
        })
    }

    /// A client with no instance behind it.
    pub fn unconfigured() -> Self {
        Self {
            http: HttpClient::new(),
            endpoint: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[async_trait]
impl HomeAutomation for HomeAssistantClient {
    async fn call_service(&self, call: ServiceCall) -> Result<Value, StoreError> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| StoreError::Upstream {
            service: SERVICE.into(),
            reason: "no Home Assistant instance is configured".into(),
        })?;

        let url = format!(
            "{}/api/services/{}/{}",
            endpoint.base_url, call.domain, call.service
        );

        tracing::info!(
            service = %call.qualified_name(),
            entity_id = call.entity_id.as_deref().unwrap_or(""),
            "calling Home Assistant service"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&endpoint.token)
            .json(&call.payload())
            .send()
            .await
            .map_err(|e| StoreError::Upstream {
                service: SERVICE.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Upstream {
                service: SERVICE.into(),
                reason: format!("HTTP {}: {body}", status.as_u16()),
            });
        }

        // The body lists the entity states the call changed.
        let changed: Vec<Value> = response.json().await.unwrap_or_default();

        Ok(json!({
            "ok": true,
            "called": call.qualified_name(),
            "entity_id": call.entity_id,
            "changed_states": changed.len(),
        }))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn light_on() -> ServiceCall {
        ServiceCall {
            domain: "light".into(),
            service: "turn_on".into(),
            entity_id: Some("light.kitchen".into()),
            data: Some(
                json!({"brightness": 200})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
        }
    }

    #[test]
    fn test_payload_merges_entity_id() {
        let payload = light_on().payload();
        assert_eq!(payload["entity_id"], "light.kitchen");
        assert_eq!(payload["brightness"], 200);
    }

    #[test]
    fn test_payload_without_data() {
        let call = ServiceCall {
            domain: "scene".into(),
            service: "turn_on".into(),
            entity_id: None,
            data: None,
        };
        assert_eq!(call.payload(), json!({}));
        assert_eq!(call.qualified_name(), "scene.turn_on");
    }

    #[tokio::test]
    async fn test_unconfigured_client_is_upstream_error() {
        let client = HomeAssistantClient::unconfigured();
        assert!(!client.is_configured());
        let err = client.call_service(light_on()).await.unwrap_err();
        assert!(matches!(err, StoreError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_upstream_error() {
        let client =
            HomeAssistantClient::new("http://127.0.0.1:1/", "token", Duration::from_secs(2))
                .unwrap();
        let err = client.call_service(light_on()).await.unwrap_err();
        assert!(matches!(err, StoreError::Upstream { .. }));
    }
}
