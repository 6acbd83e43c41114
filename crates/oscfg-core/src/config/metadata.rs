//! Instance metadata transport.
//!
//! The metadata server exposes the full document as JSON with
//! `wait_for_change` long-poll semantics keyed by an etag. Agent settings
//! live in project and instance attributes; instance attributes override
//! project ones.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AgentSettings, ConfigError};

/// Default metadata server base URL.
pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254/computeMetadata/v1";

/// Server-side long-poll hold time.
const WAIT_TIMEOUT_SEC: u64 = 60;

/// One metadata fetch result.
#[derive(Debug, Clone)]
pub struct MetadataResponse {
    /// Settings derived from the document.
    pub settings: AgentSettings,
    /// Etag to hand back on the next wait-for-change call.
    pub etag: String,
}

/// Metadata transport seam.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Fetch the document. With `wait` set, the server holds the request
    /// until the document differs from `last_etag` or its hold time lapses.
    async fn fetch(
        &self,
        last_etag: Option<&str>,
        wait: bool,
    ) -> Result<MetadataResponse, ConfigError>;
}

#[derive(Debug, Deserialize, Default)]
struct MetadataDoc {
    #[serde(default)]
    project: ProjectMeta,
    #[serde(default)]
    instance: InstanceMeta,
}

#[derive(Debug, Deserialize, Default)]
struct ProjectMeta {
    #[serde(rename = "projectId", default)]
    project_id: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct InstanceMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl MetadataDoc {
    /// Instance attribute wins over project attribute.
    fn attribute(&self, key: &str) -> Option<&str> {
        self.instance
            .attributes
            .get(key)
            .or_else(|| self.project.attributes.get(key))
            .map(String::as_str)
    }

    fn bool_attribute(&self, key: &str, default: bool) -> bool {
        self.attribute(key).map_or(default, parse_bool)
    }

    fn into_settings(self) -> AgentSettings {
        let enabled = self.bool_attribute("enable-osconfig", false);
        let poll_minutes = self
            .attribute("osconfig-poll-interval")
            .and_then(|v| v.parse::<u64>().ok());

        AgentSettings {
            task_notification_enabled: enabled,
            guest_policies_enabled: self.bool_attribute("enable-guest-policies", enabled),
            os_inventory_enabled: self.bool_attribute("enable-os-inventory", enabled),
            debug: self.bool_attribute("osconfig-log-level-debug", false),
            svc_poll_interval: poll_minutes
                .map_or(super::MIN_POLL_INTERVAL, |m| Duration::from_secs(m * 60)),
            project_id: self.project.project_id.clone(),
            instance_name: self.instance.name.clone(),
            instance_id: match &self.instance.id {
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::String(s) => s.clone(),
                _ => String::new(),
            },
            zone: self
                .instance
                .zone
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            disable_local_logging: self.bool_attribute("osconfig-disabled-features-local-logging", false),
            disable_cloud_logging: self.bool_attribute("osconfig-disabled-features-cloud-logging", false),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "on"
    )
}

/// HTTP [`MetadataClient`] against the instance metadata server.
#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataClient {
    /// Client against `base_url`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            // Long poll hold plus slack; individual requests override this
            // only through the server-side timeout_sec parameter.
            .timeout(Duration::from_secs(WAIT_TIMEOUT_SEC + 30))
            .build()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn fetch(
        &self,
        last_etag: Option<&str>,
        wait: bool,
    ) -> Result<MetadataResponse, ConfigError> {
        let mut request = self
            .client
            .get(format!("{}/", self.base_url))
            .header("Metadata-Flavor", "Google")
            .query(&[("recursive", "true"), ("alt", "json")]);

        if wait {
            request = request.query(&[
                ("wait_for_change", "true".to_string()),
                ("timeout_sec", WAIT_TIMEOUT_SEC.to_string()),
            ]);
            if let Some(etag) = last_etag {
                request = request.query(&[("last_etag", etag)]);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConfigError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let doc: MetadataDoc = response
            .json()
            .await
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(MetadataResponse {
            settings: doc.into_settings(),
            etag,
        })
    }
}
