//! Profiles

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::client::Client;
use crate::error::{LxdError, Result};
use crate::protocol::LogicalRequest;
use crate::resource::{Named, Refresh};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
}

#[derive(Clone)]
pub struct Profile {
    client: Client,
    metadata: ProfileMetadata,
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.metadata.name)
            .finish()
    }
}

impl Profile {
    pub(crate) fn from_value(client: Client, value: Value) -> Result<Self> {
        let metadata = serde_json::from_value(value)
            .map_err(|e| LxdError::Protocol(format!("Malformed profile record: {}", e)))?;
        Ok(Self { client, metadata })
    }

    pub fn metadata(&self) -> &ProfileMetadata {
        &self.metadata
    }

    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    pub fn config(&self) -> &HashMap<String, String> {
        &self.metadata.config
    }

    pub fn devices(&self) -> &HashMap<String, HashMap<String, String>> {
        &self.metadata.devices
    }

    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        self.client
            .request(LogicalRequest::post(self.path(), json!({"name": new_name})))
            .await?;
        self.metadata.name = new_name.to_string();
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        self.client.request(LogicalRequest::delete(self.path())).await?;
        Ok(())
    }
}

impl Named for Profile {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn path(&self) -> String {
        format!("/profiles/{}", self.metadata.name)
    }
}

#[async_trait]
impl Refresh for Profile {
    async fn refresh(&mut self) -> Result<()> {
        let latest = self.client.profile(&self.metadata.name).await?;
        self.metadata = latest.metadata;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::test_support::{MockChannelTransport, MockHttpTransport};
    use std::sync::Arc;

    fn profile(http: &Arc<MockHttpTransport>, metadata: Value) -> Profile {
        let client = Client::with_transports(
            ClientConfig::default(),
            http.clone(),
            Arc::new(MockChannelTransport::default()),
        );
        Profile::from_value(client, metadata).unwrap()
    }

    #[tokio::test]
    async fn test_rename_posts_to_current_name() {
        let http = MockHttpTransport::new();
        http.push_json(json!({"type": "sync", "metadata": {}}));

        let mut p = profile(&http, json!({"name": "web", "devices": {"eth0": {"type": "nic"}}}));
        assert_eq!(p.devices()["eth0"]["type"], "nic");
        p.rename("frontend").await.unwrap();

        assert_eq!(p.name(), "frontend");
        let requests = http.request_bodies();
        assert_eq!(requests[0].path, "/1.0/profiles/web");
        assert_eq!(
            requests[0].body,
            crate::protocol::RequestBody::Json(json!({"name": "frontend"}))
        );
    }

    #[tokio::test]
    async fn test_delete_missing_profile_is_remote_error() {
        let http = MockHttpTransport::new();
        http.push_json(json!({"type": "error", "error": "not found", "error_code": 404}));

        let p = profile(&http, json!({"name": "gone"}));
        assert!(p.delete().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_refresh_reloads_record() {
        let http = MockHttpTransport::new();
        http.push_json(json!({"type": "sync", "metadata": {"name": "web", "config": {"a": "b"}}}));

        let mut p = profile(&http, json!({"name": "web"}));
        p.refresh().await.unwrap();
        assert_eq!(p.config()["a"], "b");
    }
}
