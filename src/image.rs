//! Images

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::client::Client;
use crate::error::{LxdError, Result};
use crate::protocol::LogicalRequest;
use crate::resource::{Named, Refresh};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageAlias {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub aliases: Vec<ImageAlias>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub architecture: Value,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub update_source: Option<Value>,
}

#[derive(Clone)]
pub struct Image {
    client: Client,
    metadata: ImageMetadata,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("fingerprint", &self.metadata.fingerprint)
            .finish()
    }
}

impl Image {
    pub(crate) fn from_value(client: Client, value: Value) -> Result<Self> {
        let metadata = serde_json::from_value(value)
            .map_err(|e| LxdError::Protocol(format!("Malformed image record: {}", e)))?;
        Ok(Self { client, metadata })
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn fingerprint(&self) -> &str {
        &self.metadata.fingerprint
    }

    pub fn aliases(&self) -> &[ImageAlias] {
        &self.metadata.aliases
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.metadata.properties
    }

    pub fn architecture(&self) -> String {
        match &self.metadata.architecture {
            Value::String(name) => name.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn size(&self) -> u64 {
        self.metadata.size
    }

    pub fn auto_update(&self) -> bool {
        self.metadata.auto_update
    }

    pub fn public(&self) -> bool {
        self.metadata.public
    }

    pub fn filename(&self) -> &str {
        &self.metadata.filename
    }

    pub fn cached(&self) -> bool {
        self.metadata.cached
    }

    pub fn update_source(&self) -> Option<&Value> {
        self.metadata.update_source.as_ref()
    }

    /// Ask the daemon to refresh this image from its origin.
    pub async fn refresh_from_origin(&self) -> Result<()> {
        self.client
            .request(LogicalRequest::post(
                format!("{}/refresh", self.path()),
                Value::Object(Default::default()),
            ))
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        self.client.request(LogicalRequest::delete(self.path())).await?;
        Ok(())
    }
}

impl Named for Image {
    fn name(&self) -> &str {
        &self.metadata.fingerprint
    }

    fn path(&self) -> String {
        format!("/images/{}", self.metadata.fingerprint)
    }
}

#[async_trait]
impl Refresh for Image {
    async fn refresh(&mut self) -> Result<()> {
        let latest = self.client.image(&self.metadata.fingerprint).await?;
        self.metadata = latest.metadata;
        Ok(())
    }
}
