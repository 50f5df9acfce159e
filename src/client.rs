//! Daemon client
//!
//! [`Client`] is a cheap, cloneable handle over one dispatcher and one channel
//! transport. Resource handles ([`Container`], [`Image`], [`Profile`]) keep a
//! clone so they can issue their own requests.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ClientConfig, Endpoint};
use crate::container::Container;
use crate::dispatcher::{DispatchOptions, Outcome, RequestDispatcher};
use crate::error::{LxdError, Result};
use crate::image::Image;
use crate::operation::Operation;
use crate::profile::Profile;
use crate::protocol::{resource_name, LogicalRequest};
use crate::resource::hydrate;
use crate::transport::{
    ChannelTransport, HttpTransport, ReqwestTransport, UnixSocketTransport, WebSocketTransport,
};

/// Parameters for creating a container from an image alias.
#[derive(Debug, Clone, Serialize)]
pub struct CreateContainer {
    pub name: String,
    /// Image alias to create from
    pub image: String,
    pub profiles: Vec<String>,
    pub config: HashMap<String, String>,
    pub ephemeral: bool,
}

impl CreateContainer {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            profiles: vec!["default".to_string()],
            config: HashMap::new(),
            ephemeral: false,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles = vec![profile.into()];
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    fn body(&self) -> Value {
        json!({
            "name": self.name,
            "profiles": self.profiles,
            "ephemeral": self.ephemeral,
            "config": self.config,
            "source": {"type": "image", "alias": self.image},
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateProfile {
    pub name: String,
    pub description: String,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
}

impl CreateProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

struct ClientInner {
    dispatcher: RequestDispatcher,
    channels: Arc<dyn ChannelTransport>,
    config: ClientConfig,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build the transports for the configured endpoint.
    ///
    /// No request is made; the first call reaches the daemon.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (http, channels): (Arc<dyn HttpTransport>, Arc<dyn ChannelTransport>) =
            match config.endpoint()? {
                Endpoint::Unix(path) => {
                    info!(socket = %path.display(), "Using local daemon socket");
                    (
                        Arc::new(UnixSocketTransport::new(&path)),
                        Arc::new(WebSocketTransport::for_unix_socket(path)),
                    )
                }
                Endpoint::Http(url) => {
                    info!(url = %url, "Using remote daemon");
                    // Wait calls outlive ordinary requests; the dispatcher
                    // enforces both limits itself.
                    let timeout = config.request_timeout().max(config.operation_timeout());
                    (
                        Arc::new(ReqwestTransport::new(&url, timeout, config.accept_invalid_certs)?),
                        Arc::new(WebSocketTransport::for_url(&url)),
                    )
                }
            };
        Ok(Self::with_transports(config, http, channels))
    }

    /// Client over caller-supplied transports.
    pub fn with_transports(
        config: ClientConfig,
        http: Arc<dyn HttpTransport>,
        channels: Arc<dyn ChannelTransport>,
    ) -> Self {
        let dispatcher = RequestDispatcher::new(http)
            .with_timeouts(config.request_timeout(), config.operation_timeout())
            .with_server_wait(config.server_wait_secs)
            .with_max_waits(config.max_operation_waits);
        Self {
            inner: Arc::new(ClientInner {
                dispatcher,
                channels,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.inner.dispatcher
    }

    pub fn channel_transport(&self) -> Arc<dyn ChannelTransport> {
        Arc::clone(&self.inner.channels)
    }

    /// Dispatch a request, waiting on any operation it starts.
    pub async fn request(&self, request: LogicalRequest) -> Result<Outcome> {
        self.inner.dispatcher.call(request).await
    }

    pub async fn request_with(
        &self,
        request: LogicalRequest,
        options: DispatchOptions,
    ) -> Result<Outcome> {
        self.inner.dispatcher.dispatch(request, options).await
    }

    pub async fn wait_operation(&self, operation: &Operation) -> Result<()> {
        self.inner.dispatcher.wait_operation(operation).await
    }

    /// Server description. Refreshes [`Client::cached_info`].
    pub async fn info(&self) -> Result<Value> {
        Ok(self.request(LogicalRequest::get("/")).await?.into_value())
    }

    pub fn cached_info(&self) -> Option<Value> {
        self.inner.dispatcher.server_info()
    }

    pub async fn container_names(&self) -> Result<Vec<String>> {
        self.list_names("/containers").await
    }

    /// Every container, fetched concurrently.
    pub async fn containers(&self) -> Result<Vec<Container>> {
        let names = self.container_names().await?;
        let client = self.clone();
        hydrate(names, move |name| {
            let client = client.clone();
            async move { client.container(&name).await }
        })
        .await
    }

    pub async fn container(&self, name: &str) -> Result<Container> {
        let metadata = self
            .request(LogicalRequest::get(format!("/containers/{}", name)))
            .await?
            .into_value();
        Container::from_value(self.clone(), metadata)
    }

    /// Create a container, wait for the operation, then fetch it.
    pub async fn create_container(&self, params: CreateContainer) -> Result<Container> {
        debug!(name = %params.name, image = %params.image, "Creating container");
        self.request(LogicalRequest::post("/containers", params.body()))
            .await?;
        self.container(&params.name).await
    }

    pub async fn profile_names(&self) -> Result<Vec<String>> {
        self.list_names("/profiles").await
    }

    pub async fn profiles(&self) -> Result<Vec<Profile>> {
        let names = self.profile_names().await?;
        let client = self.clone();
        hydrate(names, move |name| {
            let client = client.clone();
            async move { client.profile(&name).await }
        })
        .await
    }

    pub async fn profile(&self, name: &str) -> Result<Profile> {
        let metadata = self
            .request(LogicalRequest::get(format!("/profiles/{}", name)))
            .await?
            .into_value();
        Profile::from_value(self.clone(), metadata)
    }

    pub async fn create_profile(&self, params: CreateProfile) -> Result<Profile> {
        let body = serde_json::to_value(&params)?;
        self.request(LogicalRequest::post("/profiles", body)).await?;
        self.profile(&params.name).await
    }

    pub async fn image_fingerprints(&self) -> Result<Vec<String>> {
        self.list_names("/images").await
    }

    pub async fn images(&self) -> Result<Vec<Image>> {
        let fingerprints = self.image_fingerprints().await?;
        let client = self.clone();
        hydrate(fingerprints, move |fingerprint| {
            let client = client.clone();
            async move { client.image(&fingerprint).await }
        })
        .await
    }

    pub async fn image(&self, fingerprint: &str) -> Result<Image> {
        let metadata = self
            .request(LogicalRequest::get(format!("/images/{}", fingerprint)))
            .await?
            .into_value();
        Image::from_value(self.clone(), metadata)
    }

    /// Names from a listing of resource URLs.
    async fn list_names(&self, path: &str) -> Result<Vec<String>> {
        let listing = self.request(LogicalRequest::get(path)).await?.into_value();
        let urls = listing.as_array().ok_or_else(|| {
            LxdError::Protocol(format!("Listing of {} is not an array", path))
        })?;
        Ok(urls
            .iter()
            .filter_map(Value::as_str)
            .map(|url| resource_name(url).to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Named;
    use crate::test_support::{MockChannelTransport, MockHttpTransport};

    fn client(http: &Arc<MockHttpTransport>) -> Client {
        Client::with_transports(
            ClientConfig::default(),
            http.clone(),
            Arc::new(MockChannelTransport::default()),
        )
    }

    fn sync(metadata: Value) -> Value {
        json!({"type": "sync", "status": "Success", "status_code": 200, "metadata": metadata})
    }

    #[tokio::test]
    async fn test_info_fills_cache() {
        let http = MockHttpTransport::new();
        http.push_json(sync(json!({"api_version": "1.0", "auth": "trusted"})));

        let client = client(&http);
        assert!(client.cached_info().is_none());
        let info = client.info().await.unwrap();
        assert_eq!(info["auth"], "trusted");
        assert_eq!(client.cached_info(), Some(info));
        assert_eq!(http.requests()[0].1, "/1.0");
    }

    #[tokio::test]
    async fn test_containers_skips_vanished_children() {
        let http = MockHttpTransport::new();
        http.route_json(
            "GET",
            "/1.0/containers",
            sync(json!(["/1.0/containers/web", "/1.0/containers/gone", "/1.0/containers/db"])),
        );
        http.route_json("GET", "/1.0/containers/web", sync(json!({"name": "web", "status": "Running"})));
        http.route_json(
            "GET",
            "/1.0/containers/gone",
            json!({"type": "error", "error": "not found", "error_code": 404}),
        );
        http.route_json("GET", "/1.0/containers/db", sync(json!({"name": "db", "status": "Stopped"})));

        let containers = client(&http).containers().await.unwrap();
        let names: Vec<&str> = containers.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["web", "db"]);
    }

    #[tokio::test]
    async fn test_listing_must_be_array() {
        let http = MockHttpTransport::new();
        http.push_json(sync(json!({"not": "a list"})));
        let err = client(&http).container_names().await.unwrap_err();
        assert!(matches!(err, LxdError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_create_container_waits_then_fetches() {
        let http = MockHttpTransport::new();
        http.push_json(json!({"type": "async", "status_code": 100,
                              "metadata": {"id": "op1", "class": "task", "status_code": 103}}));
        http.push_json(json!({"type": "sync", "metadata": {"id": "op1", "status_code": 200}}));
        http.push_json(sync(json!({"name": "c1", "status": "Stopped", "profiles": ["web"]})));

        let container = client(&http)
            .create_container(CreateContainer::new("c1", "ubuntu/22.04").with_profile("web"))
            .await
            .unwrap();
        assert_eq!(container.name(), "c1");

        let requests = http.request_bodies();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].path, "/1.0/operations/op1/wait");
        assert_eq!(requests[2].path, "/1.0/containers/c1");
        match &requests[0].body {
            crate::protocol::RequestBody::Json(body) => {
                assert_eq!(body["source"], json!({"type": "image", "alias": "ubuntu/22.04"}));
                assert_eq!(body["profiles"], json!(["web"]));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_container_failure_surfaces() {
        let http = MockHttpTransport::new();
        http.push_json(json!({"type": "async", "status_code": 100,
                              "metadata": {"id": "op1", "class": "task"}}));
        http.push_json(json!({"type": "sync", "metadata": {"id": "op1", "status": "Failure",
                                                           "status_code": 400, "err": "no such image"}}));

        let err = client(&http)
            .create_container(CreateContainer::new("c1", "missing"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), 400);
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_profiles_and_images() {
        let http = MockHttpTransport::new();
        http.route_json("GET", "/1.0/profiles", sync(json!(["/1.0/profiles/default"])));
        http.route_json(
            "GET",
            "/1.0/profiles/default",
            sync(json!({"name": "default", "description": "Default profile"})),
        );
        http.route_json("GET", "/1.0/images", sync(json!(["/1.0/images/abc"])));
        http.route_json(
            "GET",
            "/1.0/images/abc",
            sync(json!({"fingerprint": "abc", "size": 1024, "public": true})),
        );

        let client = client(&http);
        let profiles = client.profiles().await.unwrap();
        assert_eq!(profiles[0].description(), "Default profile");

        let images = client.images().await.unwrap();
        assert_eq!(images[0].fingerprint(), "abc");
        assert_eq!(images[0].size(), 1024);
    }

    #[test]
    fn test_connect_builds_transports_without_io() {
        let mut config = ClientConfig::default();
        assert!(Client::connect(config.clone()).is_ok());

        config.endpoint = "https://lxd.example:8443".into();
        assert!(Client::connect(config.clone()).is_ok());

        config.endpoint = "gopher://lxd".into();
        assert!(Client::connect(config).is_err());
    }
}
