//! HTTP transports
//!
//! Single responsibility: move one request and its response over the wire.
//! `ReqwestTransport` serves `http(s)://` endpoints, `UnixSocketTransport`
//! serves the local daemon socket.

use async_trait::async_trait;
use bytes::Bytes;
use http::header;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

use super::{HttpTransport, TransportRequest, TransportResponse};
use crate::error::{LxdError, Result};
use crate::protocol::RequestBody;

/// HTTP(S) transport for remote daemons.
pub struct ReqwestTransport {
    base_url: String,
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport rooted at `base_url` (e.g. `https://host:8443`).
    pub fn new(base_url: &str, timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| LxdError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let builder = self.client.request(request.method, &url);

        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes(data) => builder
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(data),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(TransportResponse { status, body })
    }
}

/// HTTP/1.1 over a Unix domain socket.
///
/// Each request opens a fresh connection; the daemon socket is local and
/// connection setup is cheap.
pub struct UnixSocketTransport {
    socket_path: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl HttpTransport for UnixSocketTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            LxdError::Transport(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| LxdError::Transport(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Unix socket connection closed");
            }
        });

        let builder = http::Request::builder()
            .method(request.method)
            .uri(format!("http://localhost{}", request.path))
            .header(header::HOST, "localhost");

        let (builder, body) = match request.body {
            RequestBody::Empty => (builder, Bytes::new()),
            RequestBody::Json(value) => (
                builder.header(header::CONTENT_TYPE, "application/json"),
                Bytes::from(serde_json::to_vec(&value)?),
            ),
            RequestBody::Bytes(data) => (
                builder.header(header::CONTENT_TYPE, "application/octet-stream"),
                Bytes::from(data),
            ),
        };

        let http_request = builder
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(body))
            .map_err(|e| LxdError::Transport(format!("Failed to build request: {}", e)))?;

        let response = sender
            .send_request(http_request)
            .await
            .map_err(|e| LxdError::Transport(format!("Request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| LxdError::Transport(format!("Failed to read response: {}", e)))?
            .to_bytes();

        Ok(TransportResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let transport =
            ReqwestTransport::new("https://lxd.example:8443/", Duration::from_secs(5), false)
                .unwrap();
        assert_eq!(transport.base_url(), "https://lxd.example:8443");
    }

    #[tokio::test]
    async fn test_unix_transport_reports_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let transport = UnixSocketTransport::new(dir.path().join("missing.socket"));

        let err = transport
            .send(TransportRequest {
                method: http::Method::GET,
                path: "/1.0".into(),
                body: RequestBody::Empty,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LxdError::Transport(_)));
    }
}
