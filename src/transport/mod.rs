//! Transport Layer
//!
//! The dispatcher and exec sessions only need two capabilities:
//!
//! | Trait              | Capability                                        |
//! |--------------------|---------------------------------------------------|
//! | `HttpTransport`    | send one request, receive status + body bytes     |
//! | `ChannelTransport` | open a full-duplex channel by path + secret token |
//!
//! Both are object-safe so the client can hold `Arc<dyn ...>` and tests can
//! substitute scripted implementations.

mod rest;
mod websocket;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::RequestBody;

pub use self::rest::{ReqwestTransport, UnixSocketTransport};
pub use self::websocket::WebSocketTransport;

/// A request as the transport sees it.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: http::Method,
    /// Absolute path including the API prefix and any query string
    pub path: String,
    pub body: RequestBody,
}

/// A response as the transport sees it.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// A message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ChannelMessage::Text(text) => text.into_bytes(),
            ChannelMessage::Binary(data) => data,
        }
    }
}

/// A full-duplex message channel.
///
/// All methods take `&self` so one task can block in `recv` while others
/// `send` or `close`.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, message: ChannelMessage) -> Result<()>;

    /// Next inbound message, or `None` once the peer has closed.
    async fn recv(&self) -> Result<Option<ChannelMessage>>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open the channel served at `path`, authenticating with `secret`.
    async fn open(&self, path: &str, secret: &str) -> Result<Arc<dyn Channel>>;
}

/// Path of a channel endpoint with its secret in the query string.
pub(crate) fn channel_url_path(path: &str, secret: &str) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{}{}secret={}", path, sep, urlencoding::encode(secret))
}
