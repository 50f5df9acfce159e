//! WebSocket Channels
//!
//! Single responsibility: open a WebSocket for an operation channel and move
//! messages over it. No knowledge of exec sessions or which channel is which.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    client_async_with_config, connect_async_with_config,
    tungstenite::{self, http::Request, protocol::Message},
    WebSocketStream,
};
use tracing::debug;

use super::{channel_url_path, Channel, ChannelMessage, ChannelTransport};
use crate::error::{LxdError, Result};

enum Target {
    /// `ws://` or `wss://` base URL
    Url(String),
    Unix(PathBuf),
}

/// Opens operation channels as WebSockets.
pub struct WebSocketTransport {
    target: Target,
}

impl WebSocketTransport {
    /// Channels for an `http(s)://` endpoint; the scheme is mapped to `ws(s)://`.
    pub fn for_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self {
            target: Target::Url(ws),
        }
    }

    /// Channels for the local daemon socket.
    pub fn for_unix_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::Unix(socket_path.into()),
        }
    }

    fn url_for(&self, path: &str) -> String {
        match &self.target {
            Target::Url(base) => format!("{}{}", base, path),
            Target::Unix(_) => format!("ws://localhost{}", path),
        }
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, path: &str, secret: &str) -> Result<Arc<dyn Channel>> {
        let url = self.url_for(&channel_url_path(path, secret));
        debug!(path = %path, "Opening WebSocket channel");
        let request = build_request(&url)?;

        match &self.target {
            Target::Url(_) => {
                let (ws, _) = connect_async_with_config(request, None, false)
                    .await
                    .map_err(|e| LxdError::Transport(format!("WebSocket connect failed: {}", e)))?;
                Ok(Arc::new(WsChannel::new(ws)))
            }
            Target::Unix(socket_path) => {
                let stream = UnixStream::connect(socket_path).await.map_err(|e| {
                    LxdError::Transport(format!(
                        "Failed to connect to {}: {}",
                        socket_path.display(),
                        e
                    ))
                })?;
                let (ws, _) = client_async_with_config(request, stream, None)
                    .await
                    .map_err(|e| LxdError::Transport(format!("WebSocket connect failed: {}", e)))?;
                Ok(Arc::new(WsChannel::new(ws)))
            }
        }
    }
}

fn build_request(url: &str) -> Result<Request<()>> {
    Request::builder()
        .uri(url)
        .header("Host", extract_host(url))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| LxdError::Transport(format!("Failed to build request: {}", e)))
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}

/// One open WebSocket.
///
/// Send and receive halves are locked independently so a pending `recv`
/// never blocks `send` or `close`.
pub struct WsChannel<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: AtomicBool,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LxdError::SessionClosed);
        }
        let frame = match message {
            ChannelMessage::Text(text) => Message::Text(text),
            ChannelMessage::Binary(data) => Message::Binary(data),
        };
        self.sink.lock().await.send(frame).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ChannelMessage>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(ChannelMessage::Binary(data))),
                Some(Ok(Message::Text(text))) => return Ok(Some(ChannelMessage::Text(text))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(None)).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => {}
            Err(e) => debug!(error = %e, "Error sending close frame"),
        }
        let _ = sink.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("ws://localhost:8443/1.0"), "localhost:8443");
        assert_eq!(extract_host("wss://example.com/path"), "example.com");
        assert_eq!(extract_host("invalid"), "localhost");
    }

    #[test]
    fn test_scheme_mapping() {
        let tls = WebSocketTransport::for_url("https://lxd.example:8443/");
        assert_eq!(
            tls.url_for("/1.0/operations/op1/websocket?secret=a"),
            "wss://lxd.example:8443/1.0/operations/op1/websocket?secret=a"
        );

        let plain = WebSocketTransport::for_url("http://10.0.0.2:8443");
        assert_eq!(plain.url_for("/x"), "ws://10.0.0.2:8443/x");

        let unix = WebSocketTransport::for_unix_socket("/var/lib/lxd/unix.socket");
        assert_eq!(unix.url_for("/x"), "ws://localhost/x");
    }

    #[tokio::test]
    async fn test_channel_over_duplex_stream() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            let echoed = ws.next().await.unwrap().unwrap();
            assert_eq!(echoed, Message::Binary(vec![1, 2, 3]));
            ws.close(None).await.unwrap();
        });

        let (ws, _) = client_async_with_config(build_request("ws://localhost/x").unwrap(), client_io, None)
            .await
            .unwrap();
        let channel = WsChannel::new(ws);

        assert_eq!(
            channel.recv().await.unwrap(),
            Some(ChannelMessage::Text("hello".into()))
        );
        channel.send(ChannelMessage::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), None);

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(matches!(
            channel.send(ChannelMessage::Text("late".into())).await,
            Err(LxdError::SessionClosed)
        ));

        server.await.unwrap();
    }
}
