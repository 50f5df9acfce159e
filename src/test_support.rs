//! In-memory transports for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::error::{LxdError, Result};
use crate::transport::{
    Channel, ChannelMessage, ChannelTransport, HttpTransport, TransportRequest, TransportResponse,
};

/// Scripted HTTP transport.
///
/// Responses registered for a `(method, path)` route are served first, in
/// order; everything else is served from a shared FIFO script.
#[derive(Default)]
pub struct MockHttpTransport {
    script: Mutex<VecDeque<TransportResponse>>,
    routes: Mutex<HashMap<(String, String), VecDeque<TransportResponse>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl MockHttpTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_json(&self, body: Value) {
        self.push_raw(200, body.to_string().into_bytes());
    }

    pub fn push_raw(&self, status: u16, body: Vec<u8>) {
        self.script.lock().unwrap().push_back(TransportResponse {
            status,
            body: Bytes::from(body),
        });
    }

    pub fn route_json(&self, method: &str, path: &str, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .push_back(TransportResponse {
                status: 200,
                body: Bytes::from(body.to_string()),
            });
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.method.to_string(), r.path.clone()))
            .collect()
    }

    pub fn request_bodies(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let key = (request.method.to_string(), request.path.clone());
        self.requests.lock().unwrap().push(request);

        if let Some(queue) = self.routes.lock().unwrap().get_mut(&key) {
            if let Some(response) = queue.pop_front() {
                return Ok(response);
            }
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LxdError::Transport(format!("no scripted response for {:?}", key)))
    }
}

/// Channel whose far end is driven by the test.
pub struct MockChannel {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    sent: Mutex<Vec<ChannelMessage>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LxdError::SessionClosed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ChannelMessage>> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            msg = inbound.recv() => Ok(msg),
            _ = closed_rx.changed() => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

struct Remote {
    tx: Option<mpsc::UnboundedSender<ChannelMessage>>,
    channel: Arc<MockChannel>,
}

/// Channel transport handing out [`MockChannel`]s keyed by secret.
#[derive(Default)]
pub struct MockChannelTransport {
    remotes: Mutex<HashMap<String, Remote>>,
    failing: Mutex<HashSet<String>>,
    opened: Mutex<Vec<(String, String)>>,
}

impl MockChannelTransport {
    /// Make opening the channel with this secret fail.
    pub fn fail_secret(&self, secret: &str) {
        self.failing.lock().unwrap().insert(secret.to_string());
    }

    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }

    /// Deliver a message from the far end.
    pub fn push(&self, secret: &str, message: ChannelMessage) {
        let remotes = self.remotes.lock().unwrap();
        if let Some(tx) = remotes.get(secret).and_then(|r| r.tx.as_ref()) {
            let _ = tx.send(message);
        }
    }

    /// Close the channel from the far end.
    pub fn hang_up(&self, secret: &str) {
        if let Some(remote) = self.remotes.lock().unwrap().get_mut(secret) {
            remote.tx = None;
        }
    }

    pub fn sent(&self, secret: &str) -> Vec<ChannelMessage> {
        self.remotes
            .lock()
            .unwrap()
            .get(secret)
            .map(|r| r.channel.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, secret: &str) -> bool {
        self.remotes
            .lock()
            .unwrap()
            .get(secret)
            .map(|r| r.channel.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChannelTransport for MockChannelTransport {
    async fn open(&self, path: &str, secret: &str) -> Result<Arc<dyn Channel>> {
        self.opened
            .lock()
            .unwrap()
            .push((path.to_string(), secret.to_string()));

        if self.failing.lock().unwrap().contains(secret) {
            return Err(LxdError::Transport(format!("refused secret {}", secret)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let channel = Arc::new(MockChannel {
            inbound: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        self.remotes.lock().unwrap().insert(
            secret.to_string(),
            Remote {
                tx: Some(tx),
                channel: Arc::clone(&channel),
            },
        );
        Ok(channel)
    }
}
