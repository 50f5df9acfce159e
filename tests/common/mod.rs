//! Scripted in-memory daemon used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use lxd_client::transport::{
    Channel, ChannelMessage, ChannelTransport, HttpTransport, TransportRequest, TransportResponse,
};
use lxd_client::{Client, ClientConfig, LxdError, Result};

/// Serves scripted JSON bodies in order and records every request line.
#[derive(Default)]
pub struct ScriptedDaemon {
    responses: Mutex<VecDeque<Value>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedDaemon {
    pub fn with_responses(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Requests as `"<METHOD> <path>"`.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedDaemon {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        self.seen
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, request.path));
        let body = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LxdError::Transport("daemon script exhausted".into()))?;
        Ok(TransportResponse {
            status: 200,
            body: Bytes::from(body.to_string()),
        })
    }
}

pub struct PipeChannel {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    sent: Mutex<Vec<ChannelMessage>>,
    closed: Mutex<bool>,
}

#[async_trait]
impl Channel for PipeChannel {
    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if *self.closed.lock().unwrap() {
            return Err(LxdError::SessionClosed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ChannelMessage>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// Channel endpoints keyed by secret. The test plays the daemon's side.
#[derive(Default)]
pub struct PipeTransport {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ChannelMessage>>>,
    channels: Mutex<HashMap<String, Arc<PipeChannel>>>,
    refuse: Mutex<Option<String>>,
}

impl PipeTransport {
    pub fn refuse(&self, secret: &str) {
        *self.refuse.lock().unwrap() = Some(secret.to_string());
    }

    pub fn opened(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn deliver(&self, secret: &str, data: &[u8]) {
        if let Some(tx) = self.senders.lock().unwrap().get(secret) {
            let _ = tx.send(ChannelMessage::Binary(data.to_vec()));
        }
    }

    /// Close from the daemon's side.
    pub fn end(&self, secret: &str) {
        self.senders.lock().unwrap().remove(secret);
    }

    pub fn is_closed(&self, secret: &str) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(secret)
            .map(|c| *c.closed.lock().unwrap())
            .unwrap_or(false)
    }

    pub fn sent(&self, secret: &str) -> Vec<ChannelMessage> {
        self.channels
            .lock()
            .unwrap()
            .get(secret)
            .map(|c| c.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelTransport for PipeTransport {
    async fn open(&self, _path: &str, secret: &str) -> Result<Arc<dyn Channel>> {
        if self.refuse.lock().unwrap().as_deref() == Some(secret) {
            return Err(LxdError::Transport("handshake refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(PipeChannel {
            inbound: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        self.senders.lock().unwrap().insert(secret.to_string(), tx);
        self.channels
            .lock()
            .unwrap()
            .insert(secret.to_string(), Arc::clone(&channel));
        Ok(channel)
    }
}

pub fn client(daemon: &Arc<ScriptedDaemon>, pipes: &Arc<PipeTransport>) -> Client {
    Client::with_transports(ClientConfig::default(), daemon.clone(), pipes.clone())
}
