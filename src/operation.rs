//! Remote Operations
//!
//! An [`Operation`] is a shared, read-only view of one long-running action on
//! the daemon. The dispatcher is the only writer: it creates the handle before
//! the request goes out and feeds it every response that names the operation.
//! Everyone else only reads.
//!
//! Operations of class `websocket` expose a [`ChannelFactory`] that opens each
//! of the operation's channels exactly once.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

use crate::error::{LxdError, Result};
use crate::protocol::API_PREFIX;
use crate::transport::{Channel, ChannelTransport};

/// Name of the control channel in a channel descriptor set.
pub const CONTROL_CHANNEL: &str = "control";

/// Plain operations are observed by polling; multiplexed ones also stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationClass {
    #[default]
    Plain,
    Multiplexed,
}

impl OperationClass {
    pub fn from_wire(class: &str) -> Self {
        match class {
            "websocket" => OperationClass::Multiplexed,
            _ => OperationClass::Plain,
        }
    }
}

/// Operation object as the daemon sends it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub may_cancel: bool,
    /// Operation-specific payload, e.g. channel secrets or an exec return code
    #[serde(default)]
    pub metadata: Value,
}

/// True once an operation status can no longer change.
pub fn is_terminal(status_code: u16) -> bool {
    status_code >= 200
}

/// True for a terminal failure code.
pub fn is_failure(status_code: u16) -> bool {
    (400..=599).contains(&status_code)
}

#[derive(Debug, Default)]
struct OperationState {
    started: bool,
    class: OperationClass,
    snapshot: OperationMetadata,
    raw: Value,
}

/// Handle to a remote operation. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct Operation {
    state: Arc<RwLock<OperationState>>,
}

impl Operation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Operation id; empty until the first response naming it is processed.
    pub fn id(&self) -> String {
        self.read(|s| s.snapshot.id.clone())
    }

    pub fn class(&self) -> OperationClass {
        self.read(|s| s.class)
    }

    pub fn status(&self) -> String {
        self.read(|s| s.snapshot.status.clone())
    }

    pub fn status_code(&self) -> u16 {
        self.read(|s| s.snapshot.status_code)
    }

    /// Error text reported by the daemon, if any.
    pub fn err(&self) -> String {
        self.read(|s| s.snapshot.err.clone())
    }

    pub fn has_started(&self) -> bool {
        self.read(|s| s.started)
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(self.status_code())
    }

    /// The operation object exactly as last received.
    pub fn raw(&self) -> Value {
        self.read(|s| s.raw.clone())
    }

    /// The operation-specific payload (`metadata.metadata` on the wire).
    pub fn metadata(&self) -> Value {
        self.read(|s| s.snapshot.metadata.clone())
    }

    /// Exit code of a finished exec operation.
    pub fn return_code(&self) -> Option<i64> {
        self.read(|s| s.snapshot.metadata.get("return").and_then(Value::as_i64))
    }

    /// Channel descriptor set, for multiplexed operations.
    pub fn channel_secrets(&self) -> Option<HashMap<String, String>> {
        self.read(|s| {
            if s.class != OperationClass::Multiplexed {
                return None;
            }
            let fds = s
                .snapshot
                .metadata
                .get("fds")
                .or_else(|| s.snapshot.metadata.get("channels"))?;
            let map = fds
                .as_object()?
                .iter()
                .filter_map(|(name, secret)| Some((name.clone(), secret.as_str()?.to_string())))
                .collect();
            Some(map)
        })
    }

    /// A factory that opens this operation's channels, or `None` when the
    /// operation does not stream.
    pub fn channel_factory(&self, transport: Arc<dyn ChannelTransport>) -> Option<ChannelFactory> {
        let secrets = self.channel_secrets()?;
        Some(ChannelFactory {
            path: format!("{}/operations/{}/websocket", API_PREFIX, self.id()),
            secrets: Mutex::new(secrets),
            transport,
        })
    }

    /// Apply one operation object from a response.
    ///
    /// The id is fixed by the first response. Once the status is terminal
    /// later snapshots are ignored.
    pub(crate) fn process(&self, metadata: &Value) -> Result<()> {
        let incoming: OperationMetadata = serde_json::from_value(metadata.clone())
            .map_err(|e| LxdError::Protocol(format!("Malformed operation metadata: {}", e)))?;

        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.started
            && !state.snapshot.id.is_empty()
            && !incoming.id.is_empty()
            && incoming.id != state.snapshot.id
        {
            return Err(LxdError::Protocol(format!(
                "Response for operation {} delivered to operation {}",
                incoming.id, state.snapshot.id
            )));
        }

        if state.started && is_terminal(state.snapshot.status_code) {
            if incoming.status_code != state.snapshot.status_code {
                warn!(
                    operation = %state.snapshot.id,
                    current = state.snapshot.status_code,
                    incoming = incoming.status_code,
                    "Ignoring update to finished operation"
                );
            }
            return Ok(());
        }

        let id = if incoming.id.is_empty() {
            state.snapshot.id.clone()
        } else {
            incoming.id.clone()
        };
        if !incoming.class.is_empty() {
            state.class = OperationClass::from_wire(&incoming.class);
        }
        let class = if incoming.class.is_empty() {
            state.snapshot.class.clone()
        } else {
            incoming.class.clone()
        };

        state.snapshot = OperationMetadata { id, class, ..incoming };
        state.raw = metadata.clone();
        state.started = true;
        Ok(())
    }

    /// Record a status code from a reply that carried no operation object.
    pub(crate) fn record_status_code(&self, code: u16) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.started && is_terminal(state.snapshot.status_code) {
            return;
        }
        state.snapshot.status_code = code;
        state.started = true;
    }

    fn read<T>(&self, f: impl FnOnce(&OperationState) -> T) -> T {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }
}

/// Opens the channels of one multiplexed operation.
///
/// Each named secret can be consumed once; asking for the same channel twice
/// is an error.
pub struct ChannelFactory {
    path: String,
    secrets: Mutex<HashMap<String, String>>,
    transport: Arc<dyn ChannelTransport>,
}

impl ChannelFactory {
    pub fn has_channel(&self, name: &str) -> bool {
        self.lock_secrets().contains_key(name)
    }

    /// Channel names not yet opened.
    pub fn remaining(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_secrets().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn open(&self, name: &str) -> Result<Arc<dyn Channel>> {
        let secret = self
            .lock_secrets()
            .remove(name)
            .ok_or_else(|| LxdError::ChannelOpen {
                channel: name.to_string(),
                reason: "no unused secret for this channel".into(),
            })?;

        self.transport
            .open(&self.path, &secret)
            .await
            .map_err(|e| LxdError::ChannelOpen {
                channel: name.to_string(),
                reason: e.to_string(),
            })
    }

    fn lock_secrets(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
