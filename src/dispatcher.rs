//! Request Dispatcher
//!
//! One path for every logical request:
//!
//! 1. send through the [`HttpTransport`] under a client-side timeout
//! 2. raw GETs return the body untouched
//! 3. everything else is classified as `sync`, `async` or `error`
//! 4. `async` responses must carry the accepted code (100); the dispatcher then
//!    either waits on `/operations/<id>/wait` until the operation is terminal,
//!    or hands the live [`Operation`] back to the caller
//!
//! The dispatcher is the only writer of the operations it creates.

use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::{
    DEFAULT_MAX_OPERATION_WAITS, DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::error::{LxdError, Result};
use crate::operation::{is_failure, is_terminal, Operation};
use crate::protocol::{
    resource_name, LogicalRequest, Method, ResponseEnvelope, ResponseType, STATUS_CREATED,
    STATUS_SUCCESS,
};
use crate::transport::{HttpTransport, TransportRequest, TransportResponse};

/// Process-wide request counter, used only to correlate log lines.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-call dispatch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Block on asynchronous operations until they reach a terminal state.
    pub wait: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { wait: true }
    }
}

impl DispatchOptions {
    /// Return asynchronous operations as soon as the daemon accepts them.
    pub fn no_wait() -> Self {
        Self { wait: false }
    }
}

/// Result of one dispatched request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// `metadata` of a synchronous response
    Sync(Value),
    /// Body of a raw GET
    Raw(Bytes),
    /// Accepted operation, not waited on
    Pending(Operation),
    /// Operation that reached a successful terminal state
    Completed(Operation),
}

impl Outcome {
    /// The structured result: sync metadata, or the last operation snapshot.
    pub fn into_value(self) -> Value {
        match self {
            Outcome::Sync(value) => value,
            Outcome::Pending(op) | Outcome::Completed(op) => op.raw(),
            Outcome::Raw(body) => Value::String(String::from_utf8_lossy(&body).into_owned()),
        }
    }

    pub fn into_operation(self) -> Option<Operation> {
        match self {
            Outcome::Pending(op) | Outcome::Completed(op) => Some(op),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Outcome::Raw(body) => body,
            other => Bytes::from(other.into_value().to_string()),
        }
    }
}

pub struct RequestDispatcher {
    http: Arc<dyn HttpTransport>,
    request_timeout: Duration,
    operation_timeout: Duration,
    /// Server-side `timeout` passed to wait calls
    server_wait: Option<u64>,
    /// Wait calls allowed per operation
    max_waits: u32,
    server_info: RwLock<Option<Value>>,
}

impl RequestDispatcher {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self {
            http,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            server_wait: None,
            max_waits: DEFAULT_MAX_OPERATION_WAITS,
            server_info: RwLock::new(None),
        }
    }

    /// Client-side timeouts for ordinary calls and for each wait call.
    pub fn with_timeouts(mut self, request: Duration, operation: Duration) -> Self {
        self.request_timeout = request;
        self.operation_timeout = operation;
        self
    }

    pub fn with_server_wait(mut self, seconds: Option<u64>) -> Self {
        self.server_wait = seconds;
        self
    }

    /// Upper bound on wait calls for one operation. At least one wait is
    /// always issued.
    pub fn with_max_waits(mut self, max_waits: u32) -> Self {
        self.max_waits = max_waits.max(1);
        self
    }

    /// Last server description seen on `GET /1.0`.
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Dispatch and wait; the usual entry point.
    pub async fn call(&self, request: LogicalRequest) -> Result<Outcome> {
        self.dispatch(request, DispatchOptions::default()).await
    }

    pub async fn dispatch(
        &self,
        request: LogicalRequest,
        options: DispatchOptions,
    ) -> Result<Outcome> {
        let request_id = next_request_id();
        let response = self
            .send(request_id, &request, self.request_timeout)
            .await?;

        if request.method.is_raw() {
            return raw_outcome(response);
        }

        let envelope = ResponseEnvelope::decode(&response.body)?;
        match envelope.response_type()? {
            ResponseType::Sync => {
                if request.method == Method::Get && request.path.is_empty() {
                    self.store_server_info(&envelope.metadata);
                }
                Ok(Outcome::Sync(envelope.metadata))
            }
            ResponseType::Error => {
                debug!(
                    request_id,
                    code = envelope.error_code,
                    error = %envelope.error,
                    "Request failed"
                );
                Err(envelope.into_remote_error())
            }
            ResponseType::Async => {
                if envelope.status_code != STATUS_CREATED {
                    return Err(LxdError::Protocol(format!(
                        "{} returned async status {} instead of {}",
                        request, envelope.status_code, STATUS_CREATED
                    )));
                }

                let operation = Operation::new();
                operation.process(&accepted_snapshot(&envelope))?;
                debug!(
                    request_id,
                    operation = %operation.id(),
                    wait = options.wait,
                    "Operation accepted"
                );

                if !options.wait {
                    return Ok(Outcome::Pending(operation));
                }
                self.wait_operation(&operation).await?;
                Ok(Outcome::Completed(operation))
            }
        }
    }

    /// Block until `operation` is terminal.
    ///
    /// A wait reply that carries no status code at all counts as success.
    ///
    /// # Errors
    /// `Operation` when the terminal code is in 400..=599, `Remote` when the
    /// wait call itself is rejected, `RetriesExceeded` when the operation is
    /// still running after the configured number of wait calls.
    pub async fn wait_operation(&self, operation: &Operation) -> Result<()> {
        for _ in 0..self.max_waits {
            let id = operation.id();
            if id.is_empty() {
                return Err(LxdError::Protocol(
                    "Cannot wait on an operation without an id".into(),
                ));
            }

            let mut path = format!("/operations/{}/wait", id);
            if let Some(seconds) = self.server_wait {
                path.push_str(&format!("?timeout={}", seconds));
            }
            let request = LogicalRequest::get(path);
            let request_id = next_request_id();
            let response = self
                .send(request_id, &request, self.operation_timeout)
                .await?;

            let envelope = ResponseEnvelope::decode(&response.body)?;
            if envelope.response_type()? == ResponseType::Error {
                return Err(envelope.into_remote_error());
            }

            let snapshot_code = envelope
                .metadata
                .get("status_code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok())
                .unwrap_or(0);
            let code = match (snapshot_code, envelope.status_code) {
                (0, 0) => STATUS_SUCCESS,
                (0, envelope_code) => envelope_code,
                (snapshot_code, _) => snapshot_code,
            };

            if envelope.metadata.is_object() {
                let mut snapshot = envelope.metadata.clone();
                if snapshot_code == 0 {
                    snapshot["status_code"] = Value::from(code);
                }
                operation.process(&snapshot)?;
            } else {
                operation.record_status_code(code);
            }

            let failure = if is_failure(code) {
                Some(code)
            } else if is_failure(envelope.status_code) {
                Some(envelope.status_code)
            } else {
                None
            };
            if let Some(code) = failure {
                let status = non_empty(operation.status(), &envelope.status);
                let message = non_empty(operation.err(), &envelope.error);
                let message = non_empty(message, &status);
                warn!(request_id, operation = %id, code, error = %message, "Operation failed");
                return Err(LxdError::Operation {
                    id,
                    message,
                    status,
                    code,
                });
            }

            if is_terminal(code) {
                trace!(request_id, operation = %id, code, "Operation finished");
                return Ok(());
            }
            trace!(request_id, operation = %id, code, "Operation still running");
        }

        let id = operation.id();
        warn!(operation = %id, waits = self.max_waits, "Operation still running after last wait");
        Err(LxdError::RetriesExceeded {
            what: format!("operation {}", id),
            attempts: self.max_waits,
        })
    }

    async fn send(
        &self,
        request_id: u64,
        request: &LogicalRequest,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let path = request.wire_path();
        debug!(request_id, method = %request.method, path = %path, "Dispatching request");

        let transport_request = TransportRequest {
            method: request.method.http(),
            path,
            body: request.body.clone(),
        };
        let response = tokio::time::timeout(timeout, self.http.send(transport_request))
            .await
            .map_err(|_| {
                LxdError::Transport(format!("{} timed out after {:?}", request, timeout))
            })??;

        trace!(request_id, status = response.status, bytes = response.body.len(), "Response received");
        Ok(response)
    }

    fn store_server_info(&self, metadata: &Value) {
        let mut cache = self
            .server_info
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cache = Some(metadata.clone());
    }
}

fn raw_outcome(response: TransportResponse) -> Result<Outcome> {
    if response.status >= 400 {
        if let Ok(envelope) = ResponseEnvelope::decode(&response.body) {
            if matches!(envelope.response_type(), Ok(ResponseType::Error)) {
                return Err(envelope.into_remote_error());
            }
        }
    }
    Ok(Outcome::Raw(response.body))
}

/// The operation object of an accepted response, with its id filled in from
/// the operation URL when the metadata omits it.
fn accepted_snapshot(envelope: &ResponseEnvelope) -> Value {
    let mut snapshot = match &envelope.metadata {
        Value::Object(_) => envelope.metadata.clone(),
        _ => Value::Object(Default::default()),
    };
    let has_id = snapshot
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_id && !envelope.operation.is_empty() {
        snapshot["id"] = Value::from(resource_name(&envelope.operation));
    }
    if snapshot.get("status_code").is_none() {
        snapshot["status_code"] = Value::from(envelope.status_code);
    }
    snapshot
}

fn non_empty(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
