//! Containers
//!
//! A [`Container`] is a snapshot of the daemon's record plus the client that
//! fetched it. Accessors read the snapshot; actions go through the client and
//! refresh the snapshot where the daemon's view changed.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::client::Client;
use crate::dispatcher::DispatchOptions;
use crate::error::{LxdError, Result};
use crate::exec::{ExecOutput, ExecSession};
use crate::operation::Operation;
use crate::protocol::{LogicalRequest, Method, RequestBody};
use crate::resource::{Named, Refresh};
use crate::retry::RetryPolicy;
use crate::sequencer::{Dispatch, TaskSequencer};

/// Server-side timeout passed with every state change, in seconds.
pub const STATE_CHANGE_TIMEOUT: u64 = 30;

/// Status code the daemon reports for a running container.
const STATUS_RUNNING: u16 = 103;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn matches(&self, protocol: &str) -> bool {
        match self {
            IpFamily::V4 => protocol.eq_ignore_ascii_case("IPV4") || protocol == "inet",
            IpFamily::V6 => protocol.eq_ignore_ascii_case("IPV6") || protocol == "inet6",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IpAddress {
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub address: String,
}

/// Runtime status as embedded in older container records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub ips: Option<Vec<IpAddress>>,
    #[serde(default)]
    pub processcount: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StatusField {
    Text(String),
    Detailed(RuntimeStatus),
}

impl Default for StatusField {
    fn default() -> Self {
        StatusField::Text(String::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NetworkInterface {
    #[serde(default)]
    addresses: Vec<NetworkAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NetworkAddress {
    #[serde(default)]
    family: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContainerState {
    #[serde(default)]
    processes: i64,
    #[serde(default)]
    network: Option<HashMap<String, NetworkInterface>>,
}

/// The daemon's record of one container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default)]
    pub name: String,
    /// Name string on current daemons, numeric id on old ones
    #[serde(default)]
    pub architecture: Value,
    #[serde(default)]
    status: StatusField,
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    state: Option<ContainerState>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Start => "start",
            StateAction::Stop => "stop",
            StateAction::Restart => "restart",
            StateAction::Freeze => "freeze",
            StateAction::Unfreeze => "unfreeze",
        }
    }
}

/// Body of `PUT /containers/<name>/state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub action: StateAction,
    /// Server-side timeout in seconds
    pub timeout: u64,
    pub force: bool,
}

impl StateChange {
    pub fn new(action: StateAction) -> Self {
        Self {
            action,
            timeout: STATE_CHANGE_TIMEOUT,
            force: true,
        }
    }

    fn body(&self) -> Value {
        json!({
            "action": self.action.as_str(),
            "timeout": self.timeout,
            "force": self.force,
        })
    }
}

/// A command to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub command: Vec<String>,
    /// Merged over the client's configured exec environment
    pub environment: HashMap<String, String>,
    /// Interactive sessions use one shared channel for input and output
    pub interactive: bool,
}

impl ExecOptions {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

#[derive(Clone)]
pub struct Container {
    client: Client,
    metadata: ContainerMetadata,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.metadata.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Container {
    pub(crate) fn from_value(client: Client, value: Value) -> Result<Self> {
        let metadata: ContainerMetadata = serde_json::from_value(value)
            .map_err(|e| LxdError::Protocol(format!("Malformed container record: {}", e)))?;
        Ok(Self { client, metadata })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    pub fn architecture(&self) -> String {
        match &self.metadata.architecture {
            Value::String(name) => name.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> &str {
        match &self.metadata.status {
            StatusField::Text(status) => status,
            StatusField::Detailed(runtime) => &runtime.status,
        }
    }

    pub fn status_code(&self) -> u16 {
        match &self.metadata.status {
            StatusField::Detailed(runtime) if runtime.status_code != 0 => runtime.status_code,
            _ => self.metadata.status_code,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status_code() == STATUS_RUNNING || self.status().eq_ignore_ascii_case("running")
    }

    pub fn config(&self) -> &HashMap<String, String> {
        &self.metadata.config
    }

    pub fn profiles(&self) -> &[String] {
        &self.metadata.profiles
    }

    pub fn ephemeral(&self) -> bool {
        self.metadata.ephemeral
    }

    pub fn process_count(&self) -> i64 {
        match (&self.metadata.status, &self.metadata.state) {
            (StatusField::Detailed(runtime), _) => runtime.processcount,
            (_, Some(state)) => state.processes,
            _ => 0,
        }
    }

    /// Every known address, from either record layout.
    pub fn addresses(&self) -> Vec<IpAddress> {
        if let StatusField::Detailed(runtime) = &self.metadata.status {
            if let Some(ips) = &runtime.ips {
                return ips.clone();
            }
        }
        let Some(network) = self.metadata.state.as_ref().and_then(|s| s.network.as_ref()) else {
            return Vec::new();
        };
        let mut addresses: Vec<IpAddress> = network
            .iter()
            .flat_map(|(interface, nic)| {
                nic.addresses.iter().map(move |addr| IpAddress {
                    interface: interface.clone(),
                    protocol: addr.family.clone(),
                    address: addr.address.clone(),
                })
            })
            .collect();
        addresses.sort_by(|a, b| a.interface.cmp(&b.interface));
        addresses
    }

    /// First address on `interface`, optionally restricted to one family.
    pub fn ip(&self, interface: &str, family: Option<IpFamily>) -> Option<IpAddress> {
        self.addresses().into_iter().find(|addr| {
            addr.interface == interface && family.map_or(true, |f| f.matches(&addr.protocol))
        })
    }

    pub fn ipv4(&self) -> Option<String> {
        self.ip("eth0", Some(IpFamily::V4)).map(|addr| addr.address)
    }

    pub fn ipv6(&self) -> Option<String> {
        self.ip("eth0", Some(IpFamily::V6)).map(|addr| addr.address)
    }

    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        self.client
            .request(LogicalRequest::post(self.path(), json!({"name": new_name})))
            .await?;
        self.metadata.name = new_name.to_string();
        Ok(())
    }

    /// Apply a state change, then reload the record.
    pub async fn set_state(&mut self, change: StateChange) -> Result<()> {
        info!(container = %self.metadata.name, action = change.action.as_str(), "Changing container state");
        self.client
            .request(LogicalRequest::put(format!("{}/state", self.path()), change.body()))
            .await?;
        self.refresh().await
    }

    pub async fn start(&mut self) -> Result<()> {
        self.set_state(StateChange::new(StateAction::Start)).await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.set_state(StateChange::new(StateAction::Stop)).await
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.set_state(StateChange::new(StateAction::Restart)).await
    }

    pub async fn freeze(&mut self) -> Result<()> {
        self.set_state(StateChange::new(StateAction::Freeze)).await
    }

    pub async fn unfreeze(&mut self) -> Result<()> {
        self.set_state(StateChange::new(StateAction::Unfreeze)).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.client.request(LogicalRequest::delete(self.path())).await?;
        Ok(())
    }

    /// Stop the container if it is running, then delete it.
    ///
    /// The two steps run in order; a failed stop skips the delete.
    pub async fn destroy(self) -> Result<()> {
        let failure: Arc<Mutex<Option<LxdError>>> = Arc::new(Mutex::new(None));
        let sequencer = TaskSequencer::new();

        if self.is_running() {
            let mut container = self.clone();
            let failure = Arc::clone(&failure);
            sequencer.queue_future(Dispatch::Sequential, async move {
                if let Err(e) = container.stop().await {
                    record(&failure, e);
                }
            });
        }

        let failure_for_delete = Arc::clone(&failure);
        sequencer.queue_future(Dispatch::Sequential, async move {
            if has_failed(&failure_for_delete) {
                return;
            }
            if let Err(e) = self.delete().await {
                record(&failure_for_delete, e);
            }
        });

        sequencer.complete().await?;
        let failure = failure.lock().unwrap_or_else(|p| p.into_inner()).take();
        failure.map_or(Ok(()), Err)
    }

    /// Start a command and return its live session.
    pub async fn exec(&self, options: ExecOptions) -> Result<ExecSession> {
        Ok(self.start_exec(options).await?.1)
    }

    /// Run a command to completion, collecting its output and exit code.
    pub async fn run(&self, options: ExecOptions) -> Result<ExecOutput> {
        let (operation, session) = self.start_exec(options).await?;
        let mut output = session.collect_output().await;
        self.client.wait_operation(&operation).await?;
        output.exit_code = operation.return_code();
        Ok(output)
    }

    async fn start_exec(&self, options: ExecOptions) -> Result<(Operation, ExecSession)> {
        let mut environment = self.client.config().exec.environment.clone();
        environment.extend(options.environment);
        let body = json!({
            "command": options.command,
            "environment": environment,
            "wait-for-websocket": true,
            "interactive": options.interactive,
        });

        let operation = self
            .client
            .request_with(
                LogicalRequest::post(format!("{}/exec", self.path()), body),
                DispatchOptions::no_wait(),
            )
            .await?
            .into_operation()
            .ok_or_else(|| LxdError::Protocol("Exec did not start an operation".into()))?;

        let factory = operation
            .channel_factory(self.client.channel_transport())
            .ok_or_else(|| {
                LxdError::Protocol(format!(
                    "Exec operation {} exposes no channels",
                    operation.id()
                ))
            })?;
        debug!(container = %self.metadata.name, operation = %operation.id(), "Opening exec channels");
        let session = ExecSession::open(factory).await?;
        Ok((operation, session))
    }

    /// Write `data` to `remote_path` inside the container.
    pub async fn upload(&self, remote_path: &str, data: Vec<u8>) -> Result<()> {
        let request = LogicalRequest::new(Method::Post, self.files_path(remote_path))
            .with_body(RequestBody::Bytes(data));
        self.client.request(request).await?;
        Ok(())
    }

    /// Read `remote_path` from inside the container.
    pub async fn download(&self, remote_path: &str) -> Result<Bytes> {
        Ok(self
            .client
            .request(LogicalRequest::get_raw(self.files_path(remote_path)))
            .await?
            .into_bytes())
    }

    pub async fn upload_file(&self, local_path: impl AsRef<Path>, remote_path: &str) -> Result<()> {
        let data = tokio::fs::read(local_path.as_ref()).await?;
        self.upload(remote_path, data).await
    }

    pub async fn download_file(&self, remote_path: &str, local_path: impl AsRef<Path>) -> Result<()> {
        let data = self.download(remote_path).await?;
        tokio::fs::write(local_path.as_ref(), &data).await?;
        Ok(())
    }

    /// Wait for `eth0` to get an IPv4 address using the configured polling.
    pub async fn wait_ipv4(&mut self) -> Result<String> {
        let policy = self.client.config().polling.ipv4_policy();
        self.wait_address(IpFamily::V4, policy).await
    }

    pub async fn wait_ipv6(&mut self) -> Result<String> {
        let policy = self.client.config().polling.ipv6_policy();
        self.wait_address(IpFamily::V6, policy).await
    }

    /// Refresh until `eth0` has an address of `family`.
    pub async fn wait_address(&mut self, family: IpFamily, policy: RetryPolicy) -> Result<String> {
        if let Some(addr) = self.ip("eth0", Some(family)) {
            return Ok(addr.address);
        }

        let client = self.client.clone();
        let name = self.metadata.name.clone();
        let what = format!("{:?} address of {}", family, name);
        let (address, latest) = policy
            .poll_until(&what, move |_| {
                let client = client.clone();
                let name = name.clone();
                async move {
                    let latest = client.container(&name).await?;
                    Ok(latest
                        .ip("eth0", Some(family))
                        .map(|addr| (addr.address, latest)))
                }
            })
            .await?;
        self.metadata = latest.metadata;
        Ok(address)
    }

    fn files_path(&self, remote_path: &str) -> String {
        format!("{}/files?path={}", self.path(), urlencoding::encode(remote_path))
    }
}

impl Named for Container {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn path(&self) -> String {
        format!("/containers/{}", self.metadata.name)
    }
}

#[async_trait]
impl Refresh for Container {
    async fn refresh(&mut self) -> Result<()> {
        let latest = self.client.container(&self.metadata.name).await?;
        self.metadata = latest.metadata;
        Ok(())
    }
}

fn record(failure: &Mutex<Option<LxdError>>, error: LxdError) {
    failure
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get_or_insert(error);
}

fn has_failed(failure: &Mutex<Option<LxdError>>) -> bool {
    failure.lock().unwrap_or_else(|p| p.into_inner()).is_some()
}
