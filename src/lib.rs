//! lxd-client - Async client for the LXD container daemon
//!
//! Talks to the daemon's REST API over its local Unix socket or HTTPS and
//! turns responses into typed containers, images, profiles, operations and
//! exec sessions.
//!
//! ## Layers
//!
//! - **Transport**: one request/response exchange, or one full-duplex channel
//! - **Dispatcher**: classifies `sync` / `async` / `error` responses and waits
//!   on operations
//! - **Sequencer**: runs bursts of dependent async steps with one completion
//! - **Exec**: binds an operation's channels into one process handle
//! - **Resources**: containers, images and profiles on top of the client
//!
//! ```no_run
//! use lxd_client::{Client, ClientConfig, ExecOptions};
//!
//! # async fn demo() -> lxd_client::Result<()> {
//! let client = Client::connect(ClientConfig::default())?;
//! let mut web = client.container("web").await?;
//! web.start().await?;
//! let output = web.run(ExecOptions::new(["uname", "-a"])).await?;
//! println!("{}", output.stdout_lossy());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod exec;
pub mod image;
pub mod operation;
pub mod profile;
pub mod protocol;
pub mod resource;
pub mod retry;
pub mod sequencer;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{Client, CreateContainer, CreateProfile};
pub use config::{ClientConfig, Endpoint};
pub use container::{Container, ExecOptions, IpFamily, StateAction, StateChange};
pub use dispatcher::{DispatchOptions, Outcome, RequestDispatcher};
pub use error::{ErrorKind, LxdError, Result};
pub use exec::{ExecEvent, ExecMode, ExecOutput, ExecSession};
pub use image::Image;
pub use operation::{Operation, OperationClass};
pub use profile::Profile;
pub use protocol::{LogicalRequest, Method};
pub use resource::{Named, Refresh};
pub use retry::RetryPolicy;
pub use sequencer::{Dispatch, TaskSequencer};
