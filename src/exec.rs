//! Exec Sessions
//!
//! An [`ExecSession`] binds the channels of one multiplexed exec operation
//! into a single process-like handle.
//!
//! | Mode           | Channels | Layout                                   |
//! |----------------|----------|------------------------------------------|
//! | Interactive    | 2        | `0` input and output, `control`          |
//! | NonInteractive | 4        | `0` stdin, `1` stdout, `2` stderr, `control` |
//!
//! Output arrives as [`ExecEvent::Data`]. The control channel closing (or an
//! explicit [`ExecSession::close`]) ends the session: every remaining channel
//! is closed and exactly one [`ExecEvent::Closed`] is delivered after all data
//! events.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{LxdError, Result};
use crate::operation::{ChannelFactory, CONTROL_CHANNEL};
use crate::sequencer::{Dispatch, TaskSequencer};
use crate::transport::{Channel, ChannelMessage};

/// Channel layout, inferred from how many channels the operation exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Interactive,
    NonInteractive,
}

impl ExecMode {
    pub fn from_channel_count(count: usize) -> Option<Self> {
        match count {
            2 => Some(ExecMode::Interactive),
            4 => Some(ExecMode::NonInteractive),
            _ => None,
        }
    }

    /// Logical channel names in layout order; control is always last.
    pub fn channel_names(&self) -> &'static [&'static str] {
        match self {
            ExecMode::Interactive => &["0", CONTROL_CHANNEL],
            ExecMode::NonInteractive => &["0", "1", "2", CONTROL_CHANNEL],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Data { is_error: bool, data: Vec<u8> },
    Closed,
}

/// Everything a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set once the exec operation itself has been waited on
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub struct ExecSession {
    mode: ExecMode,
    input: Arc<dyn Channel>,
    control: Arc<dyn Channel>,
    events: mpsc::UnboundedReceiver<ExecEvent>,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

impl ExecSession {
    /// Open every channel of an exec operation and start the session.
    ///
    /// Channels are opened concurrently. If any open fails, the channels that
    /// did open are closed again and the error is returned; no event is ever
    /// delivered in that case.
    pub async fn open(factory: ChannelFactory) -> Result<Self> {
        let available = factory.remaining();
        let mode = ExecMode::from_channel_count(available.len()).ok_or_else(|| {
            LxdError::Protocol(format!(
                "Exec operation exposes {} channels, expected 2 or 4",
                available.len()
            ))
        })?;
        let names = mode.channel_names();
        if let Some(missing) = names.iter().find(|name| !factory.has_channel(name)) {
            return Err(LxdError::Protocol(format!(
                "Exec operation has no secret for channel {}",
                missing
            )));
        }

        let channels = open_channels(Arc::new(factory), names).await?;
        Ok(Self::start(mode, channels))
    }

    /// Wire up pumps and the supervisor over already opened channels, given
    /// in layout order.
    fn start(mode: ExecMode, channels: Vec<Arc<dyn Channel>>) -> Self {
        let input = Arc::clone(&channels[0]);
        let control = Arc::clone(&channels[channels.len() - 1]);
        let outputs: Vec<(Arc<dyn Channel>, bool)> = match mode {
            ExecMode::Interactive => vec![(Arc::clone(&channels[0]), false)],
            ExecMode::NonInteractive => vec![
                (Arc::clone(&channels[1]), false),
                (Arc::clone(&channels[2]), true),
            ],
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (close_tx, close_rx) = watch::channel(false);
        let (finished_tx, finished) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        let pumps = outputs
            .into_iter()
            .map(|(channel, is_error)| {
                tokio::spawn(pump(channel, is_error, events_tx.clone(), stop_rx.clone()))
            })
            .collect();

        tokio::spawn(supervise(Supervisor {
            control: Arc::clone(&control),
            channels,
            pumps,
            events: events_tx,
            stop: stop_tx,
            close_requested: close_rx,
            closed: Arc::clone(&closed),
            finished: finished_tx,
        }));

        Self {
            mode,
            input,
            control,
            events,
            closed,
            close_tx,
            finished,
        }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next event, or `None` after [`ExecEvent::Closed`] has been delivered.
    pub async fn next_event(&mut self) -> Option<ExecEvent> {
        self.events.recv().await
    }

    /// Send bytes to the process's input.
    ///
    /// # Errors
    /// `SessionClosed` once the session has ended.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(LxdError::SessionClosed);
        }
        self.input.send(ChannelMessage::Binary(data.to_vec())).await
    }

    /// Ask the daemon to resize the terminal. No reply is expected.
    pub async fn resize(&self, width: u32, height: u32) -> Result<()> {
        if self.is_closed() {
            return Err(LxdError::SessionClosed);
        }
        let message = json!({
            "command": "window-resize",
            "width": width,
            "height": height,
        });
        self.control
            .send(ChannelMessage::Text(message.to_string()))
            .await
    }

    /// End the session and wait for teardown. Closing twice is a no-op.
    pub async fn close(&self) {
        self.close_tx.send_replace(true);
        let mut finished = self.finished.clone();
        while !*finished.borrow_and_update() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }

    /// Drain the session, splitting output by stream, until it closes.
    pub async fn collect_output(mut self) -> ExecOutput {
        let mut output = ExecOutput::default();
        while let Some(event) = self.next_event().await {
            match event {
                ExecEvent::Data { is_error: false, data } => output.stdout.extend(data),
                ExecEvent::Data { is_error: true, data } => output.stderr.extend(data),
                ExecEvent::Closed => break,
            }
        }
        output
    }
}

/// Open `names` concurrently as one eager sequencer run.
async fn open_channels(
    factory: Arc<ChannelFactory>,
    names: &'static [&'static str],
) -> Result<Vec<Arc<dyn Channel>>> {
    let slots: Arc<Mutex<Vec<Option<Arc<dyn Channel>>>>> =
        Arc::new(Mutex::new(vec![None; names.len()]));
    let failure: Arc<Mutex<Option<LxdError>>> = Arc::new(Mutex::new(None));

    let sequencer = TaskSequencer::new();
    for (index, name) in names.iter().enumerate() {
        let factory = Arc::clone(&factory);
        let slots = Arc::clone(&slots);
        let failure = Arc::clone(&failure);
        sequencer.queue_future(Dispatch::Eager, async move {
            if lock(&failure).is_some() {
                return;
            }
            match factory.open(name).await {
                Ok(channel) => {
                    trace!(channel = %name, "Exec channel open");
                    lock(&slots)[index] = Some(channel);
                }
                Err(e) => {
                    debug!(channel = %name, error = %e, "Exec channel failed to open");
                    lock(&failure).get_or_insert(e);
                }
            }
        });
    }
    sequencer.complete().await?;

    let opened: Vec<Option<Arc<dyn Channel>>> = std::mem::take(&mut *lock(&slots));
    let failure = lock(&failure).take();
    if let Some(error) = failure {
        for channel in opened.into_iter().flatten() {
            let _ = channel.close().await;
        }
        return Err(error);
    }

    opened
        .into_iter()
        .zip(names)
        .map(|(slot, name)| {
            slot.ok_or_else(|| LxdError::ChannelOpen {
                channel: name.to_string(),
                reason: "channel was never opened".into(),
            })
        })
        .collect()
}

/// Forward one output channel into the event queue until it closes or the
/// session stops. Ready messages are always drained before stopping.
async fn pump(
    channel: Arc<dyn Channel>,
    is_error: bool,
    events: mpsc::UnboundedSender<ExecEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            biased;
            received = channel.recv() => received,
            _ = stop.changed() => break,
        };
        match received {
            Ok(Some(message)) => {
                let data = message.into_bytes();
                if data.is_empty() {
                    continue;
                }
                if events.send(ExecEvent::Data { is_error, data }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(is_error, error = %e, "Exec output channel failed");
                break;
            }
        }
    }
}

struct Supervisor {
    control: Arc<dyn Channel>,
    channels: Vec<Arc<dyn Channel>>,
    pumps: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<ExecEvent>,
    stop: watch::Sender<bool>,
    close_requested: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    finished: watch::Sender<bool>,
}

async fn supervise(mut sup: Supervisor) {
    let control = Arc::clone(&sup.control);
    tokio::select! {
        _ = drain_control(control) => trace!("Exec control channel closed"),
        _ = sup.close_requested.changed() => trace!("Exec session closed locally"),
    }

    sup.closed.store(true, Ordering::SeqCst);
    sup.stop.send_replace(true);
    for pump in sup.pumps.drain(..) {
        let _ = pump.await;
    }
    for channel in &sup.channels {
        let _ = channel.close().await;
    }

    let _ = sup.events.send(ExecEvent::Closed);
    sup.finished.send_replace(true);
}

/// Resolves once the control channel is gone. Anything the daemon sends on
/// it is ignored.
async fn drain_control(control: Arc<dyn Channel>) {
    while let Ok(Some(_)) = control.recv().await {}
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::test_support::MockChannelTransport;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn exec_operation(fds: Value) -> Operation {
        let op = Operation::new();
        op.process(&json!({"id": "op1", "class": "websocket", "status_code": 103,
                           "metadata": {"fds": fds}}))
            .unwrap();
        op
    }

    fn four_channels() -> Operation {
        exec_operation(json!({"0": "s0", "1": "s1", "2": "s2", "control": "sc"}))
    }

    async fn open_session(op: &Operation, transport: &Arc<MockChannelTransport>) -> Result<ExecSession> {
        ExecSession::open(op.channel_factory(transport.clone()).unwrap()).await
    }

    #[tokio::test]
    async fn test_four_channels_tag_error_stream() {
        let transport = Arc::new(MockChannelTransport::default());
        let mut session = open_session(&four_channels(), &transport).await.unwrap();
        assert_eq!(session.mode(), ExecMode::NonInteractive);

        transport.push("s1", ChannelMessage::Binary(b"out".to_vec()));
        assert_eq!(
            session.next_event().await,
            Some(ExecEvent::Data { is_error: false, data: b"out".to_vec() })
        );
        transport.push("s2", ChannelMessage::Text("err".into()));
        assert_eq!(
            session.next_event().await,
            Some(ExecEvent::Data { is_error: true, data: b"err".to_vec() })
        );
    }

    #[tokio::test]
    async fn test_control_close_fires_closed_once() {
        let transport = Arc::new(MockChannelTransport::default());
        let mut session = open_session(&four_channels(), &transport).await.unwrap();

        transport.hang_up("sc");
        assert_eq!(session.next_event().await, Some(ExecEvent::Closed));
        assert!(session.is_closed());

        // Remaining channels were force-closed.
        for secret in ["s0", "s1", "s2"] {
            assert!(transport.is_closed(secret), "{secret} still open");
        }

        session.close().await;
        session.close().await;
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn test_explicit_close_is_idempotent() {
        let transport = Arc::new(MockChannelTransport::default());
        let mut session = open_session(&four_channels(), &transport).await.unwrap();

        session.close().await;
        session.close().await;
        assert!(transport.is_closed("sc"));
        assert_eq!(session.next_event().await, Some(ExecEvent::Closed));
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn test_data_delivered_before_close() {
        let transport = Arc::new(MockChannelTransport::default());
        let session = open_session(&four_channels(), &transport).await.unwrap();

        transport.push("s1", ChannelMessage::Binary(b"hello ".to_vec()));
        transport.push("s1", ChannelMessage::Binary(b"world".to_vec()));
        transport.push("s2", ChannelMessage::Binary(b"warn".to_vec()));
        transport.hang_up("s1");
        transport.hang_up("s2");
        // Give the pumps a chance to reach end of stream before control closes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.hang_up("sc");

        let output = session.collect_output().await;
        assert_eq!(output.stdout_lossy(), "hello world");
        assert_eq!(output.stderr_lossy(), "warn");
        assert_eq!(output.exit_code, None);
    }

    #[tokio::test]
    async fn test_failed_open_closes_opened_channels() {
        let transport = Arc::new(MockChannelTransport::default());
        transport.fail_secret("s2");

        let err = open_session(&four_channels(), &transport).await.err().unwrap();
        match err {
            LxdError::ChannelOpen { ref channel, .. } => assert_eq!(channel, "2"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(transport.is_closed("s0"));
        assert!(transport.is_closed("s1"));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let transport = Arc::new(MockChannelTransport::default());
        let session = open_session(&four_channels(), &transport).await.unwrap();

        session.write(b"ls\n").await.unwrap();
        assert_eq!(transport.sent("s0"), vec![ChannelMessage::Binary(b"ls\n".to_vec())]);

        session.close().await;
        assert!(matches!(session.write(b"more").await, Err(LxdError::SessionClosed)));
        assert!(matches!(session.resize(80, 24).await, Err(LxdError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_resize_sends_control_message() {
        let transport = Arc::new(MockChannelTransport::default());
        let session = open_session(&four_channels(), &transport).await.unwrap();

        session.resize(120, 40).await.unwrap();
        let sent = transport.sent("sc");
        assert_eq!(sent.len(), 1);
        let ChannelMessage::Text(text) = &sent[0] else {
            panic!("resize must be a text message");
        };
        let message: Value = serde_json::from_str(text).unwrap();
        assert_eq!(message, json!({"command": "window-resize", "width": 120, "height": 40}));
    }

    #[tokio::test]
    async fn test_interactive_uses_channel_zero_for_both_directions() {
        let transport = Arc::new(MockChannelTransport::default());
        let op = exec_operation(json!({"0": "tty", "control": "ctl"}));
        let mut session = open_session(&op, &transport).await.unwrap();
        assert_eq!(session.mode(), ExecMode::Interactive);

        session.write(b"id\n").await.unwrap();
        assert_eq!(transport.sent("tty").len(), 1);

        transport.push("tty", ChannelMessage::Binary(b"uid=0".to_vec()));
        assert_eq!(
            session.next_event().await,
            Some(ExecEvent::Data { is_error: false, data: b"uid=0".to_vec() })
        );
    }

    #[tokio::test]
    async fn test_unexpected_channel_count_rejected() {
        let transport = Arc::new(MockChannelTransport::default());
        let op = exec_operation(json!({"0": "a", "1": "b", "control": "c"}));
        let err = open_session(&op, &transport).await.err().unwrap();
        assert!(matches!(err, LxdError::Protocol(_)));
        assert!(transport.opened().is_empty());
    }
}
