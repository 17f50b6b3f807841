//! The inference channel: one persistent websocket and its task.
//!
//! [`InferenceChannel::open`] spawns a single task that owns the
//! connection, the [`RequestTracker`] and the reconnect schedule. The
//! returned handle only passes messages to that task, so no lock ever
//! guards tracker state.
//!
//! Unacknowledged requests are never replayed after a reconnect; their
//! waiters resolve through the timeout sweep instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use segmark_core::annotation::InferencePrompt;
use segmark_core::types::{FrameNumber, LabelId, ProjectId, RequestId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::client::{InferenceClient, InferenceStream};
use crate::events::{ChannelEvent, MaskPayload};
use crate::messages::InferenceRequest;
use crate::processor::{handle_text_message, Waiter};
use crate::reconnect::{Backoff, ReconnectConfig};
use crate::tracker::{PendingRequest, RequestTracker};

/// Default bounded wait for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often overdue requests are swept.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on a single websocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the handle-to-task command queue.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// How long [`InferenceChannel::close`] waits for the task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<InferenceStream, Message>;
type WsSource = SplitStream<InferenceStream>;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub ws_url: String,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl InferenceConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// A mask request for one label.
#[derive(Debug, Clone)]
pub struct MaskRequest {
    pub project_id: ProjectId,
    pub frame_number: FrameNumber,
    pub label_id: LabelId,
    pub prompt: InferencePrompt,
}

/// Successful resolution of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum MaskOutcome {
    Mask(MaskPayload),
    /// The model is not ready; the label has no mask.
    Unavailable { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference channel is not connected")]
    NotConnected,

    #[error("Request superseded by a newer request for the same label")]
    Superseded,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out")]
    TimedOut,

    #[error("Inference service rejected the request: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Inference channel closed")]
    Closed,
}

/// Awaitable result of [`InferenceChannel::submit`].
///
/// Dropping it is fine; the channel still emits the matching
/// [`ChannelEvent`].
#[derive(Debug)]
pub struct PendingMask {
    request_id: RequestId,
    label_id: LabelId,
    rx: oneshot::Receiver<Result<MaskOutcome, InferenceError>>,
}

impl PendingMask {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn label_id(&self) -> LabelId {
        self.label_id
    }

    pub async fn wait(self) -> Result<MaskOutcome, InferenceError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Closed),
        }
    }
}

enum Command {
    Submit {
        request: InferenceRequest,
        waiter: Waiter,
    },
    Forget(LabelId),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the running channel task.
pub struct InferenceChannel {
    commands: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task_handle: tokio::task::JoinHandle<()>,
}

impl InferenceChannel {
    /// Spawn the connection task and return the handle plus the event
    /// stream. Must be called from within a tokio runtime.
    pub fn open(config: InferenceConfig) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = ChannelTask {
            client: InferenceClient::new(config.ws_url.clone()),
            backoff: Backoff::new(config.reconnect.clone()),
            config,
            tracker: RequestTracker::new(),
            events: event_tx,
            connected: Arc::clone(&connected),
            sink: None,
        };

        let task_cancel = cancel.clone();
        let task_handle = tokio::spawn(async move {
            tracing::info!(ws_url = %task.client.ws_url(), "Starting inference channel task");
            task.run(command_rx, task_cancel).await;
            tracing::info!("Inference channel task exited");
        });

        let channel = Self {
            commands: command_tx,
            connected,
            cancel,
            task_handle,
        };
        (channel, event_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send a mask request; it becomes the latest request of its label.
    ///
    /// Fails immediately with [`InferenceError::NotConnected`] while the
    /// socket is down. Nothing is queued for later delivery.
    pub async fn submit(&self, request: MaskRequest) -> Result<PendingMask, InferenceError> {
        if !self.is_connected() {
            return Err(InferenceError::NotConnected);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (waiter, rx) = oneshot::channel();
        let wire = InferenceRequest {
            project_id: request.project_id,
            frame_number: request.frame_number,
            label_id: request.label_id,
            points: request.prompt.points,
            labels: request.prompt.labels,
            request_id: request_id.clone(),
        };

        self.commands
            .send(Command::Submit {
                request: wire,
                waiter,
            })
            .await
            .map_err(|_| InferenceError::Closed)?;

        Ok(PendingMask {
            request_id,
            label_id: request.label_id,
            rx,
        })
    }

    /// Stop tracking a label so any in-flight response for it is stale.
    pub async fn forget(&self, label_id: LabelId) {
        let _ = self.commands.send(Command::Forget(label_id)).await;
    }

    /// Cancel the task and wait for it to exit.
    pub async fn close(self) {
        tracing::info!("Closing inference channel");
        self.cancel.cancel();

        let abort = self.task_handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task_handle)
            .await
            .is_err()
        {
            tracing::warn!("Inference channel task did not exit in time, aborting");
            abort.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct ChannelTask {
    client: InferenceClient,
    config: InferenceConfig,
    backoff: Backoff,
    tracker: RequestTracker<Waiter>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: Arc<AtomicBool>,
    sink: Option<WsSink>,
}

impl ChannelTask {
    /// Core loop: connect -> process frames and commands -> reconnect.
    ///
    /// Runs until cancelled or every handle is dropped.
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut source: Option<WsSource> = None;
        let mut retry_at = Instant::now();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.expire_overdue(),
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        source = None;
                        retry_at = self.on_disconnect();
                    }
                }
                _ = tokio::time::sleep_until(retry_at), if source.is_none() => {
                    match self.connect().await {
                        Some(stream) => source = Some(stream),
                        None => retry_at = Instant::now() + self.backoff.next_delay(),
                    }
                }
                frame = next_frame(&mut source) => {
                    if !self.handle_frame(frame) {
                        source = None;
                        retry_at = self.on_disconnect();
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn connect(&mut self) -> Option<WsSource> {
        let conn = match self.client.connect_within(self.config.connect_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Inference connection attempt failed");
                return None;
            }
        };

        let (sink, source) = conn.ws_stream.split();
        self.sink = Some(sink);
        self.backoff.reset();
        self.connected.store(true, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Connected {
            at: conn.connected_at,
        });
        Some(source)
    }

    /// Mark the socket down and return when to try again.
    fn on_disconnect(&mut self) -> Instant {
        self.sink = None;
        self.connected.store(false, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Disconnected {
            at: chrono::Utc::now(),
        });

        let delay = self.backoff.next_delay();
        tracing::info!(
            pending = self.tracker.len(),
            delay_ms = delay.as_millis() as u64,
            "Inference connection lost, scheduling reconnect",
        );
        Instant::now() + delay
    }

    /// Returns `false` if the socket failed while sending.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Forget(label_id) => {
                if let Some((pending, waiter)) = self.tracker.forget(label_id) {
                    tracing::debug!(
                        %label_id,
                        request_id = %pending.request_id,
                        "Forgot in-flight request",
                    );
                    let _ = waiter.send(Err(InferenceError::Cancelled));
                }
                true
            }
            Command::Submit { request, waiter } => self.send_request(request, waiter).await,
        }
    }

    async fn send_request(&mut self, request: InferenceRequest, waiter: Waiter) -> bool {
        let Some(sink) = self.sink.as_mut() else {
            let _ = waiter.send(Err(InferenceError::NotConnected));
            return true;
        };

        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                let _ = waiter.send(Err(InferenceError::Transport(e.to_string())));
                return true;
            }
        };

        let label_id = request.label_id;
        let pending = PendingRequest {
            request_id: request.request_id,
            label_id,
            frame_number: request.frame_number,
            sent_at: Instant::now(),
        };
        tracing::debug!(
            %label_id,
            request_id = %pending.request_id,
            frame_number = pending.frame_number,
            points = request.points.len(),
            "Sending inference request",
        );

        if let Some((old, old_waiter)) = self.tracker.begin(pending, waiter) {
            tracing::debug!(
                %label_id,
                request_id = %old.request_id,
                "Superseded in-flight request",
            );
            let _ = old_waiter.send(Err(InferenceError::Superseded));
        }

        match sink.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%label_id, error = %e, "Failed to send inference request");
                if let Some((_, waiter)) = self.tracker.forget(label_id) {
                    let _ = waiter.send(Err(InferenceError::Transport(e.to_string())));
                }
                false
            }
        }
    }

    /// Returns `false` when the connection is gone.
    fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) -> bool {
        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(&text, &mut self.tracker, &self.events);
                true
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary frame");
                true
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => true,
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "Inference websocket closed");
                false
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Inference websocket receive error");
                false
            }
            None => {
                tracing::info!("Inference websocket stream ended");
                false
            }
        }
    }

    fn expire_overdue(&mut self) {
        let expired = self
            .tracker
            .expire(Instant::now(), self.config.request_timeout);

        for (pending, waiter) in expired {
            tracing::warn!(
                label_id = %pending.label_id,
                request_id = %pending.request_id,
                timeout_ms = self.config.request_timeout.as_millis() as u64,
                "Inference request timed out",
            );
            let _ = waiter.send(Err(InferenceError::TimedOut));
            let _ = self.events.send(ChannelEvent::RequestTimedOut {
                label_id: pending.label_id,
                frame_number: pending.frame_number,
                request_id: pending.request_id,
            });
        }
    }

    async fn shutdown(&mut self) {
        for (_, waiter) in self.tracker.drain() {
            let _ = waiter.send(Err(InferenceError::Closed));
        }
        self.connected.store(false, Ordering::Release);
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
    }
}

/// Next frame from the socket, or never while disconnected.
async fn next_frame(source: &mut Option<WsSource>) -> Option<Result<Message, tungstenite::Error>> {
    match source {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
