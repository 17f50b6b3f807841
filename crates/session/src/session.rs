//! The editing session: one event loop over user commands, inference
//! events, frame loads and the resize debounce.
//!
//! [`Session::open`] opens the inference channel and returns the
//! session plus a cloneable [`SessionHandle`]. [`Session::run`] owns
//! all mutable state and handles every input sequentially, so nothing
//! here is behind a lock. Persistence writes go through one
//! [`AnnotationWriter`] in submission order and are only logged; local
//! state stays the visible truth when they fail.

use std::sync::Arc;
use std::time::Duration;

use segmark_core::annotation::{MaskRecord, Point};
use segmark_core::types::{FrameNumber, LabelId, PointId};
use segmark_core::viewport::{Size, Vec2, ViewportState, ZoomDirection};
use segmark_inference::channel::{InferenceChannel, MaskRequest};
use segmark_inference::events::ChannelEvent;
use segmark_persistence::{AnnotationPersistence, MaskCreate, PersistenceError, StoredMask};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::debounce::Debouncer;
use crate::error::SessionError;
use crate::orchestrator::{ClickOutcome, LoadState, MaskGeometry, Orchestrator};
use crate::render::RenderNode;
use crate::writer::{AnnotationWriter, WriteJob};

/// Capacity of the handle-to-session command queue.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// How long closing waits for queued writes before aborting them.
const WRITE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Inputs accepted by the session loop.
#[derive(Debug)]
pub enum SessionCommand {
    LoadFrame(FrameNumber),
    SelectLabel(LabelId),
    /// Add a point for the selected label at a canvas position.
    Click { canvas_pos: Vec2, include: bool },
    RemovePoint { label_id: LabelId, point_id: PointId },
    Pan { dx: f64, dy: f64 },
    Zoom { pointer: Vec2, direction: ZoomDirection },
    Resize(Size),
    FitToView,
    ClearLabel(LabelId),
    ClearAll,
    Snapshot(oneshot::Sender<Snapshot>),
    Close,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaskSummary {
    pub label_id: LabelId,
    pub area: Option<u64>,
    /// Not yet round-tripped through persistence.
    pub preview: bool,
}

/// Read-only view of the session state.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub load_state: LoadState,
    pub frame_number: Option<FrameNumber>,
    pub active_label: Option<LabelId>,
    pub connected: bool,
    pub viewport: ViewportState,
    pub points: Vec<Point>,
    pub masks: Vec<MaskSummary>,
    pub draw_list: Vec<RenderNode>,
    /// Full render rebuilds so far.
    pub syncs: u64,
}

/// Cloneable sender side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn load_frame(&self, frame_number: FrameNumber) -> Result<(), SessionError> {
        self.send(SessionCommand::LoadFrame(frame_number)).await
    }

    pub async fn select_label(&self, label_id: LabelId) -> Result<(), SessionError> {
        self.send(SessionCommand::SelectLabel(label_id)).await
    }

    pub async fn click(&self, canvas_pos: Vec2, include: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::Click {
            canvas_pos,
            include,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Close).await
    }
}

struct FrameLoad {
    frame_number: FrameNumber,
    result: Result<LoadedFrame, PersistenceError>,
}

struct LoadedFrame {
    width: u32,
    height: u32,
    points: Vec<Point>,
    masks: Vec<StoredMask>,
}

pub struct Session<P> {
    config: SessionConfig,
    persistence: Arc<P>,
    channel: InferenceChannel,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    loads_tx: mpsc::UnboundedSender<FrameLoad>,
    loads_rx: mpsc::UnboundedReceiver<FrameLoad>,
    writes: mpsc::UnboundedSender<WriteJob>,
    writer: JoinHandle<()>,
    orchestrator: Orchestrator,
    resize: Debouncer<Size>,
    active_label: Option<LabelId>,
    connected: bool,
}

impl<P: AnnotationPersistence> Session<P> {
    /// Open the inference channel and build an idle session for a
    /// canvas of `canvas` pixels. Must be called from within a tokio
    /// runtime.
    pub fn open(config: SessionConfig, persistence: Arc<P>, canvas: Size) -> (Self, SessionHandle) {
        let (channel, channel_events) = InferenceChannel::open(config.inference());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (loads_tx, loads_rx) = mpsc::unbounded_channel();
        let (writes, write_jobs) = mpsc::unbounded_channel();
        let writer = tokio::spawn(AnnotationWriter::run(Arc::clone(&persistence), write_jobs));

        tracing::info!(project_id = %config.project_id, "Opening session");

        let session = Self {
            orchestrator: Orchestrator::new(canvas, config.zoom),
            resize: Debouncer::new(config.resize_debounce),
            config,
            persistence,
            channel,
            channel_events,
            commands: command_rx,
            loads_tx,
            loads_rx,
            writes,
            writer,
            active_label: None,
            connected: false,
        };
        (
            session,
            SessionHandle {
                commands: command_tx,
            },
        )
    }

    /// Run until [`SessionCommand::Close`] or until every handle is
    /// dropped, then close the inference channel.
    pub async fn run(mut self) {
        loop {
            let resize_at = self.resize.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.channel_events.recv() => {
                    self.handle_channel_event(event).await;
                }
                Some(load) = self.loads_rx.recv() => self.handle_load(load),
                _ = tokio::time::sleep_until(resize_at.unwrap_or_else(Instant::now)),
                    if resize_at.is_some() =>
                {
                    if let Some(canvas) = self.resize.take_due(Instant::now()) {
                        self.orchestrator.resize(canvas);
                    }
                }
            }
        }

        self.close().await;
    }

    async fn close(self) {
        tracing::info!(project_id = %self.config.project_id, "Closing session");
        self.channel.close().await;

        // Closing the queue lets the writer drain what is left and exit.
        drop(self.writes);
        let abort = self.writer.abort_handle();
        if tokio::time::timeout(WRITE_FLUSH_TIMEOUT, self.writer)
            .await
            .is_err()
        {
            tracing::warn!("Pending annotation writes did not finish in time, aborting");
            abort.abort();
        }
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::LoadFrame(frame_number) => self.load_frame(frame_number),
            SessionCommand::SelectLabel(label_id) => {
                tracing::debug!(%label_id, "Selected label");
                self.active_label = Some(label_id);
            }
            SessionCommand::Click {
                canvas_pos,
                include,
            } => self.click(canvas_pos, include).await,
            SessionCommand::RemovePoint { label_id, point_id } => {
                if self.orchestrator.remove_point(label_id, point_id).is_some() {
                    self.points_changed(label_id).await;
                }
            }
            SessionCommand::Pan { dx, dy } => self.orchestrator.pan(dx, dy),
            SessionCommand::Zoom { pointer, direction } => {
                self.orchestrator.zoom(pointer, direction);
            }
            SessionCommand::Resize(canvas) => self.resize.push(canvas, Instant::now()),
            SessionCommand::FitToView => self.orchestrator.fit(),
            SessionCommand::ClearLabel(label_id) => self.clear(Some(label_id)).await,
            SessionCommand::ClearAll => self.clear(None).await,
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            SessionCommand::Close => {}
        }
    }

    fn load_frame(&mut self, frame_number: FrameNumber) {
        self.orchestrator.begin_load(frame_number);

        let persistence = Arc::clone(&self.persistence);
        let loads = self.loads_tx.clone();
        tokio::spawn(async move {
            let result = fetch_frame(persistence.as_ref(), frame_number).await;
            let _ = loads.send(FrameLoad {
                frame_number,
                result,
            });
        });
    }

    async fn click(&mut self, canvas_pos: Vec2, include: bool) {
        let Some(label_id) = self.active_label else {
            tracing::warn!("Click without a selected label");
            return;
        };

        match self.orchestrator.click(canvas_pos, label_id, include) {
            ClickOutcome::Added(point) => {
                tracing::debug!(
                    %label_id,
                    point_id = %point.id,
                    x = point.x,
                    y = point.y,
                    include,
                    "Point added",
                );
                self.points_changed(label_id).await;
            }
            ClickOutcome::Ignored | ClickOutcome::Outside => {}
            ClickOutcome::Rejected(reason) => {
                tracing::warn!(%label_id, reason = %reason, "Point rejected");
            }
        }
    }

    /// Persist the label's points and request a fresh mask; an empty
    /// label drops its mask instead.
    async fn points_changed(&mut self, label_id: LabelId) {
        let Some(frame_number) = self.orchestrator.frame_number() else {
            return;
        };
        let points = self.orchestrator.store().points(label_id).to_vec();

        if points.is_empty() {
            self.orchestrator.drop_mask(label_id);
            self.channel.forget(label_id).await;
            self.queue_write(WriteJob::ClearLabels {
                frame_number,
                label_id: Some(label_id),
            });
            return;
        }

        self.queue_write(WriteJob::SavePoints {
            frame_number,
            label_id,
            points,
        });

        let prompt = match self.orchestrator.store().inference_prompt(label_id) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!(%label_id, error = %e, "No inference prompt");
                return;
            }
        };
        let request = MaskRequest {
            project_id: self.config.project_id,
            frame_number,
            label_id,
            prompt,
        };
        match self.channel.submit(request).await {
            Ok(pending) => {
                tracing::debug!(
                    %label_id,
                    request_id = %pending.request_id(),
                    "Mask requested",
                );
            }
            Err(e) => {
                tracing::warn!(%label_id, error = %e, "Mask not requested");
            }
        }
    }

    async fn clear(&mut self, label_id: Option<LabelId>) {
        let Some(frame_number) = self.orchestrator.frame_number() else {
            tracing::debug!("Ignoring clear while no frame is ready");
            return;
        };

        let outcome = match label_id {
            Some(label_id) => self.orchestrator.clear_label(label_id),
            None => self.orchestrator.clear_all(),
        };
        for label in &outcome.labels {
            self.channel.forget(*label).await;
        }
        if let Some(label) = label_id {
            // A request may be in flight for a label with no local state.
            self.channel.forget(label).await;
        }

        tracing::info!(
            frame_number,
            label_id = ?label_id,
            points_removed = outcome.points_removed,
            masks_removed = outcome.masks_removed,
            "Cleared labels",
        );
        self.queue_write(WriteJob::ClearLabels {
            frame_number,
            label_id,
        });
    }

    fn queue_write(&self, job: WriteJob) {
        if self.writes.send(job).is_err() {
            tracing::error!("Annotation writer stopped, dropping write");
        }
    }

    fn snapshot(&self) -> Snapshot {
        let store = self.orchestrator.store();
        Snapshot {
            load_state: self.orchestrator.load_state(),
            frame_number: self.orchestrator.frame_number(),
            active_label: self.active_label,
            connected: self.connected,
            viewport: *self.orchestrator.viewport(),
            points: store.iter_points().cloned().collect(),
            masks: store
                .iter_masks()
                .map(|(label_id, record)| MaskSummary {
                    label_id,
                    area: self.orchestrator.mask_area(label_id),
                    preview: record.is_preview(),
                })
                .collect(),
            draw_list: self.orchestrator.draw_list().into_iter().cloned().collect(),
            syncs: self.orchestrator.sync_count(),
        }
    }

    // ---- inference events ----

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { at } => {
                tracing::info!(%at, "Inference channel connected");
                self.connected = true;
            }
            ChannelEvent::Disconnected { at } => {
                tracing::warn!(%at, "Inference channel disconnected");
                self.connected = false;
            }
            ChannelEvent::MaskReady(payload) => {
                let label_id = payload.label_id;
                if !self.orchestrator.accepts_mask(label_id, payload.frame_number) {
                    tracing::debug!(
                        %label_id,
                        frame_number = payload.frame_number,
                        request_id = %payload.request_id,
                        "Dropping mask outside the current context",
                    );
                    return;
                }
                let record = MaskRecord::Preview {
                    rle: payload.rle,
                    bbox: payload.bbox,
                };
                if let Some(geometry) = self.orchestrator.apply_mask(label_id, record) {
                    self.persist_mask(payload.frame_number, label_id, geometry);
                }
            }
            ChannelEvent::MaskUnavailable {
                label_id,
                frame_number,
                ..
            } => {
                if self.orchestrator.frame_number() == Some(frame_number) {
                    self.orchestrator.drop_mask(label_id);
                }
            }
            ChannelEvent::RequestFailed {
                label_id, error, ..
            } => {
                tracing::warn!(%label_id, error = %error, "Mask request failed");
            }
            ChannelEvent::RequestTimedOut {
                label_id,
                request_id,
                ..
            } => {
                tracing::warn!(%label_id, request_id = %request_id, "Mask request timed out");
            }
            ChannelEvent::QueueStatus {
                queue_size,
                estimated_wait_ms,
                ..
            } => {
                tracing::debug!(queue_size, estimated_wait_ms, "Inference queue");
            }
        }
    }

    fn persist_mask(&self, frame_number: FrameNumber, label_id: LabelId, geometry: MaskGeometry) {
        if geometry.area == 0 {
            return;
        }
        let mask = MaskCreate {
            contour_polygon: geometry.contour,
            area: geometry.area as f64,
        };
        self.queue_write(WriteJob::SaveMask {
            frame_number,
            label_id,
            mask,
        });
    }

    // ---- frame loads ----

    fn handle_load(&mut self, load: FrameLoad) {
        match load.result {
            Ok(frame) => {
                let masks = frame.masks.into_iter().map(StoredMask::into_record).collect();
                self.orchestrator.finish_load(
                    load.frame_number,
                    frame.width,
                    frame.height,
                    frame.points,
                    masks,
                );
            }
            Err(e) => {
                if self.orchestrator.fail_load(load.frame_number) {
                    tracing::error!(
                        frame_number = load.frame_number,
                        error = %e,
                        "Failed to load frame",
                    );
                }
            }
        }
    }
}

async fn fetch_frame<P: AnnotationPersistence>(
    persistence: &P,
    frame_number: FrameNumber,
) -> Result<LoadedFrame, PersistenceError> {
    let (image, points, masks) = tokio::try_join!(
        persistence.load_frame(frame_number),
        persistence.load_points(frame_number, None),
        persistence.load_masks(frame_number, None),
    )?;
    Ok(LoadedFrame {
        width: image.width(),
        height: image.height(),
        points,
        masks,
    })
}
