//! Inbound frame processing.
//!
//! Parses text frames into [`InboundMessage`]s, applies the staleness
//! rule through the [`RequestTracker`], resolves the matching waiter
//! and emits a [`ChannelEvent`]. Malformed frames are logged and
//! skipped.

use tokio::sync::{mpsc, oneshot};

use crate::channel::{InferenceError, MaskOutcome};
use crate::events::{ChannelEvent, MaskPayload};
use crate::messages::{parse_message, InboundMessage, MaskFailure, MaskResponse, MaskSuccess};
use crate::tracker::{PendingRequest, RequestTracker};

/// Receiving half of a submitted request.
pub type Waiter = oneshot::Sender<Result<MaskOutcome, InferenceError>>;

/// Substrings (lowercase) marking a "model not ready" error.
const NOT_READY_MARKERS: [&str; 3] = ["not ready", "not loaded", "not initialized"];

/// Upper bound on raw frame text echoed into logs.
const LOG_EXCERPT_LEN: usize = 200;

/// Whether an error reported by the service means the model is not
/// ready yet, as opposed to a request failure.
pub fn is_model_not_ready(error: &str) -> bool {
    let lower = error.to_lowercase();
    NOT_READY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Dispatch a single text frame.
pub fn handle_text_message(
    text: &str,
    tracker: &mut RequestTracker<Waiter>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    match parse_message(text) {
        Ok(InboundMessage::Mask(MaskResponse::Success(data))) => {
            handle_success(data, tracker, events);
        }
        Ok(InboundMessage::Mask(MaskResponse::Error(data))) => {
            handle_failure(data, tracker, events);
        }
        Ok(InboundMessage::Queue(status)) => {
            tracing::debug!(
                queue_size = status.queue_size,
                processing = status.processing,
                estimated_wait_ms = status.estimated_wait_ms,
                "Inference queue status",
            );
            let _ = events.send(ChannelEvent::QueueStatus {
                queue_size: status.queue_size,
                processing: status.processing,
                estimated_wait_ms: status.estimated_wait_ms,
            });
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %excerpt(text),
                "Failed to parse inference message",
            );
        }
    }
}

// ---- individual message handlers ----

fn handle_success(
    data: MaskSuccess,
    tracker: &mut RequestTracker<Waiter>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    let Some((pending, waiter)) = claim(tracker, &data.label_id, data.request_id.as_deref())
    else {
        return;
    };

    tracing::debug!(
        label_id = %pending.label_id,
        request_id = %pending.request_id,
        frame_number = pending.frame_number,
        inference_time_ms = data.inference_time_ms,
        "Mask received",
    );

    let payload = MaskPayload {
        label_id: pending.label_id,
        frame_number: pending.frame_number,
        request_id: pending.request_id,
        // A null mask is an empty one: the label's overlay goes away.
        rle: data.mask_rle.unwrap_or_default(),
        bbox: data.mask_bbox,
        inference_time_ms: data.inference_time_ms,
    };
    let _ = waiter.send(Ok(MaskOutcome::Mask(payload.clone())));
    let _ = events.send(ChannelEvent::MaskReady(payload));
}

fn handle_failure(
    data: MaskFailure,
    tracker: &mut RequestTracker<Waiter>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    let Some((pending, waiter)) = claim(tracker, &data.label_id, data.request_id.as_deref())
    else {
        return;
    };

    if is_model_not_ready(&data.error) {
        tracing::warn!(
            label_id = %pending.label_id,
            request_id = %pending.request_id,
            reason = %data.error,
            "Model not ready, no mask for label",
        );
        let _ = waiter.send(Ok(MaskOutcome::Unavailable {
            reason: data.error.clone(),
        }));
        let _ = events.send(ChannelEvent::MaskUnavailable {
            label_id: pending.label_id,
            frame_number: pending.frame_number,
            request_id: pending.request_id,
            reason: data.error,
        });
    } else {
        tracing::error!(
            label_id = %pending.label_id,
            request_id = %pending.request_id,
            error_message = %data.error,
            "Inference request failed",
        );
        let _ = waiter.send(Err(InferenceError::Rejected(data.error.clone())));
        let _ = events.send(ChannelEvent::RequestFailed {
            label_id: pending.label_id,
            frame_number: pending.frame_number,
            request_id: pending.request_id,
            error: data.error,
        });
    }
}

/// Look up the tracker entry a response belongs to, logging stale ones.
fn claim(
    tracker: &mut RequestTracker<Waiter>,
    label_id: &str,
    request_id: Option<&str>,
) -> Option<(PendingRequest, Waiter)> {
    let claimed = uuid::Uuid::parse_str(label_id)
        .ok()
        .and_then(|label| tracker.resolve(label, request_id));

    if claimed.is_none() {
        tracing::debug!(
            label_id = %label_id,
            request_id = ?request_id,
            "Discarding stale inference response",
        );
    }
    claimed
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(LOG_EXCERPT_LEN) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
