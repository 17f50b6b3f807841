//! Events emitted by the inference channel task.
//!
//! Only responses that survive the staleness check become
//! `MaskReady`/`MaskUnavailable`/`RequestFailed`; stale frames never
//! produce an event.

use chrono::{DateTime, Utc};
use segmark_core::types::{FrameNumber, LabelId, RequestId};
use serde::Serialize;

/// A mask accepted as the current result for its label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskPayload {
    pub label_id: LabelId,
    /// Frame the request was issued for.
    pub frame_number: FrameNumber,
    pub request_id: RequestId,
    pub rle: String,
    pub bbox: Option<[i64; 4]>,
    pub inference_time_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// The websocket handshake completed.
    Connected { at: DateTime<Utc> },

    /// The websocket closed or errored; a reconnect is scheduled.
    Disconnected { at: DateTime<Utc> },

    MaskReady(MaskPayload),

    /// The model reported it is not ready; the label has no mask.
    MaskUnavailable {
        label_id: LabelId,
        frame_number: FrameNumber,
        request_id: RequestId,
        reason: String,
    },

    RequestFailed {
        label_id: LabelId,
        frame_number: FrameNumber,
        request_id: RequestId,
        error: String,
    },

    RequestTimedOut {
        label_id: LabelId,
        frame_number: FrameNumber,
        request_id: RequestId,
    },

    QueueStatus {
        queue_size: u32,
        processing: bool,
        estimated_wait_ms: f64,
    },
}
