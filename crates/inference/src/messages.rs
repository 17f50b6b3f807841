//! Inference wire messages and parser.
//!
//! Outbound requests are plain JSON objects. Inbound frames are either
//! a mask response tagged by `"status"` or an untagged queue status
//! update; [`parse_message`] tells them apart.

use serde::{Deserialize, Serialize};
use segmark_core::types::{FrameNumber, LabelId, ProjectId, RequestId};

/// Request for one label's mask given its prompt points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    pub project_id: ProjectId,
    pub frame_number: FrameNumber,
    pub label_id: LabelId,
    /// Normalized `[x, y]` pairs.
    pub points: Vec<[f64; 2]>,
    /// `1` include, `0` exclude; aligned with `points`.
    pub labels: Vec<u8>,
    pub request_id: RequestId,
}

/// Every inbound frame the service sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Mask(MaskResponse),
    Queue(QueueStatus),
}

/// Reply to an [`InferenceRequest`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MaskResponse {
    Success(MaskSuccess),
    Error(MaskFailure),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaskSuccess {
    /// Kept as text; an unparseable id makes the response stale.
    pub label_id: String,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    /// `null` when the model found nothing to segment.
    #[serde(default)]
    pub mask_rle: Option<String>,
    /// `[x, y, width, height]` in pixels, passed through untouched.
    #[serde(default)]
    pub mask_bbox: Option<[i64; 4]>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub frame_number: Option<FrameNumber>,
    #[serde(default)]
    pub inference_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaskFailure {
    #[serde(default)]
    pub label_id: String,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub error: String,
    #[serde(default)]
    pub frame_number: Option<FrameNumber>,
}

/// Server-side queue depth broadcast.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueStatus {
    pub queue_size: u32,
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub estimated_wait_ms: f64,
}

/// Parse an inbound text frame.
///
/// Returns `Err` for malformed JSON or unrecognized shapes; callers log
/// and continue.
pub fn parse_message(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}
