/// Projects are identified by the UUID assigned by the persistence service.
pub type ProjectId = uuid::Uuid;

/// Labels (object classes) are identified by UUID.
pub type LabelId = uuid::Uuid;

/// Point ids: UUID v4 for locally created points, service-assigned otherwise.
pub type PointId = uuid::Uuid;

/// Frames are 0-indexed.
pub type FrameNumber = u32;

/// Client-generated correlation id for inference requests.
pub type RequestId = String;
