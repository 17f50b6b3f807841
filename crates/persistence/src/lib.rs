//! Persistence of points, masks and frame images.
//!
//! [`AnnotationPersistence`] is the seam the session depends on.
//! [`api::PersistenceApi`] implements it over the REST service and
//! [`memory::MemoryPersistence`] in memory.

use std::future::Future;

use segmark_core::annotation::Point;
use segmark_core::types::{FrameNumber, LabelId};

pub mod api;
pub mod memory;
pub mod models;

pub use api::{PersistenceApi, PersistenceError};
pub use models::{ClearLabelsResponse, FrameImage, MaskCreate, StoredMask};

/// Storage operations for one project.
///
/// `label_id: None` means "every label" wherever it is accepted.
pub trait AnnotationPersistence: Send + Sync + 'static {
    /// Fetch and decode the image of a frame.
    fn load_frame(
        &self,
        frame_number: FrameNumber,
    ) -> impl Future<Output = Result<FrameImage, PersistenceError>> + Send;

    fn load_points(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> impl Future<Output = Result<Vec<Point>, PersistenceError>> + Send;

    /// Replace the stored points of a label with `points`.
    fn save_points(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
        points: Vec<Point>,
    ) -> impl Future<Output = Result<Vec<Point>, PersistenceError>> + Send;

    fn load_masks(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> impl Future<Output = Result<Vec<StoredMask>, PersistenceError>> + Send;

    /// Store the mask of a label, replacing any previous one.
    fn save_mask(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
        mask: MaskCreate,
    ) -> impl Future<Output = Result<StoredMask, PersistenceError>> + Send;

    /// Delete points and masks of one label, or of all labels.
    fn clear_labels(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> impl Future<Output = Result<ClearLabelsResponse, PersistenceError>> + Send;
}
