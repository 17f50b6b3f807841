//! In-memory [`AnnotationPersistence`] for offline sessions and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use segmark_core::annotation::Point;
use segmark_core::types::{FrameNumber, LabelId};
use tokio::sync::Mutex;

use crate::models::{ClearLabelsResponse, FrameImage, MaskCreate, StoredMask};
use crate::{AnnotationPersistence, PersistenceError};

#[derive(Default)]
struct Tables {
    frames: HashMap<FrameNumber, (u32, u32)>,
    points: HashMap<(FrameNumber, LabelId), Vec<Point>>,
    masks: HashMap<(FrameNumber, LabelId), StoredMask>,
}

/// Stores everything in process memory. Frame images are blank RGB
/// canvases of the registered size.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
    load_delay: Option<Duration>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a frame of the given pixel size.
    pub fn with_frame(mut self, frame_number: FrameNumber, width: u32, height: u32) -> Self {
        self.tables
            .get_mut()
            .frames
            .insert(frame_number, (width, height));
        self
    }

    /// Delay every frame load, to observe the loading state.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Make every write fail with a 503.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Number of write calls received, including failed ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    pub async fn insert_frame(&self, frame_number: FrameNumber, width: u32, height: u32) {
        self.tables
            .lock()
            .await
            .frames
            .insert(frame_number, (width, height));
    }

    pub async fn stored_points(&self, frame_number: FrameNumber, label_id: LabelId) -> Vec<Point> {
        self.tables
            .lock()
            .await
            .points
            .get(&(frame_number, label_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn stored_mask(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
    ) -> Option<StoredMask> {
        self.tables
            .lock()
            .await
            .masks
            .get(&(frame_number, label_id))
            .cloned()
    }

    fn begin_write(&self) -> Result<(), PersistenceError> {
        self.writes.fetch_add(1, Ordering::AcqRel);
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(PersistenceError::Api {
                status: 503,
                body: "writes disabled".into(),
            });
        }
        Ok(())
    }
}

fn matches_label(key: &(FrameNumber, LabelId), frame: FrameNumber, label: Option<LabelId>) -> bool {
    key.0 == frame && label.map_or(true, |l| key.1 == l)
}

impl AnnotationPersistence for MemoryPersistence {
    async fn load_frame(&self, frame_number: FrameNumber) -> Result<FrameImage, PersistenceError> {
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        let size = self.tables.lock().await.frames.get(&frame_number).copied();
        let (width, height) = size.ok_or(PersistenceError::FrameNotFound(frame_number))?;
        Ok(FrameImage {
            frame_number,
            image: image::DynamicImage::new_rgb8(width, height),
        })
    }

    async fn load_points(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> Result<Vec<Point>, PersistenceError> {
        let tables = self.tables.lock().await;
        let mut points: Vec<Point> = tables
            .points
            .iter()
            .filter(|(key, _)| matches_label(key, frame_number, label_id))
            .flat_map(|(_, pts)| pts.iter().cloned())
            .collect();
        points.sort_by_key(|p| p.label_id);
        Ok(points)
    }

    async fn save_points(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
        points: Vec<Point>,
    ) -> Result<Vec<Point>, PersistenceError> {
        self.begin_write()?;
        let stored: Vec<Point> = points
            .into_iter()
            .map(|p| Point {
                id: uuid::Uuid::new_v4(),
                label_id,
                ..p
            })
            .collect();
        self.tables
            .lock()
            .await
            .points
            .insert((frame_number, label_id), stored.clone());
        Ok(stored)
    }

    async fn load_masks(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> Result<Vec<StoredMask>, PersistenceError> {
        let tables = self.tables.lock().await;
        let mut masks: Vec<StoredMask> = tables
            .masks
            .iter()
            .filter(|(key, _)| matches_label(key, frame_number, label_id))
            .map(|(_, m)| m.clone())
            .collect();
        masks.sort_by_key(|m| m.label_id);
        Ok(masks)
    }

    async fn save_mask(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
        mask: MaskCreate,
    ) -> Result<StoredMask, PersistenceError> {
        self.begin_write()?;
        let stored = StoredMask {
            id: uuid::Uuid::new_v4(),
            label_id,
            contour_polygon: mask.contour_polygon,
            area: mask.area,
        };
        self.tables
            .lock()
            .await
            .masks
            .insert((frame_number, label_id), stored.clone());
        Ok(stored)
    }

    async fn clear_labels(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> Result<ClearLabelsResponse, PersistenceError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;

        let mut points_deleted = 0u64;
        tables.points.retain(|key, pts| {
            let hit = matches_label(key, frame_number, label_id);
            if hit {
                points_deleted += pts.len() as u64;
            }
            !hit
        });
        let before = tables.masks.len();
        tables
            .masks
            .retain(|key, _| !matches_label(key, frame_number, label_id));
        let masks_deleted = (before - tables.masks.len()) as u64;

        let manually_labeled = tables.points.keys().any(|(f, _)| *f == frame_number);
        Ok(ClearLabelsResponse {
            success: true,
            points_deleted,
            masks_deleted,
            label_id,
            frame_number,
            manually_labeled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn point(label_id: LabelId, x: f64) -> Point {
        Point {
            id: uuid::Uuid::new_v4(),
            x,
            y: 0.5,
            include: true,
            label_id,
        }
    }

    #[tokio::test]
    async fn frame_has_registered_size() {
        let store = MemoryPersistence::new().with_frame(2, 64, 48);
        let frame = store.load_frame(2).await.unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert_matches!(store.load_frame(3).await, Err(PersistenceError::FrameNotFound(3)));
    }

    #[tokio::test]
    async fn save_points_replaces_label_points() {
        let store = MemoryPersistence::new();
        let label = uuid::Uuid::new_v4();
        store.save_points(0, label, vec![point(label, 0.1), point(label, 0.2)]).await.unwrap();
        store.save_points(0, label, vec![point(label, 0.3)]).await.unwrap();

        let loaded = store.load_points(0, Some(label)).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].x, 0.3);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn clear_single_label_keeps_others() {
        let store = MemoryPersistence::new();
        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        store.save_points(0, a, vec![point(a, 0.1)]).await.unwrap();
        store.save_points(0, b, vec![point(b, 0.2)]).await.unwrap();
        store
            .save_mask(0, a, MaskCreate { contour_polygon: vec![[1.0, 1.0]], area: 1.0 })
            .await
            .unwrap();

        let resp = store.clear_labels(0, Some(a)).await.unwrap();
        assert_eq!(resp.points_deleted, 1);
        assert_eq!(resp.masks_deleted, 1);
        assert!(resp.manually_labeled);
        assert_eq!(store.load_points(0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_writes_return_api_error() {
        let store = MemoryPersistence::new();
        store.set_fail_writes(true);
        let result = store.save_points(0, uuid::Uuid::new_v4(), Vec::new()).await;
        assert_matches!(result, Err(PersistenceError::Api { status: 503, .. }));
    }
}
