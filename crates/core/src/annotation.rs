//! Per-frame annotation state: prompt points and masks, keyed by label.
//!
//! The store is scoped to a single frame. Points are kept in normalized
//! image coordinates; a label has at most one current mask, and setting
//! a new one replaces the old record entirely.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mask::{self, Bitmap, Contour};
use crate::types::{FrameNumber, LabelId, PointId};
use crate::viewport::Vec2;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A prompt point in normalized image space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub x: f64,
    pub y: f64,
    /// `true` for an include (positive) prompt, `false` for exclude.
    pub include: bool,
    pub label_id: LabelId,
}

/// The current mask of a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskRecord {
    /// Received from the inference channel, not yet round-tripped
    /// through persistence.
    Preview {
        rle: String,
        /// Bounds as reported by the model service.
        bbox: Option<[i64; 4]>,
    },
    /// Loaded from, or written to, the persistence service.
    Persisted {
        label_id: LabelId,
        /// Pixel coordinates.
        contour_polygon: Contour,
        area: f64,
    },
}

impl MaskRecord {
    /// Rasterize this record for an image of `width * height` pixels.
    pub fn to_bitmap(&self, width: u32, height: u32) -> Bitmap {
        match self {
            Self::Preview { rle, .. } => mask::decode(rle, width, height),
            Self::Persisted {
                contour_polygon, ..
            } => mask::fill_contour(contour_polygon, width, height),
        }
    }

    pub fn is_preview(&self) -> bool {
        matches!(self, Self::Preview { .. })
    }
}

/// Prompt payload for one label: positionally aligned coordinates and
/// include flags (`1` include, `0` exclude).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferencePrompt {
    pub points: Vec<[f64; 2]>,
    pub labels: Vec<u8>,
}

/// What a clear operation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearOutcome {
    /// Labels that had points or a mask before the clear.
    pub labels: Vec<LabelId>,
    pub points_removed: usize,
    pub masks_removed: usize,
}

impl ClearOutcome {
    pub fn is_empty(&self) -> bool {
        self.points_removed == 0 && self.masks_removed == 0
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject coordinates outside `[0, 1]²` or non-finite.
///
/// A failure here means the caller's coordinate transform is wrong; it
/// is never a legitimate user action.
pub fn validate_normalized(x: f64, y: f64) -> Result<(), CoreError> {
    let valid = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
    if valid(x) && valid(y) {
        Ok(())
    } else {
        Err(CoreError::OutOfBounds { x, y })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Points and masks of every label on one frame.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    frame_number: FrameNumber,
    points: BTreeMap<LabelId, Vec<Point>>,
    masks: BTreeMap<LabelId, MaskRecord>,
}

impl AnnotationStore {
    pub fn new(frame_number: FrameNumber) -> Self {
        Self {
            frame_number,
            points: BTreeMap::new(),
            masks: BTreeMap::new(),
        }
    }

    pub fn frame_number(&self) -> FrameNumber {
        self.frame_number
    }

    /// Drop everything and rescope the store to another frame.
    pub fn reset(&mut self, frame_number: FrameNumber) {
        self.frame_number = frame_number;
        self.points.clear();
        self.masks.clear();
    }

    /// Append a point to a label.
    ///
    /// Out-of-bounds coordinates are rejected without touching the store.
    pub fn add_point(
        &mut self,
        label_id: LabelId,
        normalized: Vec2,
        include: bool,
    ) -> Result<Point, CoreError> {
        if let Err(e) = validate_normalized(normalized.x, normalized.y) {
            tracing::warn!(
                frame_number = self.frame_number,
                %label_id,
                x = normalized.x,
                y = normalized.y,
                "Rejected point outside normalized bounds",
            );
            return Err(e);
        }

        let point = Point {
            id: uuid::Uuid::new_v4(),
            x: normalized.x,
            y: normalized.y,
            include,
            label_id,
        };
        self.points.entry(label_id).or_default().push(point.clone());
        Ok(point)
    }

    /// Remove a single point. Returns it if it existed.
    pub fn remove_point(&mut self, label_id: LabelId, point_id: PointId) -> Option<Point> {
        let points = self.points.get_mut(&label_id)?;
        let idx = points.iter().position(|p| p.id == point_id)?;
        let removed = points.remove(idx);
        if points.is_empty() {
            self.points.remove(&label_id);
        }
        Some(removed)
    }

    pub fn points(&self, label_id: LabelId) -> &[Point] {
        self.points.get(&label_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of points across all labels.
    pub fn point_count(&self) -> usize {
        self.points.values().map(Vec::len).sum()
    }

    pub fn has_points(&self, label_id: LabelId) -> bool {
        !self.points(label_id).is_empty()
    }

    /// Every label with points or a mask, in a stable order.
    pub fn labels(&self) -> Vec<LabelId> {
        self.points
            .keys()
            .chain(self.masks.keys())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// All points, grouped by label in a stable order.
    pub fn iter_points(&self) -> impl Iterator<Item = &Point> {
        self.points.values().flatten()
    }

    pub fn mask(&self, label_id: LabelId) -> Option<&MaskRecord> {
        self.masks.get(&label_id)
    }

    pub fn iter_masks(&self) -> impl Iterator<Item = (LabelId, &MaskRecord)> {
        self.masks.iter().map(|(id, m)| (*id, m))
    }

    /// Replace the label's mask; returns the superseded record.
    pub fn set_mask(&mut self, label_id: LabelId, record: MaskRecord) -> Option<MaskRecord> {
        self.masks.insert(label_id, record)
    }

    pub fn remove_mask(&mut self, label_id: LabelId) -> Option<MaskRecord> {
        self.masks.remove(&label_id)
    }

    /// Remove every point and the mask of one label. Idempotent.
    pub fn clear_label(&mut self, label_id: LabelId) -> ClearOutcome {
        let points_removed = self.points.remove(&label_id).map_or(0, |p| p.len());
        let masks_removed = usize::from(self.masks.remove(&label_id).is_some());

        let labels = if points_removed + masks_removed > 0 {
            vec![label_id]
        } else {
            Vec::new()
        };
        ClearOutcome {
            labels,
            points_removed,
            masks_removed,
        }
    }

    /// Remove every point and mask on the frame. Idempotent.
    pub fn clear_all(&mut self) -> ClearOutcome {
        let labels = self.labels();
        let points_removed = self.point_count();
        let masks_removed = self.masks.len();
        self.points.clear();
        self.masks.clear();
        ClearOutcome {
            labels,
            points_removed,
            masks_removed,
        }
    }

    /// Wholesale replace a label's state with what persistence returned.
    ///
    /// Points with invalid coordinates are dropped (logged), and every
    /// point is re-tagged with `label_id`.
    pub fn replace_from_persistence(
        &mut self,
        label_id: LabelId,
        points: Vec<Point>,
        mask: Option<MaskRecord>,
    ) {
        let total = points.len();
        let points: Vec<Point> = points
            .into_iter()
            .filter(|p| validate_normalized(p.x, p.y).is_ok())
            .map(|p| Point { label_id, ..p })
            .collect();

        if points.len() != total {
            tracing::warn!(
                frame_number = self.frame_number,
                %label_id,
                dropped = total - points.len(),
                "Dropped persisted points outside normalized bounds",
            );
        }

        if points.is_empty() {
            self.points.remove(&label_id);
        } else {
            self.points.insert(label_id, points);
        }
        match mask {
            Some(record) => {
                self.masks.insert(label_id, record);
            }
            None => {
                self.masks.remove(&label_id);
            }
        }
    }

    /// Build the inference prompt for a label.
    pub fn inference_prompt(&self, label_id: LabelId) -> Result<InferencePrompt, CoreError> {
        let points = self.points(label_id);
        if points.is_empty() {
            return Err(CoreError::EmptyLabel(label_id));
        }
        Ok(InferencePrompt {
            points: points.iter().map(|p| [p.x, p.y]).collect(),
            labels: points.iter().map(|p| u8::from(p.include)).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn label() -> LabelId {
        uuid::Uuid::new_v4()
    }

    fn preview() -> MaskRecord {
        MaskRecord::Preview {
            rle: "0,3;10,2".into(),
            bbox: Some([0, 0, 3, 3]),
        }
    }

    // -- add_point ---------------------------------------------------------

    #[test]
    fn add_point_stores_normalized_point() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        let p = store.add_point(l, Vec2::new(0.25, 0.75), true).unwrap();
        assert_eq!(p.label_id, l);
        assert_eq!(store.points(l), &[p]);
    }

    #[test]
    fn add_point_outside_bounds_rejected() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        let err = store.add_point(l, Vec2::new(1.5, 0.2), true).unwrap_err();
        assert_matches!(err, CoreError::OutOfBounds { .. });
        assert_eq!(store.point_count(), 0);
        assert!(store.labels().is_empty());
    }

    #[test]
    fn add_point_nan_rejected() {
        let mut store = AnnotationStore::new(0);
        assert!(store.add_point(label(), Vec2::new(f64::NAN, 0.5), false).is_err());
        assert_eq!(store.point_count(), 0);
    }

    #[test]
    fn add_point_on_boundary_accepted() {
        let mut store = AnnotationStore::new(0);
        assert!(store.add_point(label(), Vec2::new(0.0, 1.0), true).is_ok());
    }

    // -- remove_point ------------------------------------------------------

    #[test]
    fn remove_last_point_drops_label() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        let p = store.add_point(l, Vec2::new(0.5, 0.5), true).unwrap();
        assert_eq!(store.remove_point(l, p.id), Some(p));
        assert!(!store.has_points(l));
        assert!(store.labels().is_empty());
    }

    #[test]
    fn remove_unknown_point_is_none() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        store.add_point(l, Vec2::new(0.5, 0.5), true).unwrap();
        assert!(store.remove_point(l, uuid::Uuid::new_v4()).is_none());
        assert_eq!(store.point_count(), 1);
    }

    // -- clear -------------------------------------------------------------

    #[test]
    fn clear_label_twice_is_idempotent() {
        let mut store = AnnotationStore::new(3);
        let l = label();
        store.add_point(l, Vec2::new(0.1, 0.1), true).unwrap();
        store.add_point(l, Vec2::new(0.2, 0.2), false).unwrap();
        store.set_mask(l, preview());

        let first = store.clear_label(l);
        assert_eq!(first.points_removed, 2);
        assert_eq!(first.masks_removed, 1);
        assert_eq!(first.labels, vec![l]);

        let second = store.clear_label(l);
        assert!(second.is_empty());
        assert_eq!(store.point_count(), 0);
        assert!(store.mask(l).is_none());
    }

    #[test]
    fn clear_label_leaves_other_labels() {
        let mut store = AnnotationStore::new(0);
        let (a, b) = (label(), label());
        store.add_point(a, Vec2::new(0.1, 0.1), true).unwrap();
        store.add_point(b, Vec2::new(0.9, 0.9), true).unwrap();
        store.clear_label(a);
        assert!(!store.has_points(a));
        assert!(store.has_points(b));
    }

    #[test]
    fn clear_all_reports_every_label() {
        let mut store = AnnotationStore::new(0);
        let (a, b) = (label(), label());
        store.add_point(a, Vec2::new(0.1, 0.1), true).unwrap();
        store.set_mask(b, preview());

        let outcome = store.clear_all();
        assert_eq!(outcome.points_removed, 1);
        assert_eq!(outcome.masks_removed, 1);
        assert_eq!(outcome.labels.len(), 2);
        assert!(store.labels().is_empty());
        assert!(store.clear_all().is_empty());
    }

    // -- masks -------------------------------------------------------------

    #[test]
    fn set_mask_supersedes_previous() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        assert!(store.set_mask(l, preview()).is_none());
        let persisted = MaskRecord::Persisted {
            label_id: l,
            contour_polygon: vec![[1.0, 1.0]],
            area: 1.0,
        };
        assert_eq!(store.set_mask(l, persisted.clone()), Some(preview()));
        assert_eq!(store.mask(l), Some(&persisted));
        assert_eq!(store.iter_masks().count(), 1);
    }

    #[test]
    fn preview_record_decodes() {
        let bitmap = preview().to_bitmap(5, 4);
        assert_eq!(mask::area(&bitmap), 5);
    }

    #[test]
    fn persisted_record_refills_its_contour() {
        let bitmap = mask::decode("0,7;7,1;13,1;14,7", 7, 3);
        let record = MaskRecord::Persisted {
            label_id: label(),
            contour_polygon: mask::trace_contour(&bitmap),
            area: mask::area(&bitmap) as f64,
        };
        assert_eq!(record.to_bitmap(7, 3), bitmap);
    }

    // -- replace_from_persistence ------------------------------------------

    #[test]
    fn replace_from_persistence_is_wholesale() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        store.add_point(l, Vec2::new(0.1, 0.1), true).unwrap();
        store.set_mask(l, preview());

        let other = label();
        let loaded = vec![
            Point { id: uuid::Uuid::new_v4(), x: 0.4, y: 0.4, include: true, label_id: other },
            Point { id: uuid::Uuid::new_v4(), x: 2.0, y: 0.4, include: true, label_id: l },
        ];
        store.replace_from_persistence(l, loaded, None);

        let points = store.points(l);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].x, 0.4);
        assert_eq!(points[0].label_id, l, "re-tagged with the target label");
        assert!(store.mask(l).is_none());
    }

    #[test]
    fn replace_with_nothing_removes_label() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        store.add_point(l, Vec2::new(0.1, 0.1), true).unwrap();
        store.replace_from_persistence(l, Vec::new(), None);
        assert!(store.labels().is_empty());
    }

    // -- inference_prompt --------------------------------------------------

    #[test]
    fn inference_prompt_aligns_points_and_labels() {
        let mut store = AnnotationStore::new(0);
        let l = label();
        store.add_point(l, Vec2::new(0.1, 0.2), true).unwrap();
        store.add_point(l, Vec2::new(0.3, 0.4), false).unwrap();
        let prompt = store.inference_prompt(l).unwrap();
        assert_eq!(prompt.points, vec![[0.1, 0.2], [0.3, 0.4]]);
        assert_eq!(prompt.labels, vec![1, 0]);
    }

    #[test]
    fn inference_prompt_for_empty_label_fails() {
        let store = AnnotationStore::new(0);
        assert_matches!(store.inference_prompt(label()), Err(CoreError::EmptyLabel(_)));
    }

    #[test]
    fn reset_rescopes_frame() {
        let mut store = AnnotationStore::new(0);
        store.add_point(label(), Vec2::new(0.5, 0.5), true).unwrap();
        store.reset(7);
        assert_eq!(store.frame_number(), 7);
        assert_eq!(store.point_count(), 0);
    }
}
