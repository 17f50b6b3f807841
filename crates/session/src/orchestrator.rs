//! Render/sync orchestration for the displayed frame.
//!
//! Owns the annotation store, the viewport, the render tree and its
//! handle registry, plus a per-label cache of decoded masks. Every
//! transform change rebuilds canvas geometry from image-space state;
//! nothing is kept in canvas coordinates across a transform change.

use std::collections::{BTreeMap, HashMap};

use segmark_core::annotation::{AnnotationStore, ClearOutcome, MaskRecord, Point};
use segmark_core::mask::{self, Bitmap, Contour};
use segmark_core::types::{FrameNumber, LabelId, PointId};
use segmark_core::viewport::{Size, Vec2, Viewport, ViewportState, ZoomDirection, ZoomLimits};
use serde::Serialize;

use crate::registry::HandleRegistry;
use crate::render::{
    label_color, marker_color, Layer, NodeId, NodeTag, RenderNode, RenderTree, Visual,
    MARKER_RADIUS,
};

/// Per-frame load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    Loading { frame_number: FrameNumber },
    Ready,
}

/// What a click did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    Added(Point),
    /// No frame is ready; the click was dropped, not queued.
    Ignored,
    /// The pointer was outside the image.
    Outside,
    Rejected(String),
}

/// Persisted form of a decoded mask.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskGeometry {
    pub contour: Contour,
    pub area: u64,
    /// `[x, y, width, height]` in pixels.
    pub bbox: Option<[u32; 4]>,
}

#[derive(Debug)]
struct CachedMask {
    bitmap: Bitmap,
    area: u64,
}

#[derive(Debug, Clone, Copy)]
struct FrameInfo {
    frame_number: FrameNumber,
    width: u32,
    height: u32,
}

pub struct Orchestrator {
    state: LoadState,
    frame: Option<FrameInfo>,
    store: AnnotationStore,
    viewport: Viewport,
    tree: RenderTree,
    registry: HandleRegistry,
    masks: HashMap<LabelId, CachedMask>,
    syncs: u64,
}

impl Orchestrator {
    pub fn new(canvas: Size, limits: ZoomLimits) -> Self {
        Self {
            state: LoadState::Idle,
            frame: None,
            store: AnnotationStore::new(0),
            viewport: Viewport::new(Size::default(), canvas, limits),
            tree: RenderTree::new(),
            registry: HandleRegistry::new(),
            masks: HashMap::new(),
            syncs: 0,
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LoadState::Ready
    }

    /// The displayed frame, once loaded.
    pub fn frame_number(&self) -> Option<FrameNumber> {
        self.frame.map(|f| f.frame_number)
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn viewport(&self) -> &ViewportState {
        self.viewport.state()
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Number of full rebuilds so far.
    pub fn sync_count(&self) -> u64 {
        self.syncs
    }

    // ---- frame loading ----

    /// Enter `Loading` for `frame_number`, dropping the current frame.
    pub fn begin_load(&mut self, frame_number: FrameNumber) {
        tracing::info!(frame_number, "Loading frame");
        self.state = LoadState::Loading { frame_number };
        self.frame = None;
        self.store.reset(frame_number);
        self.masks.clear();
        self.tree.clear();
        self.registry.clear();
    }

    /// Install a completed load. Returns `false` (and changes nothing)
    /// if it is not for the frame currently being loaded.
    pub fn finish_load(
        &mut self,
        frame_number: FrameNumber,
        width: u32,
        height: u32,
        points: Vec<Point>,
        masks: Vec<MaskRecord>,
    ) -> bool {
        if self.state != (LoadState::Loading { frame_number }) {
            tracing::debug!(frame_number, state = ?self.state, "Discarding stale frame load");
            return false;
        }

        self.frame = Some(FrameInfo {
            frame_number,
            width,
            height,
        });
        self.viewport
            .set_image(Size::new(f64::from(width), f64::from(height)));

        let mut by_label: BTreeMap<LabelId, (Vec<Point>, Option<MaskRecord>)> = BTreeMap::new();
        for point in points {
            by_label.entry(point.label_id).or_default().0.push(point);
        }
        for record in masks {
            if let MaskRecord::Persisted { label_id, .. } = &record {
                let label_id = *label_id;
                by_label.entry(label_id).or_default().1 = Some(record);
            }
        }

        for (label_id, (points, mask)) in by_label {
            self.store.replace_from_persistence(label_id, points, mask);
        }
        let labels: Vec<LabelId> = self.store.iter_masks().map(|(id, _)| id).collect();
        for label_id in labels {
            self.decode_mask(label_id);
        }

        self.state = LoadState::Ready;
        tracing::info!(
            frame_number,
            width,
            height,
            points = self.store.point_count(),
            masks = self.masks.len(),
            "Frame ready",
        );
        self.sync();
        true
    }

    /// A load failed. Returns `false` if it was not the current load.
    pub fn fail_load(&mut self, frame_number: FrameNumber) -> bool {
        if self.state != (LoadState::Loading { frame_number }) {
            return false;
        }
        self.state = LoadState::Idle;
        true
    }

    // ---- annotation ----

    /// Turn a canvas click into a point on `label_id`.
    pub fn click(&mut self, canvas_pos: Vec2, label_id: LabelId, include: bool) -> ClickOutcome {
        if !self.is_ready() {
            tracing::debug!(state = ?self.state, "Ignoring click while frame is not ready");
            return ClickOutcome::Ignored;
        }
        let Some(normalized) = self.viewport.state().canvas_to_normalized(canvas_pos) else {
            return ClickOutcome::Outside;
        };

        match self.store.add_point(label_id, normalized, include) {
            Ok(point) => {
                self.insert_marker(&point);
                ClickOutcome::Added(point)
            }
            Err(e) => ClickOutcome::Rejected(e.to_string()),
        }
    }

    pub fn remove_point(&mut self, label_id: LabelId, point_id: PointId) -> Option<Point> {
        let removed = self.store.remove_point(label_id, point_id)?;
        let tag = NodeTag::Point(point_id);
        self.tree.remove_tagged(&tag);
        self.registry.remove(&tag);
        Some(removed)
    }

    /// Whether a mask for `label_id` computed on `frame_number` may be
    /// painted now.
    pub fn accepts_mask(&self, label_id: LabelId, frame_number: FrameNumber) -> bool {
        self.is_ready()
            && self.frame_number() == Some(frame_number)
            && self.store.has_points(label_id)
    }

    /// Make `record` the label's mask and repaint its overlay.
    ///
    /// Returns the decoded geometry, or `None` when no frame is loaded.
    pub fn apply_mask(&mut self, label_id: LabelId, record: MaskRecord) -> Option<MaskGeometry> {
        self.frame?;
        self.store.set_mask(label_id, record);
        self.decode_mask(label_id);

        let tag = NodeTag::Mask(label_id);
        let removed = self.tree.remove_tagged(&tag);
        self.registry.remove(&tag);
        if removed > 0 {
            tracing::trace!(%label_id, removed, "Removed superseded mask overlays");
        }
        self.insert_overlay(label_id);

        let cached = self.masks.get(&label_id)?;
        Some(MaskGeometry {
            contour: mask::trace_contour(&cached.bitmap),
            area: cached.area,
            bbox: mask::bounding_box(&cached.bitmap),
        })
    }

    /// Remove the label's mask and overlay, keeping its points.
    pub fn drop_mask(&mut self, label_id: LabelId) -> bool {
        let had = self.store.remove_mask(label_id).is_some();
        self.masks.remove(&label_id);
        let tag = NodeTag::Mask(label_id);
        self.tree.remove_tagged(&tag);
        self.registry.remove(&tag);
        had
    }

    pub fn clear_label(&mut self, label_id: LabelId) -> ClearOutcome {
        let outcome = self.store.clear_label(label_id);
        self.masks.remove(&label_id);
        self.sync();
        outcome
    }

    pub fn clear_all(&mut self) -> ClearOutcome {
        let outcome = self.store.clear_all();
        self.masks.clear();
        self.sync();
        outcome
    }

    // ---- viewport ----

    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.viewport.pan_by(dx, dy);
        self.sync();
    }

    pub fn zoom(&mut self, pointer: Vec2, direction: ZoomDirection) {
        self.viewport.zoom_at(pointer, direction);
        self.sync();
    }

    pub fn resize(&mut self, canvas: Size) {
        self.viewport.resize(canvas);
        self.sync();
    }

    pub fn fit(&mut self) {
        self.viewport.fit();
        self.sync();
    }

    // ---- rendering ----

    /// Rebuild the render tree and registry from the store, the mask
    /// cache and the current viewport.
    pub fn sync(&mut self) {
        self.tree.clear();
        self.registry.clear();
        self.syncs += 1;

        let Some(frame) = self.frame else {
            return;
        };
        let (origin, size) = self.viewport.state().image_rect();
        let node = self.tree.insert(
            Layer::BaseImage,
            NodeTag::Image,
            Visual::Image {
                frame_number: frame.frame_number,
                origin,
                size,
            },
        );
        self.registry.insert(NodeTag::Image, node);

        let labels: Vec<LabelId> = self.store.iter_masks().map(|(id, _)| id).collect();
        for label_id in labels {
            self.insert_overlay(label_id);
        }
        let points: Vec<Point> = self.store.iter_points().cloned().collect();
        for point in &points {
            self.insert_marker(point);
        }
    }

    pub fn draw_list(&self) -> Vec<&RenderNode> {
        self.tree.draw_list()
    }

    /// Render node currently drawing `tag`.
    pub fn handle(&self, tag: &NodeTag) -> Option<NodeId> {
        self.registry.get(tag)
    }

    pub fn mask_area(&self, label_id: LabelId) -> Option<u64> {
        self.masks.get(&label_id).map(|m| m.area)
    }

    /// Decoded image-space overlay raster of a label.
    pub fn overlay_image(&self, label_id: LabelId) -> Option<image::RgbaImage> {
        self.masks
            .get(&label_id)
            .map(|m| mask::render_overlay(&m.bitmap, label_color(label_id)))
    }

    fn decode_mask(&mut self, label_id: LabelId) {
        let (Some(frame), Some(record)) = (self.frame, self.store.mask(label_id)) else {
            self.masks.remove(&label_id);
            return;
        };
        let bitmap = record.to_bitmap(frame.width, frame.height);
        let area = mask::area(&bitmap);
        self.masks.insert(label_id, CachedMask { bitmap, area });
    }

    fn insert_overlay(&mut self, label_id: LabelId) {
        let Some(cached) = self.masks.get(&label_id) else {
            return;
        };
        if cached.area == 0 {
            return;
        }
        let (origin, size) = self.viewport.state().image_rect();
        let tag = NodeTag::Mask(label_id);
        let node = self.tree.insert(
            Layer::MaskOverlay,
            tag,
            Visual::Overlay {
                label_id,
                origin,
                size,
                color: label_color(label_id),
                area: cached.area,
            },
        );
        self.registry.insert(tag, node);
    }

    fn insert_marker(&mut self, point: &Point) {
        let center = self
            .viewport
            .state()
            .normalized_to_canvas(Vec2::new(point.x, point.y));
        let tag = NodeTag::Point(point.id);
        let node = self.tree.insert(
            Layer::PointMarker,
            tag,
            Visual::Marker {
                center,
                radius: MARKER_RADIUS,
                color: marker_color(point.include),
                include: point.include,
            },
        );
        self.registry.insert(tag, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const EPS: f64 = 1e-9;

    fn ready(width: u32, height: u32, canvas: Size) -> Orchestrator {
        let mut orch = Orchestrator::new(canvas, ZoomLimits::default());
        orch.begin_load(0);
        assert!(orch.finish_load(0, width, height, Vec::new(), Vec::new()));
        orch
    }

    fn layers(orch: &Orchestrator) -> Vec<Layer> {
        orch.draw_list().iter().map(|n| n.layer).collect()
    }

    // -- loading -----------------------------------------------------------

    #[test]
    fn click_while_loading_is_ignored() {
        let mut orch = Orchestrator::new(Size::new(500.0, 500.0), ZoomLimits::default());
        orch.begin_load(1);
        let outcome = orch.click(Vec2::new(10.0, 10.0), uuid::Uuid::new_v4(), true);
        assert_eq!(outcome, ClickOutcome::Ignored);
        assert_eq!(orch.store().point_count(), 0);
    }

    #[test]
    fn stale_load_is_discarded() {
        let mut orch = Orchestrator::new(Size::new(500.0, 500.0), ZoomLimits::default());
        orch.begin_load(1);
        orch.begin_load(2);
        assert!(!orch.finish_load(1, 100, 100, Vec::new(), Vec::new()));
        assert_eq!(orch.load_state(), LoadState::Loading { frame_number: 2 });
        assert!(orch.finish_load(2, 100, 100, Vec::new(), Vec::new()));
        assert_eq!(orch.frame_number(), Some(2));
    }

    #[test]
    fn failed_load_returns_to_idle() {
        let mut orch = Orchestrator::new(Size::new(500.0, 500.0), ZoomLimits::default());
        orch.begin_load(4);
        assert!(!orch.fail_load(3));
        assert!(orch.fail_load(4));
        assert_eq!(orch.load_state(), LoadState::Idle);
    }

    #[test]
    fn load_installs_persisted_state() {
        let mut orch = Orchestrator::new(Size::new(100.0, 100.0), ZoomLimits::default());
        let label = uuid::Uuid::new_v4();
        let point = Point {
            id: uuid::Uuid::new_v4(),
            x: 0.5,
            y: 0.5,
            include: true,
            label_id: label,
        };
        // Pixels 1..=3 on both axes.
        let contour = vec![[1.0, 1.0], [4.0, 1.0], [4.0, 4.0], [1.0, 4.0], [1.0, 1.0]];
        let record = MaskRecord::Persisted {
            label_id: label,
            contour_polygon: contour,
            area: 9.0,
        };

        orch.begin_load(0);
        assert!(orch.finish_load(0, 10, 10, vec![point], vec![record]));
        assert_eq!(orch.mask_area(label), Some(9));
        assert_eq!(layers(&orch), vec![Layer::BaseImage, Layer::MaskOverlay, Layer::PointMarker]);
    }

    // -- clicks ------------------------------------------------------------

    #[test]
    fn click_maps_through_viewport() {
        let mut orch = ready(1000, 1000, Size::new(500.0, 500.0));
        let label = uuid::Uuid::new_v4();
        let outcome = orch.click(Vec2::new(250.0, 250.0), label, true);
        match outcome {
            ClickOutcome::Added(p) => {
                assert!((p.x - 0.5).abs() < EPS);
                assert!((p.y - 0.5).abs() < EPS);
            }
            other => panic!("Expected Added, got {other:?}"),
        }
        assert_eq!(orch.registry().len(), 2, "image + marker");
    }

    #[test]
    fn click_outside_image() {
        let mut orch = ready(100, 50, Size::new(100.0, 100.0));
        // Image occupies y in [25, 75].
        let outcome = orch.click(Vec2::new(50.0, 5.0), uuid::Uuid::new_v4(), true);
        assert_eq!(outcome, ClickOutcome::Outside);
    }

    // -- masks -------------------------------------------------------------

    #[test]
    fn apply_mask_replaces_overlay() {
        let mut orch = ready(5, 4, Size::new(5.0, 4.0));
        let label = uuid::Uuid::new_v4();
        orch.click(Vec2::new(1.0, 1.0), label, true);

        let first = MaskRecord::Preview { rle: "0,3;10,2".into(), bbox: None };
        let geometry = orch.apply_mask(label, first).unwrap();
        assert_eq!(geometry.area, 5);

        let second = MaskRecord::Preview { rle: "0,1".into(), bbox: None };
        orch.apply_mask(label, second);
        let overlays = orch
            .draw_list()
            .iter()
            .filter(|n| n.tag == NodeTag::Mask(label))
            .count();
        assert_eq!(overlays, 1);
        assert_eq!(orch.mask_area(label), Some(1));
    }

    #[test]
    fn empty_mask_removes_overlay() {
        let mut orch = ready(5, 4, Size::new(5.0, 4.0));
        let label = uuid::Uuid::new_v4();
        orch.click(Vec2::new(1.0, 1.0), label, true);
        orch.apply_mask(label, MaskRecord::Preview { rle: "0,3".into(), bbox: None });
        assert!(orch.handle(&NodeTag::Mask(label)).is_some());

        let geometry = orch
            .apply_mask(label, MaskRecord::Preview { rle: String::new(), bbox: None })
            .unwrap();
        assert_eq!(geometry.area, 0);
        assert!(orch.handle(&NodeTag::Mask(label)).is_none());
        assert_eq!(layers(&orch), vec![Layer::BaseImage, Layer::PointMarker]);
    }

    #[test]
    fn draw_order_holds_after_late_mask() {
        let mut orch = ready(5, 4, Size::new(5.0, 4.0));
        let label = uuid::Uuid::new_v4();
        orch.click(Vec2::new(1.0, 1.0), label, true);
        orch.apply_mask(label, MaskRecord::Preview { rle: "0,3".into(), bbox: None });
        assert_eq!(layers(&orch), vec![Layer::BaseImage, Layer::MaskOverlay, Layer::PointMarker]);
    }

    #[test]
    fn accepts_mask_context_check() {
        let mut orch = ready(10, 10, Size::new(10.0, 10.0));
        let label = uuid::Uuid::new_v4();
        assert!(!orch.accepts_mask(label, 0), "label without points");

        orch.click(Vec2::new(5.0, 5.0), label, true);
        assert!(orch.accepts_mask(label, 0));
        assert!(!orch.accepts_mask(label, 1), "other frame");

        orch.clear_label(label);
        assert!(!orch.accepts_mask(label, 0), "cleared label");
    }

    #[test]
    fn drop_mask_keeps_points() {
        let mut orch = ready(5, 4, Size::new(5.0, 4.0));
        let label = uuid::Uuid::new_v4();
        orch.click(Vec2::new(1.0, 1.0), label, true);
        orch.apply_mask(label, MaskRecord::Preview { rle: "0,3".into(), bbox: None });
        assert!(orch.drop_mask(label));
        assert!(orch.handle(&NodeTag::Mask(label)).is_none());
        assert!(orch.store().has_points(label));
    }

    #[test]
    fn overlay_raster_stays_image_sized() {
        let mut orch = ready(5, 4, Size::new(50.0, 40.0));
        let label = uuid::Uuid::new_v4();
        // Unscaled image centered at (22.5, 18).
        orch.click(Vec2::new(24.0, 20.0), label, true);
        orch.apply_mask(label, MaskRecord::Preview { rle: "0,3".into(), bbox: None });
        orch.zoom(Vec2::new(24.0, 20.0), ZoomDirection::In);

        let raster = orch.overlay_image(label).unwrap();
        assert_eq!(raster.dimensions(), (5, 4));
    }

    // -- viewport ----------------------------------------------------------

    #[test]
    fn pan_moves_markers_with_image() {
        let mut orch = ready(100, 100, Size::new(100.0, 100.0));
        let label = uuid::Uuid::new_v4();
        let ClickOutcome::Added(point) = orch.click(Vec2::new(50.0, 50.0), label, true) else {
            panic!("click not added");
        };
        orch.pan(10.0, -5.0);

        let node = orch.handle(&NodeTag::Point(point.id)).unwrap();
        let marker = orch.draw_list().into_iter().find(|n| n.id == node).unwrap();
        assert_matches!(
            marker.visual,
            Visual::Marker { center, .. }
                if (center.x - 60.0).abs() < EPS && (center.y - 45.0).abs() < EPS
        );
    }

    #[test]
    fn clear_all_leaves_only_image() {
        let mut orch = ready(10, 10, Size::new(10.0, 10.0));
        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        orch.click(Vec2::new(1.0, 1.0), a, true);
        orch.click(Vec2::new(2.0, 2.0), b, false);
        let outcome = orch.clear_all();
        assert_eq!(outcome.points_removed, 2);
        assert_eq!(layers(&orch), vec![Layer::BaseImage]);
    }
}
