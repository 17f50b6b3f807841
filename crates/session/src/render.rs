//! Retained render tree.
//!
//! Nodes carry a [`Layer`] and a [`NodeTag`] naming the entity they
//! draw. The draw list is ordered by layer first and insertion order
//! second, so a point added before a mask still paints above it.

use segmark_core::types::{FrameNumber, LabelId, PointId};
use segmark_core::viewport::{Size, Vec2};
use serde::Serialize;

/// Marker radius in canvas pixels.
pub const MARKER_RADIUS: f64 = 5.0;

pub const INCLUDE_COLOR: [u8; 3] = [34, 197, 94];
pub const EXCLUDE_COLOR: [u8; 3] = [239, 68, 68];

const LABEL_PALETTE: [[u8; 3]; 8] = [
    [59, 130, 246],
    [234, 179, 8],
    [168, 85, 247],
    [20, 184, 166],
    [249, 115, 22],
    [236, 72, 153],
    [132, 204, 22],
    [14, 165, 233],
];

/// Stable display color of a label.
pub fn label_color(label_id: LabelId) -> [u8; 3] {
    let sum: usize = label_id.as_bytes().iter().map(|b| *b as usize).sum();
    LABEL_PALETTE[sum % LABEL_PALETTE.len()]
}

pub fn marker_color(include: bool) -> [u8; 3] {
    if include {
        INCLUDE_COLOR
    } else {
        EXCLUDE_COLOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    BaseImage,
    MaskOverlay,
    PointMarker,
}

/// The entity a node draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeTag {
    Image,
    Mask(LabelId),
    Point(PointId),
}

pub type NodeId = u64;

/// Canvas-space geometry of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Visual {
    Image {
        frame_number: FrameNumber,
        origin: Vec2,
        size: Size,
    },
    /// An image-space raster stretched over `origin`/`size`.
    Overlay {
        label_id: LabelId,
        origin: Vec2,
        size: Size,
        color: [u8; 3],
        area: u64,
    },
    Marker {
        center: Vec2,
        radius: f64,
        color: [u8; 3],
        include: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderNode {
    pub id: NodeId,
    pub layer: Layer,
    pub tag: NodeTag,
    pub visual: Visual,
}

#[derive(Debug, Default)]
pub struct RenderTree {
    nodes: Vec<RenderNode>,
    next_id: NodeId,
}

impl RenderTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: Layer, tag: NodeTag, visual: Visual) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.push(RenderNode {
            id,
            layer,
            tag,
            visual,
        });
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&RenderNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        self.nodes.len() != before
    }

    /// Remove every node carrying `tag`. Returns how many were removed.
    pub fn remove_tagged(&mut self, tag: &NodeTag) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.tag != *tag);
        before - self.nodes.len()
    }

    pub fn count_tagged(&self, tag: &NodeTag) -> usize {
        self.nodes.iter().filter(|n| n.tag == *tag).count()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in paint order.
    pub fn draw_list(&self) -> Vec<&RenderNode> {
        let mut list: Vec<&RenderNode> = self.nodes.iter().collect();
        // Stable: insertion order within a layer.
        list.sort_by_key(|n| n.layer);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker() -> Visual {
        Visual::Marker {
            center: Vec2::ZERO,
            radius: MARKER_RADIUS,
            color: INCLUDE_COLOR,
            include: true,
        }
    }

    fn overlay(label_id: LabelId) -> Visual {
        Visual::Overlay {
            label_id,
            origin: Vec2::ZERO,
            size: Size::new(10.0, 10.0),
            color: label_color(label_id),
            area: 4,
        }
    }

    #[test]
    fn draw_order_ignores_insertion_order() {
        let mut tree = RenderTree::new();
        let label = uuid::Uuid::new_v4();
        tree.insert(Layer::PointMarker, NodeTag::Point(uuid::Uuid::new_v4()), marker());
        tree.insert(Layer::MaskOverlay, NodeTag::Mask(label), overlay(label));
        tree.insert(
            Layer::BaseImage,
            NodeTag::Image,
            Visual::Image {
                frame_number: 0,
                origin: Vec2::ZERO,
                size: Size::new(10.0, 10.0),
            },
        );

        let layers: Vec<Layer> = tree.draw_list().iter().map(|n| n.layer).collect();
        assert_eq!(layers, vec![Layer::BaseImage, Layer::MaskOverlay, Layer::PointMarker]);
    }

    #[test]
    fn remove_tagged_scans_all_duplicates() {
        let mut tree = RenderTree::new();
        let label = uuid::Uuid::new_v4();
        tree.insert(Layer::MaskOverlay, NodeTag::Mask(label), overlay(label));
        tree.insert(Layer::MaskOverlay, NodeTag::Mask(label), overlay(label));
        let other = uuid::Uuid::new_v4();
        tree.insert(Layer::MaskOverlay, NodeTag::Mask(other), overlay(other));

        assert_eq!(tree.remove_tagged(&NodeTag::Mask(label)), 2);
        assert_eq!(tree.count_tagged(&NodeTag::Mask(other)), 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn ids_are_unique_after_removal() {
        let mut tree = RenderTree::new();
        let a = tree.insert(Layer::PointMarker, NodeTag::Point(uuid::Uuid::new_v4()), marker());
        assert!(tree.remove(a));
        let b = tree.insert(Layer::PointMarker, NodeTag::Point(uuid::Uuid::new_v4()), marker());
        assert_ne!(a, b);
        assert!(tree.get(a).is_none());
        assert!(tree.get(b).is_some());
    }

    #[test]
    fn label_color_is_stable() {
        let label = uuid::Uuid::new_v4();
        assert_eq!(label_color(label), label_color(label));
    }
}
