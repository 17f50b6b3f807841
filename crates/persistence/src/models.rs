//! Request and response bodies of the persistence service.

use segmark_core::annotation::{MaskRecord, Point};
use segmark_core::mask::Contour;
use segmark_core::types::{FrameNumber, LabelId};
use serde::{Deserialize, Serialize};

/// One point in a save request. The service assigns ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointCreate {
    pub x: f64,
    pub y: f64,
    pub include: bool,
}

impl From<&Point> for PointCreate {
    fn from(p: &Point) -> Self {
        Self {
            x: p.x,
            y: p.y,
            include: p.include,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SavePointsRequest {
    pub label_id: LabelId,
    pub points: Vec<PointCreate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskCreate {
    /// Pixel coordinates.
    pub contour_polygon: Contour,
    pub area: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveMaskRequest {
    pub label_id: LabelId,
    pub mask: MaskCreate,
}

/// A mask as stored by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMask {
    pub id: uuid::Uuid,
    pub label_id: LabelId,
    pub contour_polygon: Contour,
    pub area: f64,
}

impl StoredMask {
    pub fn into_record(self) -> MaskRecord {
        MaskRecord::Persisted {
            label_id: self.label_id,
            contour_polygon: self.contour_polygon,
            area: self.area,
        }
    }
}

/// Result of `DELETE .../labels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearLabelsResponse {
    pub success: bool,
    pub points_deleted: u64,
    pub masks_deleted: u64,
    #[serde(default)]
    pub label_id: Option<LabelId>,
    pub frame_number: FrameNumber,
    /// Whether the frame still counts as manually labeled.
    #[serde(default)]
    pub manually_labeled: bool,
}

/// A decoded frame image.
#[derive(Debug, Clone)]
pub struct FrameImage {
    pub frame_number: FrameNumber,
    pub image: image::DynamicImage,
}

impl FrameImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_points_request_shape() {
        let label_id = uuid::Uuid::nil();
        let point = Point {
            id: uuid::Uuid::new_v4(),
            x: 0.5,
            y: 0.25,
            include: false,
            label_id,
        };
        let body = SavePointsRequest {
            label_id,
            points: vec![PointCreate::from(&point)],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "label_id": "00000000-0000-0000-0000-000000000000",
                "points": [{"x": 0.5, "y": 0.25, "include": false}],
            })
        );
    }

    #[test]
    fn save_mask_request_shape() {
        let body = SaveMaskRequest {
            label_id: uuid::Uuid::nil(),
            mask: MaskCreate {
                contour_polygon: vec![[1.0, 2.0], [3.0, 4.0]],
                area: 12.0,
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["mask"]["contour_polygon"], serde_json::json!([[1.0, 2.0], [3.0, 4.0]]));
        assert_eq!(value["mask"]["area"], 12.0);
    }

    #[test]
    fn point_response_deserializes_into_core_point() {
        let json = r#"[{"id":"6f1c0a52-9c57-4d8f-9b53-0ad0f2a1c6de","label_id":"00000000-0000-0000-0000-000000000000","x":0.1,"y":0.9,"include":true}]"#;
        let points: Vec<Point> = serde_json::from_str(json).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].include);
        assert_eq!(points[0].y, 0.9);
    }

    #[test]
    fn clear_response_for_all_labels() {
        let json = r#"{"success":true,"points_deleted":4,"masks_deleted":2,"label_id":null,"frame_number":3,"manually_labeled":false}"#;
        let resp: ClearLabelsResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert_eq!(resp.points_deleted, 4);
        assert!(resp.label_id.is_none());
    }

    #[test]
    fn stored_mask_becomes_persisted_record() {
        let label_id = uuid::Uuid::new_v4();
        let stored = StoredMask {
            id: uuid::Uuid::new_v4(),
            label_id,
            contour_polygon: vec![[0.0, 0.0]],
            area: 1.0,
        };
        assert!(!stored.into_record().is_preview());
    }
}
