use crate::types::LabelId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Point ({x}, {y}) is outside the normalized image bounds")]
    OutOfBounds { x: f64, y: f64 },

    #[error("Label {0} has no points on this frame")]
    EmptyLabel(LabelId),
}
