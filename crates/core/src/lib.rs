//! Domain core of the segmentation canvas.
//!
//! Pure, synchronous building blocks: the viewport transform, the mask
//! run-length codec and contour helpers, and the per-frame annotation
//! store. Nothing in this crate touches the network or a clock.

pub mod annotation;
pub mod error;
pub mod mask;
pub mod types;
pub mod viewport;
