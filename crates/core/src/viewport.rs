//! Image <-> canvas coordinate transform.
//!
//! Every rendered element is placed with the single affine mapping
//! `canvas = image_offset + image * scale`. Points are stored in
//! normalized image space (`[0, 1]²`) so they survive pan, zoom, resize
//! and resolution changes; overlays are re-derived from [`ViewportState`]
//! whenever it changes.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Multiplicative step applied per zoom notch.
pub const DEFAULT_ZOOM_FACTOR: f64 = 1.05;

/// Smallest allowed scale.
pub const DEFAULT_MIN_SCALE: f64 = 0.1;

/// Largest allowed scale.
pub const DEFAULT_MAX_SCALE: f64 = 10.0;

/// The initial fit never upscales past native resolution.
const MAX_FIT_SCALE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Geometry primitives
// ---------------------------------------------------------------------------

/// A 2D point or displacement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width and height, in pixels of whichever space the owner lives in.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

impl Size {
    pub fn new(w: f64, h: f64) -> Self {
        Self { w, h }
    }

    /// A size that cannot be divided by (zero, negative or non-finite).
    pub fn is_degenerate(&self) -> bool {
        !(self.w.is_finite() && self.h.is_finite() && self.w > 0.0 && self.h > 0.0)
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.w / 2.0, self.h / 2.0)
    }
}

/// Direction of a single zoom step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomDirection {
    In,
    Out,
}

/// Zoom step and clamp range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomLimits {
    pub factor: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for ZoomLimits {
    fn default() -> Self {
        Self {
            factor: DEFAULT_ZOOM_FACTOR,
            min: DEFAULT_MIN_SCALE,
            max: DEFAULT_MAX_SCALE,
        }
    }
}

impl ZoomLimits {
    fn clamp(&self, scale: f64) -> f64 {
        scale.clamp(self.min, self.max)
    }
}

// ---------------------------------------------------------------------------
// ViewportState
// ---------------------------------------------------------------------------

/// The single source of truth for where the image sits on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    pub scale: f64,
    pub image_offset: Vec2,
    pub canvas_size: Size,
    pub image_size: Size,
}

impl ViewportState {
    /// Map a point in image pixels to canvas pixels.
    pub fn image_to_canvas(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            self.image_offset.x + p.x * self.scale,
            self.image_offset.y + p.y * self.scale,
        )
    }

    /// Map a point in canvas pixels back to image pixels.
    pub fn canvas_to_image(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            (p.x - self.image_offset.x) / self.scale,
            (p.y - self.image_offset.y) / self.scale,
        )
    }

    /// Canvas pixel -> normalized image coordinate.
    ///
    /// Returns `None` when the pointer lies outside the image or the
    /// image has no usable size.
    pub fn canvas_to_normalized(&self, p: Vec2) -> Option<Vec2> {
        if self.image_size.is_degenerate() {
            return None;
        }
        let n = to_normalized(self.canvas_to_image(p), self.image_size);
        let inside = (0.0..=1.0).contains(&n.x) && (0.0..=1.0).contains(&n.y);
        inside.then_some(n)
    }

    /// Normalized image coordinate -> canvas pixel.
    pub fn normalized_to_canvas(&self, n: Vec2) -> Vec2 {
        self.image_to_canvas(from_normalized(n, self.image_size))
    }

    /// Canvas-space rectangle `(origin, size)` covered by the whole image.
    pub fn image_rect(&self) -> (Vec2, Size) {
        (
            self.image_offset,
            Size::new(self.image_size.w * self.scale, self.image_size.h * self.scale),
        )
    }
}

/// Fit an image into a canvas, centered, never upscaling past 1:1.
///
/// Degenerate sizes produce scale `1.0` at the origin instead of
/// propagating NaN or infinity into every overlay.
pub fn fit_to_viewport(image_size: Size, canvas_size: Size) -> ViewportState {
    if image_size.is_degenerate() || canvas_size.is_degenerate() {
        return ViewportState {
            scale: 1.0,
            image_offset: Vec2::ZERO,
            canvas_size,
            image_size,
        };
    }

    let scale = (canvas_size.w / image_size.w)
        .min(canvas_size.h / image_size.h)
        .min(MAX_FIT_SCALE);

    ViewportState {
        scale,
        image_offset: Vec2::new(
            (canvas_size.w - image_size.w * scale) / 2.0,
            (canvas_size.h - image_size.h * scale) / 2.0,
        ),
        canvas_size,
        image_size,
    }
}

/// Image pixel -> fraction of the image size.
pub fn to_normalized(p: Vec2, image_size: Size) -> Vec2 {
    Vec2::new(p.x / image_size.w, p.y / image_size.h)
}

/// Fraction of the image size -> image pixel.
pub fn from_normalized(n: Vec2, image_size: Size) -> Vec2 {
    Vec2::new(n.x * image_size.w, n.y * image_size.h)
}

// ---------------------------------------------------------------------------
// Viewport (stateful wrapper)
// ---------------------------------------------------------------------------

/// Interactive viewport: a [`ViewportState`] plus the zoom policy and
/// whether the user has moved away from the fitted position.
#[derive(Debug, Clone)]
pub struct Viewport {
    state: ViewportState,
    limits: ZoomLimits,
    user_adjusted: bool,
}

impl Viewport {
    /// Create a viewport fitted to `canvas_size`.
    pub fn new(image_size: Size, canvas_size: Size, limits: ZoomLimits) -> Self {
        Self {
            state: fit_to_viewport(image_size, canvas_size),
            limits,
            user_adjusted: false,
        }
    }

    pub fn state(&self) -> &ViewportState {
        &self.state
    }

    pub fn limits(&self) -> ZoomLimits {
        self.limits
    }

    /// Whether a pan or zoom happened since the last fit.
    pub fn is_user_adjusted(&self) -> bool {
        self.user_adjusted
    }

    /// Translate by a raw pointer delta.
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        self.state.image_offset.x += dx;
        self.state.image_offset.y += dy;
        self.user_adjusted = true;
    }

    /// Zoom one step, keeping the image point under `pointer` fixed.
    pub fn zoom_at(&mut self, pointer: Vec2, direction: ZoomDirection) {
        let anchor = self.state.canvas_to_image(pointer);
        let target = match direction {
            ZoomDirection::In => self.state.scale * self.limits.factor,
            ZoomDirection::Out => self.state.scale / self.limits.factor,
        };
        let scale = self.limits.clamp(target);

        self.state.scale = scale;
        self.state.image_offset =
            Vec2::new(pointer.x - anchor.x * scale, pointer.y - anchor.y * scale);
        self.user_adjusted = true;
    }

    /// React to a canvas size change.
    ///
    /// An untouched viewport is simply re-fitted. After a pan or zoom the
    /// scale is kept and the image point at the old canvas center is moved
    /// to the new canvas center.
    pub fn resize(&mut self, canvas_size: Size) {
        if !self.user_adjusted || canvas_size.is_degenerate() {
            self.state = fit_to_viewport(self.state.image_size, canvas_size);
            self.user_adjusted = false;
            return;
        }

        let focus = self.state.canvas_to_image(self.state.canvas_size.center());
        let center = canvas_size.center();
        self.state.canvas_size = canvas_size;
        self.state.image_offset = Vec2::new(
            center.x - focus.x * self.state.scale,
            center.y - focus.y * self.state.scale,
        );
    }

    /// Reset to the fitted position.
    pub fn fit(&mut self) {
        self.state = fit_to_viewport(self.state.image_size, self.state.canvas_size);
        self.user_adjusted = false;
    }

    /// Swap in a new image (frame change) and re-fit.
    pub fn set_image(&mut self, image_size: Size) {
        self.state = fit_to_viewport(image_size, self.state.canvas_size);
        self.user_adjusted = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
