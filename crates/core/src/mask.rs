//! Mask codec: sparse RLE <-> bitmap <-> contour polygon.
//!
//! The wire format is a `;`-separated list of `start,length` runs over a
//! row-major `width * height` index space. Listed runs are "on", every
//! other pixel is "off". Encoding on the inference side is done by the
//! model service; this module decodes, and derives overlays, contours,
//! area and bounds from the decoded bitmap. Edge detection lives here
//! and nowhere else.

use std::collections::BTreeMap;

use image::{Rgba, RgbaImage};

/// Alpha applied to every "on" pixel of an overlay.
pub const FILL_ALPHA: u8 = 128;

/// Alpha applied to border pixels so the outline stays visible.
pub const BORDER_ALPHA: u8 = 255;

/// Contour polygon in image pixel coordinates, `[x, y]` per vertex.
pub type Contour = Vec<[f64; 2]>;

/// The 8-connected neighbourhood (the 4-connected one is a subset).
const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

// ---------------------------------------------------------------------------
// Bitmap
// ---------------------------------------------------------------------------

/// Row-major binary mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl Bitmap {
    /// An all-off bitmap.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of pixels (`width * height`).
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether `(x, y)` is on. Out-of-bounds coordinates read as off.
    pub fn get(&self, x: i64, y: i64) -> bool {
        self.index(x, y).is_some_and(|i| self.bits[i])
    }

    /// Set `(x, y)`; out-of-bounds writes are ignored.
    pub fn set(&mut self, x: i64, y: i64, on: bool) {
        if let Some(i) = self.index(x, y) {
            self.bits[i] = on;
        }
    }

    /// Flattened row-major bits.
    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }

    /// Flattened indices of every on pixel, ascending.
    pub fn on_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, &on)| on.then_some(i))
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        let in_bounds = x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64;
        in_bounds.then(|| y as usize * self.width as usize + x as usize)
    }
}

// ---------------------------------------------------------------------------
// RLE
// ---------------------------------------------------------------------------

/// Decode a sparse RLE string into a `width * height` bitmap.
///
/// Pairs that do not parse to two non-negative integers are skipped and
/// runs are clipped to the bitmap, so a corrupt payload degrades to a
/// partial (or empty) mask instead of failing.
pub fn decode(rle: &str, width: u32, height: u32) -> Bitmap {
    let mut bitmap = Bitmap::new(width, height);
    let n = bitmap.len();
    let mut skipped = 0usize;

    for pair in rle.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((start, length)) = parse_run(pair) else {
            skipped += 1;
            continue;
        };
        if start >= n {
            continue;
        }
        let end = start.saturating_add(length).min(n);
        bitmap.bits[start..end].fill(true);
    }

    if skipped > 0 {
        tracing::debug!(skipped, width, height, "Skipped malformed RLE pairs");
    }
    bitmap
}

fn parse_run(pair: &str) -> Option<(usize, usize)> {
    let (start, length) = pair.split_once(',')?;
    Some((start.trim().parse().ok()?, length.trim().parse().ok()?))
}

/// Encode a bitmap into the sparse RLE format understood by [`decode`].
pub fn encode(bitmap: &Bitmap) -> String {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;

    for (i, &on) in bitmap.bits.iter().enumerate() {
        match (on, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(format!("{s},{}", i - s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(format!("{s},{}", bitmap.len() - s));
    }

    runs.join(";")
}

// ---------------------------------------------------------------------------
// Edges, overlay
// ---------------------------------------------------------------------------

/// An on pixel with at least one 8-connected neighbour that is off or
/// outside the image.
pub fn is_edge(bitmap: &Bitmap, x: i64, y: i64) -> bool {
    bitmap.get(x, y)
        && NEIGHBOURS
            .iter()
            .any(|(dx, dy)| !bitmap.get(x + dx, y + dy))
}

/// Bitmap of every edge pixel of `bitmap`.
pub fn border_mask(bitmap: &Bitmap) -> Bitmap {
    let mut border = Bitmap::new(bitmap.width, bitmap.height);
    for y in 0..bitmap.height as i64 {
        for x in 0..bitmap.width as i64 {
            if is_edge(bitmap, x, y) {
                border.set(x, y, true);
            }
        }
    }
    border
}

/// Rasterize a mask as an RGBA overlay in image space.
///
/// On pixels are painted with `color` at [`FILL_ALPHA`], edge pixels at
/// [`BORDER_ALPHA`]. The border is derived from `bitmap` itself, never
/// from the output buffer.
pub fn render_overlay(bitmap: &Bitmap, color: [u8; 3]) -> RgbaImage {
    let border = border_mask(bitmap);
    let [r, g, b] = color;

    RgbaImage::from_fn(bitmap.width, bitmap.height, |x, y| {
        let (x, y) = (x as i64, y as i64);
        if border.get(x, y) {
            Rgba([r, g, b, BORDER_ALPHA])
        } else if bitmap.get(x, y) {
            Rgba([r, g, b, FILL_ALPHA])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

/// Recover the on set of an overlay: every pixel with non-zero alpha.
pub fn overlay_coverage(overlay: &RgbaImage) -> Bitmap {
    let mut bitmap = Bitmap::new(overlay.width(), overlay.height());
    for (x, y, px) in overlay.enumerate_pixels() {
        if px[3] > 0 {
            bitmap.set(x as i64, y as i64, true);
        }
    }
    bitmap
}

// ---------------------------------------------------------------------------
// Contour
// ---------------------------------------------------------------------------

/// Boundary loops of `bitmap` along pixel edges.
///
/// Vertices sit on pixel corners: pixel `(x, y)` spans `[x, x+1] x
/// [y, y+1]`. Each loop is closed by repeating its first vertex, and
/// loops are concatenated in `(y, x)` order of their starting corner.
/// Outer boundaries run clockwise (on pixels to the right of travel),
/// hole boundaries counter-clockwise. Straight runs are collapsed to
/// their end points.
pub fn trace_contour(bitmap: &Bitmap) -> Contour {
    let mut edges = boundary_edges(bitmap);
    let mut contour = Vec::new();

    while let Some(start) = edges.keys().next().copied() {
        let Some(first) = take_edge(&mut edges, start, None) else {
            break;
        };
        let mut ring = vec![start];
        let mut current = first;
        let mut dir = step(start, first);

        loop {
            push_vertex(&mut ring, current);
            if current == start {
                break;
            }
            let Some(next) = take_edge(&mut edges, current, Some(dir)) else {
                tracing::warn!(corner = ?current, "Open boundary while tracing contour");
                break;
            };
            dir = step(current, next);
            current = next;
        }

        contour.extend(ring.into_iter().map(|(y, x)| [x as f64, y as f64]));
    }
    contour
}

/// Corner `(y, x)` keyed so map order is scan order.
type Corner = (i64, i64);

/// Directed boundary edges, on pixel to the right of travel.
fn boundary_edges(bitmap: &Bitmap) -> BTreeMap<Corner, Vec<Corner>> {
    let mut edges: BTreeMap<Corner, Vec<Corner>> = BTreeMap::new();
    let mut add = |from: Corner, to: Corner| edges.entry(from).or_default().push(to);

    for y in 0..bitmap.height as i64 {
        for x in 0..bitmap.width as i64 {
            if !bitmap.get(x, y) {
                continue;
            }
            if !bitmap.get(x, y - 1) {
                add((y, x), (y, x + 1));
            }
            if !bitmap.get(x + 1, y) {
                add((y, x + 1), (y + 1, x + 1));
            }
            if !bitmap.get(x, y + 1) {
                add((y + 1, x + 1), (y + 1, x));
            }
            if !bitmap.get(x - 1, y) {
                add((y + 1, x), (y, x));
            }
        }
    }
    edges
}

fn step(from: Corner, to: Corner) -> Corner {
    (to.0 - from.0, to.1 - from.1)
}

/// Remove and return an edge leaving `corner`. Where two pixels touch
/// only diagonally a corner has two exits; the right turn is taken so
/// the loop hugs the pixel it is already following.
fn take_edge(
    edges: &mut BTreeMap<Corner, Vec<Corner>>,
    corner: Corner,
    heading: Option<Corner>,
) -> Option<Corner> {
    let exits = edges.get_mut(&corner)?;
    let index = match heading {
        Some((dy, dx)) if exits.len() > 1 => {
            // Right turn in y-down coordinates.
            let right = (corner.0 + dx, corner.1 - dy);
            exits.iter().position(|&e| e == right).unwrap_or(0)
        }
        _ => 0,
    };
    let next = exits.swap_remove(index);
    if exits.is_empty() {
        edges.remove(&corner);
    }
    Some(next)
}

/// Append a vertex, dropping the previous one when it sits mid-way on a
/// straight run.
fn push_vertex(ring: &mut Vec<Corner>, vertex: Corner) {
    if ring.len() >= 2 {
        let a = ring[ring.len() - 2];
        let b = ring[ring.len() - 1];
        if b != ring[0] && heading(a, b) == heading(b, vertex) {
            ring.pop();
        }
    }
    ring.push(vertex);
}

/// Unit direction of an axis-aligned run.
fn heading(from: Corner, to: Corner) -> Corner {
    let (dy, dx) = step(from, to);
    (dy.signum(), dx.signum())
}

/// Re-rasterize a contour with the even-odd rule, sampling pixel
/// centres.
///
/// The contour is split into rings: a ring ends where a vertex repeats
/// the ring's first vertex, and a trailing open ring is closed
/// implicitly. For output of [`trace_contour`] this reproduces the
/// bitmap exactly, holes included. Non-finite vertices are skipped.
pub fn fill_contour(contour: &[[f64; 2]], width: u32, height: u32) -> Bitmap {
    let rings = split_rings(contour);
    let mut filled = Bitmap::new(width, height);
    let mut crossings = Vec::new();

    for y in 0..height as i64 {
        let yc = y as f64 + 0.5;
        crossings.clear();
        for ring in &rings {
            for (i, a) in ring.iter().enumerate() {
                let b = ring[(i + 1) % ring.len()];
                if (a[1] <= yc) != (b[1] <= yc) {
                    crossings.push(a[0] + (yc - a[1]) * (b[0] - a[0]) / (b[1] - a[1]));
                }
            }
        }
        crossings.sort_by(f64::total_cmp);

        for span in crossings.chunks_exact(2) {
            // Pixels whose centre lies in [x0, x1).
            let x0 = (span[0] - 0.5).ceil().max(0.0) as i64;
            let x1 = (span[1] - 0.5).ceil().min(width as f64) as i64;
            for x in x0..x1 {
                filled.set(x, y, true);
            }
        }
    }
    filled
}

fn split_rings(contour: &[[f64; 2]]) -> Vec<Vec<[f64; 2]>> {
    let mut rings = Vec::new();
    let mut ring: Vec<[f64; 2]> = Vec::new();

    for &vertex in contour {
        if !(vertex[0].is_finite() && vertex[1].is_finite()) {
            continue;
        }
        if ring.len() >= 3 && vertex == ring[0] {
            rings.push(std::mem::take(&mut ring));
            continue;
        }
        ring.push(vertex);
    }
    if ring.len() >= 3 {
        rings.push(ring);
    }
    rings
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// Number of on pixels.
pub fn area(bitmap: &Bitmap) -> u64 {
    bitmap.bits.iter().filter(|&&on| on).count() as u64
}

/// Tight bounds of the on pixels as `[x, y, width, height]`.
pub fn bounding_box(bitmap: &Bitmap) -> Option<[u32; 4]> {
    let w = bitmap.width as usize;
    let mut bounds: Option<(usize, usize, usize, usize)> = None;

    for i in bitmap.on_indices() {
        let (x, y) = (i % w, i / w);
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    bounds.map(|(x0, y0, x1, y1)| {
        [
            x0 as u32,
            y0 as u32,
            (x1 - x0 + 1) as u32,
            (y1 - y0 + 1) as u32,
        ]
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
