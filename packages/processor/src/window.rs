//! Pixel window math for north-up rasters.
//!
//! Rasters are addressed through a six-term affine [`GeoTransform`] in the
//! GDAL ordering. Only north-up transforms (no rotation terms) are
//! supported, which covers every CHIRPS product.

use geo::{Intersects as _, Rect, coord};

/// Affine pixel-to-world transform, GDAL ordering:
/// `x = origin_x + col * pixel_width`, `y = origin_y + row * pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner.
    pub origin_x: f64,
    /// Pixel width.
    pub pixel_width: f64,
    /// Y coordinate of the upper-left corner.
    pub origin_y: f64,
    /// Pixel height, negative for top-down rasters.
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Builds a transform from the GDAL six-term array.
    ///
    /// Returns `None` for rotated or degenerate transforms.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn from_gdal(terms: [f64; 6]) -> Option<Self> {
        let [origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height] = terms;
        if row_rotation != 0.0 || col_rotation != 0.0 || pixel_width == 0.0 || pixel_height == 0.0
        {
            return None;
        }
        Some(Self {
            origin_x,
            pixel_width,
            origin_y,
            pixel_height,
        })
    }

    /// The GDAL six-term array for this transform.
    #[must_use]
    pub const fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            self.pixel_height,
        ]
    }

    /// World coordinates of a pixel corner.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pixel_to_world(&self, col: usize, row: usize) -> (f64, f64) {
        (
            (col as f64).mul_add(self.pixel_width, self.origin_x),
            (row as f64).mul_add(self.pixel_height, self.origin_y),
        )
    }

    /// Fractional pixel coordinates of a world point.
    #[must_use]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Transform of the sub-raster starting at `window`'s upper-left pixel.
    #[must_use]
    pub fn for_window(&self, window: &PixelWindow) -> Self {
        let (origin_x, origin_y) = self.pixel_to_world(window.x, window.y);
        Self {
            origin_x,
            origin_y,
            ..*self
        }
    }

    /// World extent of a `width` × `height` raster using this transform.
    #[must_use]
    pub fn extent(&self, width: usize, height: usize) -> Rect<f64> {
        window_bounds(self, &PixelWindow::new(0, 0, width, height))
    }
}

/// A rectangular block of pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    /// Column offset from the left edge.
    pub x: usize,
    /// Row offset from the top edge.
    pub y: usize,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
}

impl PixelWindow {
    /// Creates a window.
    #[must_use]
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Builds a bounds rectangle from `[min_x, min_y, max_x, max_y]`.
#[must_use]
pub fn bounds_rect(bounds: [f64; 4]) -> Rect<f64> {
    Rect::new(
        coord! { x: bounds[0], y: bounds[1] },
        coord! { x: bounds[2], y: bounds[3] },
    )
}

/// Smallest pixel window of a `width` × `height` raster covering `bounds`.
///
/// Offsets are floored and far edges ceiled, then clamped to the raster, so
/// the window always contains the part of `bounds` that overlaps the
/// raster. Returns `None` when there is no overlap.
#[must_use]
pub fn window_for_bounds(
    transform: &GeoTransform,
    width: usize,
    height: usize,
    bounds: &Rect<f64>,
) -> Option<PixelWindow> {
    let extent = transform.extent(width, height);
    if !extent.intersects(bounds) {
        return None;
    }

    let (c0, r0) = transform.world_to_pixel(bounds.min().x, bounds.max().y);
    let (c1, r1) = transform.world_to_pixel(bounds.max().x, bounds.min().y);

    let x0 = clamp_pixel(c0.min(c1).floor(), width);
    let x1 = clamp_pixel(c0.max(c1).ceil(), width);
    let y0 = clamp_pixel(r0.min(r1).floor(), height);
    let y1 = clamp_pixel(r0.max(r1).ceil(), height);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(PixelWindow::new(x0, y0, x1 - x0, y1 - y0))
}

/// World bounds covered by `window`.
#[must_use]
pub fn window_bounds(transform: &GeoTransform, window: &PixelWindow) -> Rect<f64> {
    let (x0, y0) = transform.pixel_to_world(window.x, window.y);
    let (x1, y1) = transform.pixel_to_world(window.x + window.width, window.y + window.height);
    Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_pixel(value: f64, limit: usize) -> usize {
    if value <= 0.0 {
        0
    } else {
        (value as usize).min(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 20 × 20 raster of unit pixels covering `[0, 0, 20, 20]`.
    fn unit_grid() -> GeoTransform {
        GeoTransform::from_gdal([0.0, 1.0, 0.0, 20.0, 0.0, -1.0]).unwrap()
    }

    #[test]
    fn clip_window_covers_region_within_one_pixel() {
        let transform = unit_grid();
        let roi = bounds_rect([2.3, 3.8, 15.1, 14.2]);

        let window = window_for_bounds(&transform, 20, 20, &roi).unwrap();
        assert_eq!(window, PixelWindow::new(2, 5, 14, 12));

        let out = window_bounds(&transform, &window);
        let source = transform.extent(20, 20);

        // inside the source
        assert!(out.min().x >= source.min().x && out.max().x <= source.max().x);
        assert!(out.min().y >= source.min().y && out.max().y <= source.max().y);

        // covers the intersection
        assert!(out.min().x <= roi.min().x && out.max().x >= roi.max().x);
        assert!(out.min().y <= roi.min().y && out.max().y >= roi.max().y);

        // by less than one pixel on every side
        assert!(roi.min().x - out.min().x < 1.0);
        assert!(out.max().x - roi.max().x < 1.0);
        assert!(roi.min().y - out.min().y < 1.0);
        assert!(out.max().y - roi.max().y < 1.0);
    }

    #[test]
    fn region_larger_than_raster_is_clamped() {
        let transform = unit_grid();
        let roi = bounds_rect([-5.0, -5.0, 30.0, 12.5]);

        let window = window_for_bounds(&transform, 20, 20, &roi).unwrap();
        assert_eq!(window, PixelWindow::new(0, 7, 20, 13));
    }

    #[test]
    fn disjoint_region_has_no_window() {
        let transform = unit_grid();
        let roi = bounds_rect([25.0, 25.0, 30.0, 30.0]);
        assert_eq!(window_for_bounds(&transform, 20, 20, &roi), None);
    }

    #[test]
    fn window_transform_shifts_origin() {
        let transform = unit_grid();
        let shifted = transform.for_window(&PixelWindow::new(2, 5, 14, 12));
        assert_eq!(shifted.to_gdal(), [2.0, 1.0, 0.0, 15.0, 0.0, -1.0]);
    }

    #[test]
    fn rejects_rotated_transforms() {
        assert!(GeoTransform::from_gdal([0.0, 1.0, 0.5, 20.0, 0.0, -1.0]).is_none());
    }

    #[test]
    fn matches_chirps_africa_grid() {
        // 0.05 degree Africa grid, upper-left at (-20, 40)
        let transform = GeoTransform::from_gdal([-20.0, 0.05, 0.0, 40.0, 0.0, -0.05]).unwrap();
        let roi = bounds_rect([2.316_388, 3.837_669, 15.126_447, 14.153_350]);

        let window = window_for_bounds(&transform, 1500, 1600, &roi).unwrap();
        assert_eq!(window.x, 446);
        assert_eq!(window.width, 257);
        assert_eq!(window.y, 516);
        assert_eq!(window.height, 208);
    }
}
