//! Clip + re-encode step.
//!
//! [`RasterConverter`] hides the raster engine. With the `gdal` feature the
//! [`GdalConverter`] reads only the pixel window covering the region and
//! writes a tiled, DEFLATE-compressed GeoTIFF with AVERAGE overviews.
//! Without it, [`default_converter`] returns a converter that rejects every
//! request.

use std::path::PathBuf;
use std::sync::Arc;

use geo::Rect;

use crate::window::PixelWindow;

/// Block size of the output tiles, in pixels.
pub const TILE_SIZE: usize = 512;

/// Overview decimation factors.
pub const OVERVIEW_FACTORS: &[i32] = &[2, 4, 8, 16];

/// Metadata domain and item recording how overviews were resampled.
pub const OVERVIEW_TAG_DOMAIN: &str = "rio_overview";

/// Errors from the clip + re-encode step.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    /// The region does not overlap the raster.
    #[error("region does not overlap raster {path}")]
    NoOverlap {
        /// Source raster.
        path: PathBuf,
    },

    /// The raster uses a rotated or degenerate geotransform.
    #[error("unsupported geotransform in {path}")]
    UnsupportedTransform {
        /// Source raster.
        path: PathBuf,
    },

    /// The binary was built without a raster engine.
    #[error("raster support not compiled in (enable the `gdal` feature)")]
    Unsupported,

    /// The raster engine reported an error.
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// What to clip and where to write it.
#[derive(Debug, Clone)]
pub struct ClipRequest {
    /// Decompressed source raster.
    pub source: PathBuf,
    /// Output path.
    pub destination: PathBuf,
    /// Region `[min_x, min_y, max_x, max_y]` in `crs`.
    pub bounds: [f64; 4],
    /// CRS of `bounds`, e.g. `"EPSG:4326"`.
    pub crs: String,
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipSummary {
    /// Pixel window read from the source.
    pub window: PixelWindow,
    /// World bounds of the output, in the source CRS.
    pub bounds: Rect<f64>,
}

/// A raster engine able to clip and re-encode one file.
///
/// Implementations do blocking I/O; callers run them on a blocking thread.
pub trait RasterConverter: Send + Sync {
    /// Clips `request.source` to `request.bounds` and writes the tiled
    /// output to `request.destination`.
    ///
    /// # Errors
    ///
    /// Returns [`ClipError`] if the raster cannot be read, does not overlap
    /// the region, or the output cannot be written.
    fn convert(&self, request: &ClipRequest) -> Result<ClipSummary, ClipError>;
}

/// Converter used when no raster engine is compiled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedConverter;

impl RasterConverter for UnsupportedConverter {
    fn convert(&self, _request: &ClipRequest) -> Result<ClipSummary, ClipError> {
        Err(ClipError::Unsupported)
    }
}

/// The best converter available in this build.
#[must_use]
pub fn default_converter() -> Arc<dyn RasterConverter> {
    #[cfg(feature = "gdal")]
    {
        Arc::new(GdalConverter)
    }
    #[cfg(not(feature = "gdal"))]
    {
        log::warn!("Built without the `gdal` feature, conversions will fail");
        Arc::new(UnsupportedConverter)
    }
}

#[cfg(feature = "gdal")]
pub use gdal_impl::GdalConverter;

#[cfg(feature = "gdal")]
mod gdal_impl {
    use gdal::raster::{GdalDataType, GdalType, RasterCreationOptions};
    use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
    use gdal::{Dataset, DriverManager, Metadata as _};
    use geo::Rect;

    use super::{
        ClipError, ClipRequest, ClipSummary, OVERVIEW_FACTORS, OVERVIEW_TAG_DOMAIN, RasterConverter,
        TILE_SIZE,
    };
    use crate::window::{
        GeoTransform, PixelWindow, bounds_rect, window_bounds, window_for_bounds,
    };

    /// Densification points per edge when reprojecting the region bounds.
    const DENSIFY_POINTS: i32 = 21;

    /// GDAL-backed converter writing tiled GeoTIFFs.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct GdalConverter;

    impl GdalConverter {
        /// Region bounds expressed in the raster's CRS. The raster itself is
        /// never warped.
        fn region_in_raster_crs(
            source: &Dataset,
            request: &ClipRequest,
        ) -> Result<Rect<f64>, ClipError> {
            let mut region_srs = SpatialRef::from_definition(&request.crs)?;
            region_srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

            let Ok(mut raster_srs) = source.spatial_ref() else {
                log::warn!(
                    "  {} has no CRS, assuming {}",
                    request.source.display(),
                    request.crs
                );
                return Ok(bounds_rect(request.bounds));
            };
            raster_srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

            if raster_srs == region_srs {
                return Ok(bounds_rect(request.bounds));
            }

            log::debug!("  reprojecting region bounds into the raster CRS");
            let transform = CoordTransform::new(&region_srs, &raster_srs)?;
            let projected = transform.transform_bounds(&request.bounds, DENSIFY_POINTS)?;
            Ok(bounds_rect(projected))
        }
    }

/// Copies `window` of every band into a tiled GeoTIFF of element type `T`
    /// and builds its overviews.
    fn write_window<T: GdalType + Copy>(
        source: &Dataset,
        request: &ClipRequest,
        transform: &GeoTransform,
        window: &PixelWindow,
    ) -> Result<(), ClipError> {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut options = RasterCreationOptions::new();
        options.set_name_value("TILED", "YES")?;
        options.set_name_value("BLOCKXSIZE", &TILE_SIZE.to_string())?;
        options.set_name_value("BLOCKYSIZE", &TILE_SIZE.to_string())?;
        options.set_name_value("COMPRESS", "DEFLATE")?;

        let band_count = source.raster_count();
        let mut output = driver.create_with_band_type_with_options::<T, _>(
            &request.destination,
            window.width,
            window.height,
            band_count,
            &options,
        )?;
        output.set_geo_transform(&transform.for_window(window).to_gdal())?;
        if let Ok(srs) = source.spatial_ref() {
            output.set_spatial_ref(&srs)?;
        }

        #[allow(clippy::cast_possible_wrap)]
        let offset = (window.x as isize, window.y as isize);
        let size = (window.width, window.height);

        for index in 1..=band_count {
            let band = source.rasterband(index)?;
            let mut buffer = band.read_as::<T>(offset, size, size, None)?;

            let mut out_band = output.rasterband(index)?;
            if let Some(nodata) = band.no_data_value() {
                out_band.set_no_data_value(Some(nodata))?;
            }
            out_band.write((0, 0), size, &mut buffer)?;
        }

        output.build_overviews("AVERAGE", OVERVIEW_FACTORS, &[])?;
        output.set_metadata_item("resampling", "average", OVERVIEW_TAG_DOMAIN)?;
        Ok(())
    }

    impl RasterConverter for GdalConverter {
        fn convert(&self, request: &ClipRequest) -> Result<ClipSummary, ClipError> {
            let source = Dataset::open(&request.source)?;
            let (width, height) = source.raster_size();
            let transform = GeoTransform::from_gdal(source.geo_transform()?).ok_or_else(|| {
                ClipError::UnsupportedTransform {
                    path: request.source.clone(),
                }
            })?;

            let region = Self::region_in_raster_crs(&source, request)?;
            let window = window_for_bounds(&transform, width, height, &region).ok_or_else(|| {
                ClipError::NoOverlap {
                    path: request.source.clone(),
                }
            })?;
            log::debug!(
                "  window {}x{} at ({}, {}) of {width}x{height}",
                window.width,
                window.height,
                window.x,
                window.y
            );

            let band_type = source.rasterband(1)?.band_type();
            log::debug!("  preserving band type {band_type:?}");
            match band_type {
                GdalDataType::UInt8 => write_window::<u8>(&source, request, &transform, &window)?,
                GdalDataType::UInt16 => write_window::<u16>(&source, request, &transform, &window)?,
                GdalDataType::Int16 => write_window::<i16>(&source, request, &transform, &window)?,
                GdalDataType::UInt32 => write_window::<u32>(&source, request, &transform, &window)?,
                GdalDataType::Int32 => write_window::<i32>(&source, request, &transform, &window)?,
                GdalDataType::Float32 => write_window::<f32>(&source, request, &transform, &window)?,
                GdalDataType::Float64 => write_window::<f64>(&source, request, &transform, &window)?,
                other => {
                    log::warn!("  no native buffer type for {other:?}, writing Float64");
                    write_window::<f64>(&source, request, &transform, &window)?;
                }
            }

            Ok(ClipSummary {
                window,
                bounds: window_bounds(&transform, &window),
            })
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_converter_rejects_requests() {
        let request = ClipRequest {
            source: PathBuf::from("/tmp/a.tif"),
            destination: PathBuf::from("/tmp/nigeria-cog-a.tif"),
            bounds: [0.0, 0.0, 1.0, 1.0],
            crs: "EPSG:4326".to_string(),
        };
        assert!(matches!(
            UnsupportedConverter.convert(&request),
            Err(ClipError::Unsupported)
        ));
    }
}
