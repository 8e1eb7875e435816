//! Error types for the raster crate.

use thiserror::Error;

/// Errors that can occur when reading, writing or fetching raster data.
#[derive(Debug, Error)]
pub enum RasterError {
    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF encode or decode error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Tile identifier does not follow the `LLLL_BBB` grid naming.
    #[error("Invalid tile id: {0}")]
    InvalidTileId(String),

    /// File is a TIFF but not in the expected band layout.
    #[error("Invalid raster layout: {0}")]
    InvalidLayout(String),

    /// Unsupported sample data type in the TIFF file.
    #[error("Unsupported TIFF data type: {0}")]
    UnsupportedDataType(String),

    /// Raster has an unexpected number of bands.
    #[error("Expected {expected} bands, found {found}")]
    BandCount {
        /// Number of bands required.
        expected: usize,
        /// Number of bands present.
        found: usize,
    },

    /// Buffer length does not match the raster dimensions.
    #[error("Buffer of {found} samples does not match {width}x{height} raster")]
    DimensionMismatch {
        /// Raster width in pixels.
        width: u32,
        /// Raster height in pixels.
        height: u32,
        /// Number of samples supplied.
        found: usize,
    },

    /// Requested window lies outside the raster.
    #[error("Window ({x}, {y}) {w}x{h} is outside {width}x{height} raster")]
    WindowOutOfBounds {
        /// Window column offset.
        x: u32,
        /// Window row offset.
        y: u32,
        /// Window width.
        w: u32,
        /// Window height.
        h: u32,
        /// Raster width.
        width: u32,
        /// Raster height.
        height: u32,
    },

    /// HTTP request error when fetching source imagery.
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// Remote server answered but the download did not succeed.
    #[error("Failed to download tile {tile} interval {interval}: {reason}")]
    DownloadFailed {
        /// Tile identifier.
        tile: String,
        /// Interval identifier.
        interval: u32,
        /// Reason for failure.
        reason: String,
    },
}

impl RasterError {
    /// Whether the error comes from the transport rather than the content.
    ///
    /// Transport failures are worth retrying later; content failures are not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RasterError::HttpRequest(_) | RasterError::DownloadFailed { .. }
        )
    }
}
