//! # treewatch-raster
//!
//! Raster I/O for GLAD ARD imagery.
//!
//! This crate provides:
//! - [`TileId`]: the 1x1 degree grid identifiers (`105W_40N`) and their bounds
//! - [`Raster`]: in-memory multi-band rasters decoded from source GeoTIFFs
//! - [`write_layout`] / [`LayoutReader`]: the strip-indexed GeoTIFF layout with
//!   overviews used for every published artifact, readable one window at a time
//! - [`ScratchRaster`]: disk-backed `f32` rasters for out-of-core processing
//! - [`HttpSourceFetcher`]: authenticated download of raw source imagery
//!
//! ## Example
//!
//! ```no_run
//! use treewatch_raster::{write_layout, LayoutOptions, LayoutReader, Raster, TileId};
//! use std::path::Path;
//!
//! let tile = TileId::parse("105W_40N")?;
//! let mut raw = Raster::<u16>::from_file("source.tif")?;
//!
//! let options = LayoutOptions {
//!     nodata: Some(0.0),
//!     bounds: Some(tile.bounds()),
//!     ..Default::default()
//! };
//! write_layout(Path::new("raw.tif"), &mut raw, &options)?;
//!
//! let mut reader = LayoutReader::<u16>::open("raw.tif")?;
//! let window = reader.read_window(2, 0, 0, 500, 500)?;
//! println!("read {} red samples", window.len());
//! # Ok::<(), treewatch_raster::RasterError>(())
//! ```

mod error;
mod fetch;
mod layout;
mod raster;
mod scratch;
mod tile;

pub use error::RasterError;
pub use fetch::{Credentials, DownloadStats, HttpSourceFetcher, SourceFetcher, DEFAULT_SOURCE_URL, DEFAULT_TIMEOUT};
pub use layout::{write_layout, BandSource, LayoutOptions, LayoutReader, LayoutSummary, DEFAULT_ROWS_PER_STRIP};
pub use raster::{Raster, Sample};
pub use scratch::{Quantized, ScratchRaster};
pub use tile::{TileBounds, TileId, TILE_ID_LEN};

/// Result type for raster operations.
pub type Result<T> = std::result::Result<T, RasterError>;
