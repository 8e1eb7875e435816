//! Strip-indexed GeoTIFF layout with overviews.
//!
//! Every artifact the pipeline publishes uses the same layout so that readers
//! can fetch a horizontal band of rows without decoding the whole image:
//!
//! - one single-band image directory per band at full resolution, stored
//!   uncompressed and split into strips of `rows_per_strip` rows
//! - followed by the same set of directories for each overview level, each
//!   level halving the previous resolution (nearest-neighbour decimation)
//! - directory 0 carries an `ImageDescription` of the form
//!   `treewatch:bands=<n>;overviews=<m>` plus the GDAL nodata and the
//!   GeoTIFF tie point / pixel scale tags when bounds are known
//!
//! Directory `level * bands + band` holds `band` at overview `level`
//! (level 0 is full resolution).

use crate::tile::TileBounds;
use crate::{Raster, RasterError, Result, Sample};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::{Decoder, Limits};
use tiff::encoder::compression::Uncompressed;
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;

/// Default number of rows per strip, matching the default processing block.
pub const DEFAULT_ROWS_PER_STRIP: u32 = 500;

/// GDAL_NODATA tag (ASCII).
const TAG_GDAL_NODATA: u16 = 42113;
/// ModelPixelScale tag.
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
/// ModelTiepoint tag.
const TAG_MODEL_TIEPOINT: u16 = 33922;
/// GeoKeyDirectory tag.
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;

const DESCRIPTION_PREFIX: &str = "treewatch:";

/// Tag for a numeric code. The decoder files tags it knows by name under
/// their named variant, so lookups must not use `Tag::Unknown` for those.
fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Options controlling how a raster is laid out on disk.
#[derive(Debug, Clone)]
pub struct LayoutOptions {
    /// Rows per strip at every level.
    pub rows_per_strip: u32,
    /// Upper bound on the number of overview levels.
    pub max_overviews: u8,
    /// Overviews stop once the longer side would drop below this size.
    pub min_overview_size: u32,
    /// Sentinel written as GDAL_NODATA.
    pub nodata: Option<f64>,
    /// Geographic bounds written as GeoTIFF tags.
    pub bounds: Option<TileBounds>,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            rows_per_strip: DEFAULT_ROWS_PER_STRIP,
            max_overviews: 4,
            min_overview_size: 256,
            nodata: None,
            bounds: None,
        }
    }
}

impl LayoutOptions {
    /// Number of overview levels for a raster of the given size.
    pub fn overview_levels(&self, width: u32, height: u32) -> u8 {
        let longest = width.max(height);
        let mut levels = 0u8;
        while levels < self.max_overviews && (longest >> (levels + 1)) >= self.min_overview_size {
            levels += 1;
        }
        levels
    }
}

/// Something that can hand out full-width rows of a band.
pub trait BandSource<S> {
    /// Width in pixels.
    fn width(&self) -> u32;
    /// Height in pixels.
    fn height(&self) -> u32;
    /// Number of bands.
    fn band_count(&self) -> usize;
    /// Read `rows` full rows of `band` starting at `row`.
    fn read_rows(&mut self, band: usize, row: u32, rows: u32) -> Result<Vec<S>>;
}

impl<S: Sample> BandSource<S> for Raster<S> {
    fn width(&self) -> u32 {
        Raster::width(self)
    }

    fn height(&self) -> u32 {
        Raster::height(self)
    }

    fn band_count(&self) -> usize {
        Raster::band_count(self)
    }

    fn read_rows(&mut self, band: usize, row: u32, rows: u32) -> Result<Vec<S>> {
        let width = Raster::width(self) as usize;
        let start = row as usize * width;
        let end = start + rows as usize * width;
        self.band(band)
            .get(start..end)
            .map(<[S]>::to_vec)
            .ok_or(RasterError::WindowOutOfBounds {
                x: 0,
                y: row,
                w: width as u32,
                h: rows,
                width: width as u32,
                height: Raster::height(self),
            })
    }
}

/// What was written by [`write_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSummary {
    /// Number of bands.
    pub bands: usize,
    /// Number of overview levels.
    pub overviews: u8,
    /// Size of the file in bytes.
    pub bytes: u64,
}

/// Encode all bands of `source` into the strip-indexed layout at `path`.
///
/// Memory use is bounded by one strip of one band at a time.
pub fn write_layout<S, B>(path: &Path, source: &mut B, options: &LayoutOptions) -> Result<LayoutSummary>
where
    S: Sample,
    [S]: TiffValue,
    B: BandSource<S>,
{
    let (width, height) = (source.width(), source.height());
    let bands = source.band_count();
    if width == 0 || height == 0 || bands == 0 {
        return Err(RasterError::InvalidLayout(format!(
            "cannot encode empty raster {}x{} with {} bands",
            width, height, bands
        )));
    }
    let overviews = options.overview_levels(width, height);
    let rows_per_strip = options.rows_per_strip.max(1);

    let file = File::create(path)?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;

    for level in 0..=overviews {
        let factor = 1u32 << level;
        let level_width = width.div_ceil(factor);
        let level_height = height.div_ceil(factor);

        for band in 0..bands {
            let mut image = encoder.new_image_with_compression::<S::Color, _>(
                level_width,
                level_height,
                Uncompressed,
            )?;
            image.rows_per_strip(rows_per_strip)?;

            if level > 0 {
                // Reduced-resolution version of another image
                image.encoder().write_tag(Tag::NewSubfileType, 1u32)?;
            }
            if level == 0 && band == 0 {
                let description = format!("{}bands={};overviews={}", DESCRIPTION_PREFIX, bands, overviews);
                image.encoder().write_tag(Tag::ImageDescription, description.as_str())?;
            }
            if let Some(nodata) = options.nodata {
                image.encoder().write_tag(tag(TAG_GDAL_NODATA), nodata.to_string().as_str())?;
            }
            if let Some(bounds) = options.bounds {
                let scale = [
                    (bounds.max_lon - bounds.min_lon) / f64::from(level_width),
                    (bounds.max_lat - bounds.min_lat) / f64::from(level_height),
                    0.0,
                ];
                let tiepoint = [0.0, 0.0, 0.0, bounds.min_lon, bounds.max_lat, 0.0];
                // Geographic WGS84, pixel-is-area
                let geokeys: [u16; 16] = [1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 1, 2048, 0, 1, 4326];
                image.encoder().write_tag(tag(TAG_MODEL_PIXEL_SCALE), &scale[..])?;
                image.encoder().write_tag(tag(TAG_MODEL_TIEPOINT), &tiepoint[..])?;
                image.encoder().write_tag(tag(TAG_GEO_KEY_DIRECTORY), &geokeys[..])?;
            }

            let mut row = 0;
            while row < level_height {
                let rows = rows_per_strip.min(level_height - row);
                let strip = if level == 0 {
                    source.read_rows(band, row, rows)?
                } else {
                    decimate_rows(source, band, row, rows, factor, level_width)?
                };
                image.write_strip(&strip)?;
                row += rows;
            }
            image.finish()?;
        }
    }
    drop(encoder);

    let bytes = std::fs::metadata(path)?.len();
    tracing::debug!(path = %path.display(), bands, overviews, bytes, "wrote strip-indexed raster");
    Ok(LayoutSummary { bands, overviews, bytes })
}

/// Nearest-neighbour rows for an overview level.
fn decimate_rows<S, B>(source: &mut B, band: usize, row: u32, rows: u32, factor: u32, level_width: u32) -> Result<Vec<S>>
where
    S: Sample,
    B: BandSource<S>,
{
    let height = source.height();
    let mut out = Vec::with_capacity((rows * level_width) as usize);
    for r in row..row + rows {
        let src_row = (r * factor).min(height - 1);
        let full = source.read_rows(band, src_row, 1)?;
        out.extend((0..level_width).map(|x| full[((x * factor) as usize).min(full.len() - 1)]));
    }
    Ok(out)
}

/// Windowed reader over a file written by [`write_layout`].
///
/// Keeps the most recently read strip of each band, so a block that reads
/// several bands of the same rows loads each strip once.
pub struct LayoutReader<S> {
    decoder: Decoder<BufReader<File>>,
    width: u32,
    height: u32,
    bands: usize,
    overviews: u8,
    rows_per_strip: u32,
    nodata: Option<f64>,
    bounds: Option<TileBounds>,
    current_directory: usize,
    cached_strips: Vec<Option<(u32, Vec<S>)>>,
}

impl<S> std::fmt::Debug for LayoutReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutReader")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bands", &self.bands)
            .field("overviews", &self.overviews)
            .finish()
    }
}

impl<S: Sample> LayoutReader<S> {
    /// Open a strip-indexed raster.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

        let description = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .map_err(|_| RasterError::InvalidLayout("missing layout description".to_string()))?;
        let (bands, overviews) = parse_description(&description)?;

        let (width, height) = decoder.dimensions()?;
        let (_, rows_per_strip) = decoder.chunk_dimensions();
        let nodata = decoder
            .get_tag_ascii_string(tag(TAG_GDAL_NODATA))
            .ok()
            .and_then(|s| s.trim_end_matches('\0').trim().parse().ok());
        let bounds = read_bounds(&mut decoder, width, height);

        Ok(Self {
            decoder,
            width,
            height,
            bands,
            overviews,
            rows_per_strip: rows_per_strip.max(1),
            nodata,
            bounds,
            current_directory: 0,
            cached_strips: (0..bands).map(|_| None).collect(),
        })
    }

    /// Full-resolution width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Full-resolution height.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of bands.
    pub fn band_count(&self) -> usize {
        self.bands
    }

    /// Number of overview levels.
    pub fn overviews(&self) -> u8 {
        self.overviews
    }

    /// Rows per strip.
    pub fn rows_per_strip(&self) -> u32 {
        self.rows_per_strip
    }

    /// Nodata sentinel, if the file declares one.
    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Geographic bounds, if the file is georeferenced.
    pub fn bounds(&self) -> Option<TileBounds> {
        self.bounds
    }

    fn seek_directory(&mut self, directory: usize) -> Result<()> {
        if self.current_directory != directory {
            self.decoder.seek_to_image(directory)?;
            self.current_directory = directory;
        }
        Ok(())
    }

    fn strip(&mut self, band: usize, strip: u32) -> Result<&[S]> {
        let cached = matches!(self.cached_strips.get(band), Some(Some((s, _))) if *s == strip);
        if !cached {
            self.seek_directory(band)?;
            let data = S::from_decoded(self.decoder.read_chunk(strip)?)?;
            if let Some(slot) = self.cached_strips.get_mut(band) {
                *slot = Some((strip, data));
            }
        }
        match self.cached_strips.get(band) {
            Some(Some((_, data))) => Ok(data.as_slice()),
            _ => Err(RasterError::InvalidLayout(format!("no cached strip for band {}", band))),
        }
    }

    /// Read a window of one band at full resolution.
    pub fn read_window(&mut self, band: usize, x: u32, y: u32, w: u32, h: u32) -> Result<Vec<S>> {
        if band >= self.bands
            || x.checked_add(w).map_or(true, |end| end > self.width)
            || y.checked_add(h).map_or(true, |end| end > self.height)
        {
            return Err(RasterError::WindowOutOfBounds {
                x,
                y,
                w,
                h,
                width: self.width,
                height: self.height,
            });
        }

        let width = self.width as usize;
        let rows_per_strip = self.rows_per_strip;
        let mut out = Vec::with_capacity(w as usize * h as usize);
        for row in y..y + h {
            let strip_index = row / rows_per_strip;
            let offset = (row % rows_per_strip) as usize * width;
            let strip = self.strip(band, strip_index)?;
            let start = offset + x as usize;
            out.extend_from_slice(&strip[start..start + w as usize]);
        }
        Ok(out)
    }

    /// Read a whole band at the given overview level (0 = full resolution).
    pub fn read_level(&mut self, band: usize, level: u8) -> Result<Raster<S>> {
        if band >= self.bands || level > self.overviews {
            return Err(RasterError::InvalidLayout(format!(
                "no band {} at overview level {}",
                band, level
            )));
        }
        self.seek_directory(level as usize * self.bands + band)?;
        let (w, h) = self.decoder.dimensions()?;
        let data = S::from_decoded(self.decoder.read_image()?)?;
        Raster::from_bands(w, h, vec![data])
    }
}

impl<S: Sample> BandSource<S> for LayoutReader<S> {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn band_count(&self) -> usize {
        self.bands
    }

    fn read_rows(&mut self, band: usize, row: u32, rows: u32) -> Result<Vec<S>> {
        let width = self.width;
        self.read_window(band, 0, row, width, rows)
    }
}

fn parse_description(description: &str) -> Result<(usize, u8)> {
    let body = description
        .trim_end_matches('\0')
        .strip_prefix(DESCRIPTION_PREFIX)
        .ok_or_else(|| RasterError::InvalidLayout(format!("unknown description '{}'", description)))?;

    let mut bands = None;
    let mut overviews = None;
    for field in body.split(';') {
        match field.split_once('=') {
            Some(("bands", v)) => bands = v.parse().ok(),
            Some(("overviews", v)) => overviews = v.parse().ok(),
            _ => {}
        }
    }
    match (bands, overviews) {
        (Some(b), Some(o)) if b > 0 => Ok((b, o)),
        _ => Err(RasterError::InvalidLayout(format!("malformed description '{}'", description))),
    }
}

fn read_bounds<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, width: u32, height: u32) -> Option<TileBounds> {
    let tiepoint = decoder.get_tag_f64_vec(tag(TAG_MODEL_TIEPOINT)).ok()?;
    let scale = decoder.get_tag_f64_vec(tag(TAG_MODEL_PIXEL_SCALE)).ok()?;
    if tiepoint.len() < 6 || scale.len() < 2 {
        return None;
    }
    // Tiepoint format: [i, j, k, x, y, z], top-left corner, data goes south and east
    let max_lat = tiepoint[4];
    let min_lon = tiepoint[3];
    Some(TileBounds {
        min_lat: max_lat - f64::from(height) * scale[1],
        max_lat,
        min_lon,
        max_lon: min_lon + f64::from(width) * scale[0],
    })
}
