//! In-memory multi-band rasters and decoding of source GeoTIFFs.

use crate::{RasterError, Result};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype;

/// A pixel sample type that can be stored in the strip-indexed layout.
pub trait Sample: Copy + Default + PartialEq + Send + Sync + 'static {
    /// Single-channel TIFF colour type used to encode one band.
    type Color: colortype::ColorType<Inner = Self>;

    /// Convert from a processing value, saturating into range.
    fn from_f32(value: f32) -> Self;

    /// Convert to a processing value.
    fn to_f32(self) -> f32;

    /// Convert a decoded TIFF buffer into samples of this type.
    fn from_decoded(result: DecodingResult) -> Result<Vec<Self>>;
}

impl Sample for u8 {
    type Color = colortype::Gray8;

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }

    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_decoded(result: DecodingResult) -> Result<Vec<Self>> {
        match result {
            DecodingResult::U8(data) => Ok(data),
            other => Err(RasterError::UnsupportedDataType(format!(
                "expected 8-bit samples, got {}",
                decoded_kind(&other)
            ))),
        }
    }
}

impl Sample for u16 {
    type Color = colortype::Gray16;

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 65535.0) as u16
    }

    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_decoded(result: DecodingResult) -> Result<Vec<Self>> {
        match result {
            DecodingResult::U16(data) => Ok(data),
            DecodingResult::U8(data) => Ok(data.into_iter().map(u16::from).collect()),
            // Signed reflectance only goes negative for fill values; clamp to the nodata floor.
            DecodingResult::I16(data) => Ok(data.into_iter().map(|v| v.max(0) as u16).collect()),
            other => Err(RasterError::UnsupportedDataType(format!(
                "expected 16-bit samples, got {}",
                decoded_kind(&other)
            ))),
        }
    }
}

fn decoded_kind(result: &DecodingResult) -> &'static str {
    match result {
        DecodingResult::U8(_) => "u8",
        DecodingResult::U16(_) => "u16",
        DecodingResult::U32(_) => "u32",
        DecodingResult::U64(_) => "u64",
        DecodingResult::I8(_) => "i8",
        DecodingResult::I16(_) => "i16",
        DecodingResult::I32(_) => "i32",
        DecodingResult::I64(_) => "i64",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
        #[allow(unreachable_patterns)]
        _ => "other",
    }
}

/// A band-sequential raster held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<S> {
    width: u32,
    height: u32,
    bands: Vec<Vec<S>>,
}

impl<S: Sample> Raster<S> {
    /// Create a raster with every band filled with `fill`.
    pub fn filled(width: u32, height: u32, band_count: usize, fill: S) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            bands: vec![vec![fill; pixels]; band_count],
        }
    }

    /// Create a raster from per-band buffers.
    pub fn from_bands(width: u32, height: u32, bands: Vec<Vec<S>>) -> Result<Self> {
        let pixels = width as usize * height as usize;
        if let Some(bad) = bands.iter().find(|b| b.len() != pixels) {
            return Err(RasterError::DimensionMismatch {
                width,
                height,
                found: bad.len(),
            });
        }
        Ok(Self { width, height, bands })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of pixels per band.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bands.
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Samples of one band in row-major order.
    pub fn band(&self, index: usize) -> &[S] {
        &self.bands[index]
    }

    /// Mutable samples of one band.
    pub fn band_mut(&mut self, index: usize) -> &mut [S] {
        &mut self.bands[index]
    }

    /// All bands.
    pub fn bands(&self) -> &[Vec<S>] {
        &self.bands
    }

    /// Consume the raster, returning its bands.
    pub fn into_bands(self) -> Vec<Vec<S>> {
        self.bands
    }
}

impl<S: Sample> Raster<S> {
    /// Decode a source GeoTIFF into bands.
    ///
    /// Accepts either a single image directory with all bands pixel-interleaved
    /// (the provider's layout) or one single-band directory per band (the layout
    /// written by [`crate::write_layout`], overview directories are skipped).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let mut decoder = Decoder::new(std::io::BufReader::new(file))?;

        // Source tiles are 4004 x 4004 x 8 bands of u16 = ~256 MB decoded
        let mut limits = Limits::default();
        limits.decoding_buffer_size = 1024 * 1024 * 1024; // 1 GB
        limits.intermediate_buffer_size = 1024 * 1024 * 1024; // 1 GB
        limits.ifd_value_size = 1024 * 1024 * 1024;
        decoder = decoder.with_limits(limits);

        let (width, height) = decoder.dimensions()?;
        let mut bands = Vec::new();

        loop {
            let (w, h) = decoder.dimensions()?;
            if (w, h) == (width, height) {
                let data = S::from_decoded(decoder.read_image()?)?;
                let pixels = width as usize * height as usize;
                if pixels == 0 || data.len() % pixels != 0 {
                    return Err(RasterError::DimensionMismatch {
                        width,
                        height,
                        found: data.len(),
                    });
                }
                let samples = data.len() / pixels;
                bands.extend(deinterleave(data, samples));
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        Self::from_bands(width, height, bands)
    }
}

/// Split pixel-interleaved samples into per-band buffers.
fn deinterleave<S: Copy>(data: Vec<S>, samples: usize) -> Vec<Vec<S>> {
    if samples == 1 {
        return vec![data];
    }
    let pixels = data.len() / samples;
    let mut bands: Vec<Vec<S>> = (0..samples).map(|_| Vec::with_capacity(pixels)).collect();
    for pixel in data.chunks_exact(samples) {
        for (band, &value) in bands.iter_mut().zip(pixel) {
            band.push(value);
        }
    }
    bands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave() {
        let bands = deinterleave(vec![1u16, 10, 2, 20, 3, 30], 2);
        assert_eq!(bands, vec![vec![1, 2, 3], vec![10, 20, 30]]);
    }

    #[test]
    fn test_from_bands_checks_length() {
        let err = Raster::<u8>::from_bands(2, 2, vec![vec![0; 4], vec![0; 3]]).unwrap_err();
        assert!(matches!(err, RasterError::DimensionMismatch { found: 3, .. }));
    }

    #[test]
    fn test_sample_conversion_saturates() {
        assert_eq!(u8::from_f32(300.0), 255);
        assert_eq!(u8::from_f32(-4.0), 0);
        assert_eq!(u8::from_f32(127.6), 128);
        assert_eq!(u16::from_f32(70000.0), 65535);
    }
}
