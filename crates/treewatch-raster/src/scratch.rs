//! Band-sequential `f32` scratch rasters on disk.
//!
//! Temporal processing keeps one scratch raster per interval so that only a
//! block window of each needs to be resident at a time. The file is raw
//! native-endian `f32`, band after band, row-major inside a band. NaN marks
//! nodata. The file is removed when the raster is dropped.

use crate::layout::BandSource;
use crate::{RasterError, Result, Sample};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SAMPLE_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// A disk-backed `f32` raster supporting windowed reads and writes.
///
/// Windows may be read and written from several threads; file access is
/// serialized internally.
#[derive(Debug)]
pub struct ScratchRaster {
    path: PathBuf,
    width: u32,
    height: u32,
    bands: usize,
    file: Mutex<File>,
}

impl ScratchRaster {
    /// Create a scratch raster filled with NaN.
    pub fn create<P: AsRef<Path>>(path: P, width: u32, height: u32, bands: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let row = vec![f32::NAN; width as usize];
        let row_bytes: &[u8] = bytemuck::cast_slice(&row);
        {
            let mut writer = std::io::BufWriter::new(&mut file);
            for _ in 0..(height as usize * bands) {
                writer.write_all(row_bytes)?;
            }
            writer.flush()?;
        }

        tracing::trace!(path = %path.display(), width, height, bands, "created scratch raster");
        Ok(Self {
            path,
            width,
            height,
            bands,
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of bands.
    pub fn band_count(&self) -> usize {
        self.bands
    }

    fn check_window(&self, band: usize, x: u32, y: u32, w: u32, h: u32) -> Result<()> {
        let fits = band < self.bands
            && x.checked_add(w).is_some_and(|end| end <= self.width)
            && y.checked_add(h).is_some_and(|end| end <= self.height);
        if fits {
            Ok(())
        } else {
            Err(RasterError::WindowOutOfBounds {
                x,
                y,
                w,
                h,
                width: self.width,
                height: self.height,
            })
        }
    }

    fn offset(&self, band: usize, x: u32, y: u32) -> u64 {
        let band_len = u64::from(self.width) * u64::from(self.height);
        (band as u64 * band_len + u64::from(y) * u64::from(self.width) + u64::from(x)) * SAMPLE_BYTES
    }

    /// Read a window of one band.
    pub fn read_window(&self, band: usize, x: u32, y: u32, w: u32, h: u32) -> Result<Vec<f32>> {
        self.check_window(band, x, y, w, h)?;
        let mut out = vec![0f32; w as usize * h as usize];
        let mut file = self.file.lock();
        for (r, row) in out.chunks_exact_mut(w.max(1) as usize).enumerate() {
            file.seek(SeekFrom::Start(self.offset(band, x, y + r as u32)))?;
            file.read_exact(bytemuck::cast_slice_mut(row))?;
        }
        Ok(out)
    }

    /// Write a window of one band.
    pub fn write_window(&self, band: usize, x: u32, y: u32, w: u32, h: u32, data: &[f32]) -> Result<()> {
        self.check_window(band, x, y, w, h)?;
        if data.len() != w as usize * h as usize {
            return Err(RasterError::DimensionMismatch {
                width: w,
                height: h,
                found: data.len(),
            });
        }
        let mut file = self.file.lock();
        for (r, row) in data.chunks_exact(w.max(1) as usize).enumerate() {
            file.seek(SeekFrom::Start(self.offset(band, x, y + r as u32)))?;
            file.write_all(bytemuck::cast_slice(row))?;
        }
        Ok(())
    }

    /// Read full rows of one band.
    pub fn read_rows(&self, band: usize, row: u32, rows: u32) -> Result<Vec<f32>> {
        self.read_window(band, 0, row, self.width, rows)
    }

    /// Write full rows of one band.
    pub fn write_rows(&self, band: usize, row: u32, data: &[f32]) -> Result<()> {
        let rows = if self.width == 0 { 0 } else { (data.len() / self.width as usize) as u32 };
        self.write_window(band, 0, row, self.width, rows, data)
    }

    /// View the raster as a source of `S` samples, mapping NaN to `nodata`.
    pub fn quantized<S: Sample>(&self, nodata: S) -> Quantized<'_, S> {
        Quantized { raster: self, nodata }
    }

    /// Delete the backing file now.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

impl Drop for ScratchRaster {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch raster");
            }
        }
    }
}

/// Integer view of a [`ScratchRaster`], used when encoding outputs.
#[derive(Debug)]
pub struct Quantized<'a, S> {
    raster: &'a ScratchRaster,
    nodata: S,
}

impl<S: Sample> BandSource<S> for Quantized<'_, S> {
    fn width(&self) -> u32 {
        self.raster.width
    }

    fn height(&self) -> u32 {
        self.raster.height
    }

    fn band_count(&self) -> usize {
        self.raster.bands
    }

    fn read_rows(&mut self, band: usize, row: u32, rows: u32) -> Result<Vec<S>> {
        let nodata = self.nodata;
        Ok(self
            .raster
            .read_rows(band, row, rows)?
            .into_iter()
            .map(|v| if v.is_nan() { nodata } else { S::from_f32(v) })
            .collect())
    }
}
