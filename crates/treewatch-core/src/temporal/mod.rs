//! Out-of-core temporal processing of a tile's raw imagery.
//!
//! The extent is cut into square blocks. For each block, only that window of
//! every interval's raw raster is read into a `(time, bands, h, w)` array,
//! transformed along time and written back into one band-sequential scratch
//! raster per interval. Blocks are independent and run on the rayon pool.
//! Finally each scratch raster is encoded into the strip-indexed layout and
//! published under `(tile, interval, level)`.
//!
//! Staged inputs are deleted once the block pass is finished; each output is
//! deleted as soon as it has been published.

pub mod blocks;
pub mod change;
pub mod composite;
pub mod fill;

use crate::config::{IngestSettings, ProcessingSettings};
use crate::error::CoreError;
use crate::ingest::{quality_mask, QUALITY_BAND, RAW_BAND_COUNT};
use crate::params::TileParamStore;
use crate::registry::IntervalId;
use crate::staging::StagedFile;
use crate::store::{ArtifactKey, ArtifactStore, ProductLevel};
use blocks::{Block, Blocks};
use change::ChangeConfig;
use composite::{BandRange, COMPOSITE_BANDS, RGB_BANDS};
use ndarray::{s, Array4, Axis};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use treewatch_metrics::{metric_defs, TileLabels};
use treewatch_raster::{write_layout, BandSource, LayoutOptions, LayoutReader, ScratchRaster, TileId};

/// Raw band index of near infrared.
pub const NIR_BAND: usize = 3;

/// Raw band index of red.
pub const RED_BAND: usize = 2;

/// Colour value of composite pixels never observed.
///
/// Not declared as nodata: a valid pixel at the bottom of its band range
/// stretches to the same value, so validity is carried by the alpha band.
pub const COMPOSITE_FILL: u8 = 0;

/// Nodata of the change band.
pub const CHANGE_NODATA: u8 = 255;

/// Processing policy.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Side of the square processing block.
    pub block_size: u32,
    /// Worker threads; `None` uses the global rayon pool.
    pub threads: Option<usize>,
    /// Quality flag values that mark a pixel as valid.
    pub accepted_quality_codes: Vec<u16>,
    /// Default change-detection constants.
    pub change: ChangeConfig,
    /// Rows per strip of published artifacts.
    pub rows_per_strip: u32,
    /// Maximum overview levels.
    pub max_overviews: u8,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::new(&ProcessingSettings::default(), &IngestSettings::default())
    }
}

impl ProcessorConfig {
    /// Build from configuration sections.
    pub fn new(processing: &ProcessingSettings, ingest: &IngestSettings) -> Self {
        Self {
            block_size: processing.block_size,
            threads: processing.threads,
            accepted_quality_codes: ingest.accepted_quality_codes.clone(),
            change: ChangeConfig {
                cut_threshold: processing.cut_threshold,
                tree_lower_bound: processing.tree_lower_bound,
                smoothing_window: processing.smoothing_window,
                stabilization_window: processing.stabilization_window,
            },
            rows_per_strip: ingest.rows_per_strip,
            max_overviews: ingest.max_overviews,
        }
    }
}

/// What a processing run published.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    /// Tile identifier.
    pub tile: TileId,
    /// Derived level.
    pub level: ProductLevel,
    /// Published intervals with artifact sizes, ascending.
    pub published: Vec<(IntervalId, u64)>,
}

/// One interval's staged raw input.
struct Input {
    interval: IntervalId,
    reader: Mutex<LayoutReader<u16>>,
    _staged: StagedFile,
}

/// Derives composite and change products from stored raw imagery.
pub struct TemporalProcessor {
    store: Arc<dyn ArtifactStore>,
    params: Option<Arc<dyn TileParamStore>>,
    config: ProcessorConfig,
    staging_dir: PathBuf,
}

impl fmt::Debug for TemporalProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporalProcessor")
            .field("config", &self.config)
            .field("staging_dir", &self.staging_dir)
            .finish_non_exhaustive()
    }
}

impl TemporalProcessor {
    /// Create a processor.
    pub fn new(store: Arc<dyn ArtifactStore>, config: ProcessorConfig, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            params: None,
            config,
            staging_dir: staging_dir.into(),
        }
    }

    /// Use per-tile overrides of the change-detection constants.
    pub fn with_params(mut self, params: Arc<dyn TileParamStore>) -> Self {
        self.params = Some(params);
        self
    }

    fn failure(tile: &TileId, reason: impl Into<String>) -> CoreError {
        CoreError::Processing {
            tile: tile.to_string(),
            reason: reason.into(),
        }
    }

    /// Intervals of a tile whose raw image is stored, ascending.
    pub fn raw_intervals(&self, tile: &TileId) -> Result<Vec<IntervalId>, CoreError> {
        let mut intervals = Vec::new();
        for interval in self.store.list_intervals(tile)? {
            if self.store.exists(&ArtifactKey::new(tile.clone(), interval, ProductLevel::Raw))? {
                intervals.push(interval);
            }
        }
        Ok(intervals)
    }

    /// Derive `level` for every stored interval of a tile.
    pub fn process(&self, tile: &TileId, level: ProductLevel) -> Result<ProcessReport, CoreError> {
        if level == ProductLevel::Raw {
            return Err(Self::failure(tile, "raw is not a derived level"));
        }
        let intervals = self.raw_intervals(tile)?;
        if intervals.is_empty() {
            return Err(Self::failure(tile, "no raw imagery stored"));
        }

        let work_dir = self.staging_dir.join(format!("{}_{}", tile, level));
        std::fs::create_dir_all(&work_dir)?;
        tracing::info!(%tile, %level, intervals = intervals.len(), "processing tile");
        metrics::histogram!(metric_defs::PROCESS_STACK_DEPTH.name, &TileLabels::new(tile.as_str()).to_labels())
            .record(intervals.len() as f64);

        let result = self.run(tile, level, &intervals, &work_dir);
        if let Err(e) = std::fs::remove_dir(&work_dir) {
            tracing::debug!(dir = %work_dir.display(), error = %e, "work directory not removed");
        }
        result
    }

    fn run(
        &self,
        tile: &TileId,
        level: ProductLevel,
        intervals: &[IntervalId],
        work_dir: &Path,
    ) -> Result<ProcessReport, CoreError> {
        let inputs = self.stage_inputs(tile, intervals, work_dir)?;
        let (width, height) = match inputs.first() {
            Some(first) => {
                let reader = first.reader.lock();
                (reader.width(), reader.height())
            }
            None => return Err(Self::failure(tile, "no raw imagery stored")),
        };

        let out_bands = match level {
            ProductLevel::Composite => COMPOSITE_BANDS,
            _ => 1,
        };
        let outputs = inputs
            .iter()
            .map(|input| {
                let path = work_dir.join(format!("{}.{}.f32", input.interval, level));
                ScratchRaster::create(path, width, height, out_bands)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let started = Instant::now();
        match level {
            ProductLevel::Composite => {
                let ranges = self.colour_ranges(tile, &inputs)?;
                self.for_each_block(tile, level, width, height, |block| {
                    self.composite_window(&inputs, &outputs, &ranges, block)
                })?;
            }
            _ => {
                let config = self.change_config(tile)?;
                self.for_each_block(tile, level, width, height, |block| {
                    self.change_window(&inputs, &outputs, &config, block)
                })?;
            }
        }
        tracing::info!(%tile, %level, elapsed_ms = started.elapsed().as_millis() as u64, "block pass finished");
        drop(inputs);

        let mut published = Vec::with_capacity(outputs.len());
        for (&interval, output) in intervals.iter().zip(outputs) {
            let bytes = self.publish(tile, interval, level, output, work_dir)?;
            published.push((interval, bytes));
        }

        tracing::info!(%tile, %level, published = published.len(), "processing finished");
        Ok(ProcessReport {
            tile: tile.clone(),
            level,
            published,
        })
    }

    fn stage_inputs(
        &self,
        tile: &TileId,
        intervals: &[IntervalId],
        work_dir: &Path,
    ) -> Result<Vec<Input>, CoreError> {
        let mut inputs: Vec<Input> = Vec::with_capacity(intervals.len());
        for &interval in intervals {
            let staged = StagedFile::new(work_dir.join(format!("{}.raw.tif", interval)));
            let key = ArtifactKey::new(tile.clone(), interval, ProductLevel::Raw);
            self.store.fetch_to(&key, staged.path())?;
            let reader = LayoutReader::<u16>::open(staged.path())?;

            if reader.band_count() != RAW_BAND_COUNT {
                return Err(Self::failure(
                    tile,
                    format!("interval {} has {} bands, expected {}", interval, reader.band_count(), RAW_BAND_COUNT),
                ));
            }
            if let Some(first) = inputs.first() {
                let first = first.reader.lock();
                if (first.width(), first.height()) != (reader.width(), reader.height()) {
                    return Err(Self::failure(
                        tile,
                        format!(
                            "interval {} is {}x{}, expected {}x{}",
                            interval,
                            reader.width(),
                            reader.height(),
                            first.width(),
                            first.height()
                        ),
                    ));
                }
            }
            tracing::debug!(%tile, interval, "staged raw input");
            inputs.push(Input {
                interval,
                reader: Mutex::new(reader),
                _staged: staged,
            });
        }
        Ok(inputs)
    }

    fn change_config(&self, tile: &TileId) -> Result<ChangeConfig, CoreError> {
        let config = self.config.change;
        match &self.params {
            Some(params) => Ok(match params.change_params(tile)? {
                Some(overrides) => {
                    tracing::info!(%tile, ?overrides, "using tile change parameters");
                    config.with_params(overrides)
                }
                None => config,
            }),
            None => Ok(config),
        }
    }

    /// Range of red, green and blue of each input over its valid pixels.
    fn colour_ranges(&self, tile: &TileId, inputs: &[Input]) -> Result<Vec<[Option<BandRange>; 3]>, CoreError> {
        inputs
            .par_iter()
            .map(|input| -> Result<[Option<BandRange>; 3], CoreError> {
                let mut reader = input.reader.lock();
                let (width, height) = (reader.width(), reader.height());
                let chunk = reader.rows_per_strip().max(1);
                let mut ranges = [None; 3];
                let mut row = 0;
                while row < height {
                    let rows = chunk.min(height - row);
                    let quality = reader.read_rows(QUALITY_BAND, row, rows)?;
                    let mask = quality_mask(&quality, &self.config.accepted_quality_codes);
                    for (c, &band) in RGB_BANDS.iter().enumerate() {
                        let values = reader.read_rows(band, row, rows)?;
                        let valid = values
                            .iter()
                            .zip(&mask)
                            .map(|(&v, &ok)| if ok { f32::from(v) } else { f32::NAN });
                        if let Some(part) = BandRange::of(valid) {
                            ranges[c] = Some(match ranges[c] {
                                Some(range) => part.union(range),
                                None => part,
                            });
                        }
                    }
                    row += rows;
                }
                tracing::debug!(%tile, interval = input.interval, width, ?ranges, "colour ranges");
                Ok(ranges)
            })
            .collect()
    }

    fn for_each_block<F>(&self, tile: &TileId, level: ProductLevel, width: u32, height: u32, work: F) -> Result<(), CoreError>
    where
        F: Fn(Block) -> Result<(), CoreError> + Sync + Send,
    {
        let blocks: Vec<Block> = Blocks::new(width, height, self.config.block_size).collect();
        let labels = TileLabels::new(tile.as_str()).with_level(level.as_str()).to_labels();
        let run = || {
            blocks.par_iter().try_for_each(|&block| {
                let started = Instant::now();
                work(block)?;
                metrics::histogram!(metric_defs::PROCESS_BLOCK_TIME.name, &labels)
                    .record(started.elapsed().as_micros() as f64);
                tracing::debug!(%tile, %level, x = block.x, y = block.y, "block done");
                Ok::<(), CoreError>(())
            })
        };

        match self.config.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| Self::failure(tile, format!("thread pool: {}", e)))?
                .install(run),
            None => run(),
        }
    }

    /// Read one band window of every input as `f32`, NaN where the quality
    /// flag is not accepted. Returns `(time, bands, h, w)`.
    fn read_stack(&self, inputs: &[Input], bands: &[usize], block: Block) -> Result<Array4<f32>, CoreError> {
        let shape = (inputs.len(), bands.len(), block.height as usize, block.width as usize);
        let mut stack = Array4::<f32>::from_elem(shape, f32::NAN);
        for (t, input) in inputs.iter().enumerate() {
            let mut reader = input.reader.lock();
            let quality = reader.read_window(QUALITY_BAND, block.x, block.y, block.width, block.height)?;
            let mask = quality_mask(&quality, &self.config.accepted_quality_codes);
            for (b, &band) in bands.iter().enumerate() {
                let values = reader.read_window(band, block.x, block.y, block.width, block.height)?;
                let mut frame = stack.slice_mut(s![t, b, .., ..]);
                for ((dst, &v), &ok) in frame.iter_mut().zip(&values).zip(&mask) {
                    if ok {
                        *dst = f32::from(v);
                    }
                }
            }
        }
        Ok(stack)
    }

    fn composite_window(
        &self,
        inputs: &[Input],
        outputs: &[ScratchRaster],
        ranges: &[[Option<BandRange>; 3]],
        block: Block,
    ) -> Result<(), CoreError> {
        let colours = self.read_stack(inputs, &RGB_BANDS, block)?;
        let out = composite::composite_block(colours.view(), ranges);
        for (t, output) in outputs.iter().enumerate() {
            for b in 0..COMPOSITE_BANDS {
                let data: Vec<f32> = out.slice(s![t, b, .., ..]).iter().copied().collect();
                output.write_window(b, block.x, block.y, block.width, block.height, &data)?;
            }
        }
        Ok(())
    }

    fn change_window(
        &self,
        inputs: &[Input],
        outputs: &[ScratchRaster],
        config: &ChangeConfig,
        block: Block,
    ) -> Result<(), CoreError> {
        let stack = self.read_stack(inputs, &[NIR_BAND, RED_BAND], block)?;
        let index = change::index_block(stack.index_axis(Axis(1), 0), stack.index_axis(Axis(1), 1));
        let out = change::change_block(index.view(), config);
        for (t, output) in outputs.iter().enumerate() {
            let data: Vec<f32> = out.index_axis(Axis(0), t).iter().copied().collect();
            output.write_window(0, block.x, block.y, block.width, block.height, &data)?;
        }
        Ok(())
    }

    fn publish(
        &self,
        tile: &TileId,
        interval: IntervalId,
        level: ProductLevel,
        output: ScratchRaster,
        work_dir: &Path,
    ) -> Result<u64, CoreError> {
        let (fill, nodata) = match level {
            ProductLevel::Composite => (COMPOSITE_FILL, None),
            _ => (CHANGE_NODATA, Some(f64::from(CHANGE_NODATA))),
        };
        let encoded = StagedFile::new(work_dir.join(format!("{}.{}.tif", interval, level)));
        let options = LayoutOptions {
            rows_per_strip: self.config.rows_per_strip,
            max_overviews: self.config.max_overviews,
            nodata,
            bounds: Some(tile.bounds()),
            ..Default::default()
        };
        write_layout(encoded.path(), &mut output.quantized(fill), &options)?;
        output.remove()?;

        let key = ArtifactKey::new(tile.clone(), interval, level);
        let bytes = self.store.put_file(&key, encoded.path())?;
        metrics::counter!(
            metric_defs::ARTIFACTS_PUBLISHED.name,
            &TileLabels::new(tile.as_str()).with_level(level.as_str()).to_labels()
        )
        .increment(1);
        tracing::debug!(%key, bytes, "published derived artifact");
        Ok(bytes)
    }
}
