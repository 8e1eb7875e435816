//! Tree-loss change signal.
//!
//! Per pixel, over the time series of a normalized difference vegetation
//! index:
//!
//! 1. fill gaps forward then backward and clip to [-1, 1]
//! 2. smooth with a centered rolling mean (truncated at the edges)
//! 3. flag a loss event where the smoothed index falls below
//!    `max(peak - cut_threshold, tree_lower_bound)`, `peak` being the running
//!    maximum up to and including that interval
//! 4. count loss events cumulatively
//! 5. suppress the signal once the count has been flat for a whole
//!    stabilization window, until the next loss event
//!
//! The output is 1 where the count is positive and not suppressed, 0
//! otherwise, and NaN for pixels that were never valid.

use super::fill::fill_series;
use crate::params::ChangeParams;
use ndarray::{Array3, ArrayView3, ArrayViewMut1, Axis, Zip};

/// Output value of a loss pixel.
pub const LOSS: f32 = 1.0;

/// Output value of a no-loss pixel.
pub const NO_LOSS: f32 = 0.0;

/// Change-detection constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeConfig {
    /// Drop below the running peak that counts as loss.
    pub cut_threshold: f32,
    /// Floor for the loss trigger.
    pub tree_lower_bound: f32,
    /// Width of the centered rolling mean.
    pub smoothing_window: usize,
    /// Trailing intervals with a flat count that mark stabilization.
    pub stabilization_window: usize,
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            cut_threshold: 0.25,
            tree_lower_bound: 0.7,
            smoothing_window: 3,
            stabilization_window: 3,
        }
    }
}

impl ChangeConfig {
    /// Apply per-tile overrides.
    pub fn with_params(self, params: ChangeParams) -> Self {
        Self {
            cut_threshold: params.cut_threshold,
            tree_lower_bound: params.tree_lower_bound,
            ..self
        }
    }
}

/// Normalized difference vegetation index, NaN where undefined.
pub fn vegetation_index(nir: f32, red: f32) -> f32 {
    let sum = nir + red;
    if nir.is_nan() || red.is_nan() || sum == 0.0 {
        f32::NAN
    } else {
        (nir - red) / sum
    }
}

/// Centered rolling mean. Edge positions average over the part of the
/// window that lies inside the series.
pub fn rolling_mean(series: &[f32], window: usize) -> Vec<f32> {
    let half = window.max(1) / 2;
    (0..series.len())
        .map(|t| {
            let start = t.saturating_sub(half);
            let end = (t + half + 1).min(series.len());
            let window = &series[start..end];
            window.iter().sum::<f32>() / window.len() as f32
        })
        .collect()
}

/// Replace an index series with its loss signal, in place.
fn loss_series(mut series: ArrayViewMut1<'_, f32>, config: &ChangeConfig) {
    fill_series(series.view_mut());
    if series.iter().all(|v| v.is_nan()) {
        return;
    }

    let clipped: Vec<f32> = series.iter().map(|v| v.clamp(-1.0, 1.0)).collect();
    let smoothed = rolling_mean(&clipped, config.smoothing_window);
    let flat_span = config.stabilization_window.max(1);

    let mut peak = f32::NEG_INFINITY;
    let mut cumulative = Vec::with_capacity(smoothed.len());
    let mut count = 0u32;
    let mut suppressed = false;

    for (t, (&index, out)) in smoothed.iter().zip(series.iter_mut()).enumerate() {
        peak = peak.max(index);
        let trigger = (peak - config.cut_threshold).max(config.tree_lower_bound);
        let loss = index < trigger;
        if loss {
            count += 1;
        }
        cumulative.push(count);

        let stabilized = t + 1 >= flat_span && cumulative[t + 1 - flat_span..].iter().all(|&c| c == count);
        suppressed = stabilized || (suppressed && !loss);

        *out = if count > 0 && !suppressed { LOSS } else { NO_LOSS };
    }
}

/// Loss signal of one block.
///
/// `index` is `(time, h, w)` with NaN for invalid observations.
pub fn change_block(index: ArrayView3<'_, f32>, config: &ChangeConfig) -> Array3<f32> {
    let mut out = index.to_owned();
    for lane in out.lanes_mut(Axis(0)) {
        loss_series(lane, config);
    }
    out
}

/// Vegetation index of a `(time, h, w)` block from its red and NIR bands.
pub fn index_block(nir: ArrayView3<'_, f32>, red: ArrayView3<'_, f32>) -> Array3<f32> {
    Zip::from(&nir).and(&red).map_collect(|&n, &r| vegetation_index(n, r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array3};

    const ND: f32 = f32::NAN;

    fn signal(values: &[f32]) -> Vec<f32> {
        let mut series = Array1::from_vec(values.to_vec());
        loss_series(series.view_mut(), &ChangeConfig::default());
        series.to_vec()
    }

    #[test]
    fn test_vegetation_index() {
        assert_relative_eq!(vegetation_index(3000.0, 1000.0), 0.5);
        assert!(vegetation_index(0.0, 0.0).is_nan());
        assert!(vegetation_index(ND, 100.0).is_nan());
    }

    #[test]
    fn test_rolling_mean_truncates_edges() {
        let smoothed = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_relative_eq!(smoothed[0], 1.5);
        assert_relative_eq!(smoothed[1], 2.0);
        assert_relative_eq!(smoothed[2], 3.0);
        assert_relative_eq!(smoothed[3], 3.5);
        assert_eq!(rolling_mean(&[], 3), Vec::<f32>::new());
    }

    #[test]
    fn test_sustained_drop_flags_from_drop_on() {
        let out = signal(&[0.75, 0.8, 0.9, 0.9, 0.9, 0.9, 0.3, 0.3, 0.3, 0.3]);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_stable_forest_has_no_loss() {
        let out = signal(&[0.9; 8]);
        assert!(out.iter().all(|&v| v == NO_LOSS));
    }

    #[test]
    fn test_regrowth_suppression_is_not_retroactive() {
        let out = signal(&[0.9, 0.9, 0.9, 0.2, 0.2, 0.9, 0.9, 0.9, 0.9, 0.9]);
        // Loss intervals keep their flag; suppression only starts once the
        // count has been flat for three intervals (t5..=t7).
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_gaps_are_filled_before_detection() {
        let out = signal(&[0.9, ND, 0.9, 0.9, ND, 0.9]);
        assert!(out.iter().all(|&v| v == NO_LOSS));
    }

    #[test]
    fn test_never_valid_pixel_stays_nodata() {
        let out = signal(&[ND, ND, ND, ND]);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_override_lowers_floor() {
        let config = ChangeConfig::default().with_params(ChangeParams {
            cut_threshold: 0.25,
            tree_lower_bound: 0.2,
        });
        let mut series = Array1::from_vec(vec![0.4f32; 6]);
        loss_series(series.view_mut(), &config);
        assert!(series.iter().all(|&v| v == NO_LOSS));

        // Same series is below the default floor everywhere.
        let out = signal(&[0.4; 6]);
        assert_eq!(out[0], LOSS);
    }

    #[test]
    fn test_change_block_per_pixel() {
        let nir = Array3::from_shape_vec((2, 1, 2), vec![3000.0, ND, 3000.0, ND]).unwrap();
        let red = Array3::from_shape_vec((2, 1, 2), vec![1000.0, ND, 1000.0, ND]).unwrap();
        let index = index_block(nir.view(), red.view());
        assert_relative_eq!(index[[0, 0, 0]], 0.5);

        let out = change_block(index.view(), &ChangeConfig::default());
        // 0.5 sits below the 0.7 floor from the first interval.
        assert_eq!(out[[0, 0, 0]], LOSS);
        assert!(out[[1, 0, 1]].is_nan());
    }
}
