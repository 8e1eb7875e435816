//! Gap filling along the time axis. NaN marks a missing observation.

use ndarray::{ArrayViewMut1, Axis};

/// Carry the last valid value forward over gaps.
pub fn forward_fill(mut series: ArrayViewMut1<'_, f32>) {
    let mut last = f32::NAN;
    for value in series.iter_mut() {
        if value.is_nan() {
            *value = last;
        } else {
            last = *value;
        }
    }
}

/// Carry the next valid value backward over gaps.
pub fn backward_fill(mut series: ArrayViewMut1<'_, f32>) {
    let mut next = f32::NAN;
    for value in series.iter_mut().rev() {
        if value.is_nan() {
            *value = next;
        } else {
            next = *value;
        }
    }
}

/// Forward-fill then backward-fill. A series with no valid value stays NaN.
pub fn fill_series(mut series: ArrayViewMut1<'_, f32>) {
    forward_fill(series.view_mut());
    backward_fill(series);
}

/// Fill every pixel's time series of a `(time, ...)` array.
pub fn fill_time_axis<D: ndarray::Dimension>(stack: &mut ndarray::ArrayViewMut<'_, f32, D>) {
    for lane in stack.lanes_mut(Axis(0)) {
        fill_series(lane);
    }
}
