//! True-colour RGBA composite.
//!
//! Each colour band is stretched to [0, 255] using that image's own range over
//! valid pixels, gaps are filled along time, and alpha marks pixels where all
//! three colours are present after filling.

use super::fill::fill_time_axis;
use ndarray::{s, Array4, ArrayView4, Axis};

/// Raw band indices of red, green and blue, in output order.
pub const RGB_BANDS: [usize; 3] = [2, 1, 0];

/// Output bands: red, green, blue, alpha.
pub const COMPOSITE_BANDS: usize = 4;

/// Alpha value of a present pixel.
pub const OPAQUE: f32 = 255.0;

/// Range of one band of one image over its valid pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandRange {
    /// Smallest valid value.
    pub min: f32,
    /// Largest valid value.
    pub max: f32,
}

impl BandRange {
    /// Range of the valid samples, or `None` if there are none.
    pub fn of<I: IntoIterator<Item = f32>>(values: I) -> Option<Self> {
        values.into_iter().filter(|v| !v.is_nan()).fold(None, |range, v| {
            Some(match range {
                None => BandRange { min: v, max: v },
                Some(r) => BandRange {
                    min: r.min.min(v),
                    max: r.max.max(v),
                },
            })
        })
    }

    /// Merge two partial ranges.
    pub fn union(self, other: Self) -> Self {
        BandRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Stretch a value to [0, 255]. A flat range maps everything to 0.
    pub fn stretch(&self, value: f32) -> f32 {
        if value.is_nan() {
            return f32::NAN;
        }
        let span = self.max - self.min;
        if span > 0.0 {
            (value - self.min) / span * 255.0
        } else {
            0.0
        }
    }
}

/// Build the composite of one block.
///
/// `colours` is `(time, 3, h, w)` in red, green, blue order with NaN for
/// invalid pixels; `ranges[t][c]` is the range of colour `c` in image `t`
/// (`None` when the image has no valid pixel for it). Returns `(time, 4, h, w)`.
pub fn composite_block(colours: ArrayView4<'_, f32>, ranges: &[[Option<BandRange>; 3]]) -> Array4<f32> {
    let (times, _, height, width) = colours.dim();
    let mut out = Array4::<f32>::from_elem((times, COMPOSITE_BANDS, height, width), f32::NAN);

    for t in 0..times {
        for c in 0..3 {
            let src = colours.slice(s![t, c, .., ..]);
            let mut dst = out.slice_mut(s![t, c, .., ..]);
            match ranges.get(t).and_then(|r| r[c]) {
                Some(range) => dst.zip_mut_with(&src, |d, &v| *d = range.stretch(v)),
                None => dst.fill(f32::NAN),
            }
        }
    }

    for c in 0..3 {
        fill_time_axis(&mut out.index_axis_mut(Axis(1), c));
    }

    for t in 0..times {
        let mut frame = out.index_axis_mut(Axis(0), t);
        for y in 0..height {
            for x in 0..width {
                let present = (0..3).all(|c| !frame[[c, y, x]].is_nan());
                frame[[3, y, x]] = if present { OPAQUE } else { 0.0 };
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array4;

    const ND: f32 = f32::NAN;

    #[test]
    fn test_range_ignores_nodata() {
        let range = BandRange::of([ND, 10.0, 30.0, ND, 20.0]).unwrap();
        assert_eq!(range, BandRange { min: 10.0, max: 30.0 });
        assert!(BandRange::of([ND, ND]).is_none());
    }

    #[test]
    fn test_stretch() {
        let range = BandRange { min: 100.0, max: 300.0 };
        assert_relative_eq!(range.stretch(100.0), 0.0);
        assert_relative_eq!(range.stretch(200.0), 127.5);
        assert_relative_eq!(range.stretch(300.0), 255.0);
        assert!(range.stretch(ND).is_nan());

        let flat = BandRange { min: 5.0, max: 5.0 };
        assert_eq!(flat.stretch(5.0), 0.0);
    }

    #[test]
    fn test_composite_fills_and_sets_alpha() {
        // Two images, one pixel. Image 1 is missing; image 0 has values.
        let mut colours = Array4::<f32>::from_elem((2, 3, 1, 2), ND);
        colours[[0, 0, 0, 0]] = 200.0;
        colours[[0, 1, 0, 0]] = 100.0;
        colours[[0, 2, 0, 0]] = 300.0;
        let range = Some(BandRange { min: 100.0, max: 300.0 });
        let ranges = vec![[range; 3], [None; 3]];

        let out = composite_block(colours.view(), &ranges);
        assert_eq!(out.dim(), (2, 4, 1, 2));

        // Filled forward into image 1
        for t in 0..2 {
            assert_relative_eq!(out[[t, 0, 0, 0]], 127.5);
            assert_relative_eq!(out[[t, 1, 0, 0]], 0.0);
            assert_relative_eq!(out[[t, 2, 0, 0]], 255.0);
            assert_eq!(out[[t, 3, 0, 0]], OPAQUE);
        }
        // Never-valid pixel stays transparent
        assert!(out[[0, 0, 0, 1]].is_nan());
        assert_eq!(out[[1, 3, 0, 1]], 0.0);
    }
}
