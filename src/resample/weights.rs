//! Sparse resampling weights

use super::ResampleMethod;
use crate::errors::{FusionError, Result};
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The grid pair and method a set of weights is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeightKey {
    pub source_shape: (usize, usize),
    pub destination_shape: (usize, usize),
    pub method: ResampleMethod,
}

impl WeightKey {
    #[must_use]
    pub const fn new(
        source_shape: (usize, usize),
        destination_shape: (usize, usize),
        method: ResampleMethod,
    ) -> Self {
        Self {
            source_shape,
            destination_shape,
            method,
        }
    }

    fn source_len(&self) -> usize {
        self.source_shape.0 * self.source_shape.1
    }

    fn destination_len(&self) -> usize {
        self.destination_shape.0 * self.destination_shape.1
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}x{}_{}x{}",
            self.method,
            self.source_shape.0,
            self.source_shape.1,
            self.destination_shape.0,
            self.destination_shape.1
        )
    }
}

/// Corner coordinates of the grid pair a set of weights was computed on.
///
/// Shapes alone do not pin down a region: the same window size cut from a
/// different place yields the same [`WeightKey`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    /// `[lon, lat]` of the source corners (0,0), (0,nx-1), (ny-1,0), (ny-1,nx-1)
    pub source: [[f64; 2]; 4],
    /// First and last destination latitude, then first and last longitude
    pub destination: [f64; 4],
}

impl Footprint {
    const TOLERANCE: f64 = 1e-9;

    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= Self::TOLERANCE;
        self.source
            .iter()
            .flatten()
            .zip(other.source.iter().flatten())
            .all(|(&a, &b)| close(a, b))
            && self
                .destination
                .iter()
                .zip(&other.destination)
                .all(|(&a, &b)| close(a, b))
    }
}

/// Row-compressed sparse weight matrix, one row per destination cell.
///
/// Source and destination cells are addressed by row-major flat index of
/// their spatial axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleWeights {
    key: WeightKey,
    #[serde(default)]
    footprint: Option<Footprint>,
    row_offsets: Vec<usize>,
    columns: Vec<usize>,
    values: Vec<f64>,
}

impl ResampleWeights {
    /// Build weights from one `(source index, weight)` list per destination cell.
    ///
    /// # Errors
    ///
    /// Returns a Resample error if the row count, a source index or a weight
    /// is inconsistent with `key`.
    pub fn from_rows(key: WeightKey, rows: Vec<Vec<(usize, f64)>>) -> Result<Self> {
        if rows.len() != key.destination_len() {
            return Err(FusionError::resample(format!(
                "{} weight rows supplied for {} destination cells",
                rows.len(),
                key.destination_len()
            )));
        }
        let n_src = key.source_len();
        let nnz: usize = rows.iter().map(Vec::len).sum();
        let mut row_offsets = Vec::with_capacity(rows.len() + 1);
        let mut columns = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        row_offsets.push(0);
        for row in rows {
            for (col, w) in row {
                if col >= n_src {
                    return Err(FusionError::resample(format!(
                        "weight references source cell {col} of {n_src}"
                    )));
                }
                if !w.is_finite() {
                    return Err(FusionError::resample("non-finite weight"));
                }
                columns.push(col);
                values.push(w);
            }
            row_offsets.push(columns.len());
        }
        Ok(Self {
            key,
            footprint: None,
            row_offsets,
            columns,
            values,
        })
    }

    #[must_use]
    pub fn key(&self) -> &WeightKey {
        &self.key
    }

    /// Record the coordinates these weights were computed on.
    #[must_use]
    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = Some(footprint);
        self
    }

    #[must_use]
    pub fn footprint(&self) -> Option<&Footprint> {
        self.footprint.as_ref()
    }

    /// True when these weights were computed on `footprint`. Weights with
    /// no recorded footprint never match.
    #[must_use]
    pub fn covers(&self, footprint: &Footprint) -> bool {
        self.footprint.as_ref().is_some_and(|f| f.matches(footprint))
    }

    /// Number of stored weights
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// No destination cell receives anything from the source grid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Weights of one destination cell
    pub fn row(&self, dst: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.row_offsets[dst]..self.row_offsets[dst + 1];
        self.columns[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    /// Fail with a Resample error unless these weights were built for `expected`.
    pub fn ensure_matches(&self, expected: &WeightKey) -> Result<()> {
        if self.key != *expected {
            return Err(FusionError::resample(format!(
                "weights built for {} cannot be reused for {}",
                self.key, expected
            )));
        }
        let consistent = self.row_offsets.len() == self.key.destination_len() + 1
            && self.row_offsets.last() == Some(&self.columns.len())
            && self.columns.len() == self.values.len()
            && self.row_offsets.windows(2).all(|w| w[0] <= w[1])
            && self.columns.iter().all(|&c| c < self.key.source_len());
        if !consistent {
            return Err(FusionError::resample(format!(
                "weights for {} are malformed",
                self.key
            )));
        }
        Ok(())
    }

    /// Apply the weights to a field indexed `(y, x, ...extra axes)`.
    ///
    /// Values are accumulated in f64. Non-finite source values contribute
    /// nothing; interpolating methods renormalize over the remaining weights.
    /// Destination cells with no contribution are NaN.
    pub fn apply(&self, data: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = data.shape();
        if shape.len() < 2 || (shape[0], shape[1]) != self.key.source_shape {
            return Err(FusionError::resample(format!(
                "field shape {:?} does not match weight source shape {:?}",
                shape, self.key.source_shape
            )));
        }
        let extra: Vec<usize> = shape[2..].to_vec();
        let lanes: usize = extra.iter().product();
        let n_src = self.key.source_len();
        let flat = data
            .as_standard_layout()
            .into_owned()
            .into_shape((n_src, lanes))?;

        let n_dst = self.key.destination_len();
        let renormalize = self.key.method.renormalizes();
        let result: Vec<f32> = (0..n_dst * lanes)
            .into_par_iter()
            .map(|flat_idx| {
                let dst = flat_idx / lanes;
                let lane = flat_idx % lanes;
                let mut acc = 0.0_f64;
                let mut weight = 0.0_f64;
                let mut contributed = false;
                for (src, w) in self.row(dst) {
                    let v = flat[[src, lane]];
                    if v.is_finite() {
                        acc += w * f64::from(v);
                        weight += w;
                        contributed = true;
                    }
                }
                if !contributed {
                    f32::NAN
                } else if renormalize {
                    if weight.abs() > f64::EPSILON {
                        (acc / weight) as f32
                    } else {
                        f32::NAN
                    }
                } else {
                    acc as f32
                }
            })
            .collect();

        let mut out_shape = vec![self.key.destination_shape.0, self.key.destination_shape.1];
        out_shape.extend(extra);
        Ok(ArrayD::from_shape_vec(IxDyn(&out_shape), result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn key(method: ResampleMethod) -> WeightKey {
        WeightKey::new((2, 2), (1, 2), method)
    }

    #[test]
    fn key_display_is_stable() {
        assert_eq!(key(ResampleMethod::Bilinear).to_string(), "bilinear_2x2_1x2");
    }

    #[test]
    fn rejects_out_of_range_columns() {
        let rows = vec![vec![(4, 1.0)], vec![]];
        assert!(ResampleWeights::from_rows(key(ResampleMethod::Nearest), rows).is_err());
        let short = vec![vec![(0, 1.0)]];
        assert!(ResampleWeights::from_rows(key(ResampleMethod::Nearest), short).is_err());
    }

    #[test]
    fn interpolating_weights_skip_nan_and_renormalize() {
        let rows = vec![vec![(0, 0.5), (1, 0.5)], vec![(2, 0.25), (3, 0.75)]];
        let w = ResampleWeights::from_rows(key(ResampleMethod::Bilinear), rows).unwrap();
        let data = Array2::from_shape_vec((2, 2), vec![2.0f32, f32::NAN, 4.0, 8.0])
            .unwrap()
            .into_dyn();
        let out = w.apply(&data).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        assert_eq!(out[[0, 0]], 2.0);
        assert_eq!(out[[0, 1]], 7.0);
    }

    #[test]
    fn conservative_weights_sum_without_renormalizing() {
        let rows = vec![vec![(0, 1.0), (1, 0.5)], vec![(1, 0.5), (2, 1.0), (3, 1.0)]];
        let w = ResampleWeights::from_rows(key(ResampleMethod::Conservative), rows).unwrap();
        let data = Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, f32::NAN])
            .unwrap()
            .into_dyn();
        let out = w.apply(&data).unwrap();
        assert_eq!(out[[0, 0]], 2.0);
        assert_eq!(out[[0, 1]], 4.0);
    }

    #[test]
    fn extra_axes_are_mapped_lane_by_lane() {
        let rows = vec![vec![(0, 1.0)], vec![]];
        let w = ResampleWeights::from_rows(key(ResampleMethod::Nearest), rows).unwrap();
        let data = Array3::from_shape_fn((2, 2, 3), |(i, j, k)| (i * 10 + j * 3 + k) as f32).into_dyn();
        let out = w.apply(&data).unwrap();
        assert_eq!(out.shape(), &[1, 2, 3]);
        assert_eq!(out[[0, 0, 2]], 2.0);
        assert!(out[[0, 1, 0]].is_nan());
    }

    #[test]
    fn reuse_for_other_shapes_is_refused() {
        let rows = vec![vec![(0, 1.0)], vec![]];
        let w = ResampleWeights::from_rows(key(ResampleMethod::Nearest), rows).unwrap();
        assert!(w.ensure_matches(&key(ResampleMethod::Nearest)).is_ok());
        assert!(w.ensure_matches(&key(ResampleMethod::Bilinear)).is_err());
        let bigger = Array2::<f32>::zeros((3, 2)).into_dyn();
        assert!(matches!(w.apply(&bigger), Err(FusionError::Resample(_))));
    }

    #[test]
    fn footprints_distinguish_regions_of_equal_shape() {
        let here = Footprint {
            source: [[234.0, 20.0], [235.0, 20.0], [234.0, 21.0], [235.0, 21.0]],
            destination: [30.0, 35.0, -120.0, -110.0],
        };
        let mut there = here;
        there.destination = [31.0, 36.0, -119.0, -109.0];

        let rows = vec![vec![(0, 1.0)], vec![]];
        let w = ResampleWeights::from_rows(key(ResampleMethod::Nearest), rows).unwrap();
        assert!(!w.covers(&here));
        let w = w.with_footprint(here);
        assert!(w.covers(&here));
        assert!(!w.covers(&there));

        let mut nudged = here;
        nudged.source[3][0] += 1e-12;
        assert!(w.covers(&nudged));
    }
}
