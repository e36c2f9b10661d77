//! Degraded fallback resampling
//!
//! Used when full geometric weights are unavailable. The source grid is
//! collapsed to one latitude per row and one longitude per column and
//! interpolated separably. On mildly curved grids this is close to bilinear;
//! on strongly rotated grids it is visibly worse, so results are flagged.

use super::kernel::{SourceGeometry, WeightKernel};
use super::weights::{ResampleWeights, WeightKey};
use super::{resample_with, Resampled, ResampleMethod, Resampler, WeightCache};
use crate::errors::{FusionError, Result};
use crate::grid::{Coverage, GeoGrid, RegularGrid};
use ndarray::{Array1, Axis};
use tracing::warn;

/// Separable linear interpolation over row/column averaged coordinates.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeparableKernel;

/// Averaged coordinate axis, checked to be strictly monotonic.
fn monotonic_axis(values: Array1<f64>, name: &str) -> Result<Array1<f64>> {
    if values.len() < 2 {
        return Err(FusionError::resample(format!(
            "fallback resampling needs at least two source {name} values"
        )));
    }
    let increasing = values.windows(2).into_iter().all(|w| w[0] < w[1]);
    let decreasing = values.windows(2).into_iter().all(|w| w[0] > w[1]);
    if !(increasing || decreasing) {
        return Err(FusionError::resample(format!(
            "averaged source {name} is not monotonic"
        )));
    }
    Ok(values)
}

/// Neighbouring indices around `v` and the fraction towards the second one.
fn bracket(axis: &Array1<f64>, v: f64) -> Option<(usize, usize, f64)> {
    let n = axis.len();
    let first = axis[0];
    let last = axis[n - 1];
    let (lo, hi) = if first <= last { (first, last) } else { (last, first) };
    if v < lo || v > hi {
        return None;
    }
    let k = (0..n - 1)
        .find(|&k| {
            let (a, b) = (axis[k], axis[k + 1]);
            (a <= v && v <= b) || (b <= v && v <= a)
        })?;
    let frac = (v - axis[k]) / (axis[k + 1] - axis[k]);
    Some((k, k + 1, frac))
}

impl WeightKernel for SeparableKernel {
    fn compute_weights(
        &self,
        source: &SourceGeometry,
        destination: &RegularGrid,
        method: ResampleMethod,
    ) -> Result<ResampleWeights> {
        let lat_axis = source
            .lat()
            .mean_axis(Axis(1))
            .ok_or_else(|| FusionError::resample("source grid has no columns"))?;
        let lon_axis = source
            .lon()
            .mean_axis(Axis(0))
            .ok_or_else(|| FusionError::resample("source grid has no rows"))?;
        let lat_axis = monotonic_axis(lat_axis, "latitude")?;
        let lon_axis = monotonic_axis(lon_axis, "longitude")?;
        let nx = lon_axis.len();

        let mut rows = Vec::with_capacity(destination.lat().len() * destination.lon().len());
        for &lat in destination.lat() {
            let row_bracket = bracket(&lat_axis, lat);
            for &lon in destination.lon() {
                let weights = match (row_bracket, bracket(&lon_axis, lon)) {
                    (Some((a0, a1, t)), Some((b0, b1, s))) => vec![
                        (a0 * nx + b0, (1.0 - t) * (1.0 - s)),
                        (a0 * nx + b1, (1.0 - t) * s),
                        (a1 * nx + b0, t * (1.0 - s)),
                        (a1 * nx + b1, t * s),
                    ],
                    _ => Vec::new(),
                };
                rows.push(weights);
            }
        }
        ResampleWeights::from_rows(WeightKey::new(source.shape(), destination.shape(), method), rows)
    }
}

/// Resampler of last resort. Always interpolates bilinearly and marks its
/// results as degraded.
#[derive(Debug, Default)]
pub struct FallbackResampler {
    kernel: SeparableKernel,
    cache: WeightCache,
}

impl FallbackResampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Resampler for FallbackResampler {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn is_degraded(&self) -> bool {
        true
    }

    fn resample(
        &self,
        source: &GeoGrid,
        destination: &RegularGrid,
        method: ResampleMethod,
        cache_key: Option<&str>,
    ) -> Result<Coverage<Resampled>> {
        if method != ResampleMethod::Bilinear {
            warn!(
                requested = %method,
                "Fallback resampler only supports bilinear interpolation"
            );
        }
        resample_with(
            &self.kernel,
            &self.cache,
            source,
            destination,
            ResampleMethod::Bilinear,
            cache_key,
            true,
        )
    }

    fn weight_cache(&self) -> Option<&WeightCache> {
        Some(&self.cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{CurvilinearGrid, Field};
    use ndarray::Array2;

    #[test]
    fn bracket_handles_both_directions() {
        let up = Array1::from(vec![0.0, 1.0, 2.0]);
        let down = Array1::from(vec![2.0, 1.0, 0.0]);
        assert_eq!(bracket(&up, 1.5), Some((1, 2, 0.5)));
        assert_eq!(bracket(&down, 1.5), Some((0, 1, 0.5)));
        assert_eq!(bracket(&up, 2.5), None);
    }

    #[test]
    fn results_are_flagged_degraded() {
        let lat = Array2::from_shape_fn((4, 4), |(i, _)| 30.0 + i as f64);
        let lon = Array2::from_shape_fn((4, 4), |(_, j)| 240.0 + j as f64);
        let values = Array2::from_shape_fn((4, 4), |(_, j)| j as f32);
        let source: GeoGrid = CurvilinearGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("frp", values.into_dyn()))
            .unwrap()
            .into();
        let dst = RegularGrid::new(Array1::from(vec![30.5, 31.5]), Array1::from(vec![-119.5, -118.5])).unwrap();

        let out = FallbackResampler::new()
            .resample(&source, &dst, ResampleMethod::Conservative, Some("k"))
            .unwrap()
            .covered()
            .unwrap();
        assert!(out.degraded);
        let frp = &out.grid.field("frp").unwrap().data;
        assert!((frp[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((frp[[1, 1]] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn non_monotonic_rows_are_rejected() {
        let lat = Array2::from_shape_fn((3, 2), |(i, _)| [30.0, 32.0, 31.0][i]);
        let lon = Array2::from_shape_fn((3, 2), |(_, j)| 240.0 + j as f64);
        let geometry = SourceGeometry::new(lat, lon).unwrap();
        let dst = RegularGrid::new(Array1::from(vec![31.0]), Array1::from(vec![240.5])).unwrap();
        let err = SeparableKernel.compute_weights(&geometry, &dst, ResampleMethod::Bilinear);
        assert!(matches!(err, Err(FusionError::Resample(_))));
    }
}
