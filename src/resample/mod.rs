//! Grid-to-grid resampling with weight reuse
//!
//! Resampling is split in two: a [`WeightKernel`] turns a pair of grid
//! geometries into sparse [`ResampleWeights`], and the weights are applied to
//! every field of the source grid. Weights depend only on the grid pair and
//! the method, so they are cached in a [`WeightCache`] and reused verbatim for
//! later timesteps with identically shaped grids.
//!
//! Two [`Resampler`] implementations exist and are chosen by configuration:
//!
//! - [`FullResampler`]: geometric nearest / bilinear / conservative weights
//! - [`FallbackResampler`]: separable linear interpolation over row/column
//!   averaged coordinates, flagged as degraded

pub mod cache;
pub mod fallback;
pub mod kernel;
pub mod weights;

pub use cache::WeightCache;
pub use fallback::{FallbackResampler, SeparableKernel};
pub use kernel::{GeometricKernel, SourceGeometry, WeightKernel};
pub use weights::{Footprint, ResampleWeights, WeightKey};

use crate::errors::{FusionError, Result};
use crate::grid::{Coverage, Field, GeoGrid, RegularGrid};
use crate::normalize::LonConvention;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Supported interpolation methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    /// Bilinear interpolation inside the enclosing source quad
    Bilinear,
    /// Overlap-weighted redistribution preserving field totals
    Conservative,
    /// Value of the nearest source cell centre
    Nearest,
}

impl ResampleMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bilinear => "bilinear",
            Self::Conservative => "conservative",
            Self::Nearest => "nearest",
        }
    }

    /// Interpolating methods renormalize over finite contributions; the
    /// conservative method sums them, treating missing values as zero mass.
    #[must_use]
    pub const fn renormalizes(self) -> bool {
        !matches!(self, Self::Conservative)
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResampleMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bilinear" => Ok(Self::Bilinear),
            "conservative" => Ok(Self::Conservative),
            "nearest" | "nearest_s2d" => Ok(Self::Nearest),
            other => Err(format!(
                "unknown resample method '{other}' (expected bilinear, conservative or nearest)"
            )),
        }
    }
}

/// Which resampler implementation a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Full,
    Fallback,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown backend '{other}' (expected full or fallback)")),
        }
    }
}

/// A source grid mapped onto a destination grid.
#[derive(Debug, Clone)]
pub struct Resampled {
    /// Resampled fields on the destination coordinates
    pub grid: RegularGrid,
    /// Produced by a lower-quality fallback path
    pub degraded: bool,
    /// The weights came from the cache
    pub weights_reused: bool,
}

/// Capability to resample one grid onto another.
pub trait Resampler: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether results from this resampler are degraded in quality
    fn is_degraded(&self) -> bool;

    /// Map every field of `source` onto `destination`'s coordinates.
    ///
    /// With a `cache_key`, weights computed for that key are reused; a cached
    /// entry whose shapes do not match this grid pair is a Resample error.
    /// Grids that do not overlap yield [`Coverage::Empty`].
    fn resample(
        &self,
        source: &GeoGrid,
        destination: &RegularGrid,
        method: ResampleMethod,
        cache_key: Option<&str>,
    ) -> Result<Coverage<Resampled>>;

    /// The weight cache backing this resampler, if any.
    fn weight_cache(&self) -> Option<&WeightCache>;
}

/// Resampler backed by a full geometric weight kernel.
pub struct FullResampler {
    kernel: Box<dyn WeightKernel>,
    cache: WeightCache,
}

impl FullResampler {
    /// Use the built-in [`GeometricKernel`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_kernel(Box::new(GeometricKernel::default()))
    }

    /// Use an externally supplied weight kernel.
    #[must_use]
    pub fn with_kernel(kernel: Box<dyn WeightKernel>) -> Self {
        Self {
            kernel,
            cache: WeightCache::new(),
        }
    }
}

impl Default for FullResampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler for FullResampler {
    fn name(&self) -> &'static str {
        "full"
    }

    fn is_degraded(&self) -> bool {
        false
    }

    fn resample(
        &self,
        source: &GeoGrid,
        destination: &RegularGrid,
        method: ResampleMethod,
        cache_key: Option<&str>,
    ) -> Result<Coverage<Resampled>> {
        resample_with(
            self.kernel.as_ref(),
            &self.cache,
            source,
            destination,
            method,
            cache_key,
            false,
        )
    }

    fn weight_cache(&self) -> Option<&WeightCache> {
        Some(&self.cache)
    }
}

/// Shared driver: geometry, overlap check, cached weights, field mapping.
pub(crate) fn resample_with(
    kernel: &dyn WeightKernel,
    cache: &WeightCache,
    source: &GeoGrid,
    destination: &RegularGrid,
    method: ResampleMethod,
    cache_key: Option<&str>,
    degraded: bool,
) -> Result<Coverage<Resampled>> {
    check_destination(destination)?;
    let convention = LonConvention::detect(destination.lon().iter());
    let geometry = SourceGeometry::from_grid(source, convention)?;

    if !geometry.overlaps(destination) {
        debug!("Source and destination grids do not overlap");
        return Ok(Coverage::Empty);
    }

    let key = WeightKey::new(geometry.shape(), destination.shape(), method);
    let footprint = geometry.footprint(destination);
    let (weights, weights_reused) = match cache_key {
        Some(cache_key) => cache.get_or_compute(cache_key, &key, &footprint, || {
            kernel
                .compute_weights(&geometry, destination, method)
                .map(|w| w.with_footprint(footprint))
        })?,
        None => {
            let weights = kernel.compute_weights(&geometry, destination, method)?;
            weights.ensure_matches(&key)?;
            (Arc::new(weights), false)
        }
    };

    if weights.is_empty() {
        debug!(%key, "Weights map no source cell onto the destination grid");
        return Ok(Coverage::Empty);
    }

    let mut grid = RegularGrid::new(destination.lat().clone(), destination.lon().clone())?;
    for field in source.fields() {
        let data = weights.apply(&field.data)?;
        grid.add_field(Field {
            name: field.name.clone(),
            data,
            attributes: field.attributes.clone(),
        })?;
    }

    Ok(Coverage::Covered(Resampled {
        grid,
        degraded,
        weights_reused,
    }))
}

fn check_destination(destination: &RegularGrid) -> Result<()> {
    for (name, axis) in [("latitude", destination.lat()), ("longitude", destination.lon())] {
        if axis.iter().any(|v| !v.is_finite()) {
            return Err(FusionError::resample(format!(
                "destination {name} axis contains non-finite values"
            )));
        }
        if !axis.windows(2).into_iter().all(|w| w[0] < w[1]) {
            return Err(FusionError::resample(format!(
                "destination {name} axis must be strictly increasing"
            )));
        }
    }
    Ok(())
}

/// Cache key derived from the grid pair, as used by the pipeline.
#[must_use]
pub fn shape_cache_key(source: (usize, usize), destination: (usize, usize), method: ResampleMethod) -> String {
    WeightKey::new(source, destination, method).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CurvilinearGrid;
    use ndarray::{Array1, Array2};

    fn destination() -> RegularGrid {
        let lat = Array1::from_iter((0..6).map(|i| 30.0 + i as f64));
        let lon = Array1::from_iter((0..8).map(|j| -120.0 + j as f64));
        RegularGrid::new(lat, lon).unwrap()
    }

    fn source() -> GeoGrid {
        let lat = Array2::from_shape_fn((12, 16), |(i, _)| 29.75 + 0.5 * i as f64);
        let lon = Array2::from_shape_fn((12, 16), |(_, j)| 239.75 + 0.5 * j as f64);
        let pm = Array2::from_shape_fn((12, 16), |(i, j)| ((i + 1) * (j + 2)) as f32 * 0.01);
        CurvilinearGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("rave_pm25", pm.into_dyn()))
            .unwrap()
            .into()
    }

    #[test]
    fn method_parsing() {
        assert_eq!("Conservative".parse::<ResampleMethod>(), Ok(ResampleMethod::Conservative));
        assert!("cubic".parse::<ResampleMethod>().is_err());
        assert_eq!("fallback".parse::<Backend>(), Ok(Backend::Fallback));
    }

    #[test]
    fn cache_hit_and_miss_give_identical_output() {
        let resampler = FullResampler::new();
        let dst = destination();
        let src = source();
        let key = shape_cache_key(src.spatial_shape(), dst.shape(), ResampleMethod::Conservative);

        let first = resampler
            .resample(&src, &dst, ResampleMethod::Conservative, Some(&key))
            .unwrap()
            .covered()
            .unwrap();
        let second = resampler
            .resample(&src, &dst, ResampleMethod::Conservative, Some(&key))
            .unwrap()
            .covered()
            .unwrap();

        assert!(!first.weights_reused);
        assert!(second.weights_reused);
        let cache = resampler.weight_cache().unwrap();
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        let a = &first.grid.field("rave_pm25").unwrap().data;
        let b = &second.grid.field("rave_pm25").unwrap().data;
        assert_eq!(a.shape(), &[6, 8]);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!(x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan()));
        }
        assert_eq!(first.grid.lat(), dst.lat());
    }

    #[test]
    fn output_uses_destination_convention() {
        // source is 0..360, destination -180..180; overlap must still be found
        let resampler = FullResampler::new();
        let out = resampler
            .resample(&source(), &destination(), ResampleMethod::Nearest, None)
            .unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn disjoint_grids_are_empty() {
        let lat = Array1::from(vec![-10.0, -9.0]);
        let lon = Array1::from(vec![10.0, 11.0]);
        let far = RegularGrid::new(lat, lon).unwrap();
        let out = FullResampler::new()
            .resample(&source(), &far, ResampleMethod::Bilinear, None)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn shape_mismatch_on_cached_key_is_an_error() {
        let resampler = FullResampler::new();
        let dst = destination();
        resampler
            .resample(&source(), &dst, ResampleMethod::Bilinear, Some("pair"))
            .unwrap();

        let lat = Array1::from_iter((0..5).map(|i| 30.0 + i as f64));
        let smaller = RegularGrid::new(lat, dst.lon().clone()).unwrap();
        let err = resampler.resample(&source(), &smaller, ResampleMethod::Bilinear, Some("pair"));
        assert!(matches!(err, Err(FusionError::Resample(_))));
    }

    #[test]
    fn descending_destination_is_rejected() {
        let lat = Array1::from(vec![32.0, 31.0]);
        let lon = Array1::from(vec![-120.0, -119.0]);
        let dst = RegularGrid::new(lat, lon).unwrap();
        let err = FullResampler::new().resample(&source(), &dst, ResampleMethod::Nearest, None);
        assert!(matches!(err, Err(FusionError::Resample(_))));
    }
}
