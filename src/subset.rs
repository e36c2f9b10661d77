//! Index-window subsetting of curvilinear grids
//!
//! A curvilinear grid cannot be sliced by coordinate value. Instead every
//! cell centre is tested against the padded box and the smallest rectangular
//! index window holding all matching cells is kept. Cells inside that window
//! but outside the box stay in place: dropping them individually would break
//! the `(y, x)` adjacency the resampler relies on.

use crate::clip::check_pad;
use crate::errors::{FusionError, Result};
use crate::grid::{BoundingBox, Coverage, CurvilinearGrid};
use crate::normalize::{normalize_curvilinear, normalize_lon, LonConvention};
use ndarray::Array2;
use std::ops::Range;
use tracing::debug;

/// Longitude test used for membership, in a frame where the box is ordered.
#[derive(Debug, Clone, Copy)]
enum LonFilter {
    Any,
    Within {
        convention: LonConvention,
        min: f64,
        max: f64,
    },
}

impl LonFilter {
    /// `padded` has already passed `ensure_supported`, so a box touching
    /// ±180 in -180..180 (e.g. `170..180`) is taken by the 0..360 branch,
    /// where it stays ordered. Only prime-meridian boxes fall through.
    fn for_box(padded: &BoundingBox) -> Result<Self> {
        if padded.lon_max - padded.lon_min >= 360.0 {
            return Ok(Self::Any);
        }
        // Curvilinear sources are handled in 0..360. A box straddling the
        // prime meridian is not ordered there, so it is tested in -180..180.
        for convention in [LonConvention::Zero360, LonConvention::Neg180To180] {
            let b = padded.to_convention(convention);
            if !b.crosses_antimeridian() {
                return Ok(Self::Within {
                    convention,
                    min: b.lon_min,
                    max: b.lon_max,
                });
            }
        }
        Err(FusionError::data(format!(
            "bounding box {padded} cannot be expressed as an ordered longitude range"
        )))
    }

    fn accepts(self, lon: f64) -> bool {
        match self {
            Self::Any => true,
            Self::Within {
                convention,
                min,
                max,
            } => {
                let v = normalize_lon(lon, convention);
                v >= min && v <= max
            }
        }
    }
}

/// Boolean mask of cells whose centre lies inside `padded`.
fn cell_mask(grid: &CurvilinearGrid, padded: &BoundingBox, lon_filter: LonFilter) -> Array2<bool> {
    let mut mask = Array2::from_elem(grid.shape(), false);
    ndarray::Zip::from(&mut mask)
        .and(grid.lat())
        .and(grid.lon())
        .for_each(|m, &lat, &lon| {
            *m = lat >= padded.lat_min && lat <= padded.lat_max && lon_filter.accepts(lon);
        });
    mask
}

/// Minimal `rows × cols` window containing every `true` cell.
pub(crate) fn enclosing_window(mask: &Array2<bool>) -> Option<(Range<usize>, Range<usize>)> {
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for ((y, x), &hit) in mask.indexed_iter() {
        if !hit {
            continue;
        }
        bounds = Some(match bounds {
            None => (y, y, x, x),
            Some((y0, y1, x0, x1)) => (y0.min(y), y1.max(y), x0.min(x), x1.max(x)),
        });
    }
    bounds.map(|(y0, y1, x0, x1)| (y0..y1 + 1, x0..x1 + 1))
}

/// Subset a curvilinear grid to the index window covering `bbox` padded by `pad`.
///
/// The returned grid carries longitudes in [0, 360).
///
/// # Errors
///
/// Returns a Data error for a bad pad, an antimeridian crossing box or
/// non-finite coordinates. No matching cell yields [`Coverage::Empty`].
pub fn subset(
    grid: CurvilinearGrid,
    bbox: &BoundingBox,
    pad: f64,
) -> Result<Coverage<CurvilinearGrid>> {
    check_pad(pad)?;
    bbox.ensure_supported()?;

    let grid = normalize_curvilinear(grid, LonConvention::Zero360)?;
    let padded = bbox.padded(pad);
    padded.ensure_supported()?;
    let lon_filter = LonFilter::for_box(&padded)?;
    let mask = cell_mask(&grid, &padded, lon_filter);

    match enclosing_window(&mask) {
        None => {
            debug!(bbox = %padded, "No curvilinear cell centre falls inside bounding box");
            Ok(Coverage::Empty)
        }
        Some((rows, cols)) => {
            debug!(
                y = ?rows,
                x = ?cols,
                matched = mask.iter().filter(|&&m| m).count(),
                "Curvilinear index window selected"
            );
            Ok(Coverage::Covered(grid.window(rows, cols)))
        }
    }
}
