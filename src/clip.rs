//! Bounding-box clipping of regular grids

use crate::errors::{FusionError, Result};
use crate::grid::{BoundingBox, Coverage, RegularGrid};
use crate::normalize::normalize_regular;
use ndarray::Array1;
use std::ops::Range;
use tracing::debug;

/// Clip a regular grid to `bbox` expanded by `pad` degrees on every side.
///
/// The grid is first normalized to the box's longitude convention, which
/// also leaves both axes increasing. The selection is inclusive on both
/// ends, so every retained coordinate lies in
/// `[lat_min - pad, lat_max + pad] × [lon_min - pad, lon_max + pad]`.
///
/// # Errors
///
/// Returns a Data error for a negative or non-finite pad, a box that crosses
/// the antimeridian before or after padding, or malformed grid coordinates. A box that misses the grid
/// is not an error: it yields [`Coverage::Empty`].
pub fn clip(grid: RegularGrid, bbox: &BoundingBox, pad: f64) -> Result<Coverage<RegularGrid>> {
    check_pad(pad)?;
    bbox.ensure_supported()?;

    let convention = bbox.convention();
    let padded = bbox.padded(pad);
    padded.ensure_supported()?;
    let grid = normalize_regular(grid, convention)?;

    let rows = inclusive_range(grid.lat(), padded.lat_min, padded.lat_max);
    let cols = inclusive_range(grid.lon(), padded.lon_min, padded.lon_max);
    if rows.is_empty() || cols.is_empty() {
        debug!(bbox = %padded, "Regular grid does not intersect bounding box");
        return Ok(Coverage::Empty);
    }

    debug!(
        rows = rows.len(),
        cols = cols.len(),
        "Clipped regular grid to {}", padded
    );
    Ok(Coverage::Covered(grid.window(rows, cols)))
}

pub(crate) fn check_pad(pad: f64) -> Result<()> {
    if !pad.is_finite() || pad < 0.0 {
        return Err(FusionError::data(format!(
            "padding must be a finite, non-negative number of degrees (got {pad})"
        )));
    }
    Ok(())
}

/// Index range of an increasing axis whose values fall in `[lo, hi]`.
fn inclusive_range(axis: &Array1<f64>, lo: f64, hi: f64) -> Range<usize> {
    let values = axis.to_vec();
    let start = values.partition_point(|&v| v < lo);
    let end = values.partition_point(|&v| v <= hi);
    start..end.max(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Field;
    use ndarray::Array2;

    fn reference_grid() -> RegularGrid {
        let lat = Array1::from_iter((20..=45).map(f64::from));
        let lon = Array1::from_iter((-130..=-100).map(f64::from));
        let data = Array2::from_shape_fn((lat.len(), lon.len()), |(i, j)| (i * 100 + j) as f32);
        RegularGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("TMP", data.into_dyn()))
            .unwrap()
    }

    #[test]
    fn clips_to_padded_box() {
        let bbox = BoundingBox::new(30.0, 35.0, -120.0, -110.0).unwrap();
        let out = clip(reference_grid(), &bbox, 0.5).unwrap().covered().unwrap();

        assert_eq!(out.lat().to_vec(), (30..=35).map(f64::from).collect::<Vec<_>>());
        assert_eq!(out.lon().to_vec(), (-120..=-110).map(f64::from).collect::<Vec<_>>());
        assert!(out.lat().iter().all(|&v| (29.5..=35.5).contains(&v)));
        assert!(out.lon().iter().all(|&v| (-120.5..=-109.5).contains(&v)));
        // lat 30 is row 10, lon -120 is column 10 of the source grid
        assert_eq!(out.field("TMP").unwrap().data[[0, 0]], 1010.0);
    }

    #[test]
    fn clips_zero_360_grid_with_negative_box() {
        let lat = Array1::from(vec![30.0, 31.0, 32.0]);
        let lon = Array1::from_iter((230..=260).map(f64::from));
        let grid = RegularGrid::new(lat, lon).unwrap();
        let bbox = BoundingBox::new(30.0, 31.0, -120.0, -110.0).unwrap();
        let out = clip(grid, &bbox, 0.0).unwrap().covered().unwrap();
        assert_eq!(out.lon()[0], -120.0);
        assert_eq!(out.lon()[out.lon().len() - 1], -110.0);
        assert_eq!(out.shape(), (2, 11));
    }

    #[test]
    fn disjoint_box_is_empty() {
        let bbox = BoundingBox::new(-10.0, -5.0, 10.0, 20.0).unwrap();
        assert!(clip(reference_grid(), &bbox, 0.5).unwrap().is_empty());
    }

    #[test]
    fn box_between_grid_points_is_empty() {
        let bbox = BoundingBox::new(30.2, 30.4, -120.0, -110.0).unwrap();
        assert!(clip(reference_grid(), &bbox, 0.0).unwrap().is_empty());
    }

    #[test]
    fn rejects_negative_pad() {
        let bbox = BoundingBox::new(30.0, 35.0, -120.0, -110.0).unwrap();
        assert!(matches!(
            clip(reference_grid(), &bbox, -1.0),
            Err(FusionError::Data(_))
        ));
    }
}
