//! Longitude convention normalization
//!
//! Forecast grids are usually published in [-180, 180) while emission grids
//! use [0, 360). Everything downstream compares coordinates directly, so both
//! sides must agree on a convention first.

use crate::errors::{FusionError, Result};
use crate::grid::{CurvilinearGrid, RegularGrid};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Longitude conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LonConvention {
    /// [-180, 180)
    #[serde(rename = "neg180_180")]
    Neg180To180,
    /// [0, 360)
    #[serde(rename = "zero_360")]
    Zero360,
}

impl LonConvention {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Neg180To180 => "neg180_180",
            Self::Zero360 => "zero_360",
        }
    }

    /// Guess the convention a set of longitudes is written in.
    ///
    /// Values that read the same in both conventions report `Neg180To180`.
    pub fn detect<'a>(values: impl IntoIterator<Item = &'a f64>) -> Self {
        let mut above_180 = false;
        for &v in values {
            if v < 0.0 {
                return Self::Neg180To180;
            }
            if v >= 180.0 {
                above_180 = true;
            }
        }
        if above_180 {
            Self::Zero360
        } else {
            Self::Neg180To180
        }
    }
}

impl fmt::Display for LonConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LonConvention {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neg180_180" | "-180..180" | "180" => Ok(Self::Neg180To180),
            "zero_360" | "0..360" | "360" => Ok(Self::Zero360),
            other => Err(format!("unknown longitude convention '{other}'")),
        }
    }
}

/// Map a single longitude into `convention`.
#[must_use]
pub fn normalize_lon(lon: f64, convention: LonConvention) -> f64 {
    match convention {
        LonConvention::Neg180To180 => (lon + 180.0).rem_euclid(360.0) - 180.0,
        LonConvention::Zero360 => lon.rem_euclid(360.0),
    }
}

fn ensure_finite<'a>(what: &str, values: impl IntoIterator<Item = &'a f64>) -> Result<()> {
    if let Some(bad) = values.into_iter().find(|v| !v.is_finite()) {
        return Err(FusionError::data(format!(
            "non-finite {what} coordinate ({bad})"
        )));
    }
    Ok(())
}

/// Rewrite a regular grid's longitudes into `convention`.
///
/// The longitude axis is re-sorted to stay strictly increasing, with field
/// columns permuted to match; columns that collapse onto an existing
/// longitude (a cyclic 0/360 point) are dropped. A descending latitude axis
/// is flipped to ascending so that range selection can rely on both axes
/// increasing.
///
/// # Errors
///
/// Returns a Data error for non-finite coordinates or a latitude axis that
/// is not monotonic.
pub fn normalize_regular(grid: RegularGrid, convention: LonConvention) -> Result<RegularGrid> {
    ensure_finite("latitude", grid.lat().iter())?;
    ensure_finite("longitude", grid.lon().iter())?;

    let grid = ascending_lat(grid)?;

    let converted: Vec<f64> = grid
        .lon()
        .iter()
        .map(|&v| normalize_lon(v, convention))
        .collect();
    let mut order: Vec<usize> = (0..converted.len()).collect();
    order.sort_by(|&a, &b| converted[a].total_cmp(&converted[b]));
    order.dedup_by(|later, earlier| converted[*later] == converted[*earlier]);

    let identity = order.len() == converted.len() && order.iter().enumerate().all(|(i, &o)| i == o);
    let unchanged = converted.iter().zip(grid.lon().iter()).all(|(a, b)| a == b);
    if identity && unchanged {
        return Ok(grid);
    }
    if order.len() != converted.len() {
        debug!(
            dropped = converted.len() - order.len(),
            "Dropped duplicate longitude columns after conversion to {}", convention
        );
    }

    let lon = Array1::from_iter(order.iter().map(|&i| converted[i]));
    Ok(grid.with_lon_order(lon, &order))
}

fn ascending_lat(grid: RegularGrid) -> Result<RegularGrid> {
    let lat = grid.lat();
    let increasing = lat.windows(2).into_iter().all(|w| w[0] < w[1]);
    if increasing {
        return Ok(grid);
    }
    let decreasing = lat.windows(2).into_iter().all(|w| w[0] > w[1]);
    if !decreasing {
        return Err(FusionError::data(
            "latitude axis is not strictly monotonic",
        ));
    }
    let order: Vec<usize> = (0..lat.len()).rev().collect();
    let flipped = Array1::from_iter(order.iter().map(|&i| lat[i]));
    Ok(grid.with_lat_order(flipped, &order))
}

/// Rewrite a curvilinear grid's longitude field into `convention` in place.
///
/// Index order is left untouched.
pub fn normalize_curvilinear(
    grid: CurvilinearGrid,
    convention: LonConvention,
) -> Result<CurvilinearGrid> {
    ensure_finite("latitude", grid.lat().iter())?;
    ensure_finite("longitude", grid.lon().iter())?;
    let lon = grid.lon().mapv(|v| normalize_lon(v, convention));
    if lon == *grid.lon() {
        return Ok(grid);
    }
    Ok(grid.with_lon(lon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Field;
    use ndarray::Array2;

    #[test]
    fn single_value_mapping() {
        assert_eq!(normalize_lon(-120.0, LonConvention::Zero360), 240.0);
        assert_eq!(normalize_lon(240.0, LonConvention::Neg180To180), -120.0);
        assert_eq!(normalize_lon(180.0, LonConvention::Neg180To180), -180.0);
        assert_eq!(normalize_lon(360.0, LonConvention::Zero360), 0.0);
        assert_eq!(normalize_lon(-540.0, LonConvention::Neg180To180), -180.0);
    }

    #[test]
    fn round_trip_through_zero_360() {
        let mut lon = -400.0;
        while lon <= 400.0 {
            let direct = normalize_lon(lon, LonConvention::Neg180To180);
            let via = normalize_lon(
                normalize_lon(lon, LonConvention::Zero360),
                LonConvention::Neg180To180,
            );
            assert!((direct - via).abs() < 1e-9, "lon {lon}: {direct} vs {via}");
            lon += 7.25;
        }
    }

    #[test]
    fn detect_convention() {
        assert_eq!(LonConvention::detect(&[10.0, 200.0]), LonConvention::Zero360);
        assert_eq!(LonConvention::detect(&[-10.0, 20.0]), LonConvention::Neg180To180);
        assert_eq!(LonConvention::detect(&[10.0, 20.0]), LonConvention::Neg180To180);
    }

    #[test]
    fn regular_grid_is_resorted_with_fields() {
        let lat = Array1::from(vec![0.0, 1.0]);
        let lon = Array1::from(vec![0.0, 90.0, 180.0, 270.0]);
        let data = Array2::from_shape_fn((2, 4), |(i, j)| (i * 10 + j) as f32);
        let grid = RegularGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("v", data.into_dyn()))
            .unwrap();

        let out = normalize_regular(grid, LonConvention::Neg180To180).unwrap();
        assert_eq!(out.lon().to_vec(), vec![-180.0, -90.0, 0.0, 90.0]);
        let v = &out.field("v").unwrap().data;
        assert_eq!(v[[0, 0]], 2.0);
        assert_eq!(v[[0, 1]], 3.0);
        assert_eq!(v[[1, 2]], 10.0);
    }

    #[test]
    fn descending_latitude_is_flipped() {
        let lat = Array1::from(vec![2.0, 1.0, 0.0]);
        let lon = Array1::from(vec![10.0]);
        let data = Array2::from_shape_vec((3, 1), vec![2.0f32, 1.0, 0.0]).unwrap();
        let grid = RegularGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("v", data.into_dyn()))
            .unwrap();
        let out = normalize_regular(grid, LonConvention::Neg180To180).unwrap();
        assert_eq!(out.lat().to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(out.field("v").unwrap().data[[0, 0]], 0.0);
    }

    #[test]
    fn cyclic_column_is_dropped() {
        let lat = Array1::from(vec![0.0]);
        let lon = Array1::from(vec![0.0, 180.0, 360.0]);
        let grid = RegularGrid::new(lat, lon).unwrap();
        let out = normalize_regular(grid, LonConvention::Zero360).unwrap();
        assert_eq!(out.lon().to_vec(), vec![0.0, 180.0]);
    }

    #[test]
    fn non_finite_coordinates_fail() {
        let lat = Array1::from(vec![0.0, f64::NAN]);
        let lon = Array1::from(vec![0.0]);
        let grid = RegularGrid::new(lat, lon).unwrap();
        assert!(matches!(
            normalize_regular(grid, LonConvention::Zero360),
            Err(FusionError::Data(_))
        ));
    }

    #[test]
    fn curvilinear_converted_in_place() {
        let lat = Array2::from_shape_fn((2, 2), |(i, _)| i as f64);
        let lon = Array2::from_shape_vec((2, 2), vec![-10.0, 10.0, -9.0, 11.0]).unwrap();
        let grid = CurvilinearGrid::new(lat, lon).unwrap();
        let out = normalize_curvilinear(grid, LonConvention::Zero360).unwrap();
        assert_eq!(out.lon()[[0, 0]], 350.0);
        assert_eq!(out.lon()[[0, 1]], 10.0);
        assert_eq!(out.lon()[[1, 0]], 351.0);
    }
}
