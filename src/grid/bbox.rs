//! Geographic bounding boxes

use crate::errors::{FusionError, Result};
use crate::normalize::{normalize_lon, LonConvention};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A latitude/longitude box in degrees.
///
/// Longitudes may be expressed in either convention. Boxes that cross the
/// antimeridian are not supported, whether written with the western edge east
/// of the eastern one (`170..-170`) or as a 0..360 span over 180 (`170..190`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    /// Create a validated bounding box.
    ///
    /// # Errors
    ///
    /// Returns a Data error for non-finite values, `lat_min > lat_max` or
    /// latitudes outside [-90, 90].
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Result<Self> {
        if ![lat_min, lat_max, lon_min, lon_max].iter().all(|v| v.is_finite()) {
            return Err(FusionError::data("bounding box values must be finite"));
        }
        if lat_min > lat_max {
            return Err(FusionError::data(format!(
                "lat_min {lat_min} is greater than lat_max {lat_max}"
            )));
        }
        if lat_min < -90.0 || lat_max > 90.0 {
            return Err(FusionError::data(format!(
                "latitudes {lat_min}..{lat_max} fall outside [-90, 90]"
            )));
        }
        Ok(Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        })
    }

    /// Expand the box by `pad` degrees on all four sides.
    #[must_use]
    pub fn padded(&self, pad: f64) -> Self {
        Self {
            lat_min: self.lat_min - pad,
            lat_max: self.lat_max + pad,
            lon_min: self.lon_min - pad,
            lon_max: self.lon_max + pad,
        }
    }

    /// The convention the box is written in. Boxes entirely within [0, 180]
    /// read the same in both and are reported as `Neg180To180`.
    #[must_use]
    pub fn convention(&self) -> LonConvention {
        if self.lon_min < 0.0 || self.lon_max < 0.0 {
            LonConvention::Neg180To180
        } else if self.lon_min >= 180.0 || self.lon_max >= 180.0 {
            LonConvention::Zero360
        } else {
            LonConvention::Neg180To180
        }
    }

    /// Rewrite each corner longitude into `convention`.
    #[must_use]
    pub fn to_convention(&self, convention: LonConvention) -> Self {
        Self {
            lon_min: normalize_lon(self.lon_min, convention),
            lon_max: normalize_lon(self.lon_max, convention),
            ..*self
        }
    }

    /// True when the box spans the ±180 seam of its own convention.
    /// Boxes 360 degrees or wider are global and never cross.
    #[must_use]
    pub fn crosses_antimeridian(&self) -> bool {
        if self.lon_min > self.lon_max {
            return true;
        }
        if self.lon_max - self.lon_min >= 360.0 {
            return false;
        }
        match self.convention() {
            LonConvention::Zero360 => self.lon_min < 180.0 && self.lon_max > 180.0,
            LonConvention::Neg180To180 => self.lon_min < -180.0 || self.lon_max > 180.0,
        }
    }

    /// Fail with a Data error for boxes crossing the antimeridian.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.crosses_antimeridian() {
            return Err(FusionError::data(format!(
                "bounding box {self} crosses the antimeridian, which is unsupported"
            )));
        }
        Ok(())
    }

    /// Inclusive containment test; `lon` must use the box's convention.
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[lat {}..{}, lon {}..{}]",
            self.lat_min, self.lat_max, self.lon_min, self.lon_max
        )
    }
}

/// Parses `"lat_min,lat_max,lon_min,lon_max"`.
impl FromStr for BoundingBox {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [lat_min, lat_max, lon_min, lon_max] = parts.as_slice() else {
            return Err(FusionError::data(format!(
                "invalid bbox '{s}': expected 'lat_min,lat_max,lon_min,lon_max'"
            )));
        };
        let parse = |v: &str| {
            v.parse::<f64>()
                .map_err(|_| FusionError::data(format!("invalid bbox value '{v}'")))
        };
        Self::new(
            parse(lat_min)?,
            parse(lat_max)?,
            parse(lon_min)?,
            parse(lon_max)?,
        )
    }
}
