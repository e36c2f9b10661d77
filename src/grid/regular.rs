//! Regular latitude/longitude grids

use super::{Field, FieldSet};
use crate::errors::{FusionError, Result};
use ndarray::{Array1, Array2};
use std::ops::Range;

/// A grid whose coordinates are two independent 1-D axes.
///
/// Fields are indexed `(lat, lon, ...extra axes)`. Coordinates are fixed at
/// construction; operations that change them build a new grid.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularGrid {
    lat: Array1<f64>,
    lon: Array1<f64>,
    fields: FieldSet,
}

impl RegularGrid {
    /// Create an empty grid over the given axes.
    ///
    /// # Errors
    ///
    /// Returns a Data error if either axis is empty.
    pub fn new(lat: Array1<f64>, lon: Array1<f64>) -> Result<Self> {
        if lat.is_empty() || lon.is_empty() {
            return Err(FusionError::data(format!(
                "regular grid axes must be non-empty (lat: {}, lon: {})",
                lat.len(),
                lon.len()
            )));
        }
        Ok(Self {
            lat,
            lon,
            fields: FieldSet::default(),
        })
    }

    /// Builder-style [`RegularGrid::add_field`].
    pub fn with_field(mut self, field: Field) -> Result<Self> {
        self.add_field(field)?;
        Ok(self)
    }

    /// Add a field whose leading axes match `(lat.len(), lon.len())`.
    pub fn add_field(&mut self, field: Field) -> Result<()> {
        let shape = self.shape();
        self.fields.insert(field, shape)
    }

    #[must_use]
    pub fn lat(&self) -> &Array1<f64> {
        &self.lat
    }

    #[must_use]
    pub fn lon(&self) -> &Array1<f64> {
        &self.lon
    }

    /// `(lat.len(), lon.len())`
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        self.fields.as_slice()
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Keep only the fields for which `keep` returns true.
    pub fn retain_fields(&mut self, keep: impl FnMut(&Field) -> bool) {
        self.fields.retain(keep);
    }

    /// Consume the grid, returning its fields.
    #[must_use]
    pub fn into_fields(self) -> Vec<Field> {
        self.fields.into_vec()
    }

    /// Cell-centre coordinates as 2-D `(lat, lon)` meshes.
    #[must_use]
    pub fn mesh(&self) -> (Array2<f64>, Array2<f64>) {
        let (ny, nx) = self.shape();
        let lat = Array2::from_shape_fn((ny, nx), |(i, _)| self.lat[i]);
        let lon = Array2::from_shape_fn((ny, nx), |(_, j)| self.lon[j]);
        (lat, lon)
    }

    /// Index window `rows × cols` of this grid.
    pub(crate) fn window(&self, rows: Range<usize>, cols: Range<usize>) -> Self {
        Self {
            lat: self.lat.slice(ndarray::s![rows.clone()]).to_owned(),
            lon: self.lon.slice(ndarray::s![cols.clone()]).to_owned(),
            fields: self.fields.map(|f| f.window(rows.clone(), cols.clone())),
        }
    }

    /// Rebuild with a new longitude axis, permuting field columns by `order`.
    pub(crate) fn with_lon_order(&self, lon: Array1<f64>, order: &[usize]) -> Self {
        Self {
            lat: self.lat.clone(),
            lon,
            fields: self.fields.map(|f| f.reorder(1, order)),
        }
    }

    /// Rebuild with a new latitude axis, permuting field rows by `order`.
    pub(crate) fn with_lat_order(&self, lat: Array1<f64>, order: &[usize]) -> Self {
        Self {
            lat,
            lon: self.lon.clone(),
            fields: self.fields.map(|f| f.reorder(0, order)),
        }
    }
}
