//! Curvilinear grids with per-cell centre coordinates

use super::{Field, FieldSet};
use crate::errors::{FusionError, Result};
use ndarray::{s, Array2};
use std::ops::Range;

/// A grid where every `(y, x)` cell carries its own latitude and longitude.
///
/// Index order is topological: neighbouring indices are neighbouring cells,
/// whatever their coordinates. Fields are indexed `(y, x, ...extra axes)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CurvilinearGrid {
    lat: Array2<f64>,
    lon: Array2<f64>,
    fields: FieldSet,
}

impl CurvilinearGrid {
    /// Create an empty grid from 2-D coordinate fields of equal shape.
    pub fn new(lat: Array2<f64>, lon: Array2<f64>) -> Result<Self> {
        if lat.dim() != lon.dim() {
            return Err(FusionError::data(format!(
                "curvilinear lat {:?} and lon {:?} shapes differ",
                lat.dim(),
                lon.dim()
            )));
        }
        if lat.is_empty() {
            return Err(FusionError::data("curvilinear grid has no cells"));
        }
        Ok(Self {
            lat,
            lon,
            fields: FieldSet::default(),
        })
    }

    /// Builder-style [`CurvilinearGrid::add_field`].
    pub fn with_field(mut self, field: Field) -> Result<Self> {
        self.add_field(field)?;
        Ok(self)
    }

    pub fn add_field(&mut self, field: Field) -> Result<()> {
        let shape = self.shape();
        self.fields.insert(field, shape)
    }

    #[must_use]
    pub fn lat(&self) -> &Array2<f64> {
        &self.lat
    }

    #[must_use]
    pub fn lon(&self) -> &Array2<f64> {
        &self.lon
    }

    /// `(Y, X)`
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.lat.dim()
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        self.fields.as_slice()
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Same coordinates, different fields.
    pub fn with_fields(&self, fields: Vec<Field>) -> Result<Self> {
        let mut grid = Self {
            lat: self.lat.clone(),
            lon: self.lon.clone(),
            fields: FieldSet::default(),
        };
        for field in fields {
            grid.add_field(field)?;
        }
        Ok(grid)
    }

    /// Index window `rows × cols` of this grid.
    pub(crate) fn window(&self, rows: Range<usize>, cols: Range<usize>) -> Self {
        Self {
            lat: self.lat.slice(s![rows.clone(), cols.clone()]).to_owned(),
            lon: self.lon.slice(s![rows.clone(), cols.clone()]).to_owned(),
            fields: self.fields.map(|f| f.window(rows.clone(), cols.clone())),
        }
    }

    /// Replace the longitude field, keeping index order and fields.
    pub(crate) fn with_lon(&self, lon: Array2<f64>) -> Self {
        Self {
            lat: self.lat.clone(),
            lon,
            fields: self.fields.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_shapes_must_agree() {
        let lat = Array2::<f64>::zeros((2, 3));
        let lon = Array2::<f64>::zeros((3, 2));
        assert!(CurvilinearGrid::new(lat, lon).is_err());
    }

    #[test]
    fn window_cuts_coordinates_and_fields() {
        let lat = Array2::from_shape_fn((3, 4), |(i, _)| i as f64);
        let lon = Array2::from_shape_fn((3, 4), |(_, j)| 200.0 + j as f64);
        let data = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32);
        let g = CurvilinearGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("frp", data.into_dyn()))
            .unwrap();
        let w = g.window(1..3, 2..4);
        assert_eq!(w.shape(), (2, 2));
        assert_eq!(w.lon()[[0, 0]], 202.0);
        assert_eq!(w.field("frp").unwrap().data[[1, 1]], 11.0);
    }
}
