//! Grid data model shared by every stage of the engine
//!
//! - [`RegularGrid`]: 1-D latitude × 1-D longitude axes (the reference grid)
//! - [`CurvilinearGrid`]: 2-D latitude/longitude fields (the moving grid)
//! - [`BoundingBox`]: a geographic region in either longitude convention
//! - [`Coverage`]: the explicit "data or empty" outcome of spatial operations

pub mod bbox;
pub mod curvilinear;
pub mod regular;

pub use bbox::BoundingBox;
pub use curvilinear::CurvilinearGrid;
pub use regular::RegularGrid;

use crate::errors::{FusionError, Result};
use crate::normalize::LonConvention;
use ndarray::{ArrayD, Axis, Slice};
use std::collections::BTreeMap;
use std::ops::Range;

/// A variable attribute carried from the input file to the output file.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAttribute {
    Text(String),
    Texts(Vec<String>),
    Float(f32),
    Floats(Vec<f32>),
    Double(f64),
    Doubles(Vec<f64>),
    Int(i32),
    Ints(Vec<i32>),
    Short(i16),
    Shorts(Vec<i16>),
}

impl FieldAttribute {
    /// The text value, if this is a single string.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldAttribute {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldAttribute {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<f32> for FieldAttribute {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for FieldAttribute {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<i32> for FieldAttribute {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

/// A named numeric field whose leading two axes are the grid's spatial axes.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data: ArrayD<f32>,
    /// Attributes carried through to the output file (units, long_name, valid_range, ...)
    pub attributes: BTreeMap<String, FieldAttribute>,
}

impl Field {
    /// Create a field without attributes
    pub fn new(name: impl Into<String>, data: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            data,
            attributes: BTreeMap::new(),
        }
    }

    /// Attach an attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<FieldAttribute>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// String value of attribute `key`
    #[must_use]
    pub fn text_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(FieldAttribute::as_text)
    }

    /// Shape of the spatial axes, `None` when the field has fewer than two axes.
    #[must_use]
    pub fn spatial_shape(&self) -> Option<(usize, usize)> {
        let shape = self.data.shape();
        (shape.len() >= 2).then(|| (shape[0], shape[1]))
    }

    /// Shape of the trailing (non-spatial) axes.
    #[must_use]
    pub fn extra_shape(&self) -> &[usize] {
        let shape = self.data.shape();
        if shape.len() > 2 {
            &shape[2..]
        } else {
            &[]
        }
    }

    /// Cut a rectangular index window out of the spatial axes.
    pub(crate) fn window(&self, rows: Range<usize>, cols: Range<usize>) -> Self {
        let mut view = self.data.view();
        view.slice_axis_inplace(Axis(0), Slice::from(rows));
        view.slice_axis_inplace(Axis(1), Slice::from(cols));
        Self {
            name: self.name.clone(),
            data: view.to_owned(),
            attributes: self.attributes.clone(),
        }
    }

    /// Reorder one spatial axis by index.
    pub(crate) fn reorder(&self, axis: usize, order: &[usize]) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.select(Axis(axis), order),
            attributes: self.attributes.clone(),
        }
    }
}

/// Ordered, name-unique collection of fields sharing one spatial shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FieldSet {
    fields: Vec<Field>,
}

impl FieldSet {
    pub(crate) fn insert(&mut self, field: Field, shape: (usize, usize)) -> Result<()> {
        match field.spatial_shape() {
            Some(s) if s == shape => {}
            Some(s) => {
                return Err(FusionError::data(format!(
                    "field '{}' has spatial shape {:?}, grid expects {:?}",
                    field.name, s, shape
                )))
            }
            None => {
                return Err(FusionError::data(format!(
                    "field '{}' has {} axes, at least 2 spatial axes are required",
                    field.name,
                    field.data.ndim()
                )))
            }
        }
        if self.get(&field.name).is_some() {
            return Err(FusionError::data(format!(
                "duplicate field '{}'",
                field.name
            )));
        }
        self.fields.push(field);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn as_slice(&self) -> &[Field] {
        &self.fields
    }

    pub(crate) fn into_vec(self) -> Vec<Field> {
        self.fields
    }

    pub(crate) fn map(&self, f: impl Fn(&Field) -> Field) -> Self {
        Self {
            fields: self.fields.iter().map(f).collect(),
        }
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&Field) -> bool) {
        self.fields.retain(keep);
    }
}

/// Either grid flavour, as handed to the resampler.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoGrid {
    Regular(RegularGrid),
    Curvilinear(CurvilinearGrid),
}

impl GeoGrid {
    /// Spatial index shape `(rows, cols)`
    #[must_use]
    pub fn spatial_shape(&self) -> (usize, usize) {
        match self {
            Self::Regular(g) => g.shape(),
            Self::Curvilinear(g) => g.shape(),
        }
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        match self {
            Self::Regular(g) => g.fields(),
            Self::Curvilinear(g) => g.fields(),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        match self {
            Self::Regular(g) => g.field(name),
            Self::Curvilinear(g) => g.field(name),
        }
    }

    /// Rewrite longitudes into `convention` (see [`crate::normalize`]).
    pub fn normalize(self, convention: LonConvention) -> Result<Self> {
        Ok(match self {
            Self::Regular(g) => Self::Regular(crate::normalize::normalize_regular(g, convention)?),
            Self::Curvilinear(g) => {
                Self::Curvilinear(crate::normalize::normalize_curvilinear(g, convention)?)
            }
        })
    }
}

impl From<RegularGrid> for GeoGrid {
    fn from(grid: RegularGrid) -> Self {
        Self::Regular(grid)
    }
}

impl From<CurvilinearGrid> for GeoGrid {
    fn from(grid: CurvilinearGrid) -> Self {
        Self::Curvilinear(grid)
    }
}

/// Outcome of a spatial operation that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Coverage<T> {
    /// The operation produced data
    Covered(T),
    /// The inputs do not overlap; callers skip rather than fail
    Empty,
}

impl<T> Coverage<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Convert to an `Option`, dropping the empty marker.
    pub fn covered(self) -> Option<T> {
        match self {
            Self::Covered(v) => Some(v),
            Self::Empty => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Coverage<U> {
        match self {
            Self::Covered(v) => Coverage::Covered(f(v)),
            Self::Empty => Coverage::Empty,
        }
    }

    /// Turn the empty marker into [`FusionError::EmptyIntersection`] with context.
    pub fn or_empty_error(self, context: impl FnOnce() -> String) -> Result<T> {
        match self {
            Self::Covered(v) => Ok(v),
            Self::Empty => Err(FusionError::EmptyIntersection(context())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn field_window_keeps_extra_axes() {
        let data = ndarray::Array3::from_shape_fn((4, 5, 2), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let field = Field::new("t", data.into_dyn())
            .with_attribute("units", "K")
            .with_attribute("valid_min", 180.0f32);
        let cut = field.window(1..3, 2..5);
        assert_eq!(cut.data.shape(), &[2, 3, 2]);
        assert_eq!(cut.data[[0, 0, 1]], 121.0);
        assert_eq!(cut.text_attribute("units"), Some("K"));
        assert_eq!(cut.attributes.get("valid_min"), Some(&FieldAttribute::Float(180.0)));
        assert_eq!(cut.text_attribute("valid_min"), None);
    }

    #[test]
    fn field_set_rejects_bad_shape_and_duplicates() {
        let mut set = FieldSet::default();
        let ok = Field::new("a", Array2::<f32>::zeros((2, 3)).into_dyn());
        set.insert(ok.clone(), (2, 3)).unwrap();
        assert!(matches!(set.insert(ok, (2, 3)), Err(FusionError::Data(_))));
        let bad = Field::new("b", Array2::<f32>::zeros((3, 2)).into_dyn());
        assert!(matches!(set.insert(bad, (2, 3)), Err(FusionError::Data(_))));
    }

    #[test]
    fn coverage_helpers() {
        let c: Coverage<u8> = Coverage::Covered(3);
        assert_eq!(c.clone().map(|v| v * 2), Coverage::Covered(6));
        assert_eq!(c.covered(), Some(3));
        let e: Coverage<u8> = Coverage::Empty;
        assert!(e.is_empty());
        assert!(matches!(
            e.or_empty_error(|| "clip".to_string()),
            Err(FusionError::EmptyIntersection(_))
        ));
    }
}
