//! NetCDF decoding of cached inputs and writing of fused series
//!
//! Inputs come from two very different producers, so coordinates are found
//! by candidate names rather than fixed ones. Leading singleton-like axes
//! (`time`, `step`) are reduced to their first index, fill values become NaN
//! and only variables laid out over the grid's spatial dimensions are kept.

use crate::accumulate::TemporalSeries;
use crate::errors::{FusionError, Result};
use crate::grid::{CurvilinearGrid, Field, FieldAttribute, RegularGrid};
use chrono::Utc;
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use netcdf::{create, AttributeValue, File, Variable, VariableMut};
use std::collections::BTreeMap;
use std::{fs, path::Path};
use tracing::{debug, info};

/// How to find coordinates and fields in an input file.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub lat_names: Vec<String>,
    pub lon_names: Vec<String>,
    /// Leading axes reduced to index 0 when present
    pub squeeze_dims: Vec<String>,
    /// Only decode these variables; `None` decodes every grid variable
    pub variables: Option<Vec<String>>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        let names = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        Self {
            lat_names: names(&["lat", "latitude", "grid_latt"]),
            lon_names: names(&["lon", "longitude", "grid_lont"]),
            squeeze_dims: names(&["time", "step", "valid_time"]),
            variables: None,
        }
    }
}

impl DecodeOptions {
    #[must_use]
    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = Some(variables.into_iter().map(Into::into).collect());
        self
    }

    fn wants(&self, name: &str) -> bool {
        self.variables
            .as_ref()
            .map_or(true, |vars| vars.iter().any(|v| v == name))
    }

    fn is_coordinate(&self, name: &str) -> bool {
        self.lat_names.iter().chain(&self.lon_names).any(|c| c == name)
    }
}

fn find_variable<'f>(file: &'f File, candidates: &[String], what: &str) -> Result<Variable<'f>> {
    candidates
        .iter()
        .find_map(|name| file.variable(name))
        .ok_or_else(|| {
            FusionError::data(format!(
                "no {what} coordinate found (tried {})",
                candidates.join(", ")
            ))
        })
}

/// Dimension names and lengths with squeezable leading axes split off.
struct Layout {
    leading: usize,
    dims: Vec<String>,
    shape: Vec<usize>,
    full_shape: Vec<usize>,
}

fn layout(var: &Variable, options: &DecodeOptions) -> Layout {
    let names: Vec<String> = var.dimensions().iter().map(|d| d.name().to_string()).collect();
    let full_shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
    let leading = names
        .iter()
        .zip(&full_shape)
        .take_while(|&(n, &len)| len > 0 && options.squeeze_dims.iter().any(|s| s == n))
        .count();
    if full_shape[..leading].iter().any(|&len| len > 1) {
        debug!(
            variable = %var.name(),
            "Taking the first index of leading axes {:?}",
            &names[..leading]
        );
    }
    Layout {
        leading,
        dims: names[leading..].to_vec(),
        shape: full_shape[leading..].to_vec(),
        full_shape,
    }
}

fn squeeze<T>(mut data: ArrayD<T>, leading: usize) -> ArrayD<T> {
    for _ in 0..leading {
        data = data.index_axis_move(Axis(0), 0);
    }
    data
}

fn fill_value(var: &Variable) -> Option<f64> {
    var.attribute("_FillValue")
        .and_then(|attr| match attr.value().ok()? {
            AttributeValue::Float(v) => Some(f64::from(v)),
            AttributeValue::Double(v) => Some(v),
            AttributeValue::Short(v) => Some(f64::from(v)),
            AttributeValue::Int(v) => Some(f64::from(v)),
            _ => None,
        })
}

/// Attributes carried to the output. `_FillValue` is dropped because fills
/// are decoded as NaN; types with no `FieldAttribute` counterpart are skipped.
fn field_attributes(var: &Variable) -> BTreeMap<String, FieldAttribute> {
    var.attributes()
        .filter(|attr| attr.name() != "_FillValue")
        .filter_map(|attr| {
            let value = match attr.value().ok()? {
                AttributeValue::Str(v) => FieldAttribute::Text(v),
                AttributeValue::Strs(v) => FieldAttribute::Texts(v),
                AttributeValue::Float(v) => FieldAttribute::Float(v),
                AttributeValue::Floats(v) => FieldAttribute::Floats(v),
                AttributeValue::Double(v) => FieldAttribute::Double(v),
                AttributeValue::Doubles(v) => FieldAttribute::Doubles(v),
                AttributeValue::Int(v) => FieldAttribute::Int(v),
                AttributeValue::Ints(v) => FieldAttribute::Ints(v),
                AttributeValue::Short(v) => FieldAttribute::Short(v),
                AttributeValue::Shorts(v) => FieldAttribute::Shorts(v),
                other => {
                    debug!(variable = %var.name(), attribute = %attr.name(), "Skipping attribute {other:?}");
                    return None;
                }
            };
            Some((attr.name().to_string(), value))
        })
        .collect()
}

fn put_field_attribute(var: &mut VariableMut<'_>, key: &str, value: &FieldAttribute) -> Result<()> {
    match value {
        FieldAttribute::Text(v) => var.put_attribute(key, v.as_str())?,
        FieldAttribute::Texts(v) => var.put_attribute(key, v.clone())?,
        FieldAttribute::Float(v) => var.put_attribute(key, *v)?,
        FieldAttribute::Floats(v) => var.put_attribute(key, v.clone())?,
        FieldAttribute::Double(v) => var.put_attribute(key, *v)?,
        FieldAttribute::Doubles(v) => var.put_attribute(key, v.clone())?,
        FieldAttribute::Int(v) => var.put_attribute(key, *v)?,
        FieldAttribute::Ints(v) => var.put_attribute(key, v.clone())?,
        FieldAttribute::Short(v) => var.put_attribute(key, *v)?,
        FieldAttribute::Shorts(v) => var.put_attribute(key, v.clone())?,
    };
    Ok(())
}

fn read_coordinate(var: &Variable, options: &DecodeOptions) -> Result<(Vec<String>, ArrayD<f64>)> {
    let layout = layout(var, options);
    let values: Vec<f64> = var.get_values::<f64, _>(..)?;
    let data = ArrayD::from_shape_vec(IxDyn(&layout.full_shape), values)?;
    Ok((layout.dims, squeeze(data, layout.leading)))
}

/// Every wanted variable laid out as `(spatial dims..., extra dims...)`.
fn read_fields(file: &File, spatial: &[String], options: &DecodeOptions) -> Result<Vec<Field>> {
    let mut fields = Vec::new();
    for var in file.variables() {
        let name = var.name();
        if options.is_coordinate(&name) || spatial.contains(&name) || !options.wants(&name) {
            continue;
        }
        let layout = layout(&var, options);
        if layout.dims.len() < spatial.len() || layout.dims[..spatial.len()] != *spatial {
            debug!(variable = %name, dims = ?layout.dims, "Skipping variable not laid out on the grid");
            continue;
        }
        let values: Vec<f32> = match var.get_values::<f32, _>(..) {
            Ok(values) => values,
            Err(e) => {
                debug!(variable = %name, error = %e, "Skipping non-numeric variable");
                continue;
            }
        };
        let mut data = squeeze(ArrayD::from_shape_vec(IxDyn(&layout.full_shape), values)?, layout.leading);
        if let Some(fill) = fill_value(&var) {
            data.mapv_inplace(|v| if f64::from(v) == fill { f32::NAN } else { v });
        }
        debug_assert_eq!(data.shape(), &layout.shape[..]);
        let mut field = Field::new(name, data);
        field.attributes = field_attributes(&var);
        fields.push(field);
    }
    if let Some(wanted) = &options.variables {
        for name in wanted {
            if !fields.iter().any(|f| &f.name == name) {
                debug!(variable = %name, "Requested variable not present");
            }
        }
    }
    Ok(fields)
}

/// Load a regular lat/lon grid with 1-D coordinate variables.
///
/// # Errors
///
/// Returns a Data error when coordinates are missing or not 1-D, and the
/// NetCDF error when the file cannot be read.
pub fn read_regular_grid(path: &Path, options: &DecodeOptions) -> Result<RegularGrid> {
    let file = netcdf::open(path)?;
    let (lat_dims, lat) = read_coordinate(&find_variable(&file, &options.lat_names, "latitude")?, options)?;
    let (lon_dims, lon) = read_coordinate(&find_variable(&file, &options.lon_names, "longitude")?, options)?;
    if lat.ndim() != 1 || lon.ndim() != 1 {
        return Err(FusionError::data(format!(
            "{} has {}-D latitude and {}-D longitude, expected 1-D axes",
            path.display(),
            lat.ndim(),
            lon.ndim()
        )));
    }
    let spatial = vec![lat_dims[0].clone(), lon_dims[0].clone()];
    let lat: Array1<f64> = lat.into_dimensionality()?;
    let lon: Array1<f64> = lon.into_dimensionality()?;

    let mut grid = RegularGrid::new(lat, lon)?;
    for field in read_fields(&file, &spatial, options)? {
        grid.add_field(field)?;
    }
    debug!(path = %path.display(), shape = ?grid.shape(), fields = grid.fields().len(), "Decoded regular grid");
    Ok(grid)
}

/// Load a curvilinear grid with 2-D coordinate variables over `(y, x)`.
///
/// # Errors
///
/// Returns a Data error when coordinates are missing, not 2-D or laid out
/// over different dimensions.
pub fn read_curvilinear_grid(path: &Path, options: &DecodeOptions) -> Result<CurvilinearGrid> {
    let file = netcdf::open(path)?;
    let (lat_dims, lat) = read_coordinate(&find_variable(&file, &options.lat_names, "latitude")?, options)?;
    let (lon_dims, lon) = read_coordinate(&find_variable(&file, &options.lon_names, "longitude")?, options)?;
    if lat.ndim() != 2 || lat_dims != lon_dims {
        return Err(FusionError::data(format!(
            "{} needs 2-D latitude/longitude over the same dimensions, found {:?} and {:?}",
            path.display(),
            lat_dims,
            lon_dims
        )));
    }
    let lat: Array2<f64> = lat.into_dimensionality()?;
    let lon: Array2<f64> = lon.into_dimensionality()?;

    let mut grid = CurvilinearGrid::new(lat, lon)?;
    for field in read_fields(&file, &lat_dims, options)? {
        grid.add_field(field)?;
    }
    debug!(path = %path.display(), shape = ?grid.shape(), fields = grid.fields().len(), "Decoded curvilinear grid");
    Ok(grid)
}

/// Writes a finalized series to a new NetCDF file, replacing any existing one.
pub struct SeriesWriter<'a> {
    output_path: &'a Path,
    title: String,
}

impl<'a> SeriesWriter<'a> {
    pub fn new(output_path: &'a Path) -> Self {
        Self {
            output_path,
            title: "Fused reference and emission fields".to_string(),
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn write(&self, series: &TemporalSeries) -> Result<()> {
        if series.is_empty() {
            return Err(FusionError::data("refusing to write an empty series"));
        }
        if self.output_path.exists() {
            fs::remove_file(self.output_path)?;
        }
        if let Some(parent) = self.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = create(self.output_path)?;
        file.add_dimension("time", series.len())?;
        file.add_dimension("lat", series.lat().len())?;
        file.add_dimension("lon", series.lon().len())?;

        {
            let seconds: Array1<f64> = series
                .times()
                .iter()
                .map(|t| t.timestamp() as f64)
                .collect();
            let mut time_var = file.add_variable::<f64>("time", &["time"])?;
            time_var.put_attribute("units", "seconds since 1970-01-01 00:00:00")?;
            time_var.put_attribute("calendar", "standard")?;
            time_var.put_attribute("standard_name", "time")?;
            time_var.put_attribute("axis", "T")?;
            time_var.put(seconds.view(), ..)?;
        }
        {
            let mut lat_var = file.add_variable::<f64>("lat", &["lat"])?;
            lat_var.put_attribute("units", "degrees_north")?;
            lat_var.put_attribute("standard_name", "latitude")?;
            lat_var.put_attribute("axis", "Y")?;
            lat_var.put(series.lat().view(), ..)?;
        }
        {
            let mut lon_var = file.add_variable::<f64>("lon", &["lon"])?;
            lon_var.put_attribute("units", "degrees_east")?;
            lon_var.put_attribute("standard_name", "longitude")?;
            lon_var.put_attribute("axis", "X")?;
            lon_var.put(series.lon().view(), ..)?;
        }

        for field in series.fields() {
            let mut dims = vec!["time".to_string(), "lat".to_string(), "lon".to_string()];
            for (k, &len) in field.data.shape()[3..].iter().enumerate() {
                let dim = format!("{}_axis{}", field.name, k);
                file.add_dimension(&dim, len)?;
                dims.push(dim);
            }
            let dim_refs: Vec<&str> = dims.iter().map(String::as_str).collect();
            let mut var = file.add_variable::<f32>(&field.name, &dim_refs)?;
            var.put_attribute("_FillValue", f32::NAN)?;
            for (key, value) in &field.attributes {
                if key != "_FillValue" {
                    put_field_attribute(&mut var, key, value)?;
                }
            }
            var.put(field.data.view(), ..)?;
        }

        file.add_attribute("title", self.title.as_str())?;
        file.add_attribute("Conventions", "CF-1.8")?;
        file.add_attribute(
            "history",
            format!("Created by geofuse on {}", Utc::now().to_rfc3339()),
        )?;

        info!(
            path = %self.output_path.display(),
            steps = series.len(),
            fields = series.fields().len(),
            "Wrote fused series"
        );
        Ok(())
    }
}

/// Writes `series` to `path`; see [`SeriesWriter`].
pub fn write_series(series: &TemporalSeries, path: &Path) -> Result<()> {
    SeriesWriter::new(path).write(series)
}
