//! Streaming accumulation of fused timesteps into a time series
//!
//! Each appended record is copied into per-field growing buffers and then
//! dropped, so only the running series and the record being appended are
//! ever held. Coordinates are fixed by the first record.

use crate::errors::{FusionError, Result};
use crate::grid::{Field, FieldAttribute, RegularGrid};
use chrono::{DateTime, Utc};
use ndarray::{Array1, ArrayD, IxDyn};
use std::collections::BTreeMap;
use tracing::debug;

/// All fields of one timestep on the reference grid
#[derive(Debug, Clone)]
pub struct FusedRecord {
    pub time: DateTime<Utc>,
    pub grid: RegularGrid,
}

impl FusedRecord {
    #[must_use]
    pub fn new(time: DateTime<Utc>, grid: RegularGrid) -> Self {
        Self { time, grid }
    }
}

#[derive(Debug)]
struct FieldBuffer {
    name: String,
    tail: Vec<usize>,
    attributes: BTreeMap<String, FieldAttribute>,
    values: Vec<f32>,
}

impl FieldBuffer {
    fn step_len(&self, spatial: usize) -> usize {
        spatial * self.tail.iter().product::<usize>()
    }
}

/// Running series; see [`TemporalAccumulator::append`].
#[derive(Debug, Default)]
pub struct TemporalAccumulator {
    coords: Option<(Array1<f64>, Array1<f64>)>,
    times: Vec<DateTime<Utc>>,
    buffers: Vec<FieldBuffer>,
}

impl TemporalAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    #[must_use]
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.times.last().copied()
    }

    /// Append one record.
    ///
    /// The record is checked completely before anything is changed, so a
    /// rejected record leaves the series untouched.
    ///
    /// # Errors
    ///
    /// Returns a Consistency error if the record's time does not follow the
    /// last appended time, its coordinates differ from the series', or a
    /// field's trailing axes differ from earlier records of that field.
    pub fn append(&mut self, record: FusedRecord) -> Result<()> {
        self.check(&record)?;
        let FusedRecord { time, grid } = record;
        let (ny, nx) = grid.shape();
        let spatial = ny * nx;
        let previous_steps = self.times.len();

        if self.coords.is_none() {
            self.coords = Some((grid.lat().clone(), grid.lon().clone()));
        }
        self.times.push(time);

        let mut incoming: BTreeMap<String, Field> = grid
            .into_fields()
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        for buffer in &mut self.buffers {
            let step_len = buffer.step_len(spatial);
            match incoming.remove(&buffer.name) {
                Some(field) => buffer.values.extend(field.data.iter().copied()),
                None => buffer.values.extend(std::iter::repeat(f32::NAN).take(step_len)),
            }
        }

        for (name, field) in incoming {
            let tail = field.extra_shape().to_vec();
            let mut buffer = FieldBuffer {
                name,
                tail,
                attributes: field.attributes,
                values: Vec::new(),
            };
            let step_len = buffer.step_len(spatial);
            buffer.values.reserve(step_len * (previous_steps + 1));
            buffer
                .values
                .extend(std::iter::repeat(f32::NAN).take(step_len * previous_steps));
            buffer.values.extend(field.data.iter().copied());
            if previous_steps > 0 {
                debug!(field = %buffer.name, previous_steps, "Field first seen mid-series, earlier steps are NaN");
            }
            self.buffers.push(buffer);
        }

        debug!(%time, steps = self.times.len(), "Appended fused record");
        Ok(())
    }

    fn check(&self, record: &FusedRecord) -> Result<()> {
        if let Some(last) = self.times.last() {
            if record.time <= *last {
                return Err(FusionError::consistency(format!(
                    "record at {} does not follow last appended time {}",
                    record.time, last
                )));
            }
        }
        if let Some((lat, lon)) = &self.coords {
            if record.grid.lat() != lat || record.grid.lon() != lon {
                return Err(FusionError::consistency(format!(
                    "record at {} has coordinates {:?} differing from series {:?}",
                    record.time,
                    record.grid.shape(),
                    (lat.len(), lon.len())
                )));
            }
        }
        for field in record.grid.fields() {
            if let Some(buffer) = self.buffers.iter().find(|b| b.name == field.name) {
                if buffer.tail != field.extra_shape() {
                    return Err(FusionError::consistency(format!(
                        "field '{}' has trailing axes {:?} at {}, expected {:?}",
                        field.name,
                        field.extra_shape(),
                        record.time,
                        buffer.tail
                    )));
                }
            }
        }
        Ok(())
    }

    /// Freeze the series.
    ///
    /// # Errors
    ///
    /// Returns a Consistency error when nothing was appended.
    pub fn finalize(self) -> Result<TemporalSeries> {
        let Some((lat, lon)) = self.coords else {
            return Err(FusionError::consistency("no records were accumulated"));
        };
        let steps = self.times.len();
        let mut fields = Vec::with_capacity(self.buffers.len());
        for buffer in self.buffers {
            let mut shape = vec![steps, lat.len(), lon.len()];
            shape.extend(&buffer.tail);
            fields.push(SeriesField {
                name: buffer.name,
                data: ArrayD::from_shape_vec(IxDyn(&shape), buffer.values)?,
                attributes: buffer.attributes,
            });
        }
        Ok(TemporalSeries {
            times: self.times,
            lat,
            lon,
            fields,
        })
    }
}

/// One field of a series, indexed `(time, lat, lon, ...)`.
#[derive(Debug, Clone)]
pub struct SeriesField {
    pub name: String,
    pub data: ArrayD<f32>,
    pub attributes: BTreeMap<String, FieldAttribute>,
}

/// Finalized, time-ordered series on one reference grid
#[derive(Debug, Clone)]
pub struct TemporalSeries {
    times: Vec<DateTime<Utc>>,
    lat: Array1<f64>,
    lon: Array1<f64>,
    fields: Vec<SeriesField>,
}

impl TemporalSeries {
    #[must_use]
    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    #[must_use]
    pub fn lat(&self) -> &Array1<f64> {
        &self.lat
    }

    #[must_use]
    pub fn lon(&self) -> &Array1<f64> {
        &self.lon
    }

    #[must_use]
    pub fn fields(&self) -> &[SeriesField] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&SeriesField> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::{Array2, Array3};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap()
    }

    fn grid() -> RegularGrid {
        RegularGrid::new(Array1::from(vec![30.0, 31.0]), Array1::from(vec![-120.0, -119.0, -118.0])).unwrap()
    }

    fn record(hour: u32, names: &[&str]) -> FusedRecord {
        let mut g = grid();
        for name in names {
            let data = Array2::from_elem((2, 3), hour as f32).into_dyn();
            g.add_field(Field::new(*name, data)).unwrap();
        }
        FusedRecord::new(at(hour), g)
    }

    #[test]
    fn appends_in_order() {
        let mut acc = TemporalAccumulator::new();
        acc.append(record(0, &["t2m", "rave_frp"])).unwrap();
        acc.append(record(1, &["t2m", "rave_frp"])).unwrap();
        let series = acc.finalize().unwrap();
        assert_eq!(series.times(), &[at(0), at(1)]);
        let t2m = &series.field("t2m").unwrap().data;
        assert_eq!(t2m.shape(), &[2, 2, 3]);
        assert_eq!(t2m[[1, 1, 2]], 1.0);
    }

    #[test]
    fn mismatched_coordinates_are_rejected_without_side_effects() {
        let mut acc = TemporalAccumulator::new();
        acc.append(record(0, &["t2m"])).unwrap();
        let shifted = RegularGrid::new(Array1::from(vec![30.0, 31.5]), grid().lon().clone()).unwrap();
        let err = acc.append(FusedRecord::new(at(1), shifted));
        assert!(matches!(err, Err(FusionError::Consistency(_))));
        assert_eq!(acc.len(), 1);
        acc.append(record(2, &["t2m"])).unwrap();
        assert_eq!(acc.finalize().unwrap().len(), 2);
    }

    #[test]
    fn time_must_increase() {
        let mut acc = TemporalAccumulator::new();
        acc.append(record(3, &["t2m"])).unwrap();
        assert!(matches!(acc.append(record(3, &["t2m"])), Err(FusionError::Consistency(_))));
        assert!(matches!(acc.append(record(2, &["t2m"])), Err(FusionError::Consistency(_))));
    }

    #[test]
    fn field_union_is_backfilled_with_nan() {
        let mut acc = TemporalAccumulator::new();
        acc.append(record(0, &["t2m"])).unwrap();
        acc.append(record(1, &["t2m", "rave_pm25"])).unwrap();
        acc.append(record(2, &["rave_pm25"])).unwrap();
        let series = acc.finalize().unwrap();
        let pm = &series.field("rave_pm25").unwrap().data;
        assert!(pm[[0, 0, 0]].is_nan());
        assert_eq!(pm[[1, 0, 0]], 1.0);
        let t2m = &series.field("t2m").unwrap().data;
        assert!(t2m[[2, 1, 1]].is_nan());
    }

    #[test]
    fn extra_axes_must_stay_consistent() {
        let mut acc = TemporalAccumulator::new();
        let levels = |n| Array3::<f32>::zeros((2, 3, n)).into_dyn();
        acc.append(FusedRecord::new(at(0), grid().with_field(Field::new("u", levels(4))).unwrap()))
            .unwrap();
        let err = acc.append(FusedRecord::new(at(1), grid().with_field(Field::new("u", levels(5))).unwrap()));
        assert!(matches!(err, Err(FusionError::Consistency(_))));
        assert_eq!(acc.finalize().unwrap().field("u").unwrap().data.shape(), &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_accumulator_cannot_finalize() {
        assert!(TemporalAccumulator::new().finalize().is_err());
    }
}
