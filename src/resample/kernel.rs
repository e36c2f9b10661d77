//! Weight kernels
//!
//! A kernel turns a source geometry and a destination grid into sparse
//! weights. Coordinates are treated as planar degrees (longitude, latitude),
//! which is adequate at the regional scales the engine is used for.

use super::weights::{Footprint, ResampleWeights, WeightKey};
use super::ResampleMethod;
use crate::errors::{FusionError, Result};
use crate::grid::{GeoGrid, RegularGrid};
use crate::normalize::{normalize_lon, LonConvention};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;

/// Cell-centre coordinates of a source grid in the destination's convention.
#[derive(Debug, Clone)]
pub struct SourceGeometry {
    lat: Array2<f64>,
    lon: Array2<f64>,
}

impl SourceGeometry {
    /// Extract centre coordinates from either grid flavour.
    ///
    /// # Errors
    ///
    /// Returns a Data error for non-finite coordinates.
    pub fn from_grid(grid: &GeoGrid, convention: LonConvention) -> Result<Self> {
        let (lat, lon) = match grid {
            GeoGrid::Regular(g) => g.mesh(),
            GeoGrid::Curvilinear(g) => (g.lat().clone(), g.lon().clone()),
        };
        Self::new(lat, lon.mapv(|v| normalize_lon(v, convention)))
    }

    pub fn new(lat: Array2<f64>, lon: Array2<f64>) -> Result<Self> {
        if lat.dim() != lon.dim() {
            return Err(FusionError::data("source lat/lon shapes differ"));
        }
        if lat.iter().chain(lon.iter()).any(|v| !v.is_finite()) {
            return Err(FusionError::data("source grid has non-finite coordinates"));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.lat.dim()
    }

    #[must_use]
    pub fn lat(&self) -> &Array2<f64> {
        &self.lat
    }

    #[must_use]
    pub fn lon(&self) -> &Array2<f64> {
        &self.lon
    }

    /// Corner coordinates of this geometry and of `destination`.
    #[must_use]
    pub fn footprint(&self, destination: &RegularGrid) -> Footprint {
        let (ny, nx) = self.shape();
        let (last_y, last_x) = (ny.saturating_sub(1), nx.saturating_sub(1));
        let ends = |axis: &Array1<f64>| {
            (
                axis.first().copied().unwrap_or(f64::NAN),
                axis.last().copied().unwrap_or(f64::NAN),
            )
        };
        let (lat0, lat1) = ends(destination.lat());
        let (lon0, lon1) = ends(destination.lon());
        Footprint {
            source: [
                self.point(0, 0),
                self.point(0, last_x),
                self.point(last_y, 0),
                self.point(last_y, last_x),
            ],
            destination: [lat0, lat1, lon0, lon1],
        }
    }

    fn point(&self, i: usize, j: usize) -> [f64; 2] {
        [self.lon[[i, j]], self.lat[[i, j]]]
    }

    /// `(lat_min, lat_max, lon_min, lon_max)` of the cell centres
    fn extent(&self) -> (f64, f64, f64, f64) {
        let fold = |a: &Array2<f64>| {
            a.iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
        };
        let (lat_min, lat_max) = fold(&self.lat);
        let (lon_min, lon_max) = fold(&self.lon);
        (lat_min, lat_max, lon_min, lon_max)
    }

    /// Whether the source footprint, widened by one cell spacing, reaches
    /// the destination's cell centres.
    pub(crate) fn overlaps(&self, destination: &RegularGrid) -> bool {
        let margin = self.mean_spacing().unwrap_or(0.0);
        let (lat_min, lat_max, lon_min, lon_max) = self.extent();
        let (dlat, dlon) = (destination.lat(), destination.lon());
        let d_lat_min = dlat[0];
        let d_lat_max = dlat[dlat.len() - 1];
        let d_lon_min = dlon[0];
        let d_lon_max = dlon[dlon.len() - 1];
        lat_min - margin <= d_lat_max
            && lat_max + margin >= d_lat_min
            && lon_min - margin <= d_lon_max
            && lon_max + margin >= d_lon_min
    }

    /// Mean distance between index-adjacent cell centres.
    pub(crate) fn mean_spacing(&self) -> Option<f64> {
        let (ny, nx) = self.shape();
        let mut total = 0.0;
        let mut count = 0usize;
        for i in 0..ny {
            for j in 0..nx {
                let p = self.point(i, j);
                if j + 1 < nx {
                    total += distance(p, self.point(i, j + 1));
                    count += 1;
                }
                if i + 1 < ny {
                    total += distance(p, self.point(i + 1, j));
                    count += 1;
                }
            }
        }
        let mean = total / count.max(1) as f64;
        (count > 0 && mean > 0.0).then_some(mean)
    }
}

/// Computes weights for a grid pair. Implementations may be external.
pub trait WeightKernel: Send + Sync {
    fn compute_weights(
        &self,
        source: &SourceGeometry,
        destination: &RegularGrid,
        method: ResampleMethod,
    ) -> Result<ResampleWeights>;
}

/// Built-in geometric kernel for nearest, bilinear and conservative weights.
#[derive(Debug, Clone)]
pub struct GeometricKernel {
    /// Nearest-neighbour matches further than this many source spacings are
    /// treated as outside the source footprint.
    pub max_nearest_spacings: f64,
}

impl Default for GeometricKernel {
    fn default() -> Self {
        Self {
            max_nearest_spacings: 1.0,
        }
    }
}

type IndexedPoint = GeomWithData<[f64; 2], (usize, usize)>;

fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

fn build_index(source: &SourceGeometry) -> RTree<IndexedPoint> {
    let (ny, nx) = source.shape();
    let points = (0..ny)
        .flat_map(|i| (0..nx).map(move |j| (i, j)))
        .map(|(i, j)| GeomWithData::new(source.point(i, j), (i, j)))
        .collect();
    RTree::bulk_load(points)
}

/// Destination centres in row-major order as `[lon, lat]`.
fn destination_points(destination: &RegularGrid) -> Vec<[f64; 2]> {
    let (lat, lon) = (destination.lat(), destination.lon());
    lat.iter()
        .flat_map(|&la| lon.iter().map(move |&lo| [lo, la]))
        .collect()
}

impl WeightKernel for GeometricKernel {
    fn compute_weights(
        &self,
        source: &SourceGeometry,
        destination: &RegularGrid,
        method: ResampleMethod,
    ) -> Result<ResampleWeights> {
        let key = WeightKey::new(source.shape(), destination.shape(), method);
        let rows = match method {
            ResampleMethod::Nearest => self.nearest_rows(source, destination)?,
            ResampleMethod::Bilinear => bilinear_rows(source, destination)?,
            ResampleMethod::Conservative => conservative_rows(source, destination)?,
        };
        ResampleWeights::from_rows(key, rows)
    }
}

impl GeometricKernel {
    fn nearest_rows(
        &self,
        source: &SourceGeometry,
        destination: &RegularGrid,
    ) -> Result<Vec<Vec<(usize, f64)>>> {
        let spacing = source
            .mean_spacing()
            .ok_or_else(|| FusionError::resample("source grid is degenerate (needs two distinct cells)"))?;
        let limit = spacing * self.max_nearest_spacings;
        let nx = source.shape().1;
        let tree = build_index(source);
        Ok(destination_points(destination)
            .into_par_iter()
            .map(|p| match tree.nearest_neighbor(&p) {
                Some(hit) if distance(*hit.geom(), p) <= limit => {
                    let (i, j) = hit.data;
                    vec![(i * nx + j, 1.0)]
                }
                _ => Vec::new(),
            })
            .collect())
    }
}

fn bilinear_rows(
    source: &SourceGeometry,
    destination: &RegularGrid,
) -> Result<Vec<Vec<(usize, f64)>>> {
    let (ny, nx) = source.shape();
    if ny < 2 || nx < 2 {
        return Err(FusionError::resample(format!(
            "bilinear weights need at least 2x2 source cells, got {ny}x{nx}"
        )));
    }
    let spacing = source
        .mean_spacing()
        .ok_or_else(|| FusionError::resample("source grid is degenerate (all centres coincide)"))?;
    let tree = build_index(source);
    Ok(destination_points(destination)
        .into_par_iter()
        .map(|p| {
            let Some(hit) = tree.nearest_neighbor(&p) else {
                return Vec::new();
            };
            if distance(*hit.geom(), p) > 2.0 * spacing {
                return Vec::new();
            }
            let (i, j) = hit.data;
            for i0 in [i.saturating_sub(1), i] {
                for j0 in [j.saturating_sub(1), j] {
                    if i0 + 1 >= ny || j0 + 1 >= nx {
                        continue;
                    }
                    let quad = [
                        source.point(i0, j0),
                        source.point(i0, j0 + 1),
                        source.point(i0 + 1, j0),
                        source.point(i0 + 1, j0 + 1),
                    ];
                    if let Some((s, t)) = inverse_bilinear(p, quad) {
                        return vec![
                            (i0 * nx + j0, (1.0 - s) * (1.0 - t)),
                            (i0 * nx + j0 + 1, s * (1.0 - t)),
                            ((i0 + 1) * nx + j0, (1.0 - s) * t),
                            ((i0 + 1) * nx + j0 + 1, s * t),
                        ];
                    }
                }
            }
            Vec::new()
        })
        .collect())
}

const NEWTON_ITERATIONS: usize = 25;
const UNIT_TOLERANCE: f64 = 1e-9;

/// Local coordinates `(s, t)` of `p` in the quad `[p00, p01, p10, p11]`,
/// where `s` runs along x (p00→p01) and `t` along y (p00→p10).
///
/// Returns `None` when `p` lies outside the quad or the quad is degenerate.
pub(crate) fn inverse_bilinear(p: [f64; 2], quad: [[f64; 2]; 4]) -> Option<(f64, f64)> {
    let [p00, p01, p10, p11] = quad;
    let at = |s: f64, t: f64, k: usize| {
        (1.0 - s) * (1.0 - t) * p00[k] + s * (1.0 - t) * p01[k] + (1.0 - s) * t * p10[k] + s * t * p11[k]
    };
    let scale = distance(p00, p11).max(distance(p01, p10));
    if scale <= 0.0 {
        return None;
    }

    let (mut s, mut t) = (0.5, 0.5);
    for _ in 0..NEWTON_ITERATIONS {
        let fx = at(s, t, 0) - p[0];
        let fy = at(s, t, 1) - p[1];
        if fx.abs().max(fy.abs()) <= 1e-13 * scale {
            break;
        }
        let ds_x = (1.0 - t) * (p01[0] - p00[0]) + t * (p11[0] - p10[0]);
        let ds_y = (1.0 - t) * (p01[1] - p00[1]) + t * (p11[1] - p10[1]);
        let dt_x = (1.0 - s) * (p10[0] - p00[0]) + s * (p11[0] - p01[0]);
        let dt_y = (1.0 - s) * (p10[1] - p00[1]) + s * (p11[1] - p01[1]);
        let det = ds_x * dt_y - dt_x * ds_y;
        if det.abs() <= f64::EPSILON * scale * scale {
            return None;
        }
        s -= (dt_y * fx - dt_x * fy) / det;
        t -= (-ds_y * fx + ds_x * fy) / det;
    }

    let residual = (at(s, t, 0) - p[0]).abs().max((at(s, t, 1) - p[1]).abs());
    let inside = |v: f64| (-UNIT_TOLERANCE..=1.0 + UNIT_TOLERANCE).contains(&v);
    (residual <= 1e-9 * scale && inside(s) && inside(t)).then(|| (s.clamp(0.0, 1.0), t.clamp(0.0, 1.0)))
}

/// Cell edges of an increasing centre axis, halfway between centres.
fn axis_edges(centres: &Array1<f64>, fallback_width: Option<f64>) -> Result<Vec<f64>> {
    let n = centres.len();
    if n == 1 {
        let width = fallback_width.ok_or_else(|| {
            FusionError::resample("destination grid is degenerate (single cell)")
        })?;
        return Ok(vec![centres[0] - width / 2.0, centres[0] + width / 2.0]);
    }
    let mut edges = Vec::with_capacity(n + 1);
    edges.push(centres[0] - (centres[1] - centres[0]) / 2.0);
    for k in 0..n - 1 {
        edges.push((centres[k] + centres[k + 1]) / 2.0);
    }
    edges.push(centres[n - 1] + (centres[n - 1] - centres[n - 2]) / 2.0);
    Ok(edges)
}

fn mean_step(centres: &Array1<f64>) -> Option<f64> {
    let n = centres.len();
    (n > 1).then(|| (centres[n - 1] - centres[0]) / (n - 1) as f64)
}

/// Indices `k` of cells `[edges[k], edges[k+1]]` overlapping `(lo, hi)`.
fn overlapping_cells(edges: &[f64], lo: f64, hi: f64) -> std::ops::Range<usize> {
    let cells = edges.len() - 1;
    let start = edges.partition_point(|&e| e <= lo).saturating_sub(1);
    let end = edges.partition_point(|&e| e < hi).min(cells);
    start..end.max(start)
}

/// Index of the cell containing `v`, if any.
fn containing_cell(edges: &[f64], v: f64) -> Option<usize> {
    if v < edges[0] || v > edges[edges.len() - 1] {
        return None;
    }
    Some(edges.partition_point(|&e| e <= v).saturating_sub(1).min(edges.len() - 2))
}

/// Axis-aligned box `(lon0, lon1, lat0, lat1)` around a source cell centre.
///
/// Half-widths come from the coordinate change towards index neighbours in
/// both index directions, so rotated cells are covered by their bounding box.
fn source_cell_box(source: &SourceGeometry, i: usize, j: usize) -> (f64, f64, f64, f64) {
    let (ny, nx) = source.shape();
    let step = |a: &Array2<f64>, along_x: bool| -> f64 {
        let (len, here) = if along_x { (nx, j) } else { (ny, i) };
        let at = |k: usize| if along_x { a[[i, k]] } else { a[[k, j]] };
        let mut sum = 0.0;
        let mut count = 0.0;
        if here > 0 {
            sum += (at(here) - at(here - 1)).abs();
            count += 1.0;
        }
        if here + 1 < len {
            sum += (at(here + 1) - at(here)).abs();
            count += 1.0;
        }
        if count > 0.0 {
            sum / count
        } else {
            0.0
        }
    };
    let half_lon = 0.5 * (step(&source.lon, true) + step(&source.lon, false));
    let half_lat = 0.5 * (step(&source.lat, true) + step(&source.lat, false));
    let (lon, lat) = (source.lon[[i, j]], source.lat[[i, j]]);
    (lon - half_lon, lon + half_lon, lat - half_lat, lat + half_lat)
}

/// Sum-preserving overlap weights.
///
/// Each source cell's value is split across the destination cells its box
/// overlaps, in proportion to the overlapped share of the box. A source
/// cell lying wholly inside the destination domain therefore hands on its
/// full value, and field totals are preserved. Cells with a degenerate box
/// hand their value to the destination cell containing their centre.
fn conservative_rows(
    source: &SourceGeometry,
    destination: &RegularGrid,
) -> Result<Vec<Vec<(usize, f64)>>> {
    let (dlat, dlon) = (destination.lat(), destination.lon());
    let lat_edges = axis_edges(dlat, mean_step(dlon))?;
    let lon_edges = axis_edges(dlon, mean_step(dlat))?;
    let (dny, dnx) = destination.shape();
    let (ny, nx) = source.shape();

    let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); dny * dnx];
    for i in 0..ny {
        for j in 0..nx {
            let src = i * nx + j;
            let (x0, x1, y0, y1) = source_cell_box(source, i, j);
            let area = (x1 - x0) * (y1 - y0);

            if area <= 0.0 {
                let centre = (
                    containing_cell(&lat_edges, source.lat[[i, j]]),
                    containing_cell(&lon_edges, source.lon[[i, j]]),
                );
                if let (Some(a), Some(b)) = centre {
                    rows[a * dnx + b].push((src, 1.0));
                }
                continue;
            }

            for a in overlapping_cells(&lat_edges, y0, y1) {
                let dy = y1.min(lat_edges[a + 1]) - y0.max(lat_edges[a]);
                if dy <= 0.0 {
                    continue;
                }
                for b in overlapping_cells(&lon_edges, x0, x1) {
                    let dx = x1.min(lon_edges[b + 1]) - x0.max(lon_edges[b]);
                    if dx > 0.0 {
                        rows[a * dnx + b].push((src, dx * dy / area));
                    }
                }
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{CurvilinearGrid, Field};
    use crate::validate::relative_error;
    use ndarray::ArrayD;

    fn regular(lat0: f64, lon0: f64, step: f64, ny: usize, nx: usize) -> RegularGrid {
        let lat = Array1::from_iter((0..ny).map(|i| lat0 + step * i as f64));
        let lon = Array1::from_iter((0..nx).map(|j| lon0 + step * j as f64));
        RegularGrid::new(lat, lon).unwrap()
    }

    fn geometry(grid: &RegularGrid) -> SourceGeometry {
        let (lat, lon) = grid.mesh();
        SourceGeometry::new(lat, lon).unwrap()
    }

    #[test]
    fn inverse_bilinear_on_skewed_quad() {
        let quad = [[0.0, 0.0], [2.0, 0.5], [0.3, 1.0], [2.4, 1.8]];
        let (s, t) = (0.3, 0.6);
        let x = |k: usize| {
            (1.0 - s) * (1.0 - t) * quad[0][k]
                + s * (1.0 - t) * quad[1][k]
                + (1.0 - s) * t * quad[2][k]
                + s * t * quad[3][k]
        };
        let (rs, rt) = inverse_bilinear([x(0), x(1)], quad).unwrap();
        assert!((rs - s).abs() < 1e-9 && (rt - t).abs() < 1e-9);
        assert!(inverse_bilinear([5.0, 5.0], quad).is_none());
    }

    #[test]
    fn bilinear_reproduces_linear_fields() {
        // a rotated source grid; a linear field must be reproduced exactly
        let (ny, nx) = (20, 20);
        let lat = Array2::from_shape_fn((ny, nx), |(i, j)| 30.0 + 0.5 * i as f64 + 0.05 * j as f64);
        let lon = Array2::from_shape_fn((ny, nx), |(i, j)| -121.0 + 0.5 * j as f64 - 0.05 * i as f64);
        let f = |la: f64, lo: f64| 2.0 * la - 3.0 * lo + 1.0;
        let values = ndarray::Zip::from(&lat).and(&lon).map_collect(|&la, &lo| f(la, lo) as f32);
        let source = SourceGeometry::new(lat, lon).unwrap();
        let dst = regular(32.0, -118.0, 0.7, 6, 6);

        let w = GeometricKernel::default()
            .compute_weights(&source, &dst, ResampleMethod::Bilinear)
            .unwrap();
        let out = w.apply(&values.into_dyn()).unwrap();
        for (a, &la) in dst.lat().iter().enumerate() {
            for (b, &lo) in dst.lon().iter().enumerate() {
                let v = out[[a, b]];
                assert!((f64::from(v) - f(la, lo)).abs() < 1e-3, "({la},{lo}) -> {v}");
            }
        }
    }

    #[test]
    fn nearest_leaves_far_cells_empty() {
        let src = regular(30.0, -120.0, 1.0, 3, 3);
        let dst = regular(30.0, -120.0, 1.0, 6, 6);
        let w = GeometricKernel::default()
            .compute_weights(&geometry(&src), &dst, ResampleMethod::Nearest)
            .unwrap();
        let values = ArrayD::from_elem(vec![3, 3], 1.0f32);
        let out = w.apply(&values).unwrap();
        assert_eq!(out[[2, 2]], 1.0);
        assert!(out[[5, 5]].is_nan());
    }

    #[test]
    fn identical_grids_map_onto_themselves() {
        let grid = regular(30.0, -120.0, 0.5, 5, 7);
        let values = Array2::from_shape_fn((5, 7), |(i, j)| (i * 7 + j) as f32).into_dyn();
        for method in [ResampleMethod::Nearest, ResampleMethod::Bilinear, ResampleMethod::Conservative] {
            let w = GeometricKernel::default()
                .compute_weights(&geometry(&grid), &grid, method)
                .unwrap();
            let out = w.apply(&values).unwrap();
            for (x, y) in out.iter().zip(values.iter()) {
                assert!((x - y).abs() < 1e-4, "{method}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn conservative_preserves_totals_on_curvilinear_source() {
        let (ny, nx) = (16, 16);
        let lat = Array2::from_shape_fn((ny, nx), |(i, _)| 30.25 + 0.25 * i as f64);
        let lon = Array2::from_shape_fn((ny, nx), |(_, j)| 240.25 + 0.25 * j as f64);
        let pm = Array2::from_shape_fn((ny, nx), |(i, j)| ((i * 3 + j * 5) % 7) as f32 * 1e-3);
        let grid = CurvilinearGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("pm", pm.clone().into_dyn()))
            .unwrap();
        let dst = regular(29.0, -121.0, 1.0, 8, 8);
        let source = SourceGeometry::from_grid(&grid.into(), LonConvention::Neg180To180).unwrap();

        let w = GeometricKernel::default()
            .compute_weights(&source, &dst, ResampleMethod::Conservative)
            .unwrap();
        let original = pm.into_dyn();
        let out = w.apply(&original).unwrap();
        assert!(relative_error(&original, &out) < 1e-6);
    }

    #[test]
    fn single_cell_destination_without_spacing_is_degenerate() {
        let src = regular(30.0, -120.0, 1.0, 3, 3);
        let dst = regular(31.0, -119.0, 1.0, 1, 1);
        let err = GeometricKernel::default().compute_weights(&geometry(&src), &dst, ResampleMethod::Conservative);
        assert!(matches!(err, Err(FusionError::Resample(_))));
    }

    #[test]
    fn edges_and_overlap_ranges() {
        let edges = axis_edges(&Array1::from(vec![0.0, 1.0, 2.0]), None).unwrap();
        assert_eq!(edges, vec![-0.5, 0.5, 1.5, 2.5]);
        assert_eq!(overlapping_cells(&edges, 0.0, 1.0), 0..2);
        assert_eq!(overlapping_cells(&edges, 0.5, 1.5), 1..2);
        assert_eq!(overlapping_cells(&edges, 3.0, 4.0), 3..3);
        assert_eq!(containing_cell(&edges, 2.5), Some(2));
        assert_eq!(containing_cell(&edges, -1.0), None);
    }
}
