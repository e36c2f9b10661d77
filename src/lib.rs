//! geofuse: alignment and resampling of gridded geoscience data
//!
//! geofuse puts two differently gridded datasets on one spatial and temporal
//! frame: a regular lat/lon reference grid (e.g. a weather forecast) and a
//! curvilinear moving grid (e.g. satellite fire emissions). For every
//! timestep the reference grid is clipped to a padded bounding box, the
//! moving grid is cut to the smallest index window covering the box, the
//! moving fields are resampled onto the reference grid and the merged record
//! is streamed into a single time series.
//!
//! ## Module Organization
//!
//! - [`grid`]: grid types, bounding boxes and the empty-intersection marker
//! - [`normalize`]: longitude convention handling
//! - [`clip`] / [`subset`]: regional cuts of regular and curvilinear grids
//! - [`resample`]: resamplers, weight kernels and the weight cache
//! - [`validate`]: mass conservation checks
//! - [`accumulate`]: streaming time-series assembly
//! - [`pipeline`]: per-run orchestration, cancellation and run summary
//! - [`fetch`] / [`netcdf_io`]: local cache readers and the NetCDF writer
//! - [`config`], [`parallel`], [`errors`]: run configuration and plumbing
//!
//! ## Usage
//! ```rust,no_run
//! use geofuse::prelude::*;
//!
//! let config = FusionConfig::default();
//! let reference = TemplateFetcher::new("cache/hrrr", "hrrr_%Y%m%d%H.nc");
//! let moving = ScanFetcher::new("cache/rave");
//! let pipeline = FusionPipeline::new(config, Box::new(reference), Box::new(moving)).unwrap();
//!
//! let bbox: BoundingBox = "30,35,-120,-110".parse().unwrap();
//! let start = parse_timestamp("2024-07-01 00:00").unwrap();
//! let end = parse_timestamp("2024-07-01 06:00").unwrap();
//! let times = time_range(start, end, pipeline.config().time_step()).unwrap();
//!
//! let outcome = pipeline.run(&times, &bbox).unwrap();
//! if let Some(series) = &outcome.series {
//!     write_series(series, std::path::Path::new("fused.nc")).unwrap();
//! }
//! std::process::exit(outcome.summary.exit_code());
//! ```

pub mod accumulate;
pub mod clip;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod grid;
pub mod metadata;
pub mod netcdf_io;
pub mod normalize;
pub mod parallel;
pub mod pipeline;
pub mod resample;
pub mod subset;
pub mod time_axis;
pub mod validate;

pub use errors::{FusionError, Result};

/// Common imports for library users
pub mod prelude {
    pub use crate::accumulate::{FusedRecord, TemporalAccumulator, TemporalSeries};
    pub use crate::clip::clip;
    pub use crate::config::FusionConfig;
    pub use crate::errors::{FusionError, Result};
    pub use crate::fetch::{MovingFetcher, ReferenceFetcher, ScanFetcher, TemplateFetcher};
    pub use crate::grid::{
        BoundingBox, Coverage, CurvilinearGrid, Field, FieldAttribute, GeoGrid, RegularGrid,
    };
    pub use crate::netcdf_io::{read_curvilinear_grid, read_regular_grid, write_series, DecodeOptions};
    pub use crate::normalize::{normalize_lon, LonConvention};
    pub use crate::parallel::ParallelConfig;
    pub use crate::pipeline::{CancellationToken, FusionPipeline, RunOutcome, RunSummary};
    pub use crate::resample::{
        Backend, FallbackResampler, FullResampler, ResampleMethod, Resampler, WeightCache,
    };
    pub use crate::subset::subset;
    pub use crate::time_axis::{parse_timestamp, time_range};
    pub use crate::validate::{MassCheck, MassConservationValidator};
}
