//! Defines command-line interface options using `clap` for the geofuse binary.

use clap::{Args as ClapArgs, Parser, Subcommand};
use chrono::{DateTime, Utc};
use geofuse::grid::BoundingBox;
use geofuse::resample::{Backend, ResampleMethod};
use geofuse::time_axis::parse_timestamp;
use std::path::PathBuf;

/// Fuse a regular forecast grid and a curvilinear emission grid
#[derive(Parser, Debug)]
#[command(name = "geofuse", version, about = "Grid alignment and resampling for gridded geoscience data")]
pub struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fuse every timestep between --start and --end into one NetCDF file
    Run(RunArgs),
    /// Print dimensions, variables and value summaries of a NetCDF file
    Inspect {
        /// Path to the NetCDF file
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// First timestep, RFC 3339 or "YYYY-MM-DD HH:MM" (UTC)
    #[arg(long, value_parser = parse_time_arg)]
    pub start: DateTime<Utc>,

    /// Last timestep, inclusive
    #[arg(long, value_parser = parse_time_arg)]
    pub end: DateTime<Utc>,

    /// Region as "lat_min,lat_max,lon_min,lon_max"
    #[arg(long, value_parser = parse_bbox_arg, allow_hyphen_values = true)]
    pub bbox: BoundingBox,

    /// Resampling method: bilinear, conservative or nearest
    #[arg(long, value_parser = parse_method_arg)]
    pub method: Option<ResampleMethod>,

    /// Directory holding cached reference files
    #[arg(long)]
    pub reference_dir: PathBuf,

    /// strftime template of reference file names inside --reference-dir
    #[arg(long, default_value = "hrrr_%Y%m%d%H.nc")]
    pub reference_template: String,

    /// Directory holding cached moving (emission) files
    #[arg(long)]
    pub moving_dir: PathBuf,

    /// Output NetCDF path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Degrees added around the box before clipping
    #[arg(long, value_parser = parse_pad_arg)]
    pub pad: Option<f64>,

    /// Resampler implementation: full or fallback
    #[arg(long, value_parser = parse_backend_arg)]
    pub backend: Option<Backend>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// JSON file to load resample weights from and save them to
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Timesteps processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// Number of threads used for weight computation. Defaults to number of CPU cores.
    #[arg(short = 't', long)]
    pub threads: Option<usize>,
}

fn parse_time_arg(s: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(s).map_err(|e| e.to_string())
}

fn parse_bbox_arg(s: &str) -> Result<BoundingBox, String> {
    s.parse::<BoundingBox>().map_err(|e| e.to_string())
}

fn parse_method_arg(s: &str) -> Result<ResampleMethod, String> {
    s.parse()
}

fn parse_backend_arg(s: &str) -> Result<Backend, String> {
    s.parse()
}

fn parse_pad_arg(s: &str) -> Result<f64, String> {
    let pad: f64 = s.parse().map_err(|_| format!("Invalid pad '{s}': expected degrees"))?;
    if pad.is_finite() && pad >= 0.0 {
        Ok(pad)
    } else {
        Err(format!("Invalid pad '{s}': must be a non-negative number"))
    }
}
