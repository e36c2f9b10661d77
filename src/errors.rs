//! Centralized error handling for geofuse
//!
//! Every stage of the fusion engine reports failures through [`FusionError`].
//! Per-timestep failures (bad coordinates, missing overlap, resampling or
//! consistency problems, failed fetches) are recoverable: the pipeline logs
//! them, skips the timestep and keeps going. Everything else aborts the run.

use thiserror::Error;

/// Main error type for geofuse operations
#[derive(Error, Debug)]
pub enum FusionError {
    /// Malformed coordinates or fields
    #[error("data error: {0}")]
    Data(String),

    /// A grid and the requested region (or two grids) do not overlap
    #[error("no spatial overlap: {0}")]
    EmptyIntersection(String),

    /// Weight computation, weight reuse or field mapping failed
    #[error("resample error: {0}")]
    Resample(String),

    /// A record does not line up with the series it is appended to
    #[error("consistency error: {0}")]
    Consistency(String),

    /// An external fetcher could not supply data for a timestamp
    #[error("fetch error: {0}")]
    Fetch(String),

    /// NetCDF file operation errors
    #[error("NetCDF error: {0}")]
    NetCDF(#[from] netcdf::Error),

    /// I/O operation errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Array shape or dimension error
    #[error("array error: {0}")]
    Array(#[from] ndarray::ShapeError),

    /// Weight or configuration file (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid run configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Thread pool configuration error
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// The run was cancelled before any work was done
    #[error("run cancelled")]
    Cancelled,
}

impl FusionError {
    /// Create a Data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a Resample error.
    pub fn resample(msg: impl Into<String>) -> Self {
        Self::Resample(msg.into())
    }

    /// Create a Consistency error.
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a Fetch error.
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the pipeline may skip the affected timestep and continue.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Data(_)
                | Self::EmptyIntersection(_)
                | Self::Resample(_)
                | Self::Consistency(_)
                | Self::Fetch(_)
                | Self::NetCDF(_)
                | Self::Array(_)
        )
    }

    /// Short label used in run summaries and log records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::EmptyIntersection(_) => "empty_intersection",
            Self::Resample(_) => "resample",
            Self::Consistency(_) => "consistency",
            Self::Fetch(_) => "fetch",
            Self::NetCDF(_) => "netcdf",
            Self::Io(_) => "io",
            Self::Array(_) => "array",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::ThreadPool(_) => "thread_pool",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result type alias for geofuse operations
pub type Result<T> = std::result::Result<T, FusionError>;
