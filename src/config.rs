//! Per-run configuration
//!
//! Everything a run depends on is carried by [`FusionConfig`] and handed to
//! the pipeline constructor. Values come from defaults, an optional JSON file
//! and then individual command-line overrides, in that order.

use crate::errors::{FusionError, Result};
use crate::normalize::LonConvention;
use crate::resample::{Backend, ResampleMethod};
use crate::validate::DEFAULT_TOLERANCE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    /// Degrees added on every side of the bounding box before clipping
    pub pad: f64,
    pub method: ResampleMethod,
    pub backend: Backend,
    /// Longitude convention of the fused output
    pub reference_convention: LonConvention,
    /// Relative mass error reported as a warning
    pub mass_tolerance: f64,
    /// Looser tolerance applied to degraded (fallback) results
    pub degraded_mass_tolerance: f64,
    /// Prefix of resampled moving fields in the output
    pub moving_prefix: String,
    /// Moving source variable → short output name
    pub moving_variables: BTreeMap<String, String>,
    /// Replacement for NaN in moving fields before resampling
    pub moving_fill: f32,
    /// Reference variables to keep; empty keeps all
    pub reference_variables: Vec<String>,
    pub time_step_minutes: i64,
    /// JSON file used to seed and persist resample weights
    pub weights_path: Option<PathBuf>,
    /// Timesteps processed concurrently; 1 is sequential
    pub workers: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        let moving_variables = [
            ("FRP_MEAN", "frp"),
            ("PM25", "pm25"),
            ("PM25_scaled", "pm25_scaled"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            pad: 0.5,
            method: ResampleMethod::Bilinear,
            backend: Backend::Full,
            reference_convention: LonConvention::Neg180To180,
            mass_tolerance: DEFAULT_TOLERANCE,
            degraded_mass_tolerance: 0.15,
            moving_prefix: "rave_".to_string(),
            moving_variables,
            moving_fill: 0.0,
            reference_variables: Vec::new(),
            time_step_minutes: 60,
            weights_path: None,
            workers: 1,
        }
    }
}

impl FusionConfig {
    /// Load a JSON file; keys not present keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Output name of a moving source variable
    #[must_use]
    pub fn moving_output_name(&self, short: &str) -> String {
        format!("{}{}", self.moving_prefix, short)
    }

    pub fn time_step(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.time_step_minutes)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.pad.is_finite() || self.pad < 0.0 {
            return Err(FusionError::config(format!("pad must be a non-negative number, got {}", self.pad)));
        }
        for (name, tol) in [
            ("mass_tolerance", self.mass_tolerance),
            ("degraded_mass_tolerance", self.degraded_mass_tolerance),
        ] {
            if !tol.is_finite() || tol < 0.0 {
                return Err(FusionError::config(format!("{name} must be non-negative, got {tol}")));
            }
        }
        if self.time_step_minutes <= 0 {
            return Err(FusionError::config("time_step_minutes must be positive"));
        }
        if self.workers == 0 {
            return Err(FusionError::config("workers must be at least 1"));
        }
        if self.moving_variables.is_empty() {
            return Err(FusionError::config("at least one moving variable must be selected"));
        }
        Ok(())
    }
}
