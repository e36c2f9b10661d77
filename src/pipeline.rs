//! Per-run orchestration
//!
//! For every timestamp the pipeline fetches both grids, clips the reference
//! grid and subsets the moving grid to the padded box, resamples the moving
//! fields onto the clipped reference grid, checks mass conservation and
//! appends the merged record to the accumulator. A failing timestamp is
//! logged and skipped; the run only fails when no timestamp succeeds.

use crate::accumulate::{FusedRecord, TemporalAccumulator, TemporalSeries};
use crate::clip::clip;
use crate::config::FusionConfig;
use crate::errors::{FusionError, Result};
use crate::fetch::{MovingFetcher, ReferenceFetcher};
use crate::grid::{BoundingBox, CurvilinearGrid, Field, GeoGrid};
use crate::normalize::normalize_regular;
use crate::parallel::ParallelConfig;
use crate::resample::{shape_cache_key, Backend, FallbackResampler, FullResampler, Resampler};
use crate::subset::subset;
use crate::validate::{MassCheck, MassConservationValidator};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

/// Requests that a run stop after the timestep (or batch) in progress.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedStep {
    pub time: DateTime<Utc>,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MassWarning {
    pub time: DateTime<Utc>,
    pub field: String,
    pub rel_error: f64,
    pub tolerance: f64,
}

/// What happened during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: Vec<DateTime<Utc>>,
    pub skipped: Vec<SkippedStep>,
    pub mass_warnings: Vec<MassWarning>,
    /// At least one record came from the fallback resampler
    pub degraded: bool,
    pub weight_cache_hits: usize,
    pub weight_cache_misses: usize,
    pub cancelled: bool,
}

impl RunSummary {
    /// 0 when at least one timestep produced a record
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.succeeded.is_empty() {
            1
        } else {
            0
        }
    }

    fn skip(&mut self, time: DateTime<Utc>, err: &FusionError) {
        if err.is_recoverable() {
            warn!(%time, kind = err.kind(), "Skipping timestep: {err}");
        } else {
            error!(%time, kind = err.kind(), "Skipping timestep: {err}");
        }
        self.skipped.push(SkippedStep {
            time,
            kind: err.kind(),
            reason: err.to_string(),
        });
    }

    pub fn log(&self) {
        info!(
            attempted = self.attempted,
            succeeded = self.succeeded.len(),
            skipped = self.skipped.len(),
            mass_warnings = self.mass_warnings.len(),
            cache_hits = self.weight_cache_hits,
            cache_misses = self.weight_cache_misses,
            "Run finished"
        );
        for w in &self.mass_warnings {
            warn!(time = %w.time, field = %w.field, rel_error = w.rel_error, "Mass conservation exceeded tolerance");
        }
        if self.degraded {
            warn!("Some records were produced by the degraded fallback resampler");
        }
        if self.cancelled {
            warn!("Run was cancelled before all timesteps were processed");
        }
    }
}

/// Result of fusing one timestamp
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub record: FusedRecord,
    pub checks: Vec<MassCheck>,
    pub degraded: bool,
    pub weights_reused: bool,
}

pub struct RunOutcome {
    /// `None` when no timestep succeeded
    pub series: Option<TemporalSeries>,
    pub summary: RunSummary,
}

/// Keep the configured moving variables, renamed to `<prefix><short>` with
/// NaN replaced by the configured fill.
///
/// # Errors
///
/// Returns a Data error when none of the configured variables is present.
pub fn select_moving_fields(grid: CurvilinearGrid, config: &FusionConfig) -> Result<CurvilinearGrid> {
    let fill = config.moving_fill;
    let fields: Vec<Field> = grid
        .fields()
        .iter()
        .filter_map(|field| {
            let short = config.moving_variables.get(&field.name)?;
            Some(Field {
                name: config.moving_output_name(short),
                data: field.data.mapv(|v| if v.is_nan() { fill } else { v }),
                attributes: field.attributes.clone(),
            })
        })
        .collect();
    if fields.is_empty() {
        let wanted: Vec<&str> = config.moving_variables.keys().map(String::as_str).collect();
        return Err(FusionError::data(format!(
            "moving grid has none of the variables {}",
            wanted.join(", ")
        )));
    }
    grid.with_fields(fields)
}

pub struct FusionPipeline {
    config: FusionConfig,
    reference: Box<dyn ReferenceFetcher>,
    moving: Box<dyn MovingFetcher>,
    resampler: Box<dyn Resampler>,
    cancel: CancellationToken,
}

impl FusionPipeline {
    /// Build a pipeline with the resampler named by `config.backend`.
    pub fn new(
        config: FusionConfig,
        reference: Box<dyn ReferenceFetcher>,
        moving: Box<dyn MovingFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let resampler: Box<dyn Resampler> = match config.backend {
            Backend::Full => Box::new(FullResampler::new()),
            Backend::Fallback => Box::new(FallbackResampler::new()),
        };
        Ok(Self {
            config,
            reference,
            moving,
            resampler,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the resampler, e.g. with one backed by an external kernel.
    #[must_use]
    pub fn with_resampler(mut self, resampler: Box<dyn Resampler>) -> Self {
        self.resampler = resampler;
        self
    }

    /// Share an existing token instead of the pipeline's own.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    #[must_use]
    pub fn resampler(&self) -> &dyn Resampler {
        self.resampler.as_ref()
    }

    /// Token that stops [`FusionPipeline::run`] between timesteps
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fuse one timestamp into a record on the clipped reference grid.
    ///
    /// # Errors
    ///
    /// Any failure of this timestamp, including an EmptyIntersection error
    /// when either grid misses the box or the grids miss each other.
    pub fn fuse_timestep(&self, time: DateTime<Utc>, bbox: &BoundingBox) -> Result<StepOutput> {
        let config = &self.config;

        let mut reference = self.reference.fetch_reference(time, bbox)?;
        if !config.reference_variables.is_empty() {
            reference.retain_fields(|f| config.reference_variables.contains(&f.name));
        }
        let reference = clip(reference, bbox, config.pad)?
            .or_empty_error(|| format!("reference grid does not cover {bbox}"))?;
        let reference = normalize_regular(reference, config.reference_convention)?;

        let moving = select_moving_fields(self.moving.fetch_moving(time)?, config)?;
        let moving = subset(moving, bbox, config.pad)?
            .or_empty_error(|| format!("moving grid has no cell inside {bbox}"))?;
        debug!(reference = ?reference.shape(), moving = ?moving.shape(), "Grids cut to region");

        let source = GeoGrid::from(moving);
        let key = shape_cache_key(source.spatial_shape(), reference.shape(), config.method);
        let resampled = self
            .resampler
            .resample(&source, &reference, config.method, Some(&key))?
            .or_empty_error(|| "moving and reference grids do not overlap".to_string())?;

        let validator = MassConservationValidator::new(if resampled.degraded {
            config.degraded_mass_tolerance
        } else {
            config.mass_tolerance
        });
        let mut checks = Vec::new();
        for field in resampled.grid.fields() {
            if let Some(original) = source.field(&field.name) {
                checks.push(validator.validate(&field.name, &original.data, &field.data));
            }
        }

        let mut fused = reference;
        for field in resampled.grid.into_fields() {
            fused.add_field(field)?;
        }

        Ok(StepOutput {
            record: FusedRecord::new(time, fused),
            checks,
            degraded: resampled.degraded,
            weights_reused: resampled.weights_reused,
        })
    }

    fn absorb(
        &self,
        time: DateTime<Utc>,
        step: Result<StepOutput>,
        accumulator: &mut TemporalAccumulator,
        summary: &mut RunSummary,
    ) {
        let step = match step {
            Ok(step) => step,
            Err(e) => return summary.skip(time, &e),
        };
        let StepOutput {
            record,
            checks,
            degraded,
            weights_reused,
        } = step;
        if let Err(e) = accumulator.append(record) {
            return summary.skip(time, &e);
        }
        for check in checks.into_iter().filter(|c| c.exceeds) {
            summary.mass_warnings.push(MassWarning {
                time,
                field: check.field,
                rel_error: check.rel_error,
                tolerance: check.tolerance,
            });
        }
        summary.degraded |= degraded;
        summary.succeeded.push(time);
        info!(%time, weights_reused, "Timestep fused");
    }

    /// Fuse every timestamp in `times`, which must be in increasing order.
    ///
    /// # Errors
    ///
    /// Only fails for problems affecting the whole run: an unsupported box,
    /// a thread pool that cannot be built or a series that cannot be
    /// assembled. Per-timestep failures are recorded in the summary.
    pub fn run(&self, times: &[DateTime<Utc>], bbox: &BoundingBox) -> Result<RunOutcome> {
        bbox.ensure_supported()?;
        bbox.padded(self.config.pad).ensure_supported()?;
        self.load_weights();

        let mut accumulator = TemporalAccumulator::new();
        let mut summary = RunSummary {
            attempted: times.len(),
            ..RunSummary::default()
        };
        info!(
            steps = times.len(),
            %bbox,
            method = %self.config.method,
            resampler = self.resampler.name(),
            "Starting fusion run"
        );

        let workers = self.config.workers;
        if workers <= 1 {
            for &time in times {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                let step = {
                    let _span = info_span!("timestep", %time).entered();
                    self.fuse_timestep(time, bbox)
                };
                self.absorb(time, step, &mut accumulator, &mut summary);
            }
        } else {
            let pool = ParallelConfig::with_threads(workers).build_pool()?;
            for batch in times.chunks(workers) {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                let results: Vec<Result<StepOutput>> = pool.install(|| {
                    batch
                        .par_iter()
                        .map(|&time| {
                            let _span = info_span!("timestep", %time).entered();
                            self.fuse_timestep(time, bbox)
                        })
                        .collect()
                });
                for (&time, step) in batch.iter().zip(results) {
                    self.absorb(time, step, &mut accumulator, &mut summary);
                }
            }
        }

        if let Some(cache) = self.resampler.weight_cache() {
            summary.weight_cache_hits = cache.hits();
            summary.weight_cache_misses = cache.misses();
        }
        self.save_weights();

        let series = if accumulator.is_empty() {
            None
        } else {
            Some(accumulator.finalize()?)
        };
        summary.log();
        Ok(RunOutcome { series, summary })
    }

    fn load_weights(&self) {
        let (Some(path), Some(cache)) = (&self.config.weights_path, self.resampler.weight_cache()) else {
            return;
        };
        if !path.exists() {
            debug!(path = %path.display(), "No persisted weights yet");
            return;
        }
        if let Err(e) = cache.load_from(path) {
            warn!(path = %path.display(), "Ignoring unreadable weights file: {e}");
        }
    }

    fn save_weights(&self) {
        let (Some(path), Some(cache)) = (&self.config.weights_path, self.resampler.weight_cache()) else {
            return;
        };
        if cache.is_empty() {
            return;
        }
        if let Err(e) = cache.save_to(path) {
            warn!(path = %path.display(), "Could not persist weights: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn moving() -> CurvilinearGrid {
        let lat = Array2::from_shape_fn((2, 2), |(i, _)| 30.0 + i as f64);
        let lon = Array2::from_shape_fn((2, 2), |(_, j)| 240.0 + j as f64);
        let frp = Array2::from_shape_vec((2, 2), vec![1.0, f32::NAN, 2.0, 3.0]).unwrap();
        CurvilinearGrid::new(lat, lon)
            .unwrap()
            .with_field(Field::new("FRP_MEAN", frp.into_dyn()))
            .unwrap()
            .with_field(Field::new("QA", Array2::<f32>::zeros((2, 2)).into_dyn()))
            .unwrap()
    }

    #[test]
    fn moving_fields_are_selected_renamed_and_filled() {
        let out = select_moving_fields(moving(), &FusionConfig::default()).unwrap();
        assert_eq!(out.fields().len(), 1);
        let frp = &out.field("rave_frp").unwrap().data;
        assert_eq!(frp[[0, 1]], 0.0);
        assert_eq!(frp[[1, 1]], 3.0);
    }

    #[test]
    fn missing_moving_variables_are_a_data_error() {
        let config = FusionConfig {
            moving_variables: [("PM25".to_string(), "pm25".to_string())].into_iter().collect(),
            ..FusionConfig::default()
        };
        assert!(matches!(select_moving_fields(moving(), &config), Err(FusionError::Data(_))));
    }

    #[test]
    fn exit_code_follows_successes() {
        let mut summary = RunSummary::default();
        assert_eq!(summary.exit_code(), 1);
        summary.succeeded.push(Utc::now());
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
