//! Entry point for the geofuse binary.
//! Parses arguments, sets up logging and dispatches to `run` or `inspect`.

use clap::Parser;
use geofuse::config::FusionConfig;
use geofuse::errors::Result;
use geofuse::fetch::{ScanFetcher, TemplateFetcher};
use geofuse::metadata::{inspect, print_summary};
use geofuse::netcdf_io::write_series;
use geofuse::parallel::ParallelConfig;
use geofuse::pipeline::FusionPipeline;
use geofuse::time_axis::time_range;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

use cli::{Args, Command, RunArgs};

fn init_tracing(args: &Args) {
    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}

fn build_config(run: &RunArgs) -> Result<FusionConfig> {
    let mut config = match &run.config {
        Some(path) => FusionConfig::from_json_file(path)?,
        None => FusionConfig::default(),
    };
    if let Some(method) = run.method {
        config.method = method;
    }
    if let Some(pad) = run.pad {
        config.pad = pad;
    }
    if let Some(backend) = run.backend {
        config.backend = backend;
    }
    if let Some(weights) = &run.weights {
        config.weights_path = Some(weights.clone());
    }
    if let Some(workers) = run.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn run_fusion(run: RunArgs) -> Result<ExitCode> {
    let config = build_config(&run)?;
    ParallelConfig::new(run.threads).setup_global_pool()?;
    let times = time_range(run.start, run.end, config.time_step())?;
    info!(
        start = %run.start,
        end = %run.end,
        steps = times.len(),
        output = %run.output.display(),
        "Preparing run"
    );

    let reference = TemplateFetcher::new(&run.reference_dir, &run.reference_template);
    let moving = ScanFetcher::new(&run.moving_dir);
    let pipeline = FusionPipeline::new(config, Box::new(reference), Box::new(moving))?;
    let outcome = pipeline.run(&times, &run.bbox)?;

    match &outcome.series {
        Some(series) => {
            write_series(series, &run.output)?;
            info!(path = %run.output.display(), "Saved fused series");
        }
        None => error!("No timestep could be fused; nothing was written"),
    }
    Ok(ExitCode::from(outcome.summary.exit_code() as u8))
}

fn dispatch(args: Args) -> Result<ExitCode> {
    match args.command {
        Command::Run(run) => run_fusion(run),
        Command::Inspect { file } => {
            let summary = inspect(&file)?;
            println!("\n File: {}", file.display());
            print_summary(&summary);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);
    match dispatch(args) {
        Ok(code) => code,
        Err(e) => {
            error!(kind = e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}
