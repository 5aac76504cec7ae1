//! Ordinary Kriging of an XYZ point cloud onto a square grid.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use itertools::{Itertools, MinMaxResult};
use ordered_float::OrderedFloat;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use krigrid::compute::{Context, Platform};
use krigrid::config::KrigingConfig;
use krigrid::io::{read_xyz, write_xyz};
use krigrid::kriging::{KrigingOperation, SerialKriging};
use krigrid::point::Point;
use krigrid::Result;

#[derive(Parser)]
#[command(name = "krige")]
#[command(about = "Interpolate a point cloud onto a regular grid with ordinary Kriging", long_about = None)]
#[command(version)]
struct Cli {
    /// Input XYZ file
    #[arg(long, value_name = "FILE", required_unless_present = "list_platforms")]
    input: Option<PathBuf>,

    /// Output XYZ file for the grid
    #[arg(long, value_name = "FILE", required_unless_present = "list_platforms")]
    output: Option<PathBuf>,

    /// JSON run configuration; flags given on the command line take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of lag bins of the experimental semivariogram
    #[arg(long)]
    lags_count: Option<usize>,

    /// Nodes per grid side
    #[arg(long)]
    grid_size: Option<usize>,

    /// Platform index
    #[arg(long)]
    platform: Option<usize>,

    /// Use at most this many devices of the platform
    #[arg(long = "num-devices")]
    num_devices: Option<usize>,

    /// Print per-stage timings
    #[arg(long)]
    profile: bool,

    /// Run the single-threaded host reference instead of the devices
    #[arg(long)]
    run_serial: bool,

    /// Show a progress bar while predicting
    #[arg(long)]
    progress: bool,

    /// Print the available platforms as JSON and exit
    #[arg(long)]
    list_platforms: bool,
}

impl Cli {
    fn config(&self) -> Result<KrigingConfig> {
        let mut config = match &self.config {
            Some(path) => KrigingConfig::from_json_file(path)?,
            None => KrigingConfig::default(),
        };

        if let Some(lags_count) = self.lags_count {
            config.lags_count = lags_count;
        }
        if let Some(grid_size) = self.grid_size {
            config.grid_size = grid_size;
        }
        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if self.num_devices.is_some() {
            config.device_limit = self.num_devices;
        }
        config.profile |= self.profile;
        config.run_serial |= self.run_serial;
        config.progress |= self.progress;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list_platforms {
        println!("{}", serde_json::to_string_pretty(&Platform::all())?);
        return Ok(());
    }

    let config = cli.config()?;
    let (Some(input), Some(output)) = (&cli.input, &cli.output) else {
        return Ok(());
    };

    let points = read_xyz(input)?;
    println!("Number of Points: {}", points.len());

    let grid = if config.run_serial {
        run_serial(&points, &config)?
    } else {
        run_parallel(&points, &config)?
    };

    if let MinMaxResult::MinMax(low, high) = grid.iter().map(|p| OrderedFloat(p.z)).minmax() {
        info!(nodes = grid.len(), low = low.0, high = high.0, "grid values");
    }
    write_xyz(output, &grid)
}

fn run_serial(points: &[Point], config: &KrigingConfig) -> Result<Vec<Point>> {
    let mut kriging = SerialKriging::new();

    let timer = Instant::now();
    kriging.fit(points, config.lags_count)?;
    let fit = timer.elapsed();

    let timer = Instant::now();
    let grid = kriging.predict(points, config.grid_size)?;
    let pred = timer.elapsed();

    if config.profile {
        println!("Profiling Info:");
        println!("\tSerial Kriging Fit : {} ms", fit.as_millis());
        println!("\tSerial Kriging Pred: {} ms", pred.as_millis());
        println!("\tTotal: {} ms", (fit + pred).as_millis());
    }
    Ok(grid)
}

fn run_parallel(points: &[Point], config: &KrigingConfig) -> Result<Vec<Point>> {
    let ctx = Context::new(config.platform, config.device_limit)?;
    println!("{}", ctx);
    ctx.set_profiling(config.profile);

    let mut kriging = KrigingOperation::new(&ctx)?.with_progress(config.progress);

    let timer = Instant::now();
    kriging.fit(points, config.lags_count)?;
    ctx.record_time(&["kriging_total", "krig_fit"], timer.elapsed())?;

    let timer = Instant::now();
    let grid = kriging.predict(points, config.grid_size)?;
    ctx.record_time(&["kriging_total", "krig_pred"], timer.elapsed())?;

    if ctx.profiling_enabled() {
        let profile = ctx.profile()?;
        println!("Profiling Info:");
        for (tag, elapsed) in &profile {
            println!("\t{}: {} ms", tag, elapsed.as_millis());
        }
        let total: Duration = profile
            .iter()
            .filter(|(tag, _)| !tag.ends_with("_total"))
            .map(|(_, elapsed)| *elapsed)
            .sum();
        println!();
        println!("\tTotal: {} ms", total.as_millis());
    }
    Ok(grid)
}
