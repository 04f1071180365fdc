//! hmbgen - HMB day-product generator
//!
//! Usage: hmbgen --date <YYYYMMDD> [--end-date <YYYYMMDD>] [--config <file.toml>] [options]

use anyhow::{Context, Result};
use clap::Parser;
use pbp_cli::output::{print_json, DayReport};
use pbp_cli::{init_logging, install_cancel_handler, parse_key_value};
use pbp_core::{date_range, parse_date, DayContext, DayProcessor, PbpConfig};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "hmbgen")]
#[command(about = "Generate daily hybrid millidecade band products", long_about = None)]
struct Args {
    /// First (or only) day to process, YYYYMMDD
    #[arg(long)]
    date: String,

    /// Last day to process, inclusive
    #[arg(long)]
    end_date: Option<String>,

    /// Configuration file (TOML); flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root of the {YYYY}/{YYYYMMDD}.json metadata tree
    #[arg(long)]
    json_base_dir: Option<String>,

    /// Base directory for relative audio locations
    #[arg(long)]
    audio_base_dir: Option<String>,

    /// old~new prefix rewrite applied to audio uris
    #[arg(long)]
    audio_path_map_prefix: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    output_prefix: Option<String>,

    /// Where remote audio is downloaded
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Reuse files already in the download directory
    #[arg(long)]
    assume_downloaded_files: bool,

    /// Keep downloaded files after use
    #[arg(long)]
    retain_downloaded_files: bool,

    /// Segment width in seconds
    #[arg(long)]
    resolution: Option<u32>,

    /// Process at most this many segments per day (debugging aid)
    #[arg(long)]
    max_segments: Option<usize>,

    #[arg(long)]
    voltage_multiplier: Option<f64>,

    /// Keep frequencies in [LOWER, UPPER)
    #[arg(long, num_args = 2, value_names = ["LOWER", "UPPER"])]
    subset_to: Option<Vec<f32>>,

    /// Channel to analyze in multi-channel files
    #[arg(long)]
    channel: Option<usize>,

    /// Sensitivity curve (JSON)
    #[arg(long)]
    sensitivity_uri: Option<String>,

    /// Flat sensitivity in dB
    #[arg(long, allow_hyphen_values = true)]
    sensitivity_flat_value: Option<f64>,

    /// Global attributes file (JSON)
    #[arg(long)]
    global_attrs: Option<String>,

    /// Variable attributes file (JSON)
    #[arg(long)]
    variable_attrs: Option<String>,

    /// Set a global attribute; also replaces {{KEY}} in other attributes
    #[arg(long, value_parser = parse_key_value, value_name = "KEY=VALUE")]
    set_global_attr: Vec<(String, String)>,

    /// Days processed in parallel (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = build_config(&args)?;
    let start = parse_date(&args.date)?;
    let end = match &args.end_date {
        Some(end) => parse_date(end)?,
        None => start,
    };
    let dates = date_range(start, end)?;

    let processor = DayProcessor::new(config)?;

    let cancel = Arc::new(AtomicBool::new(false));
    install_cancel_handler(cancel.clone());

    let mut pool = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = args.jobs {
        pool = pool.num_threads(jobs.max(1));
    }
    let pool = pool.build().context("Failed to create worker pool")?;

    log::info!("Processing {} day(s) from {} to {}", dates.len(), start, end);
    let started = std::time::Instant::now();

    let reports: Vec<DayReport> = pool.install(|| {
        dates
            .par_iter()
            .map(|&date| {
                let ctx = DayContext::with_cancel(date, cancel.clone());
                match processor.process_day(&ctx) {
                    Ok(outcome) => DayReport::from_outcome(&outcome),
                    Err(e) => {
                        log::error!("{} {}", ctx.label(), e);
                        DayReport::from_error(date, &e)
                    }
                }
            })
            .collect()
    });

    let succeeded = reports.iter().filter(|r| r.is_success()).count();
    log::info!(
        "Finished {}/{} day(s) in {:.1}s",
        succeeded,
        reports.len(),
        started.elapsed().as_secs_f64()
    );

    print_json(&reports);
    Ok(())
}

fn build_config(args: &Args) -> Result<PbpConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => PbpConfig::default(),
    };

    let p = &mut config.processing;
    if let Some(resolution) = args.resolution {
        p.resolution_secs = resolution;
    }
    if let Some(max) = args.max_segments {
        p.max_segments = max;
    }
    if args.voltage_multiplier.is_some() {
        p.voltage_multiplier = args.voltage_multiplier;
    }
    if let Some(bounds) = &args.subset_to {
        if let [lower, upper] = bounds.as_slice() {
            p.subset_to = Some((*lower, *upper));
        }
    }
    if let Some(channel) = args.channel {
        p.channel = channel;
    }

    if args.sensitivity_uri.is_some() {
        config.calibration.sensitivity_uri = args.sensitivity_uri.clone();
    }
    if args.sensitivity_flat_value.is_some() {
        config.calibration.sensitivity_flat_value = args.sensitivity_flat_value;
    }

    let s = &mut config.storage;
    if let Some(dir) = &args.json_base_dir {
        s.json_base_dir = dir.clone();
    }
    if args.audio_base_dir.is_some() {
        s.audio_base_dir = args.audio_base_dir.clone();
    }
    if let Some(map) = &args.audio_path_map_prefix {
        s.path_map_prefix = map.clone();
    }

    if let Some(dir) = &args.download_dir {
        config.cache.download_dir = dir.clone();
    }
    config.cache.assume_downloaded_files |= args.assume_downloaded_files;
    config.cache.retain_downloaded_files |= args.retain_downloaded_files;

    if let Some(dir) = &args.output_dir {
        config.output.output_dir = dir.clone();
    }
    if let Some(prefix) = &args.output_prefix {
        config.output.output_prefix = prefix.clone();
    }

    if args.global_attrs.is_some() {
        config.attributes.global_attrs_uri = args.global_attrs.clone();
    }
    if args.variable_attrs.is_some() {
        config.attributes.variable_attrs_uri = args.variable_attrs.clone();
    }
    for (k, v) in &args.set_global_attr {
        config.attributes.set_global_attrs.insert(k.clone(), v.clone());
    }

    Ok(config)
}

fn load_config(path: &Path) -> Result<PbpConfig> {
    let config = PbpConfig::load(path)?;
    log::info!("Loaded configuration from: {}", path.display());
    Ok(config)
}
