//! metagen - Per-day audio metadata generator
//!
//! Usage: metagen --location <uri> --prefix <P> --start <YYYYMMDD> --end <YYYYMMDD>
//!        --json-base-dir <dir>
//!        (--seconds-per-file <S> | --header-duration | --soundtrap [--xml-dir <dir>]
//!         | --iclisten <S>)

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser};
use pbp_cli::init_logging;
use pbp_cli::output::print_json;
use pbp_core::{
    date_range, parse_date, DayInventoryBuilder, DownloadCache, FileCatalog, PbpConfig,
    RecorderFamily, StoreRegistry, SOUNDTRAP_SAMPLE_RATE,
};
use pbp_format::{day_file_path, save_entries};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "metagen")]
#[command(about = "Catalog recordings and write per-day metadata JSON", long_about = None)]
struct Args {
    /// Directory or bucket uri holding the recordings
    #[arg(long)]
    location: String,

    /// File name prefix of the recorder
    #[arg(long)]
    prefix: String,

    /// First day, YYYYMMDD
    #[arg(long)]
    start: String,

    /// Last day, YYYYMMDD (inclusive)
    #[arg(long)]
    end: String,

    /// Output root; files go to {dir}/{YYYY}/{YYYYMMDD}.json
    #[arg(long)]
    json_base_dir: PathBuf,

    #[command(flatten)]
    family: FamilyArgs,

    /// Where SoundTrap .log.xml files live, if not beside the recordings
    #[arg(long, requires = "soundtrap")]
    xml_dir: Option<String>,

    /// Rate SoundTrap sample counts are converted at
    #[arg(long, default_value_t = SOUNDTRAP_SAMPLE_RATE)]
    soundtrap_sample_rate: u32,

    /// Configuration file (TOML) for storage, cache and retry settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where remote files are fetched for header reads
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct FamilyArgs {
    /// Every file has this nominal duration
    #[arg(long)]
    seconds_per_file: Option<f64>,

    /// Read each file's duration from its header
    #[arg(long)]
    header_duration: bool,

    /// Take start times and sample counts from SoundTrap .log.xml files
    #[arg(long)]
    soundtrap: bool,

    /// iCListen files of this nominal duration; complete days are
    /// corrected for clock drift
    #[arg(long, value_name = "SECONDS")]
    iclisten: Option<f64>,
}

impl Args {
    fn family(&self) -> RecorderFamily {
        let family = &self.family;
        if let Some(seconds_per_file) = family.seconds_per_file {
            RecorderFamily::FixedInterval { seconds_per_file }
        } else if let Some(seconds_per_file) = family.iclisten {
            RecorderFamily::IcListen { seconds_per_file }
        } else if family.soundtrap {
            RecorderFamily::SoundTrap {
                xml_dir: self.xml_dir.clone(),
                sample_rate: self.soundtrap_sample_rate,
            }
        } else {
            RecorderFamily::HeaderDuration
        }
    }
}

#[derive(Serialize)]
struct DayFile {
    date: String,
    files: usize,
    path: String,
}

#[derive(Serialize)]
struct MetagenOutput {
    status: &'static str,
    files: usize,
    skipped: usize,
    days: Vec<DayFile>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let mut config = match &args.config {
        Some(path) => PbpConfig::load(path)?,
        None => PbpConfig::default(),
    };
    if let Some(dir) = &args.download_dir {
        config.cache.download_dir = dir.clone();
    }

    let dates = date_range(parse_date(&args.start)?, parse_date(&args.end)?)?;

    let stores = StoreRegistry::from_config(&config.storage);
    let cache = DownloadCache::new(&config.cache, config.retry.clone());
    let family = args.family();
    let catalog = FileCatalog::new(&stores, &cache, family.clone());

    let listing = catalog
        .list(&args.location, &args.prefix)
        .with_context(|| format!("Failed to catalog {}", args.location))?;

    let mut days = Vec::new();
    for inventory in DayInventoryBuilder::build_range(&dates, &listing.records) {
        let date = inventory.date.format("%Y%m%d").to_string();
        if inventory.is_empty() {
            log::info!("[{}] No recordings", date);
            continue;
        }
        let inventory = family.correct_day(inventory);

        let path = day_file_path(&args.json_base_dir, inventory.date);
        let entries: Vec<_> = inventory.records().iter().map(|r| r.to_entry()).collect();
        save_entries(&path, &entries)?;
        log::info!("[{}] Wrote {} entries to {}", date, entries.len(), path.display());

        days.push(DayFile {
            date,
            files: entries.len(),
            path: path.display().to_string(),
        });
    }

    print_json(&MetagenOutput {
        status: "success",
        files: listing.records.len(),
        skipped: listing.skipped.len(),
        days,
    });
    Ok(())
}
