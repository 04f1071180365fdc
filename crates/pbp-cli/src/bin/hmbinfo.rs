//! hmbinfo - Inspect an HMB product file
//!
//! Usage: hmbinfo <file.pbph> [--segments]

use anyhow::Result;
use clap::Parser;
use pbp_cli::init_logging;
use pbp_cli::output::print_json;
use pbp_format::{HmbReader, SegmentStatus};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hmbinfo")]
#[command(about = "Print the header and summary of an HMB product file", long_about = None)]
struct Args {
    /// Product file
    input: PathBuf,

    /// Also list status and effort of every segment
    #[arg(long)]
    segments: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct SegmentInfo {
    index: usize,
    time_secs: i64,
    status: SegmentStatus,
    effort: f32,
}

#[derive(Serialize)]
struct Summary {
    covered: usize,
    partial: usize,
    gaps: usize,
    failed: usize,
    not_processed: usize,
    total_effort_secs: f64,
    min_frequency: Option<f32>,
    max_frequency: Option<f32>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, false);

    let file = HmbReader::read(&args.input)?;
    let payload = &file.payload;
    let count = |s: SegmentStatus| payload.status.iter().filter(|&&x| x == s).count();

    let summary = Summary {
        covered: count(SegmentStatus::Covered),
        partial: count(SegmentStatus::Partial),
        gaps: count(SegmentStatus::Gap),
        failed: count(SegmentStatus::Failed),
        not_processed: count(SegmentStatus::NotProcessed),
        total_effort_secs: payload.effort.iter().map(|&e| e as f64).sum(),
        min_frequency: payload.frequencies.first().copied(),
        max_frequency: payload.frequencies.last().copied(),
    };

    let mut result = serde_json::json!({
        "file": args.input.display().to_string(),
        "header": file.header,
        "metadata": file.metadata,
        "summary": summary,
    });

    if args.segments {
        let segments: Vec<SegmentInfo> = (0..payload.num_segments())
            .map(|i| SegmentInfo {
                index: i,
                time_secs: payload.time_secs[i],
                status: payload.status[i],
                effort: payload.effort[i],
            })
            .collect();
        result["segments"] = serde_json::to_value(segments)?;
    }

    print_json(&result);
    Ok(())
}
