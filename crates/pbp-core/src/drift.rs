//! Clock drift correction for fixed-length recorders
//!
//! iCListen file names carry the recorder's own clock, which wanders against
//! UTC by a few seconds a day. A complete day of fixed-length files is one
//! continuous recording, so the files are chained back to back from the first
//! start. Days with missing files are left alone; chaining them would hide
//! real gaps.

use crate::day::SECONDS_PER_DAY;
use crate::inventory::{
    micros_to_secs, secs_to_micros, DayInventory, DayInventoryBuilder, MICROS_PER_SEC,
};
use chrono::{DateTime, Duration, Timelike, Utc};

/// Chain the start times of a complete day of `seconds_per_file` files.
///
/// Applies when the day holds one file per slot (plus at most one spilling
/// over from the previous day), every file has the nominal length, and the
/// start gaps are within half a file of nominal without all being exact.
/// Each corrected start is the previous start plus the nominal length,
/// truncated to the second. Anything else is returned unchanged.
pub fn correct_drift(inventory: DayInventory, seconds_per_file: f64) -> DayInventory {
    let label = format!("[{}]", inventory.date.format("%Y%m%d"));
    let nominal_us = secs_to_micros(seconds_per_file);
    if nominal_us <= 0 || inventory.is_empty() {
        return inventory;
    }

    let records = inventory.records();
    let files_per_day = (SECONDS_PER_DAY * MICROS_PER_SEC / nominal_us) as usize;
    if records.len() != files_per_day && records.len() != files_per_day + 1 {
        log::debug!(
            "{} {} files where a full day has {}, start times kept",
            label,
            records.len(),
            files_per_day
        );
        return inventory;
    }
    if records
        .iter()
        .any(|r| secs_to_micros(r.duration_secs()) != nominal_us)
    {
        log::debug!("{} Files of unequal length, start times kept", label);
        return inventory;
    }

    let gaps: Vec<i64> = records
        .windows(2)
        .map(|w| w[1].start_us() - w[0].start_us())
        .collect();
    if gaps.iter().all(|&g| g == nominal_us) {
        log::debug!("{} No drift", label);
        return inventory;
    }
    if gaps.iter().any(|&g| (g - nominal_us).abs() > nominal_us / 2) {
        log::warn!("{} File spacing too irregular to correct drift", label);
        return inventory;
    }

    let mut start = records[0].start();
    let mut max_jitter_us = 0i64;
    let mut corrected = Vec::with_capacity(records.len());
    for record in records {
        max_jitter_us = max_jitter_us.max((record.start_us() - start.timestamp_micros()).abs());
        corrected.push(record.with_start(start));
        start = truncate_to_second(start + Duration::microseconds(nominal_us));
    }
    log::info!(
        "{} Corrected drift over {} files, largest shift {:.3}s",
        label,
        corrected.len(),
        micros_to_secs(max_jitter_us)
    );

    DayInventoryBuilder::build(inventory.date, &corrected)
}

fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}
