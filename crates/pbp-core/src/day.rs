//! Calendar days and the per-day processing context

use crate::error::{PbpError, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Parse a `YYYYMMDD` date
pub fn parse_date(date: &str) -> Result<NaiveDate> {
    if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
        return Err(PbpError::config(format!(
            "invalid date '{date}', expected YYYYMMDD"
        )));
    }
    NaiveDate::parse_from_str(date, "%Y%m%d")
        .map_err(|e| PbpError::config(format!("invalid date '{date}': {e}")))
}

/// Inclusive list of days from `start` to `end`
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
    if end < start {
        return Err(PbpError::config(format!(
            "end date {end} is before start date {start}"
        )));
    }
    Ok(start.iter_days().take_while(|d| *d <= end).collect())
}

/// 00:00:00 UTC of `date`
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// 00:00:00 UTC of the following day
pub fn day_end(date: NaiveDate) -> DateTime<Utc> {
    day_start(date) + Duration::seconds(SECONDS_PER_DAY)
}

/// Everything one day-worker needs to know about the day it is processing.
///
/// Passed explicitly through the pipeline so that parallel day-workers never
/// share per-day state.
#[derive(Debug, Clone)]
pub struct DayContext {
    pub date: NaiveDate,
    label: String,
    cancel: Arc<AtomicBool>,
}

impl DayContext {
    pub fn new(date: NaiveDate) -> Self {
        Self::with_cancel(date, Arc::new(AtomicBool::new(false)))
    }

    /// Share a cancellation flag with other workers
    pub fn with_cancel(date: NaiveDate, cancel: Arc<AtomicBool>) -> Self {
        Self {
            date,
            label: format!("[{}]", date.format("%Y%m%d")),
            cancel,
        }
    }

    /// Prefix for log lines of this day
    pub fn label(&self) -> &str {
        &self.label
    }

    /// `YYYYMMDD`
    pub fn compact_date(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }

    pub fn start(&self) -> DateTime<Utc> {
        day_start(self.date)
    }

    pub fn end(&self) -> DateTime<Utc> {
        day_end(self.date)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Fail with `Cancelled` once the flag is raised
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PbpError::Cancelled(self.compact_date()))
        } else {
            Ok(())
        }
    }
}
