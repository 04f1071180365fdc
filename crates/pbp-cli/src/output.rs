//! JSON output formatting

use chrono::NaiveDate;
use pbp_core::{DayOutcome, PbpError};
use serde::Serialize;

/// One line of the `hmbgen` report
#[derive(Debug, Clone, Serialize)]
pub struct DayReport {
    pub date: String,
    /// `success`, `no_data`, `failed` or `cancelled`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    pub segments: usize,
    pub covered: usize,
    pub partial: usize,
    pub gaps: usize,
    pub failed: usize,
    pub not_processed: usize,
    pub total_effort_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DayReport {
    pub fn from_outcome(outcome: &DayOutcome) -> Self {
        let s = &outcome.summary;
        Self {
            date: outcome.date.format("%Y%m%d").to_string(),
            status: if outcome.output.is_some() {
                "success"
            } else {
                "no_data"
            },
            output_file: outcome.output.as_ref().map(|p| p.display().to_string()),
            segments: s.segments,
            covered: s.covered,
            partial: s.partial,
            gaps: s.gaps,
            failed: s.failed,
            not_processed: s.not_processed,
            total_effort_secs: s.total_effort_secs,
            error: None,
        }
    }

    pub fn from_error(date: NaiveDate, error: &PbpError) -> Self {
        Self {
            date: date.format("%Y%m%d").to_string(),
            status: match error {
                PbpError::Cancelled(_) => "cancelled",
                _ => "failed",
            },
            output_file: None,
            segments: 0,
            covered: 0,
            partial: 0,
            gaps: 0,
            failed: 0,
            not_processed: 0,
            total_effort_secs: 0.0,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing output: {}", e),
    }
}
