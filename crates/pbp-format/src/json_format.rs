//! Per-day audio metadata JSON
//!
//! Each day file is an array of objects describing one recording:
//! `uri`, ISO-8601 `start` and `end`, `duration_secs` and `channels`.
//! Day files live at `{json_base_dir}/{YYYY}/{YYYYMMDD}.json`.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One recording listed in a metadata day file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub uri: String,
    #[serde(with = "iso8601")]
    pub start: DateTime<Utc>,
    #[serde(default, with = "iso8601_opt", skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

impl MetaEntry {
    pub fn new(uri: String, start: DateTime<Utc>, duration_secs: f64, channels: u16) -> Self {
        Self {
            uri,
            start,
            end: Some(start + micros(duration_secs)),
            duration_secs,
            channels,
        }
    }

    /// End instant, derived from the duration when the file omits it
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end
            .unwrap_or_else(|| self.start + micros(self.duration_secs))
    }
}

fn micros(secs: f64) -> Duration {
    Duration::microseconds((secs * 1_000_000.0).round() as i64)
}

/// Parse the contents of a metadata file.
///
/// Repeated `uri` values are dropped after the first occurrence.
pub fn parse_entries(contents: &str) -> Result<Vec<MetaEntry>> {
    let raw: Vec<MetaEntry> =
        serde_json::from_str(contents).context("Failed to parse metadata JSON")?;

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw.len());
    for entry in raw {
        if !seen.insert(entry.uri.clone()) {
            log::warn!("Skipping duplicate json entry: uri={}", entry.uri);
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Load a metadata file from disk
pub fn load_entries(path: &Path) -> Result<Vec<MetaEntry>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata file: {}", path.display()))?;
    parse_entries(&contents)
}

/// Save entries sorted by start time (then uri)
pub fn save_entries(path: &Path, entries: &[MetaEntry]) -> Result<()> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.uri.cmp(&b.uri)));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let json_str = serde_json::to_string_pretty(&sorted)?;
    std::fs::write(path, json_str)
        .with_context(|| format!("Failed to write metadata file: {}", path.display()))?;
    Ok(())
}

/// Location of the metadata file for `date` under `base_dir`
pub fn day_file_path(base_dir: &Path, date: NaiveDate) -> PathBuf {
    base_dir
        .join(date.format("%Y").to_string())
        .join(format!("{}.json", date.format("%Y%m%d")))
}

/// Timestamps are written as `2022-09-02T00:00:00.000Z` and read leniently:
/// any RFC 3339 value, or a zone-less value taken as UTC.
mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const WRITE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.format(WRITE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Ok(naive.and_utc());
            }
        }
        Err(format!("invalid ISO-8601 timestamp: {raw}"))
    }
}

mod iso8601_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => super::iso8601::serialize(dt, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| super::iso8601::parse(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_entries_skips_duplicates() {
        let json = r#"[
            {"uri": "s3://bucket/a.wav", "start": "2022-09-02T00:00:00Z",
             "end": "2022-09-02T00:30:00Z", "duration_secs": 1800, "channels": 1},
            {"uri": "s3://bucket/a.wav", "start": "2022-09-02T01:00:00Z",
             "duration_secs": 10},
            {"uri": "s3://bucket/b.wav", "start": "2022-09-02T00:40:00.000Z",
             "duration_secs": 1800}
        ]"#;

        let entries = parse_entries(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uri, "s3://bucket/a.wav");
        assert_eq!(entries[1].channels, 1);
        assert_eq!(
            entries[1].end_time(),
            Utc.with_ymd_and_hms(2022, 9, 2, 1, 10, 0).unwrap()
        );
    }

    #[test]
    fn test_zone_less_timestamps_are_utc() {
        let json = r#"[{"uri": "a.wav", "start": "2022-09-02T23:59:30", "duration_secs": 60}]"#;
        let entries = parse_entries(json).unwrap();
        assert_eq!(
            entries[0].start,
            Utc.with_ymd_and_hms(2022, 9, 2, 23, 59, 30).unwrap()
        );
    }

    #[test]
    fn test_save_sorts_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2022, 9, 2).unwrap();
        let path = day_file_path(dir.path(), date);
        assert!(path.ends_with("2022/20220902.json"));

        let t0 = Utc.with_ymd_and_hms(2022, 9, 2, 0, 0, 0).unwrap();
        let late = MetaEntry::new("b.wav".into(), t0 + Duration::hours(1), 600.0, 1);
        let early = MetaEntry::new("a.wav".into(), t0, 600.0, 2);
        save_entries(&path, &[late, early]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("2022-09-02T00:00:00.000Z"));

        let loaded = load_entries(&path).unwrap();
        assert_eq!(loaded[0].uri, "a.wav");
        assert_eq!(loaded[0].channels, 2);
        assert_eq!(loaded[1].uri, "b.wav");
    }
}
