//! Audio file records and per-day inventories
//!
//! Time arithmetic is done in integer microseconds since the epoch so that
//! interval comparisons are exact and planning is reproducible.

use crate::cache::DownloadCache;
use crate::day::{day_end, day_start, DayContext};
use crate::error::{PbpError, Result};
use crate::storage_backend::{ObjectLocation, StoreRegistry};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use pbp_format::{day_file_path, parse_entries, MetaEntry};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

pub const MICROS_PER_SEC: i64 = 1_000_000;

pub fn secs_to_micros(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC as f64).round() as i64
}

pub fn micros_to_secs(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_SEC as f64
}

/// One recording with a known start and a positive duration
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFileRecord {
    uri: String,
    start: DateTime<Utc>,
    duration_secs: f64,
    channels: u16,
}

impl AudioFileRecord {
    pub fn new(
        uri: impl Into<String>,
        start: DateTime<Utc>,
        duration_secs: f64,
        channels: u16,
    ) -> Result<Self> {
        let uri = uri.into();
        if !duration_secs.is_finite() || secs_to_micros(duration_secs) <= 0 {
            return Err(PbpError::Catalog {
                name: uri,
                reason: format!("invalid duration {duration_secs}"),
            });
        }
        Ok(Self {
            uri,
            start,
            duration_secs,
            channels: channels.max(1),
        })
    }

    /// From a metadata entry; a missing duration falls back to `end - start`
    pub fn from_entry(entry: &MetaEntry) -> Result<Self> {
        let duration_secs = if entry.duration_secs > 0.0 {
            entry.duration_secs
        } else {
            micros_to_secs((entry.end_time() - entry.start).num_microseconds().unwrap_or(0))
        };
        Self::new(entry.uri.clone(), entry.start, duration_secs, entry.channels)
    }

    /// The same recording with a corrected start time
    pub fn with_start(&self, start: DateTime<Utc>) -> Self {
        Self {
            start,
            ..self.clone()
        }
    }

    pub fn to_entry(&self) -> MetaEntry {
        MetaEntry::new(self.uri.clone(), self.start, self.duration_secs, self.channels)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::microseconds(secs_to_micros(self.duration_secs))
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn start_us(&self) -> i64 {
        self.start.timestamp_micros()
    }

    pub fn end_us(&self) -> i64 {
        self.start_us() + secs_to_micros(self.duration_secs)
    }

    /// Whether `[start, end)` intersects `[lo_us, hi_us)`
    pub fn intersects(&self, lo_us: i64, hi_us: i64) -> bool {
        self.start_us() < hi_us && self.end_us() > lo_us
    }
}

/// Recordings intersecting one calendar day, ordered by (start, uri)
#[derive(Debug, Clone, PartialEq)]
pub struct DayInventory {
    pub date: NaiveDate,
    records: Vec<AudioFileRecord>,
}

impl DayInventory {
    pub fn records(&self) -> &[AudioFileRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of record durations clipped to the day (overlaps counted twice)
    pub fn clipped_secs(&self) -> f64 {
        let lo = day_start(self.date).timestamp_micros();
        let hi = day_end(self.date).timestamp_micros();
        let total: i64 = self
            .records
            .iter()
            .map(|r| r.end_us().min(hi) - r.start_us().max(lo))
            .sum();
        micros_to_secs(total)
    }
}

pub struct DayInventoryBuilder;

impl DayInventoryBuilder {
    /// Records whose interval intersects `date`, sorted by (start, uri).
    ///
    /// Overlapping recordings are all kept; resolving them is the planner's
    /// job. A repeated uri is kept once.
    pub fn build<'a>(
        date: NaiveDate,
        records: impl IntoIterator<Item = &'a AudioFileRecord>,
    ) -> DayInventory {
        let lo = day_start(date).timestamp_micros();
        let hi = day_end(date).timestamp_micros();

        let mut seen = HashSet::new();
        let mut selected: Vec<AudioFileRecord> = records
            .into_iter()
            .filter(|r| r.intersects(lo, hi))
            .filter(|r| seen.insert(r.uri.clone()))
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            a.start_us()
                .cmp(&b.start_us())
                .then_with(|| a.uri.cmp(&b.uri))
        });

        DayInventory {
            date,
            records: selected,
        }
    }

    /// One inventory per date
    pub fn build_range(dates: &[NaiveDate], records: &[AudioFileRecord]) -> Vec<DayInventory> {
        dates
            .iter()
            .map(|&date| Self::build(date, records))
            .collect()
    }
}

/// Loads day inventories from the `{base}/{YYYY}/{YYYYMMDD}.json` tree
#[derive(Debug, Clone)]
pub struct MetadataSource {
    json_base_dir: String,
}

impl MetadataSource {
    pub fn new(json_base_dir: impl Into<String>) -> Self {
        Self {
            json_base_dir: json_base_dir.into(),
        }
    }

    fn day_location(&self, stores: &StoreRegistry, date: NaiveDate) -> Result<ObjectLocation> {
        if self.json_base_dir.contains("://") {
            let uri = format!(
                "{}/{}/{}.json",
                self.json_base_dir.trim_end_matches('/'),
                date.format("%Y"),
                date.format("%Y%m%d")
            );
            stores.resolve(&uri)
        } else {
            Ok(ObjectLocation::Local(day_file_path(
                Path::new(&self.json_base_dir),
                date,
            )))
        }
    }

    fn read_entries(
        &self,
        stores: &StoreRegistry,
        cache: &DownloadCache,
        location: &ObjectLocation,
        required: bool,
    ) -> Result<Vec<MetaEntry>> {
        let mut localized = if required {
            cache.localize(stores, location)?
        } else {
            cache.localize_once(stores, location)?
        };
        let mut contents = String::new();
        let read = localized.file.read_to_string(&mut contents);
        let path = localized.path.display().to_string();
        cache.release(localized);
        read?;

        parse_entries(&contents).map_err(|e| PbpError::Catalog {
            name: path,
            reason: format!("{e:#}"),
        })
    }

    /// Inventory for the context's day.
    ///
    /// The previous day's file is read too when present, so recordings that
    /// start before midnight are found even if only listed there.
    pub fn load_day(
        &self,
        ctx: &DayContext,
        stores: &StoreRegistry,
        cache: &DownloadCache,
    ) -> Result<DayInventory> {
        let location = self.day_location(stores, ctx.date)?;
        let mut entries = self
            .read_entries(stores, cache, &location, true)
            .map_err(|e| PbpError::day(ctx.compact_date(), format!("metadata: {e}")))?;

        if let Some(prev) = ctx.date.pred_opt() {
            let prev_location = self.day_location(stores, prev)?;
            match self.read_entries(stores, cache, &prev_location, false) {
                Ok(prev_entries) => entries.extend(prev_entries),
                Err(e) => log::debug!(
                    "{} No previous-day metadata at {}: {}",
                    ctx.label(),
                    prev_location.uri(),
                    e
                ),
            }
        }

        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match AudioFileRecord::from_entry(entry) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("{} Skipping metadata entry: {}", ctx.label(), e),
            }
        }

        let inventory = DayInventoryBuilder::build(ctx.date, &records);
        log::info!(
            "{} Inventory: {} files, {:.0}s of audio within the day",
            ctx.label(),
            inventory.len(),
            inventory.clipped_secs()
        );
        Ok(inventory)
    }
}
