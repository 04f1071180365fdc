//! File catalog
//!
//! Lists the audio objects under a location, reads a start time from each
//! file name and a duration from the recorder family, and emits
//! [`AudioFileRecord`]s sorted by start.

use crate::audio::{read_info_path, AudioFormat, AudioInfo};
use crate::cache::DownloadCache;
use crate::drift::correct_drift;
use crate::error::{PbpError, Result};
use crate::inventory::{micros_to_secs, AudioFileRecord, DayInventory};
use crate::storage_backend::{ObjectLocation, StoreRegistry};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;

/// Rate SoundTrap sample counts are taken at unless told otherwise
pub const SOUNDTRAP_SAMPLE_RATE: u32 = 48_000;

/// How a recorder family reports file timing
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderFamily {
    /// Every file has the same nominal length
    FixedInterval { seconds_per_file: f64 },
    /// Duration is frames / sample rate from the file header
    HeaderDuration,
    /// Start time and sample count come from the `.log.xml` the recorder
    /// writes next to each file, or from `xml_dir` when the logs are kept
    /// apart
    SoundTrap {
        xml_dir: Option<String>,
        sample_rate: u32,
    },
    /// Header durations; a complete day of `seconds_per_file` files is
    /// re-chained to remove clock drift
    IcListen { seconds_per_file: f64 },
}

impl RecorderFamily {
    /// Day-level timing fixes, applied before a day's metadata is written
    pub fn correct_day(&self, inventory: DayInventory) -> DayInventory {
        match self {
            RecorderFamily::IcListen { seconds_per_file } => {
                correct_drift(inventory, *seconds_per_file)
            }
            _ => inventory,
        }
    }
}

/// Timing from a SoundTrap `.log.xml`
#[derive(Debug, Clone, PartialEq)]
pub struct SoundTrapLog {
    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
    pub sample_count: Option<u64>,
}

impl SoundTrapLog {
    /// Read the `WavFileHandler` attributes of a log; later elements win
    pub fn parse(name: &str, xml: &str) -> Result<Self> {
        let element = Regex::new(r"<WavFileHandler\b([^>]*)>")?;
        let attribute = Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#)?;
        let invalid = |reason: String| PbpError::Catalog {
            name: name.to_string(),
            reason,
        };

        let mut start = None;
        let mut stop = None;
        let mut sample_count = None;
        for el in element.captures_iter(xml) {
            for attr in attribute.captures_iter(&el[1]) {
                let value = attr[2].trim();
                match &attr[1] {
                    "SamplingStartTimeUTC" => {
                        start = Some(parse_log_time(value).ok_or_else(|| {
                            invalid(format!("bad SamplingStartTimeUTC '{value}'"))
                        })?)
                    }
                    "SamplingStopTimeUTC" => {
                        stop = Some(parse_log_time(value).ok_or_else(|| {
                            invalid(format!("bad SamplingStopTimeUTC '{value}'"))
                        })?)
                    }
                    "SampleCount" => {
                        sample_count = Some(
                            value
                                .parse::<u64>()
                                .map_err(|e| invalid(format!("bad SampleCount '{value}': {e}")))?,
                        )
                    }
                    _ => {}
                }
            }
        }

        let start = start.ok_or_else(|| invalid("log has no SamplingStartTimeUTC".into()))?;
        Ok(Self {
            start,
            stop,
            sample_count,
        })
    }

    /// Sample count over `sample_rate`, else the stop time minus the start
    pub fn duration_secs(&self, sample_rate: u32) -> Option<f64> {
        match (self.sample_count, self.stop) {
            (Some(count), _) if sample_rate > 0 => Some(count as f64 / sample_rate as f64),
            (_, Some(stop)) => (stop - self.start).num_microseconds().map(micros_to_secs),
            _ => None,
        }
    }
}

fn parse_log_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

/// A listed object that did not make it into the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub uri: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct CatalogListing {
    pub records: Vec<AudioFileRecord>,
    pub skipped: Vec<SkippedFile>,
}

/// Filename timestamp layouts, most specific first: (date and time groups,
/// whether the year has four digits)
const TIMESTAMP_LAYOUTS: &[(&str, bool)] = &[
    (r"(\d{8})_(\d{6})", true),
    (r"(\d{6})_(\d{6})", false),
    (r"(\d{8})T(\d{6})Z?", true),
    (r"(\d{8})(\d{6})", true),
    (r"(\d{6})(\d{6})", false),
];

/// Parses start times out of file names that begin with a fixed prefix
pub struct TimestampParser {
    patterns: Vec<(Regex, bool)>,
}

impl TimestampParser {
    pub fn new(prefix: &str) -> Result<Self> {
        let prefix = regex::escape(prefix);
        let patterns = TIMESTAMP_LAYOUTS
            .iter()
            .map(|(body, century)| {
                // the timestamp must be followed by at least one dotted token
                Regex::new(&format!(r"^{prefix}[._]?{body}\.[^/]+$")).map(|re| (re, *century))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Start time encoded in `name`, using the first layout that matches
    pub fn parse(&self, name: &str) -> Option<DateTime<Utc>> {
        self.patterns.iter().find_map(|(re, century)| {
            let caps = re.captures(name)?;
            build_timestamp(&caps[1], &caps[2], *century)
        })
    }
}

fn digits(s: &str, range: std::ops::Range<usize>) -> Option<u32> {
    s.get(range)?.parse().ok()
}

fn build_timestamp(date: &str, time: &str, century: bool) -> Option<DateTime<Utc>> {
    let (year, rest) = if century {
        (digits(date, 0..4)? as i32, 4)
    } else {
        let yy = digits(date, 0..2)? as i32;
        (if yy >= 69 { 1900 + yy } else { 2000 + yy }, 2)
    };
    let month = digits(date, rest..rest + 2)?;
    let day = digits(date, rest + 2..rest + 4)?;

    let hour = digits(time, 0..2)?;
    let minute = digits(time, 2..4)?;
    // some recorders write a seconds field of 60
    let second = digits(time, 4..6)?.min(59);

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(date.and_time(time).and_utc())
}

/// Lists audio objects and turns them into records
pub struct FileCatalog<'a> {
    stores: &'a StoreRegistry,
    cache: &'a DownloadCache,
    family: RecorderFamily,
}

impl<'a> FileCatalog<'a> {
    pub fn new(stores: &'a StoreRegistry, cache: &'a DownloadCache, family: RecorderFamily) -> Self {
        Self {
            stores,
            cache,
            family,
        }
    }

    /// Catalog every wav/flac object under `location` whose name starts with
    /// `prefix`.
    ///
    /// Files whose timestamp or duration cannot be determined are reported in
    /// [`CatalogListing::skipped`]; the rest of the listing is unaffected.
    pub fn list(&self, location: &str, prefix: &str) -> Result<CatalogListing> {
        let parser = TimestampParser::new(prefix)?;
        let listing_uri = format!("{}/{}", location.trim_end_matches('/'), prefix);
        let listing_location = self.stores.resolve(&listing_uri)?;

        let objects = self.stores.list(&listing_location)?;
        log::info!("Found {} objects under {}", objects.len(), listing_uri);

        let mut out = CatalogListing::default();
        for object in objects {
            let name = object.simple_name();
            if !name.starts_with(prefix) || AudioFormat::from_name(&name) == AudioFormat::Unknown {
                continue;
            }

            match self.record_for(&parser, &object, &name) {
                Ok(record) => out.records.push(record),
                Err(e) => {
                    log::warn!("Skipping {}: {}", object.uri(), e);
                    out.skipped.push(SkippedFile {
                        uri: object.uri(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        out.records.sort_by(|a, b| {
            a.start_us()
                .cmp(&b.start_us())
                .then_with(|| a.uri().cmp(b.uri()))
        });
        log::info!(
            "Cataloged {} files, skipped {}",
            out.records.len(),
            out.skipped.len()
        );
        Ok(out)
    }

    fn record_for(
        &self,
        parser: &TimestampParser,
        object: &ObjectLocation,
        name: &str,
    ) -> Result<AudioFileRecord> {
        let start = parser.parse(name).ok_or_else(|| PbpError::Catalog {
            name: name.to_string(),
            reason: "no recognizable timestamp".to_string(),
        })?;

        match &self.family {
            RecorderFamily::FixedInterval { seconds_per_file } => {
                AudioFileRecord::new(object.uri(), start, *seconds_per_file, 1)
            }
            RecorderFamily::HeaderDuration | RecorderFamily::IcListen { .. } => {
                let info = self.header_info(object, name)?;
                AudioFileRecord::new(object.uri(), start, info.duration_secs(), info.channels)
            }
            RecorderFamily::SoundTrap {
                xml_dir,
                sample_rate,
            } => {
                // the log's clock wins over the name
                let log = self.soundtrap_log(object, name, xml_dir.as_deref())?;
                let duration_secs =
                    log.duration_secs(*sample_rate).ok_or_else(|| PbpError::Catalog {
                        name: name.to_string(),
                        reason: "log has neither SampleCount nor SamplingStopTimeUTC".into(),
                    })?;
                AudioFileRecord::new(object.uri(), log.start, duration_secs, 1)
            }
        }
    }

    fn header_info(&self, object: &ObjectLocation, name: &str) -> Result<AudioInfo> {
        let localized = self.cache.localize(self.stores, object)?;
        let info = read_info_path(&localized.path);
        self.cache.release(localized);
        info.map_err(|e| PbpError::Catalog {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })
    }

    fn soundtrap_log(
        &self,
        object: &ObjectLocation,
        name: &str,
        xml_dir: Option<&str>,
    ) -> Result<SoundTrapLog> {
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let log_name = format!("{stem}.log.xml");
        let location = match xml_dir {
            Some(dir) => self
                .stores
                .resolve(&format!("{}/{}", dir.trim_end_matches('/'), log_name))?,
            None => object.sibling(&log_name),
        };

        let localized = self.cache.localize(self.stores, &location)?;
        let contents = std::io::read_to_string(&localized.file);
        self.cache.release(localized);
        SoundTrapLog::parse(&log_name, &contents?)
    }
}
