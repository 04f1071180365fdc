//! Product assembly
//!
//! Turns a calibrated day into the metadata block and array payload of an
//! HMB product file and writes it through [`FileSink`].

use crate::cache::DownloadCache;
use crate::calibration::CalibratedDay;
use crate::config::{AttributesConfig, OutputConfig};
use crate::day::day_start;
use crate::error::{PbpError, Result};
use crate::storage_backend::StoreRegistry;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use pbp_format::{HmbHeader, HmbMetadata, HmbPayload, HmbWriter, SegmentStatus};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;

pub const PBP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Replace every `snippet` with its value inside the string values of `attrs`
pub fn replace_snippets(attrs: &Map<String, Value>, snippets: &[(String, String)]) -> Map<String, Value> {
    attrs
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => Value::String(
                    snippets
                        .iter()
                        .fold(s.clone(), |acc, (snippet, value)| acc.replace(snippet, value)),
                ),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Global and per-variable attributes attached to every product
#[derive(Debug, Clone, Default)]
pub struct AttributeSet {
    global: Map<String, Value>,
    variables: Map<String, Value>,
}

impl AttributeSet {
    pub fn new(global: Map<String, Value>, variables: Map<String, Value>) -> Self {
        Self { global, variables }
    }

    /// Load the configured attribute files; either may be absent
    pub fn load(
        config: &AttributesConfig,
        stores: &StoreRegistry,
        cache: &DownloadCache,
    ) -> Result<Self> {
        let mut global = match &config.global_attrs_uri {
            Some(uri) => load_map("global", uri, stores, cache)?,
            None => Map::new(),
        };
        for (k, v) in &config.set_global_attrs {
            global.insert(k.clone(), Value::String(v.clone()));
        }
        let variables = match &config.variable_attrs_uri {
            Some(uri) => load_map("variable", uri, stores, cache)?,
            None => Map::new(),
        };
        Ok(Self { global, variables })
    }

    pub fn global(&self) -> &Map<String, Value> {
        &self.global
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Global attributes of one product: coverage times and creation date
    /// are filled in, then `{{PBP_version}}` and `{{key}}` snippets replaced.
    pub fn global_for(&self, day: &CalibratedDay, created: DateTime<Utc>) -> Map<String, Value> {
        let product = &day.product;
        let start = day_start(product.date);
        let reached = product
            .status
            .iter()
            .filter(|s| **s != SegmentStatus::NotProcessed)
            .count() as i64;
        let end = (start + Duration::seconds(reached * product.resolution_secs as i64))
            .min(start + Duration::days(1));

        let mut attrs = self.global.clone();
        attrs.insert(
            "time_coverage_start".into(),
            Value::String(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        attrs.insert(
            "time_coverage_end".into(),
            Value::String(end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        attrs.insert(
            "date_created".into(),
            Value::String(created.format("%Y-%m-%d").to_string()),
        );

        let mut snippets = vec![("{{PBP_version}}".to_string(), PBP_VERSION.to_string())];
        snippets.extend(attrs.iter().filter_map(|(k, v)| {
            v.as_str().map(|s| (format!("{{{{{k}}}}}"), s.to_string()))
        }));
        replace_snippets(&attrs, &snippets)
    }
}

fn load_map(
    what: &str,
    uri: &str,
    stores: &StoreRegistry,
    cache: &DownloadCache,
) -> Result<Map<String, Value>> {
    log::info!("Loading {} attributes from {}", what, uri);
    let location = stores.resolve(uri)?;
    let mut localized = cache.localize(stores, &location)?;
    let mut contents = String::new();
    let read = localized.file.read_to_string(&mut contents);
    cache.release(localized);
    read.map_err(|e| PbpError::config(format!("cannot read {what} attributes {uri}: {e}")))?;

    match serde_json::from_str(&contents) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(PbpError::config(format!(
            "{what} attributes {uri} must be a JSON object"
        ))),
        Err(e) => Err(PbpError::config(format!(
            "invalid {what} attributes {uri}: {e}"
        ))),
    }
}

/// Builds product metadata and payload
pub struct ProductAssembler {
    attributes: AttributeSet,
    voltage_multiplier: Option<f64>,
}

impl ProductAssembler {
    pub fn new(attributes: AttributeSet, voltage_multiplier: Option<f64>) -> Self {
        Self {
            attributes,
            voltage_multiplier,
        }
    }

    pub fn assemble(&self, day: &CalibratedDay, created: DateTime<Utc>) -> (HmbMetadata, HmbPayload) {
        let product = &day.product;

        let metadata = HmbMetadata {
            date: product.date.format("%Y-%m-%d").to_string(),
            resolution_secs: product.resolution_secs,
            calibration: day.calibration.clone(),
            subset_to: day.subset_to,
            voltage_multiplier: self.voltage_multiplier,
            global_attributes: self.attributes.global_for(day, created),
            variable_attributes: self.attributes.variables().clone(),
            created_at: created.to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let width = product.frequencies.len();
        let mut psd = Vec::with_capacity(product.rows.len() * width);
        for row in &product.rows {
            match row {
                Some(values) => psd.extend_from_slice(values),
                None => psd.extend(std::iter::repeat(f32::NAN).take(width)),
            }
        }

        let payload = HmbPayload {
            time_secs: product.segment_starts.iter().map(|t| t.timestamp()).collect(),
            effort: product.effort.iter().map(|&e| e as f32).collect(),
            status: product.status.clone(),
            frequencies: product.frequencies.clone(),
            sensitivity: day.sensitivity.clone(),
            psd,
        };

        (metadata, payload)
    }
}

/// Writes products as `{output_dir}/{prefix}{YYYYMMDD}.pbph`
pub struct FileSink {
    output_dir: PathBuf,
    prefix: String,
    writer: HmbWriter,
}

impl FileSink {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            prefix: config.output_prefix.clone(),
            writer: HmbWriter::new(),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.output_dir
            .join(format!("{}{}.pbph", self.prefix, date.format("%Y%m%d")))
    }

    pub fn write(
        &self,
        date: NaiveDate,
        metadata: &HmbMetadata,
        payload: &HmbPayload,
    ) -> Result<(PathBuf, HmbHeader)> {
        let path = self.path_for(date);
        let header = self
            .writer
            .write(&path, metadata, payload)
            .map_err(|e| PbpError::day(date.format("%Y%m%d"), format!("{e:#}")))?;
        log::info!(
            "Wrote {} ({} segments x {} frequencies)",
            path.display(),
            header.num_segments,
            header.num_frequencies
        );
        Ok((path, header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::DayProduct;
    use crate::config::{CacheConfig, StorageConfig};
    use crate::retry::RetryPolicy;
    use chrono::TimeZone;
    use pbp_format::{CalibrationInfo, HmbReader};
    use serde_json::json;

    fn calibrated() -> CalibratedDay {
        let date = NaiveDate::from_ymd_opt(2022, 9, 2).unwrap();
        let start = day_start(date);
        let starts: Vec<_> = (0..4).map(|i| start + Duration::seconds(i * 60)).collect();
        CalibratedDay {
            product: DayProduct {
                date,
                resolution_secs: 60,
                segment_starts: starts,
                effort: vec![60.0, 30.0, 0.0, 0.0],
                status: vec![
                    SegmentStatus::Covered,
                    SegmentStatus::Partial,
                    SegmentStatus::Gap,
                    SegmentStatus::NotProcessed,
                ],
                frequencies: vec![10.0, 20.0],
                rows: vec![Some(vec![1.0, 2.0]), Some(vec![3.0, 4.0]), None, None],
                sample_rate: Some(100),
            },
            calibration: CalibrationInfo::Flat { value: -170.0 },
            sensitivity: Vec::new(),
            subset_to: None,
        }
    }

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_snippet_replacement() {
        let attrs = json!({
            "title": "HMB {{site}} (PBP {{PBP_version}})",
            "site": "MARS",
            "count": 3
        });
        let attrs = AttributeSet::new(attrs.as_object().unwrap().clone(), Map::new());
        let global = attrs.global_for(&calibrated(), created());

        assert_eq!(
            global["title"],
            Value::String(format!("HMB MARS (PBP {PBP_VERSION})"))
        );
        assert_eq!(global["count"], json!(3));
        assert_eq!(global["date_created"], json!("2024-01-05"));
        assert_eq!(global["time_coverage_start"], json!("2022-09-02T00:00:00Z"));
        // three segments reached, the fourth was not processed
        assert_eq!(global["time_coverage_end"], json!("2022-09-02T00:03:00Z"));
    }

    #[test]
    fn test_assemble_fills_sentinel_rows() {
        let assembler = ProductAssembler::new(AttributeSet::default(), Some(2.0));
        let (metadata, payload) = assembler.assemble(&calibrated(), created());

        assert_eq!(metadata.date, "2022-09-02");
        assert_eq!(metadata.voltage_multiplier, Some(2.0));
        assert_eq!(payload.num_segments(), 4);
        assert_eq!(payload.row(1), &[3.0, 4.0]);
        assert!(payload.row(2).iter().all(|v| v.is_nan()));
        assert!(payload.row(3).iter().all(|v| v.is_nan()));
        assert_eq!(payload.effort, vec![60.0, 30.0, 0.0, 0.0]);
        payload.validate().unwrap();
    }

    #[test]
    fn test_file_sink_writes_readable_product() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(&OutputConfig {
            output_dir: dir.path().join("out"),
            output_prefix: "milli_psd_".into(),
        });
        let (metadata, payload) =
            ProductAssembler::new(AttributeSet::default(), None).assemble(&calibrated(), created());
        let date = NaiveDate::from_ymd_opt(2022, 9, 2).unwrap();

        let (path, header) = sink.write(date, &metadata, &payload).unwrap();
        assert!(path.ends_with("out/milli_psd_20220902.pbph"));
        assert_eq!(header.num_segments, 4);

        let file = HmbReader::read(&path).unwrap();
        assert_eq!(file.payload.status, payload.status);
        assert_eq!(file.metadata.calibration, CalibrationInfo::Flat { value: -170.0 });
    }

    #[test]
    fn test_load_attribute_files() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let vars = dir.path().join("vars.json");
        std::fs::write(&global, r#"{"institution": "MBARI", "title": "x"}"#).unwrap();
        std::fs::write(&vars, r#"{"effort": {"units": "seconds"}}"#).unwrap();

        let stores = StoreRegistry::from_config(&StorageConfig::default());
        let cache = DownloadCache::new(&CacheConfig::default(), RetryPolicy::no_retry());
        let mut config = AttributesConfig {
            global_attrs_uri: Some(global.display().to_string()),
            variable_attrs_uri: Some(vars.display().to_string()),
            ..AttributesConfig::default()
        };
        config
            .set_global_attrs
            .insert("title".into(), "overridden".into());

        let attrs = AttributeSet::load(&config, &stores, &cache).unwrap();
        assert_eq!(attrs.global()["institution"], json!("MBARI"));
        assert_eq!(attrs.global()["title"], json!("overridden"));
        assert_eq!(attrs.variables()["effort"]["units"], json!("seconds"));

        std::fs::write(&vars, "[1, 2]").unwrap();
        assert!(matches!(
            AttributeSet::load(&config, &stores, &cache),
            Err(PbpError::Config(_))
        ));
    }
}
