//! Day aggregation
//!
//! Walks the plan of one day in segment order, retrieves each segment's audio,
//! runs the spectral step and collects one row plus one effort value per
//! segment. Rows for segments without a usable estimate are `None` and become
//! NaN sentinel rows in the product.

use crate::day::DayContext;
use crate::error::{PbpError, Result};
use crate::inventory::DayInventory;
use crate::planner::{OverlapPolicy, Segment, SegmentPlanner, SegmentSource};
use crate::retriever::{SegmentAudio, SegmentRetriever};
use crate::transform::SpectralAnalyzer;
use chrono::{DateTime, NaiveDate, Utc};
use pbp_format::SegmentStatus;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub resolution_secs: u32,
    /// Process at most this many segments; 0 means all
    pub max_segments: usize,
    pub voltage_multiplier: Option<f64>,
    pub overlap_policy: OverlapPolicy,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            resolution_secs: 60,
            max_segments: 0,
            voltage_multiplier: None,
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

/// Per-segment arrays of one day, before calibration
#[derive(Debug, Clone)]
pub struct DayProduct {
    pub date: NaiveDate,
    pub resolution_secs: u32,
    pub segment_starts: Vec<DateTime<Utc>>,
    /// Seconds of audio analyzed per segment
    pub effort: Vec<f64>,
    pub status: Vec<SegmentStatus>,
    /// Empty until the first segment is analyzed
    pub frequencies: Vec<f32>,
    pub rows: Vec<Option<Vec<f32>>>,
    pub sample_rate: Option<u32>,
}

/// Segment counts of a finished day
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DaySummary {
    pub segments: usize,
    pub covered: usize,
    pub partial: usize,
    pub gaps: usize,
    pub failed: usize,
    pub not_processed: usize,
    pub total_effort_secs: f64,
}

impl DayProduct {
    fn new(date: NaiveDate, resolution_secs: u32, capacity: usize) -> Self {
        Self {
            date,
            resolution_secs,
            segment_starts: Vec::with_capacity(capacity),
            effort: Vec::with_capacity(capacity),
            status: Vec::with_capacity(capacity),
            frequencies: Vec::new(),
            rows: Vec::with_capacity(capacity),
            sample_rate: None,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.status.len()
    }

    /// Whether any segment produced a spectrum
    pub fn has_data(&self) -> bool {
        self.rows.iter().any(Option::is_some)
    }

    pub fn summary(&self) -> DaySummary {
        let count = |s: SegmentStatus| self.status.iter().filter(|&&x| x == s).count();
        DaySummary {
            segments: self.num_segments(),
            covered: count(SegmentStatus::Covered),
            partial: count(SegmentStatus::Partial),
            gaps: count(SegmentStatus::Gap),
            failed: count(SegmentStatus::Failed),
            not_processed: count(SegmentStatus::NotProcessed),
            total_effort_secs: self.effort.iter().sum(),
        }
    }

    fn push(&mut self, segment: &Segment, status: SegmentStatus, effort: f64, row: Option<Vec<f32>>) {
        self.segment_starts.push(segment.start);
        self.status.push(status);
        self.effort.push(effort);
        self.rows.push(row);
    }
}

pub struct DayAggregator<'a> {
    options: AggregatorOptions,
    analyzer: &'a dyn SpectralAnalyzer,
}

impl<'a> DayAggregator<'a> {
    pub fn new(options: AggregatorOptions, analyzer: &'a dyn SpectralAnalyzer) -> Self {
        Self { options, analyzer }
    }

    /// Aggregate every segment of the inventory's day.
    ///
    /// Segment failures are recorded as [`SegmentStatus::Failed`] and the day
    /// goes on. Cancellation is checked between segments and drops the
    /// partial product.
    pub fn aggregate(
        &self,
        ctx: &DayContext,
        inventory: &DayInventory,
        retriever: &mut SegmentRetriever<'_>,
    ) -> Result<DayProduct> {
        let planner = SegmentPlanner::new(self.options.resolution_secs)
            .with_policy(self.options.overlap_policy);
        let plan = planner.plan(inventory);
        let cap = match self.options.max_segments {
            0 => plan.len(),
            n => n.min(plan.len()),
        };

        log::info!(
            "{} Aggregating {} segments of {}s from {} files",
            ctx.label(),
            plan.len(),
            planner.resolution_secs(),
            inventory.len()
        );
        if cap < plan.len() {
            log::warn!("{} Segment cap: only the first {} are processed", ctx.label(), cap);
        }

        let mut product = DayProduct::new(inventory.date, planner.resolution_secs(), plan.len());

        for (segment, source) in &plan {
            ctx.check_cancelled()?;

            if segment.index >= cap {
                product.push(segment, SegmentStatus::NotProcessed, 0.0, None);
                continue;
            }
            if source.is_gap() {
                product.push(segment, SegmentStatus::Gap, 0.0, None);
                continue;
            }

            match self.process_segment(ctx, &mut product, retriever, source) {
                Ok(Some((seconds, row))) => {
                    let width = segment.width_secs();
                    let status = if seconds >= width {
                        SegmentStatus::Covered
                    } else {
                        SegmentStatus::Partial
                    };
                    product.push(segment, status, seconds.min(width), Some(row));
                }
                Ok(None) => product.push(segment, SegmentStatus::Gap, 0.0, None),
                Err(e) => {
                    log::warn!(
                        "{} Segment {} ({}) failed: {}",
                        ctx.label(),
                        segment.index,
                        segment.start.format("%H:%M:%S"),
                        e
                    );
                    product.push(segment, SegmentStatus::Failed, 0.0, None);
                }
            }

            if (segment.index + 1) % 60 == 0 {
                log::debug!(
                    "{} Processed {}/{} segments",
                    ctx.label(),
                    segment.index + 1,
                    cap
                );
            }
        }
        retriever.finish();

        let summary = product.summary();
        log::info!(
            "{} Done: {} covered, {} partial, {} gaps, {} failed, {} not processed, effort {:.1}s",
            ctx.label(),
            summary.covered,
            summary.partial,
            summary.gaps,
            summary.failed,
            summary.not_processed,
            summary.total_effort_secs
        );
        Ok(product)
    }

    /// Analyzed seconds and spectrum of one segment, `None` if no audio came back
    fn process_segment(
        &self,
        ctx: &DayContext,
        product: &mut DayProduct,
        retriever: &mut SegmentRetriever<'_>,
        source: &SegmentSource,
    ) -> Result<Option<(f64, Vec<f32>)>> {
        let Some(audio) = retriever.materialize(ctx, source)? else {
            return Ok(None);
        };
        let SegmentAudio {
            mut samples,
            sample_rate,
            seconds,
        } = audio;
        if samples.is_empty() {
            return Ok(None);
        }

        match product.sample_rate {
            Some(rate) if rate != sample_rate => {
                return Err(PbpError::Analysis(format!(
                    "sample rate {sample_rate} differs from the day's {rate}"
                )));
            }
            _ => {}
        }

        if let Some(multiplier) = self.options.voltage_multiplier {
            let m = multiplier as f32;
            samples.iter_mut().for_each(|s| *s *= m);
        }

        let spectrum = self
            .analyzer
            .analyze(&samples, sample_rate)
            .map_err(|e| PbpError::Analysis(format!("{e:#}")))?;
        if spectrum.psd.len() != spectrum.frequencies.len() {
            return Err(PbpError::Analysis(format!(
                "{} values for {} frequencies",
                spectrum.psd.len(),
                spectrum.frequencies.len()
            )));
        }

        if product.frequencies.is_empty() {
            product.frequencies = spectrum.frequencies;
            product.sample_rate = Some(sample_rate);
        } else if product.frequencies != spectrum.frequencies {
            return Err(PbpError::Analysis(
                "frequency axis differs from earlier segments".to_string(),
            ));
        }

        Ok(Some((seconds, spectrum.psd)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DownloadCache;
    use crate::config::{CacheConfig, StorageConfig};
    use crate::inventory::{AudioFileRecord, DayInventoryBuilder};
    use crate::retry::RetryPolicy;
    use crate::storage_backend::StoreRegistry;
    use crate::transform::Spectrum;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use std::path::Path;

    /// Reports the sample count and mean sample value
    struct StubAnalyzer;

    impl SpectralAnalyzer for StubAnalyzer {
        fn analyze(&self, samples: &[f32], _sample_rate: u32) -> anyhow::Result<Spectrum> {
            let mean = samples.iter().sum::<f32>() / samples.len() as f32;
            Ok(Spectrum {
                frequencies: vec![1.0, 2.0],
                psd: vec![samples.len() as f32, mean],
            })
        }
    }

    struct FailingAnalyzer;

    impl SpectralAnalyzer for FailingAnalyzer {
        fn analyze(&self, _samples: &[f32], _sample_rate: u32) -> anyhow::Result<Spectrum> {
            anyhow::bail!("numerical trouble")
        }
    }

    /// Mono 16-bit WAV with every sample set to `value`
    fn write_wav(path: &Path, sample_rate: u32, seconds: u32, value: i16) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..sample_rate * seconds {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 9, 2).unwrap()
    }

    fn record(path: &Path, h: u32, m: u32, s: u32, duration: f64) -> AudioFileRecord {
        let start = Utc.with_ymd_and_hms(2022, 9, 2, h, m, s).unwrap();
        AudioFileRecord::new(path.display().to_string(), start, duration, 1).unwrap()
    }

    fn run(
        records: &[AudioFileRecord],
        options: AggregatorOptions,
        analyzer: &dyn SpectralAnalyzer,
        ctx: &DayContext,
    ) -> Result<DayProduct> {
        let stores = StoreRegistry::from_config(&StorageConfig::default());
        let cache = DownloadCache::new(&CacheConfig::default(), RetryPolicy::no_retry());
        let inventory = DayInventoryBuilder::build(date(), records);
        let mut retriever = SegmentRetriever::new(&stores, &cache, 0);
        DayAggregator::new(options, analyzer).aggregate(ctx, &inventory, &mut retriever)
    }

    #[test]
    fn test_end_to_end_gap_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("uri_a.wav");
        let b = dir.path().join("uri_b.wav");
        write_wav(&a, 10, 1800, 100);
        write_wav(&b, 10, 1800, 100);
        let records = vec![record(&a, 0, 0, 0, 1800.0), record(&b, 0, 40, 0, 1800.0)];

        let product = run(
            &records,
            AggregatorOptions::default(),
            &StubAnalyzer,
            &DayContext::new(date()),
        )
        .unwrap();

        assert_eq!(product.num_segments(), 1440);
        assert_eq!(product.frequencies, vec![1.0, 2.0]);
        assert_eq!(product.sample_rate, Some(10));
        for i in 0..1440 {
            let covered = i < 30 || (40..70).contains(&i);
            if covered {
                assert_eq!(product.status[i], SegmentStatus::Covered, "segment {i}");
                assert_relative_eq!(product.effort[i], 60.0);
                assert_eq!(product.rows[i].as_ref().unwrap()[0], 600.0);
            } else {
                assert_eq!(product.status[i], SegmentStatus::Gap, "segment {i}");
                assert_eq!(product.effort[i], 0.0);
                assert!(product.rows[i].is_none());
            }
        }

        let summary = product.summary();
        assert_eq!(summary.covered, 60);
        assert_eq!(summary.gaps, 1380);
        assert_relative_eq!(summary.total_effort_secs, 3600.0);
    }

    #[test]
    fn test_partial_segment_and_voltage_multiplier() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        write_wav(&a, 10, 90, 16384);
        let records = vec![record(&a, 1, 0, 0, 90.0)];

        let options = AggregatorOptions {
            voltage_multiplier: Some(2.0),
            ..AggregatorOptions::default()
        };
        let product = run(&records, options, &StubAnalyzer, &DayContext::new(date())).unwrap();

        assert_eq!(product.status[60], SegmentStatus::Covered);
        assert_eq!(product.status[61], SegmentStatus::Partial);
        assert_relative_eq!(product.effort[61], 30.0);
        let row = product.rows[61].as_ref().unwrap();
        assert_eq!(row[0], 300.0);
        assert_relative_eq!(row[1], 1.0);
    }

    #[test]
    fn test_file_shorter_than_recorded_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        write_wav(&a, 10, 30, 0);
        // listed as a minute, holds only half of it
        let records = vec![record(&a, 2, 0, 0, 60.0)];

        let product =
            run(&records, AggregatorOptions::default(), &StubAnalyzer, &DayContext::new(date()))
                .unwrap();
        assert_eq!(product.status[120], SegmentStatus::Partial);
        assert_relative_eq!(product.effort[120], 30.0);
    }

    #[test]
    fn test_failures_degrade_single_segments() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        write_wav(&a, 10, 120, 0);
        let missing = dir.path().join("missing.wav");
        let records = vec![record(&a, 0, 0, 0, 120.0), record(&missing, 0, 5, 0, 60.0)];

        let product =
            run(&records, AggregatorOptions::default(), &StubAnalyzer, &DayContext::new(date()))
                .unwrap();
        assert_eq!(product.status[0], SegmentStatus::Covered);
        assert_eq!(product.status[5], SegmentStatus::Failed);
        assert_eq!(product.effort[5], 0.0);
        assert!(product.rows[5].is_none());

        let product =
            run(&records, AggregatorOptions::default(), &FailingAnalyzer, &DayContext::new(date()))
                .unwrap();
        assert_eq!(product.summary().failed, 3);
        assert!(!product.has_data());
        assert!(product.frequencies.is_empty());
    }

    #[test]
    fn test_segment_cap_is_not_a_gap() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        write_wav(&a, 10, 600, 0);
        let records = vec![record(&a, 0, 0, 0, 600.0)];

        let options = AggregatorOptions {
            max_segments: 3,
            ..AggregatorOptions::default()
        };
        let product = run(&records, options, &StubAnalyzer, &DayContext::new(date())).unwrap();

        assert_eq!(product.num_segments(), 1440);
        assert_eq!(&product.status[..3], &[SegmentStatus::Covered; 3]);
        assert_eq!(product.status[3], SegmentStatus::NotProcessed);
        assert_eq!(product.summary().not_processed, 1437);
        assert_eq!(product.summary().gaps, 0);
    }

    #[test]
    fn test_cancelled_day_returns_no_product() {
        let ctx = DayContext::new(date());
        ctx.cancel();
        let none: Vec<AudioFileRecord> = Vec::new();
        let result = run(&none, AggregatorOptions::default(), &StubAnalyzer, &ctx);
        assert!(matches!(result, Err(PbpError::Cancelled(_))));
    }
}
