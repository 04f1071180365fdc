//! One-day pipeline
//!
//! [`DayProcessor`] is built once per run; everything that can fail for
//! configuration reasons (validation, sensitivity, attribute files) fails in
//! [`DayProcessor::new`]. [`DayProcessor::process_day`] then takes `&self`
//! and keeps all per-day state local, so days can run on parallel workers.

use crate::aggregator::{AggregatorOptions, DayAggregator, DaySummary};
use crate::cache::DownloadCache;
use crate::calibration::{CalibrationApplier, Sensitivity};
use crate::config::PbpConfig;
use crate::day::DayContext;
use crate::error::Result;
use crate::inventory::MetadataSource;
use crate::product::{AttributeSet, FileSink, ProductAssembler};
use crate::retriever::SegmentRetriever;
use crate::storage_backend::StoreRegistry;
use crate::transform::{SpectralAnalyzer, WelchAnalyzer};
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;

/// Result of one completed day
#[derive(Debug, Clone)]
pub struct DayOutcome {
    pub date: NaiveDate,
    /// Product file; `None` when no segment had data
    pub output: Option<PathBuf>,
    pub summary: DaySummary,
}

pub struct DayProcessor {
    config: PbpConfig,
    stores: StoreRegistry,
    cache: DownloadCache,
    metadata: MetadataSource,
    applier: CalibrationApplier,
    assembler: ProductAssembler,
    sink: FileSink,
    analyzer: Box<dyn SpectralAnalyzer>,
}

impl DayProcessor {
    pub fn new(config: PbpConfig) -> Result<Self> {
        let stores = StoreRegistry::from_config(&config.storage);
        Self::with_stores(config, stores)
    }

    /// Like [`new`](Self::new) with a custom store registry
    pub fn with_stores(config: PbpConfig, stores: StoreRegistry) -> Result<Self> {
        config.validate()?;

        let cache = DownloadCache::new(&config.cache, config.retry.clone());
        let sensitivity = Sensitivity::from_sources(&config.calibration, &stores, &cache)?;
        let attributes = AttributeSet::load(&config.attributes, &stores, &cache)?;

        let p = &config.processing;
        Ok(Self {
            metadata: MetadataSource::new(config.storage.json_base_dir.clone()),
            applier: CalibrationApplier::new(sensitivity, p.subset_to),
            assembler: ProductAssembler::new(attributes, p.voltage_multiplier),
            sink: FileSink::new(&config.output),
            analyzer: Box::new(WelchAnalyzer::new()),
            stores,
            cache,
            config,
        })
    }

    pub fn with_analyzer(mut self, analyzer: Box<dyn SpectralAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &PbpConfig {
        &self.config
    }

    /// Process one day: inventory, aggregation, calibration, product file.
    ///
    /// Errors are scoped to the day. A cancelled day writes nothing.
    pub fn process_day(&self, ctx: &DayContext) -> Result<DayOutcome> {
        ctx.check_cancelled()?;
        let p = &self.config.processing;

        let inventory = self.metadata.load_day(ctx, &self.stores, &self.cache)?;

        let options = AggregatorOptions {
            resolution_secs: p.resolution_secs,
            max_segments: p.max_segments,
            voltage_multiplier: p.voltage_multiplier,
            overlap_policy: p.overlap_policy,
        };
        let mut retriever = SegmentRetriever::new(&self.stores, &self.cache, p.channel);
        let product = DayAggregator::new(options, self.analyzer.as_ref()).aggregate(
            ctx,
            &inventory,
            &mut retriever,
        )?;
        drop(retriever);

        let summary = product.summary();
        if !product.has_data() {
            log::warn!("{} No segment produced data; no product written", ctx.label());
            return Ok(DayOutcome {
                date: ctx.date,
                output: None,
                summary,
            });
        }

        let day = self.applier.calibrate(product);
        let (metadata, payload) = self.assembler.assemble(&day, Utc::now());

        ctx.check_cancelled()?;
        let (path, _) = self.sink.write(ctx.date, &metadata, &payload)?;
        log::info!("{} Product written to {}", ctx.label(), path.display());

        Ok(DayOutcome {
            date: ctx.date,
            output: Some(path),
            summary,
        })
    }
}
