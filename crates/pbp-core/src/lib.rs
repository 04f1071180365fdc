//! PBP Core - HMB day-product engine
//!
//! Builds per-day inventories of recorded audio, partitions each day into
//! fixed-width segments, resolves every segment onto the underlying files and
//! aggregates calibrated spectra plus effort into one product per day.

pub mod aggregator;
pub mod audio;
pub mod cache;
pub mod calibration;
pub mod catalog;
pub mod config;
pub mod day;
pub mod drift;
pub mod error;
pub mod inventory;
pub mod planner;
pub mod processor;
pub mod product;
pub mod retriever;
pub mod retry;
pub mod storage_backend;
pub mod transform;

pub use aggregator::{AggregatorOptions, DayAggregator, DayProduct, DaySummary};
pub use cache::DownloadCache;
pub use calibration::{CalibratedDay, CalibrationApplier, Sensitivity};
pub use catalog::{
    CatalogListing, FileCatalog, RecorderFamily, SoundTrapLog, TimestampParser,
    SOUNDTRAP_SAMPLE_RATE,
};
pub use config::PbpConfig;
pub use day::{date_range, parse_date, DayContext};
pub use drift::correct_drift;
pub use error::{PbpError, Result};
pub use inventory::{AudioFileRecord, DayInventory, DayInventoryBuilder, MetadataSource};
pub use planner::{OverlapPolicy, Segment, SegmentPlanner, SegmentSource, SubSpan};
pub use processor::{DayOutcome, DayProcessor};
pub use product::{AttributeSet, FileSink, ProductAssembler};
pub use retriever::{SegmentAudio, SegmentRetriever};
pub use retry::RetryPolicy;
pub use storage_backend::{ObjectLocation, ObjectStore, StoreRegistry};
pub use transform::{SpectralAnalyzer, Spectrum, WelchAnalyzer};
