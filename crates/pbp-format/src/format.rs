//! HMB day-product container structures

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Magic bytes for product files: "PBPH"
pub const MAGIC: [u8; 4] = [0x50, 0x42, 0x50, 0x48];

/// Current format version
pub const VERSION: u16 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Header flag: payload is zstd-compressed
pub const FLAG_COMPRESSED: u16 = 0x1;

/// File header (64 bytes fixed size, little-endian)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmbHeader {
    /// Magic bytes: "PBPH"
    pub magic: [u8; 4],
    /// Format version
    pub version: u16,
    /// Flags (bit 0: compressed)
    pub flags: u16,
    /// Size of the JSON metadata block
    pub metadata_size: u64,
    /// Size of the payload (uncompressed)
    pub payload_size: u64,
    /// Size of the payload as stored
    pub payload_size_compressed: u64,
    /// Number of time segments
    pub num_segments: u32,
    /// Number of frequency bins
    pub num_frequencies: u32,
    /// Segment width in seconds
    pub resolution_secs: u32,
    /// Reserved
    pub reserved1: u32,
    /// CRC-64 of the stored payload
    pub checksum: u64,
    /// Reserved
    pub reserved2: u64,
}

impl HmbHeader {
    pub fn new(num_segments: u32, num_frequencies: u32, resolution_secs: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            metadata_size: 0,
            payload_size: 0,
            payload_size_compressed: 0,
            num_segments,
            num_frequencies,
            resolution_secs,
            reserved1: 0,
            checksum: 0,
            reserved2: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        if compressed {
            self.flags |= FLAG_COMPRESSED;
        } else {
            self.flags &= !FLAG_COMPRESSED;
        }
    }
}

/// What happened to one segment of the day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Audio for the whole segment width
    Covered,
    /// Audio for part of the segment width
    Partial,
    /// No recording overlaps the segment
    Gap,
    /// Audio was expected but retrieval or analysis failed
    Failed,
    /// Not reached (segment cap or cancellation)
    NotProcessed,
}

impl SegmentStatus {
    /// True when the segment carries a computed spectrum
    pub fn has_data(&self) -> bool {
        matches!(self, SegmentStatus::Covered | SegmentStatus::Partial)
    }
}

/// How the product was calibrated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationInfo {
    Curve { source: String },
    Flat { value: f64 },
}

/// JSON metadata block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmbMetadata {
    /// Day in `YYYY-MM-DD` form
    pub date: String,
    pub resolution_secs: u32,
    pub calibration: CalibrationInfo,
    #[serde(default)]
    pub subset_to: Option<(f32, f32)>,
    #[serde(default)]
    pub voltage_multiplier: Option<f64>,
    #[serde(default)]
    pub global_attributes: Map<String, Value>,
    /// Per-variable attribute maps (`psd`, `effort`, `time`, ...)
    #[serde(default)]
    pub variable_attributes: Map<String, Value>,
    pub created_at: String,
}

/// Array payload, all arrays indexed by segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmbPayload {
    /// Segment start times (seconds since the Unix epoch)
    pub time_secs: Vec<i64>,
    /// Seconds of real audio analysed per segment
    pub effort: Vec<f32>,
    pub status: Vec<SegmentStatus>,
    /// Frequency axis (Hz)
    pub frequencies: Vec<f32>,
    /// Sensitivity applied per frequency (empty when flat)
    pub sensitivity: Vec<f32>,
    /// Row-major `[segment][frequency]` PSD values (dB), NaN for no data
    pub psd: Vec<f32>,
}

impl HmbPayload {
    pub fn num_segments(&self) -> usize {
        self.time_secs.len()
    }

    pub fn num_frequencies(&self) -> usize {
        self.frequencies.len()
    }

    /// PSD row for one segment
    pub fn row(&self, segment: usize) -> &[f32] {
        let width = self.num_frequencies();
        &self.psd[segment * width..(segment + 1) * width]
    }

    /// Check that all arrays agree in length
    pub fn validate(&self) -> Result<(), FormatError> {
        let n = self.num_segments();
        if self.effort.len() != n || self.status.len() != n {
            return Err(FormatError::Inconsistent(format!(
                "segment arrays disagree: time={} effort={} status={}",
                n,
                self.effort.len(),
                self.status.len()
            )));
        }
        if self.psd.len() != n * self.num_frequencies() {
            return Err(FormatError::Inconsistent(format!(
                "psd has {} values, expected {} x {}",
                self.psd.len(),
                n,
                self.num_frequencies()
            )));
        }
        if !self.sensitivity.is_empty() && self.sensitivity.len() != self.num_frequencies() {
            return Err(FormatError::Inconsistent(format!(
                "sensitivity has {} values for {} frequencies",
                self.sensitivity.len(),
                self.num_frequencies()
            )));
        }
        Ok(())
    }
}

/// Complete product file
#[derive(Debug, Clone)]
pub struct HmbFile {
    pub header: HmbHeader,
    pub metadata: HmbMetadata,
    pub payload: HmbPayload,
}

/// Structural problems with a product file
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("invalid product file: magic bytes mismatch")]
    BadMagic,
    #[error("unsupported product version {0}")]
    UnsupportedVersion(u16),
    #[error("product file truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("payload checksum mismatch: header {expected:016x}, computed {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
    #[error("inconsistent product: {0}")]
    Inconsistent(String),
}
