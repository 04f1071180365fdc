//! Audio header probing and span reading
//!
//! Supports WAV (hound) and FLAC (claxon).

mod decoder;

pub use decoder::{read_info_path, AudioInfo, SpanReader};

use std::path::Path;

/// Supported audio formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Flac,
    Unknown,
}

impl AudioFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => Self::from_extension(ext),
            None => AudioFormat::Unknown,
        }
    }

    /// Detect format from a file or object name
    pub fn from_name(name: &str) -> Self {
        match name.rsplit_once('.') {
            Some((_, ext)) => Self::from_extension(ext),
            None => AudioFormat::Unknown,
        }
    }

    fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => AudioFormat::Wav,
            "flac" => AudioFormat::Flac,
            _ => AudioFormat::Unknown,
        }
    }
}
