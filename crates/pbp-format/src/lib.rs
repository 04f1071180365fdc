//! PBP file formats: per-day audio metadata JSON and the HMB day-product container

pub mod format;
pub mod json_format;
pub mod reader;
pub mod writer;

pub use format::{
    CalibrationInfo, FormatError, HmbFile, HmbHeader, HmbMetadata, HmbPayload, SegmentStatus,
    MAGIC, VERSION,
};
pub use json_format::{day_file_path, load_entries, parse_entries, save_entries, MetaEntry};
pub use reader::HmbReader;
pub use writer::HmbWriter;
