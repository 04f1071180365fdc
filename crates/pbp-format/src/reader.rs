//! Product file reader

use crate::format::{FormatError, HmbFile, HmbHeader, HmbMetadata, HmbPayload, HEADER_SIZE, MAGIC, VERSION};
use crate::writer::CHECKSUM;
use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

pub struct HmbReader;

impl HmbReader {
    /// Read and verify a complete product file
    pub fn read(path: &Path) -> Result<HmbFile> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open product file: {}", path.display()))?;
        // SAFETY: the file is opened read-only and products are only ever
        // replaced by rename, never modified in place.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map product file: {}", path.display()))?;

        Self::from_bytes(&mmap)
    }

    /// Read only the fixed header
    pub fn read_header(path: &Path) -> Result<HmbHeader> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read product file: {}", path.display()))?;
        Ok(Self::parse_header(&bytes)?)
    }

    /// Decode a product held in memory
    pub fn from_bytes(bytes: &[u8]) -> Result<HmbFile> {
        let header = Self::parse_header(bytes)?;

        let metadata_start = HEADER_SIZE;
        let metadata_end = metadata_start + header.metadata_size as usize;
        let payload_end = metadata_end + header.payload_size_compressed as usize;
        if bytes.len() < payload_end {
            return Err(FormatError::Truncated {
                needed: payload_end,
                available: bytes.len(),
            }
            .into());
        }

        let metadata: HmbMetadata = serde_json::from_slice(&bytes[metadata_start..metadata_end])
            .context("Failed to parse product metadata")?;

        let stored = &bytes[metadata_end..payload_end];
        let actual = CHECKSUM.checksum(stored);
        if actual != header.checksum {
            return Err(FormatError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            }
            .into());
        }

        let raw = if header.is_compressed() {
            zstd::decode_all(stored).context("Failed to decompress payload")?
        } else {
            stored.to_vec()
        };
        let payload: HmbPayload =
            bincode::deserialize(&raw).context("Failed to decode payload")?;
        payload.validate()?;

        if payload.num_segments() != header.num_segments as usize
            || payload.num_frequencies() != header.num_frequencies as usize
        {
            return Err(FormatError::Inconsistent(format!(
                "header says {}x{}, payload has {}x{}",
                header.num_segments,
                header.num_frequencies,
                payload.num_segments(),
                payload.num_frequencies()
            ))
            .into());
        }

        Ok(HmbFile {
            header,
            metadata,
            payload,
        })
    }

    fn parse_header(bytes: &[u8]) -> Result<HmbHeader, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut cursor = FieldCursor { bytes, pos: 0 };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(cursor.take(4));
        if magic != MAGIC {
            return Err(FormatError::BadMagic);
        }

        let version = cursor.read_u16();
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        Ok(HmbHeader {
            magic,
            version,
            flags: cursor.read_u16(),
            metadata_size: cursor.read_u64(),
            payload_size: cursor.read_u64(),
            payload_size_compressed: cursor.read_u64(),
            num_segments: cursor.read_u32(),
            num_frequencies: cursor.read_u32(),
            resolution_secs: cursor.read_u32(),
            reserved1: cursor.read_u32(),
            checksum: cursor.read_u64(),
            reserved2: cursor.read_u64(),
        })
    }
}

/// Little-endian field reader over a header slice already checked for length
struct FieldCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    fn read_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2));
        u16::from_le_bytes(buf)
    }

    fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4));
        u32::from_le_bytes(buf)
    }

    fn read_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8));
        u64::from_le_bytes(buf)
    }
}
