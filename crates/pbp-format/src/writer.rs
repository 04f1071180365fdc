//! Product file writer

use crate::format::{HmbHeader, HmbMetadata, HmbPayload};
use anyhow::{Context, Result};
use crc::{Crc, CRC_64_ECMA_182};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub(crate) const CHECKSUM: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub struct HmbWriter {
    compression_level: i32,
}

impl HmbWriter {
    pub fn new() -> Self {
        Self {
            compression_level: 3,
        }
    }

    /// Use a different zstd level (0 stores the payload uncompressed)
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Write a product file.
    ///
    /// The file is written next to `path` under a temporary name and renamed
    /// into place, so readers never observe a partial product.
    pub fn write(
        &self,
        path: &Path,
        metadata: &HmbMetadata,
        payload: &HmbPayload,
    ) -> Result<HmbHeader> {
        payload.validate()?;

        let metadata_bytes = serde_json::to_vec(metadata)?;
        let raw_payload = bincode::serialize(payload).context("Failed to encode payload")?;

        let mut header = HmbHeader::new(
            payload.num_segments() as u32,
            payload.num_frequencies() as u32,
            metadata.resolution_secs,
        );

        let stored_payload = if self.compression_level > 0 {
            header.set_compressed(true);
            zstd::encode_all(&raw_payload[..], self.compression_level)
                .context("Failed to compress payload")?
        } else {
            raw_payload.clone()
        };

        header.metadata_size = metadata_bytes.len() as u64;
        header.payload_size = raw_payload.len() as u64;
        header.payload_size_compressed = stored_payload.len() as u64;
        header.checksum = CHECKSUM.checksum(&stored_payload);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let file = File::create(&tmp_path).with_context(|| {
                format!("Failed to create product file: {}", tmp_path.display())
            })?;
            let mut writer = BufWriter::new(file);
            self.write_header(&mut writer, &header)?;
            writer.write_all(&metadata_bytes)?;
            writer.write_all(&stored_payload)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move product into place: {}", path.display()))?;

        log::debug!(
            "Wrote {}: {} segments x {} frequencies, payload {} -> {} bytes",
            path.display(),
            header.num_segments,
            header.num_frequencies,
            header.payload_size,
            header.payload_size_compressed
        );

        Ok(header)
    }

    fn write_header<W: Write>(&self, writer: &mut W, header: &HmbHeader) -> Result<()> {
        writer.write_all(&header.magic)?;
        writer.write_all(&header.version.to_le_bytes())?;
        writer.write_all(&header.flags.to_le_bytes())?;
        writer.write_all(&header.metadata_size.to_le_bytes())?;
        writer.write_all(&header.payload_size.to_le_bytes())?;
        writer.write_all(&header.payload_size_compressed.to_le_bytes())?;
        writer.write_all(&header.num_segments.to_le_bytes())?;
        writer.write_all(&header.num_frequencies.to_le_bytes())?;
        writer.write_all(&header.resolution_secs.to_le_bytes())?;
        writer.write_all(&header.reserved1.to_le_bytes())?;
        writer.write_all(&header.checksum.to_le_bytes())?;
        writer.write_all(&header.reserved2.to_le_bytes())?;

        Ok(())
    }
}

impl Default for HmbWriter {
    fn default() -> Self {
        Self::new()
    }
}
