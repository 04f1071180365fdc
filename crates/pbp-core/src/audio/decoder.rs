//! Header probing and single-channel span reading for WAV and FLAC

use super::AudioFormat;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

/// Stream parameters read from the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Total frames (samples per channel)
    pub frames: u64,
}

impl AudioInfo {
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

/// Read the header of the audio file at `path`
pub fn read_info_path(path: &Path) -> Result<AudioInfo> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
    read_info(&file, AudioFormat::from_path(path))
        .with_context(|| format!("Failed to read audio header: {}", path.display()))
}

fn rewound(file: &File) -> Result<File> {
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn read_info(file: &File, format: AudioFormat) -> Result<AudioInfo> {
    match format {
        AudioFormat::Wav => {
            let reader = hound::WavReader::new(BufReader::new(rewound(file)?))?;
            let spec = reader.spec();
            Ok(AudioInfo {
                format,
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                bits_per_sample: spec.bits_per_sample,
                frames: reader.duration() as u64,
            })
        }
        AudioFormat::Flac => {
            let reader = claxon::FlacReader::new(BufReader::new(rewound(file)?))?;
            let info = reader.streaminfo();
            let frames = info
                .samples
                .context("FLAC stream does not declare its length")?;
            Ok(AudioInfo {
                format,
                sample_rate: info.sample_rate,
                channels: info.channels as u16,
                bits_per_sample: info.bits_per_sample as u16,
                frames,
            })
        }
        AudioFormat::Unknown => anyhow::bail!("Unsupported audio format"),
    }
}

/// Reads frame ranges of one channel from an open audio file.
///
/// WAV spans are read by seeking. FLAC has no cheap random access, so the
/// selected channel is decoded once and kept for the reader's lifetime.
pub struct SpanReader {
    file: File,
    info: AudioInfo,
    channel: usize,
    decoded: Option<Vec<f32>>,
}

impl SpanReader {
    /// `channel` is clamped to the file's channel count
    pub fn open(file: &File, format: AudioFormat, channel: usize) -> Result<Self> {
        let info = read_info(file, format)?;
        if info.sample_rate == 0 || info.channels == 0 {
            anyhow::bail!("Invalid stream parameters: {:?}", info);
        }
        let channel = channel.min(info.channels as usize - 1);
        Ok(Self {
            file: file.try_clone()?,
            info,
            channel,
            decoded: None,
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// Read up to `num_frames` frames starting at `start_frame`.
    ///
    /// Ranges past the end of the stream are clamped; the result may be
    /// shorter than requested.
    pub fn read(&mut self, start_frame: u64, num_frames: u64) -> Result<Vec<f32>> {
        let start = start_frame.min(self.info.frames);
        let end = start_frame.saturating_add(num_frames).min(self.info.frames);
        if end <= start {
            return Ok(Vec::new());
        }

        match self.info.format {
            AudioFormat::Wav => self.read_wav(start, end - start),
            AudioFormat::Flac => {
                if self.decoded.is_none() {
                    self.decoded = Some(self.decode_flac_channel()?);
                }
                let decoded = self.decoded.as_deref().unwrap_or_default();
                let end = (end as usize).min(decoded.len());
                let start = (start as usize).min(end);
                Ok(decoded[start..end].to_vec())
            }
            AudioFormat::Unknown => anyhow::bail!("Unsupported audio format"),
        }
    }

    fn read_wav(&self, start: u64, count: u64) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::new(BufReader::new(rewound(&self.file)?))?;
        reader.seek(start as u32)?;

        let spec = reader.spec();
        let channels = spec.channels as usize;
        let wanted = count as usize * channels;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .take(wanted)
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .take(wanted)
                    .map(|s| s.map(|v| v as f32 / max_val))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(select_channel(&interleaved, channels, self.channel))
    }

    fn decode_flac_channel(&self) -> Result<Vec<f32>> {
        let mut reader = claxon::FlacReader::new(BufReader::new(rewound(&self.file)?))?;
        let channels = self.info.channels as usize;
        let max_val = (1i64 << (self.info.bits_per_sample - 1)) as f32;

        let mut out = Vec::with_capacity(self.info.frames as usize);
        for (i, sample) in reader.samples().enumerate() {
            let sample = sample?;
            if i % channels == self.channel {
                out.push(sample as f32 / max_val);
            }
        }
        log::trace!("Decoded {} FLAC frames (channel {})", out.len(), self.channel);
        Ok(out)
    }
}

fn select_channel(interleaved: &[f32], channels: usize, channel: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame[channel])
        .collect()
}
