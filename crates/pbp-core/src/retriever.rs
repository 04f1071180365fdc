//! Segment retrieval
//!
//! Turns a [`SegmentSource`] into samples. Files are localized through the
//! [`DownloadCache`] and kept open while they are likely to be needed again:
//! consecutive segments usually read from the same recording. A file that was
//! not touched while two other files were used is released. A file that
//! cannot be localized or opened is remembered and not tried again that day.

use crate::audio::{AudioFormat, SpanReader};
use crate::cache::{DownloadCache, Localized};
use crate::day::DayContext;
use crate::error::{PbpError, Result};
use crate::inventory::{micros_to_secs, MICROS_PER_SEC};
use crate::planner::{SegmentSource, SubSpan};
use crate::storage_backend::StoreRegistry;
use std::collections::HashMap;

/// Files untouched for more than this many distinct opens are released
const MAX_AGE: u32 = 2;

/// Samples of one segment, spliced in time order
#[derive(Debug, Clone)]
pub struct SegmentAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Seconds of audio read: the planned span length for complete reads,
    /// what the file held for short ones
    pub seconds: f64,
}

struct OpenFile {
    localized: Localized,
    reader: SpanReader,
    age: u32,
}

pub struct SegmentRetriever<'a> {
    stores: &'a StoreRegistry,
    cache: &'a DownloadCache,
    channel: usize,
    open: HashMap<String, OpenFile>,
    /// Uris that could not be opened, with the reason
    failed: HashMap<String, String>,
}

impl<'a> SegmentRetriever<'a> {
    pub fn new(stores: &'a StoreRegistry, cache: &'a DownloadCache, channel: usize) -> Self {
        Self {
            stores,
            cache,
            channel,
            open: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    /// Number of files currently held open
    pub fn open_files(&self) -> usize {
        self.open.len()
    }

    /// Number of uris given up on
    pub fn failed_files(&self) -> usize {
        self.failed.len()
    }

    /// Read the audio of one segment; `None` for a gap.
    ///
    /// A sub-span that cannot be read is dropped with a warning and the
    /// segment continues with what remains. Only when every sub-span fails is
    /// an error returned.
    pub fn materialize(
        &mut self,
        ctx: &DayContext,
        source: &SegmentSource,
    ) -> Result<Option<SegmentAudio>> {
        let spans = source.spans();
        if spans.is_empty() {
            return Ok(None);
        }

        let mut samples = Vec::new();
        let mut sample_rate: Option<u32> = None;
        let mut covered_us = 0i64;
        let mut last_error = None;

        for span in spans {
            match self.read_span(span) {
                Ok((rate, chunk, chunk_us)) => {
                    match sample_rate {
                        Some(expected) if expected != rate => {
                            return Err(PbpError::retrieval(
                                span.record.uri(),
                                format!("sample rate {rate} differs from {expected} within one segment"),
                                false,
                            ));
                        }
                        _ => sample_rate = Some(rate),
                    }
                    samples.extend_from_slice(&chunk);
                    covered_us += chunk_us;
                }
                Err(e) => {
                    log::warn!(
                        "{} Cannot read {} (+{:.3}s, {:.3}s): {}",
                        ctx.label(),
                        span.record.uri(),
                        span.offset_secs(),
                        span.duration_secs(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match (sample_rate, last_error) {
            (Some(sample_rate), _) => Ok(Some(SegmentAudio {
                samples,
                sample_rate,
                seconds: micros_to_secs(covered_us),
            })),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(None),
        }
    }

    /// Sample rate, samples and covered microseconds of one sub-span
    fn read_span(&mut self, span: &SubSpan) -> Result<(u32, Vec<f32>, i64)> {
        let uri = span.record.uri();
        let file = self.acquire(uri)?;

        let sample_rate = file.reader.info().sample_rate;
        if sample_rate == 0 {
            return Err(PbpError::retrieval(uri, "sample rate of 0", false));
        }
        let rate = sample_rate as i64;
        // both ends floored onto the file's frame grid: consecutive spans of
        // one file meet without sharing a frame
        let offset_us = span.offset_us.max(0);
        let first = offset_us * rate / MICROS_PER_SEC;
        let end = (offset_us + span.duration_us.max(0)) * rate / MICROS_PER_SEC;
        let num_frames = (end - first) as u64;

        let samples = file
            .reader
            .read(first as u64, num_frames)
            .map_err(|e| PbpError::retrieval(uri, format!("{e:#}"), false))?;
        log::trace!("Read {} frames from {} at frame {}", samples.len(), uri, first);

        let covered_us = if samples.len() as u64 >= num_frames {
            span.duration_us.max(0)
        } else {
            samples.len() as i64 * MICROS_PER_SEC / rate
        };
        Ok((sample_rate, samples, covered_us))
    }

    /// Open `uri` (or reuse it) and age every other open file
    fn acquire(&mut self, uri: &str) -> Result<&mut OpenFile> {
        if let Some(reason) = self.failed.get(uri) {
            return Err(PbpError::retrieval(
                uri,
                format!("unavailable earlier: {reason}"),
                false,
            ));
        }

        if !self.open.contains_key(uri) {
            let opened = match self.open_file(uri) {
                Ok(opened) => opened,
                Err(e) => {
                    self.failed.insert(uri.to_string(), e.to_string());
                    return Err(e);
                }
            };
            for other in self.open.values_mut() {
                other.age += 1;
            }
            self.open.insert(uri.to_string(), opened);
            self.release_stale();
        }

        let file = self
            .open
            .get_mut(uri)
            .ok_or_else(|| PbpError::retrieval(uri, "file released while in use", false))?;
        file.age = 0;
        Ok(file)
    }

    fn open_file(&self, uri: &str) -> Result<OpenFile> {
        let location = self.stores.resolve(uri)?;
        let localized = self.cache.localize(self.stores, &location)?;
        let format = AudioFormat::from_path(&localized.path);

        match SpanReader::open(&localized.file, format, self.channel) {
            Ok(reader) => {
                log::debug!("Opened {} ({:?})", uri, reader.info());
                Ok(OpenFile {
                    localized,
                    reader,
                    age: 0,
                })
            }
            Err(e) => {
                self.cache.release(localized);
                Err(PbpError::retrieval(uri, format!("{e:#}"), false))
            }
        }
    }

    fn release_stale(&mut self) {
        let stale: Vec<String> = self
            .open
            .iter()
            .filter(|(_, f)| f.age > MAX_AGE)
            .map(|(uri, _)| uri.clone())
            .collect();
        for uri in stale {
            if let Some(file) = self.open.remove(&uri) {
                log::debug!("Releasing {}", uri);
                self.cache.release(file.localized);
            }
        }
    }

    /// Release every open file
    pub fn finish(&mut self) {
        for (_, file) in self.open.drain() {
            self.cache.release(file.localized);
        }
    }
}

impl Drop for SegmentRetriever<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
