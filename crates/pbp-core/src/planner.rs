//! Segment planning
//!
//! Partitions a day into contiguous fixed-width segments and resolves each
//! segment onto the recordings of a [`DayInventory`].
//!
//! The inventory is ordered by start time, so the planner walks it with a
//! forward cursor: records that ended before the current segment are never
//! looked at again. Days with thousands of short files stay linear in
//! `segments + files` instead of `segments * files`.
//!
//! Overlapping recordings are resolved by an [`OverlapPolicy`]. Candidates
//! claim the segment in policy order; each one only gets the parts of its
//! interval nobody claimed before it.

use crate::day::{day_start, SECONDS_PER_DAY};
use crate::inventory::{micros_to_secs, AudioFileRecord, DayInventory};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

/// One analysis window of the day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// 0-based position within the day
    pub index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Segment {
    pub fn start_us(&self) -> i64 {
        self.start.timestamp_micros()
    }

    pub fn end_us(&self) -> i64 {
        self.end.timestamp_micros()
    }

    pub fn width_us(&self) -> i64 {
        self.end_us() - self.start_us()
    }

    pub fn width_secs(&self) -> f64 {
        micros_to_secs(self.width_us())
    }
}

/// A contiguous piece of one recording feeding a segment
#[derive(Debug, Clone, PartialEq)]
pub struct SubSpan {
    pub record: AudioFileRecord,
    /// Offset from the start of the recording
    pub offset_us: i64,
    pub duration_us: i64,
}

impl SubSpan {
    pub fn offset_secs(&self) -> f64 {
        micros_to_secs(self.offset_us)
    }

    pub fn duration_secs(&self) -> f64 {
        micros_to_secs(self.duration_us)
    }

    pub fn abs_start_us(&self) -> i64 {
        self.record.start_us() + self.offset_us
    }

    pub fn abs_end_us(&self) -> i64 {
        self.abs_start_us() + self.duration_us
    }
}

/// Where a segment's audio comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentSource {
    /// Sub-spans in time order, splicing without gaps over the whole segment
    Covered { spans: Vec<SubSpan> },
    /// Audio for only part of the segment
    Partial { spans: Vec<SubSpan>, covered_us: i64 },
    /// No recording touches the segment
    Gap,
}

impl SegmentSource {
    pub fn spans(&self) -> &[SubSpan] {
        match self {
            SegmentSource::Covered { spans } | SegmentSource::Partial { spans, .. } => spans,
            SegmentSource::Gap => &[],
        }
    }

    pub fn covered_us(&self) -> i64 {
        self.spans().iter().map(|s| s.duration_us).sum()
    }

    pub fn covered_secs(&self) -> f64 {
        micros_to_secs(self.covered_us())
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, SegmentSource::Gap)
    }
}

/// Which recording wins where recordings overlap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// The earliest-starting recording (ties broken by uri)
    #[default]
    EarliestStart,
    /// The latest-starting recording (ties broken by uri)
    LatestStart,
    /// The recording covering most of the segment
    LongestOverlap,
}

/// Plans the segments of a day
#[derive(Debug, Clone)]
pub struct SegmentPlanner {
    resolution_secs: u32,
    policy: OverlapPolicy,
}

impl SegmentPlanner {
    pub fn new(resolution_secs: u32) -> Self {
        Self {
            resolution_secs: resolution_secs.max(1),
            policy: OverlapPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: OverlapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resolution_secs(&self) -> u32 {
        self.resolution_secs
    }

    /// `ceil(86400 / resolution)` segments from 00:00 to 24:00.
    ///
    /// When the resolution does not divide the day the last segment is cut
    /// short at midnight.
    pub fn segments(&self, date: NaiveDate) -> Vec<Segment> {
        let resolution = self.resolution_secs as i64;
        let count = (SECONDS_PER_DAY + resolution - 1) / resolution;
        let midnight = day_start(date);

        (0..count)
            .map(|i| {
                let start = i * resolution;
                let end = (start + resolution).min(SECONDS_PER_DAY);
                Segment {
                    index: i as usize,
                    start: midnight + Duration::seconds(start),
                    end: midnight + Duration::seconds(end),
                }
            })
            .collect()
    }

    /// Resolve every segment of the inventory's day, in time order
    pub fn plan(&self, inventory: &DayInventory) -> Vec<(Segment, SegmentSource)> {
        let records = inventory.records();
        let mut cursor = 0;

        self.segments(inventory.date)
            .into_iter()
            .map(|segment| {
                let (lo, hi) = (segment.start_us(), segment.end_us());

                while cursor < records.len() && records[cursor].end_us() <= lo {
                    cursor += 1;
                }

                let candidates: Vec<&AudioFileRecord> = records[cursor..]
                    .iter()
                    .take_while(|r| r.start_us() < hi)
                    .filter(|r| r.end_us() > lo)
                    .collect();

                let source = self.resolve(&segment, candidates);
                (segment, source)
            })
            .collect()
    }

    /// Resolve one segment given the records intersecting it, in inventory order
    pub(crate) fn resolve(
        &self,
        segment: &Segment,
        mut candidates: Vec<&AudioFileRecord>,
    ) -> SegmentSource {
        if candidates.is_empty() {
            return SegmentSource::Gap;
        }

        let (lo, hi) = (segment.start_us(), segment.end_us());
        let overlap = |r: &AudioFileRecord| r.end_us().min(hi) - r.start_us().max(lo);

        match self.policy {
            OverlapPolicy::EarliestStart => {
                candidates.sort_by(|a, b| {
                    a.start_us()
                        .cmp(&b.start_us())
                        .then_with(|| a.uri().cmp(b.uri()))
                });
            }
            OverlapPolicy::LatestStart => {
                candidates.sort_by(|a, b| {
                    b.start_us()
                        .cmp(&a.start_us())
                        .then_with(|| a.uri().cmp(b.uri()))
                });
            }
            OverlapPolicy::LongestOverlap => {
                candidates.sort_by(|a, b| {
                    overlap(b)
                        .cmp(&overlap(a))
                        .then_with(|| a.start_us().cmp(&b.start_us()))
                        .then_with(|| a.uri().cmp(b.uri()))
                });
            }
        }

        let mut claimed: Vec<(i64, i64)> = Vec::new();
        let mut spans = Vec::new();
        for record in candidates {
            let clip = (record.start_us().max(lo), record.end_us().min(hi));
            for (s, e) in unclaimed(clip, &claimed) {
                spans.push(SubSpan {
                    record: record.clone(),
                    offset_us: s - record.start_us(),
                    duration_us: e - s,
                });
                claimed.push((s, e));
            }
            claimed.sort_unstable();
        }
        spans.sort_by_key(SubSpan::abs_start_us);

        let covered_us: i64 = spans.iter().map(|s| s.duration_us).sum();
        if covered_us == hi - lo {
            SegmentSource::Covered { spans }
        } else {
            SegmentSource::Partial { spans, covered_us }
        }
    }
}

impl Default for SegmentPlanner {
    fn default() -> Self {
        Self::new(60)
    }
}

/// Parts of `interval` not inside any of the sorted, disjoint `claimed` intervals
fn unclaimed(interval: (i64, i64), claimed: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let (mut s, e) = interval;
    let mut free = Vec::new();
    for &(cs, ce) in claimed {
        if ce <= s {
            continue;
        }
        if cs >= e {
            break;
        }
        if cs > s {
            free.push((s, cs));
        }
        s = s.max(ce);
        if s >= e {
            break;
        }
    }
    if s < e {
        free.push((s, e));
    }
    free
}
