//! Tests for segment planning

use super::*;
use crate::day::{day_end, parse_date};
use crate::inventory::{DayInventoryBuilder, MICROS_PER_SEC};
use chrono::TimeZone;

const DAY: i64 = 86_400;

fn date() -> NaiveDate {
    parse_date("20220902").unwrap()
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 9, 2, h, m, s).unwrap()
}

fn rec(uri: &str, start: DateTime<Utc>, secs: f64) -> AudioFileRecord {
    AudioFileRecord::new(uri, start, secs, 1).unwrap()
}

fn inventory(date: NaiveDate, records: &[AudioFileRecord]) -> DayInventory {
    DayInventoryBuilder::build(date, records)
}

fn effort(source: &SegmentSource) -> f64 {
    source.covered_secs()
}

/// Small deterministic generator for inventories
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn random_records(seed: u64, count: usize) -> Vec<AudioFileRecord> {
    let mut rng = Lcg(seed);
    let midnight = day_start(date());
    (0..count)
        .map(|i| {
            // starts from one hour before the day to one hour into the next
            let offset_ms = rng.below((DAY as u64 + 7200) * 1000) as i64 - 3_600_000;
            let duration = 1.0 + rng.below(3_600_000) as f64 / 1000.0;
            rec(
                &format!("s3://bucket/rec_{:03}_{}.wav", i, rng.below(5)),
                midnight + Duration::milliseconds(offset_ms),
                duration,
            )
        })
        .collect()
}

fn divisors_of_day() -> Vec<u32> {
    (1..=DAY as u32).filter(|r| DAY as u32 % r == 0).collect()
}

#[test]
fn test_divisor_resolutions_partition_the_day() {
    let date = date();
    for resolution in divisors_of_day() {
        let segments = SegmentPlanner::new(resolution).segments(date);
        assert_eq!(segments.len() as i64, DAY / resolution as i64, "R={resolution}");
        assert_eq!(segments[0].start, day_start(date));
        assert_eq!(segments[segments.len() - 1].end, day_end(date));
        for (i, pair) in segments.windows(2).enumerate() {
            assert_eq!(pair[0].end, pair[1].start, "R={resolution} i={i}");
            assert_eq!(pair[0].index + 1, pair[1].index);
            assert_eq!(pair[0].width_us(), resolution as i64 * MICROS_PER_SEC);
        }
    }
}

#[test]
fn test_non_divisor_resolution_truncates_last_segment() {
    let segments = SegmentPlanner::new(7).segments(date());
    assert_eq!(segments.len(), 12_343);
    let last = segments[segments.len() - 1];
    assert_eq!(last.width_secs(), 6.0);
    assert_eq!(last.end, day_end(date()));

    let segments = SegmentPlanner::new(86_400 + 1).segments(date());
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].width_secs(), 86_400.0);
}

#[test]
fn test_empty_inventory_is_all_gaps() {
    let plan = SegmentPlanner::new(60).plan(&inventory(date(), &[]));
    assert_eq!(plan.len(), 1440);
    for (_, source) in &plan {
        assert_eq!(*source, SegmentSource::Gap);
        assert_eq!(effort(source), 0.0);
    }
}

#[test]
fn test_whole_day_file_covers_every_segment() {
    for resolution in [1, 60, 300, 3600, 86_400] {
        let records = vec![rec("day.wav", at(0, 0, 0), DAY as f64)];
        let plan = SegmentPlanner::new(resolution).plan(&inventory(date(), &records));
        for (segment, source) in &plan {
            let SegmentSource::Covered { spans } = source else {
                panic!("segment {} not covered", segment.index);
            };
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].offset_us, segment.start_us() - day_start(date()).timestamp_micros());
            assert_eq!(effort(source), resolution as f64);
        }
    }
}

#[test]
fn test_planning_is_deterministic() {
    for seed in 0..20 {
        let records = random_records(seed, 200);
        let inv = inventory(date(), &records);
        let planner = SegmentPlanner::new(60);
        assert_eq!(planner.plan(&inv), planner.plan(&inv), "seed {seed}");

        // input order does not matter
        let mut reversed = records.clone();
        reversed.reverse();
        assert_eq!(planner.plan(&inv), planner.plan(&inventory(date(), &reversed)));
    }
}

#[test]
fn test_cursor_scan_matches_full_scan() {
    for policy in [
        OverlapPolicy::EarliestStart,
        OverlapPolicy::LatestStart,
        OverlapPolicy::LongestOverlap,
    ] {
        for seed in 0..10 {
            let records = random_records(seed * 7 + 1, 300);
            let inv = inventory(date(), &records);
            let planner = SegmentPlanner::new(120).with_policy(policy);

            for (segment, source) in planner.plan(&inv) {
                let all: Vec<&AudioFileRecord> = inv
                    .records()
                    .iter()
                    .filter(|r| r.intersects(segment.start_us(), segment.end_us()))
                    .collect();
                assert_eq!(source, planner.resolve(&segment, all), "{policy:?} seed {seed}");
            }
        }
    }
}

#[test]
fn test_effort_equals_union_of_coverage() {
    for seed in 0..10 {
        let records = random_records(seed + 100, 150);
        let inv = inventory(date(), &records);
        let plan = SegmentPlanner::new(60).plan(&inv);

        let lo = day_start(date()).timestamp_micros();
        let hi = day_end(date()).timestamp_micros();
        let mut intervals: Vec<(i64, i64)> = inv
            .records()
            .iter()
            .map(|r| (r.start_us().max(lo), r.end_us().min(hi)))
            .collect();
        intervals.sort_unstable();
        let mut union = 0;
        let mut reach = lo;
        for (s, e) in intervals {
            let s = s.max(reach);
            if e > s {
                union += e - s;
                reach = e;
            }
        }

        let total: i64 = plan.iter().map(|(_, source)| source.covered_us()).sum();
        assert_eq!(total, union, "seed {seed}");

        for (segment, source) in &plan {
            assert!(source.covered_us() <= segment.width_us());
            let spans = source.spans();
            for pair in spans.windows(2) {
                assert!(pair[0].abs_end_us() <= pair[1].abs_start_us());
            }
            for span in spans {
                assert!(span.abs_start_us() >= segment.start_us());
                assert!(span.abs_end_us() <= segment.end_us());
                assert!(span.duration_us > 0);
            }
        }
    }
}

#[test]
fn test_file_crossing_midnight_is_split_between_days() {
    let records = vec![rec("late.wav", at(23, 59, 30), 60.0)];
    let planner = SegmentPlanner::new(60);

    let day_n = planner.plan(&inventory(date(), &records));
    let (_, last) = &day_n[day_n.len() - 1];
    match last {
        SegmentSource::Partial { spans, covered_us } => {
            assert_eq!(*covered_us, 30 * MICROS_PER_SEC);
            assert_eq!(spans[0].offset_us, 0);
        }
        other => panic!("unexpected {other:?}"),
    }

    let next = parse_date("20220903").unwrap();
    let day_n1 = planner.plan(&inventory(next, &records));
    let (_, first) = &day_n1[0];
    match first {
        SegmentSource::Partial { spans, covered_us } => {
            assert_eq!(*covered_us, 30 * MICROS_PER_SEC);
            assert_eq!(spans[0].offset_us, 30 * MICROS_PER_SEC);
        }
        other => panic!("unexpected {other:?}"),
    }

    let total: f64 = day_n
        .iter()
        .chain(day_n1.iter())
        .map(|(_, source)| effort(source))
        .sum();
    assert_eq!(total, 60.0);
}

#[test]
fn test_earliest_start_wins_overlap() {
    let records = vec![
        rec("b.wav", at(10, 0, 0), 60.0),
        rec("a.wav", at(9, 59, 0), 120.0),
    ];
    let inv = inventory(date(), &records);
    let plan = SegmentPlanner::new(60).plan(&inv);

    let (_, source) = &plan[600];
    let SegmentSource::Covered { spans } = source else {
        panic!("expected covered, got {source:?}");
    };
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].record.uri(), "a.wav");
    assert_eq!(spans[0].offset_us, 60 * MICROS_PER_SEC);

    // identical starts fall back to uri order
    let twins = vec![
        rec("z.wav", at(10, 0, 0), 60.0),
        rec("m.wav", at(10, 0, 0), 60.0),
    ];
    for _ in 0..3 {
        let plan = SegmentPlanner::new(60).plan(&inventory(date(), &twins));
        assert_eq!(plan[600].1.spans()[0].record.uri(), "m.wav");
    }
}

#[test]
fn test_later_file_fills_only_unclaimed_time() {
    // a ends 10:00:20, b (10:00:10 - 10:01:10) overlaps it by 10s
    let records = vec![
        rec("a.wav", at(9, 50, 20), 600.0),
        rec("b.wav", at(10, 0, 10), 60.0),
    ];
    let plan = SegmentPlanner::new(60).plan(&inventory(date(), &records));
    let SegmentSource::Covered { spans } = &plan[600].1 else {
        panic!("expected covered");
    };
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].record.uri(), "a.wav");
    assert_eq!(spans[0].duration_us, 20 * MICROS_PER_SEC);
    assert_eq!(spans[1].record.uri(), "b.wav");
    assert_eq!(spans[1].offset_us, 10 * MICROS_PER_SEC);
    assert_eq!(spans[1].duration_us, 40 * MICROS_PER_SEC);
}

#[test]
fn test_alternative_policies() {
    let records = vec![
        rec("early.wav", at(9, 59, 50), 20.0),
        rec("late.wav", at(10, 0, 5), 600.0),
    ];
    let inv = inventory(date(), &records);

    let earliest = SegmentPlanner::new(60).plan(&inv);
    assert_eq!(earliest[600].1.spans()[0].duration_us, 10 * MICROS_PER_SEC);

    let latest = SegmentPlanner::new(60)
        .with_policy(OverlapPolicy::LatestStart)
        .plan(&inv);
    let spans = latest[600].1.spans();
    assert_eq!(spans[0].record.uri(), "early.wav");
    assert_eq!(spans[0].duration_us, 5 * MICROS_PER_SEC);
    assert_eq!(spans[1].record.uri(), "late.wav");

    let longest = SegmentPlanner::new(60)
        .with_policy(OverlapPolicy::LongestOverlap)
        .plan(&inv);
    assert_eq!(longest[600].1.covered_secs(), 60.0);
    let spans = longest[600].1.spans();
    assert_eq!(spans[0].record.uri(), "early.wav");
    assert_eq!(spans[0].duration_us, 5 * MICROS_PER_SEC);
}

#[test]
fn test_splice_at_file_boundary_is_covered() {
    let records = vec![
        rec("a.wav", at(10, 0, 0), 30.5),
        rec("b.wav", at(10, 0, 30), 600.0),
    ];
    let plan = SegmentPlanner::new(60).plan(&inventory(date(), &records));
    let SegmentSource::Covered { spans } = &plan[600].1 else {
        panic!("expected covered");
    };
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].abs_end_us(), spans[1].abs_start_us());
    assert_eq!(spans[1].offset_us, MICROS_PER_SEC / 2);
}

#[test]
fn test_file_ending_mid_segment_is_partial() {
    let records = vec![rec("a.wav", at(10, 0, 0), 45.0)];
    let plan = SegmentPlanner::new(60).plan(&inventory(date(), &records));
    assert!(matches!(
        plan[600].1,
        SegmentSource::Partial { covered_us, .. } if covered_us == 45 * MICROS_PER_SEC
    ));
    assert!(plan[601].1.is_gap());
}

#[test]
fn test_long_file_does_not_hide_later_short_files() {
    // the cursor stops at the long file; shorter ones behind it must still be found
    let mut records = vec![rec("long.wav", at(0, 0, 0), 7200.0)];
    for i in 0..100 {
        records.push(rec(&format!("short_{i:03}.wav"), at(1, i / 2, 0), 10.0));
    }
    let inv = inventory(date(), &records);
    let plan = SegmentPlanner::new(60)
        .with_policy(OverlapPolicy::LatestStart)
        .plan(&inv);
    let spans = plan[61].1.spans();
    assert!(spans.iter().any(|s| s.record.uri().starts_with("short_")));
}

#[test]
fn test_end_to_end_scenario() {
    let records = vec![
        rec("uri_a", at(0, 0, 0), 1800.0),
        rec("uri_b", at(0, 40, 0), 1800.0),
    ];
    let plan = SegmentPlanner::new(60).plan(&inventory(date(), &records));
    assert_eq!(plan.len(), 1440);

    for (segment, source) in &plan {
        match segment.index {
            0..=29 | 40..=69 => {
                assert!(matches!(source, SegmentSource::Covered { .. }), "{}", segment.index);
                assert_eq!(effort(source), 60.0);
            }
            _ => {
                assert!(source.is_gap(), "{}", segment.index);
                assert_eq!(effort(source), 0.0);
            }
        }
    }
    assert_eq!(plan[45].1.spans()[0].record.uri(), "uri_b");
    assert_eq!(plan[45].1.spans()[0].offset_us, 300 * MICROS_PER_SEC);
}
