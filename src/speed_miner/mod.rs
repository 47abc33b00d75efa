// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Single-pass mining of vehicle position pings into per-segment
//! time/distance samples.
//!
//! A shard is a half-open range of record numbers into the shared ping
//! dataset. Memory use is bounded by the number of active buses plus the
//! number of segments that received at least one sample, never by the
//! shard's record count.

use crate::transit_graph::{SegmentKey, TransitGraph, haversine_km};
use ahash::AHashMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// A ping farther than this from the nearest candidate segment's from-stop
/// is left unmatched.
pub const SNAP_THRESHOLD_KM: f64 = 0.5;

/// Implied speeds above this are treated as noise and discarded.
pub const MAX_PLAUSIBLE_SPEED_KMH: f64 = 120.0;

pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// One parsed vehicle position record.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PositionPing {
    pub bus_id: i32,
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub line_id: i32,
}

/// Commutative (sum distance, sum time, count) accumulator for one segment.
/// Partial accumulators from independent shards merge in any order and any
/// grouping to the same totals.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleAccumulator {
    pub sum_distance_km: f64,
    pub sum_time_ms: i64,
    pub count: i64,
}

impl SampleAccumulator {
    pub fn record(&mut self, distance_km: f64, elapsed_ms: i64) {
        self.sum_distance_km += distance_km;
        self.sum_time_ms += elapsed_ms;
        self.count += 1;
    }

    pub fn add(&mut self, other: &SampleAccumulator) {
        self.sum_distance_km += other.sum_distance_km;
        self.sum_time_ms += other.sum_time_ms;
        self.count += other.count;
    }

    pub fn avg_speed_kmh(&self) -> Option<f64> {
        if self.sum_time_ms > 0 && self.count > 0 {
            Some(self.sum_distance_km / (self.sum_time_ms as f64 / MS_PER_HOUR))
        } else {
            None
        }
    }
}

/// Wire form of one segment's accumulator, as returned by a mining shard.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentSample {
    pub key: SegmentKey,
    pub sum_distance_km: f64,
    pub sum_time_ms: i64,
    pub count: i64,
}

impl SegmentSample {
    pub fn accumulator(&self) -> SampleAccumulator {
        SampleAccumulator {
            sum_distance_km: self.sum_distance_km,
            sum_time_ms: self.sum_time_ms,
            count: self.count,
        }
    }
}

/// Last matched segment and last ping of one bus. Held only for the
/// duration of a single shard pass.
#[derive(Copy, Clone, Debug)]
struct BusState {
    segment: SegmentKey,
    last_ping: PositionPing,
}

/// Parses one raw dataset record. Fixed comma-separated positions: index 2
/// is the bus id, 4 and 5 the coordinates scaled by 10^7, 7 the line id,
/// 9 the timestamp in milliseconds. Anything malformed yields `None`.
pub fn parse_ping(record: &str) -> Option<PositionPing> {
    let fields: Vec<&str> = record.split(',').collect();
    if fields.len() < 10 {
        return None;
    }

    Some(PositionPing {
        bus_id: fields[2].parse().ok()?,
        lat: fields[4].parse::<f64>().ok()? / 10_000_000.0,
        lon: fields[5].parse::<f64>().ok()? / 10_000_000.0,
        line_id: fields[7].parse().ok()?,
        timestamp_ms: fields[9].parse().ok()?,
    })
}

/// Matches a ping to the candidate segment of its line (both orientations)
/// whose from-stop is geographically closest, within the snap threshold.
pub fn match_segment(graph: &TransitGraph, ping: &PositionPing) -> Option<SegmentKey> {
    let mut best: Option<(SegmentKey, f64)> = None;

    for orientation in [0i16, 1] {
        for key in graph.segment_keys_by_line(ping.line_id, orientation) {
            let Some(segment) = graph.segment(key) else {
                continue;
            };
            let Some(from) = graph.stop(segment.from_stop) else {
                continue;
            };
            let distance = haversine_km(ping.lat, ping.lon, from.lat, from.lon);
            if best.is_none_or(|(_, best_distance)| distance < best_distance) {
                best = Some((*key, distance));
            }
        }
    }

    match best {
        Some((key, distance)) if distance <= SNAP_THRESHOLD_KM => Some(key),
        _ => None,
    }
}

/// Mines the records numbered `[start_record, end_record)` (1-based,
/// `None` = to end of data) out of `reader`. Records before the range are
/// skipped, malformed records never abort the shard.
pub fn mine_shard<R: BufRead>(
    graph: &TransitGraph,
    reader: R,
    start_record: u64,
    end_record: Option<u64>,
) -> AHashMap<SegmentKey, SampleAccumulator> {
    let mut stats: AHashMap<SegmentKey, SampleAccumulator> = AHashMap::new();
    let mut bus_states: AHashMap<i32, BusState> = AHashMap::new();
    let mut processed: u64 = 0;

    for (idx, record) in reader.lines().enumerate() {
        let record_num = idx as u64 + 1;
        if record_num < start_record {
            continue;
        }
        if let Some(end) = end_record {
            if record_num >= end {
                break;
            }
        }

        processed += 1;
        if processed % 100_000 == 0 {
            info!("shard progress: {} records processed", processed);
        }

        let Ok(record) = record else {
            continue;
        };
        let Some(ping) = parse_ping(&record) else {
            continue;
        };
        let Some(current_key) = match_segment(graph, &ping) else {
            continue;
        };

        match bus_states.get_mut(&ping.bus_id) {
            // Still traversing the same segment.
            Some(state) if state.segment == current_key => {
                state.last_ping = ping;
            }
            Some(state) => {
                let last_key = state.segment;
                let adjacent = last_key.line_id == current_key.line_id
                    && (current_key.sequence_num - last_key.sequence_num).abs() == 1;

                if adjacent {
                    let elapsed_ms = ping.timestamp_ms - state.last_ping.timestamp_ms;
                    if elapsed_ms > 0 {
                        if let Some(last_segment) = graph.segment(&last_key) {
                            let implied_kmh =
                                last_segment.distance_km / (elapsed_ms as f64 / MS_PER_HOUR);
                            if implied_kmh <= MAX_PLAUSIBLE_SPEED_KMH {
                                stats
                                    .entry(last_key)
                                    .or_default()
                                    .record(last_segment.distance_km, elapsed_ms);
                            }
                        }
                    }
                }

                // Non-adjacent transitions are a new trip fragment: no
                // sample, no interpolation across skipped segments.
                state.segment = current_key;
                state.last_ping = ping;
            }
            None => {
                bus_states.insert(
                    ping.bus_id,
                    BusState {
                        segment: current_key,
                        last_ping: ping,
                    },
                );
            }
        }
    }

    stats
}

/// Mines a shard out of a dataset file on the local filesystem.
pub fn mine_shard_file(
    graph: &TransitGraph,
    path: &Path,
    start_record: u64,
    end_record: Option<u64>,
) -> io::Result<AHashMap<SegmentKey, SampleAccumulator>> {
    let file = File::open(path)?;
    Ok(mine_shard(graph, BufReader::new(file), start_record, end_record))
}

/// Flattens an accumulator map into the wire form, ordered by key.
pub fn to_samples(stats: &AHashMap<SegmentKey, SampleAccumulator>) -> Vec<SegmentSample> {
    let mut samples: Vec<SegmentSample> = stats
        .iter()
        .map(|(key, acc)| SegmentSample {
            key: *key,
            sum_distance_km: acc.sum_distance_km,
            sum_time_ms: acc.sum_time_ms,
            count: acc.count,
        })
        .collect();
    samples.sort_by_key(|s| s.key);
    samples
}

/// Merges a shard's samples into an aggregate map by summing matching keys.
pub fn merge_samples(
    aggregate: &mut AHashMap<SegmentKey, SampleAccumulator>,
    samples: &[SegmentSample],
) {
    for sample in samples {
        aggregate
            .entry(sample.key)
            .or_default()
            .add(&sample.accumulator());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transit_graph::{ConnectivityTuple, Line, Stop};
    use std::io::Cursor;

    // Four stops spaced 0.01 degrees of longitude apart along the equator,
    // one line with three sequential segments in orientation 0.
    fn test_graph() -> TransitGraph {
        let stops = (0..4)
            .map(|i| Stop {
                stop_id: 100 + i,
                short_name: format!("S{i}"),
                long_name: format!("Stop {i}"),
                lat: 0.0,
                lon: 0.01 * i as f64,
            })
            .collect();
        let lines = vec![Line {
            line_id: 7,
            short_name: "T31".to_string(),
            description: "Test line".to_string(),
        }];
        let tuples = (0..4)
            .map(|i| ConnectivityTuple {
                line_id: 7,
                line_variant: 1,
                orientation: 0,
                stop_id: 100 + i,
                stop_sequence: i + 1,
            })
            .collect();

        TransitGraph::build(stops, lines, tuples)
    }

    fn record(bus_id: i32, line_id: i32, lat: f64, lon: f64, timestamp_ms: i64) -> String {
        format!(
            "0,01-JAN-26,{},6277,{},{},497,{},9921,{},2026-01-01 00:00:21,837",
            bus_id,
            (lat * 10_000_000.0).round() as i64,
            (lon * 10_000_000.0).round() as i64,
            line_id,
            timestamp_ms
        )
    }

    fn key(sequence_num: i32) -> SegmentKey {
        SegmentKey {
            line_id: 7,
            orientation: 0,
            sequence_num,
        }
    }

    #[test]
    fn parses_well_formed_record() {
        let ping = parse_ping(&record(504016, 131, 3.4483433, -76.5233667, 5445120768)).unwrap();
        assert_eq!(ping.bus_id, 504016);
        assert_eq!(ping.line_id, 131);
        assert_eq!(ping.timestamp_ms, 5445120768);
        assert!((ping.lat - 3.4483433).abs() < 1e-9);
        assert!((ping.lon - (-76.5233667)).abs() < 1e-9);
    }

    #[test]
    fn rejects_malformed_records() {
        assert!(parse_ping("").is_none());
        assert!(parse_ping("1,2,3").is_none());
        assert!(parse_ping("0,x,not-a-bus,6277,345,-765,497,131,9921,5445120768").is_none());
        assert!(parse_ping("0,x,42,6277,345,-765,497,131,9921,not-a-timestamp").is_none());
    }

    #[test]
    fn matches_nearest_from_stop_within_threshold() {
        let graph = test_graph();

        // Right on top of stop 101, the from-stop of segment seq 2.
        let ping = parse_ping(&record(1, 7, 0.0, 0.01, 1000)).unwrap();
        assert_eq!(match_segment(&graph, &ping), Some(key(2)));

        // Unknown line has no candidates.
        let ping = parse_ping(&record(1, 99, 0.0, 0.01, 1000)).unwrap();
        assert_eq!(match_segment(&graph, &ping), None);
    }

    #[test]
    fn discards_pings_beyond_snap_threshold() {
        let graph = test_graph();
        // ~1.1 km north of the nearest from-stop.
        let ping = parse_ping(&record(1, 7, 0.01, 0.0, 1000)).unwrap();
        assert_eq!(match_segment(&graph, &ping), None);
    }

    #[test]
    fn adjacent_transition_records_sample_for_last_segment() {
        let graph = test_graph();
        // Bus 1 sits at stop 100 (segment seq 1), then 200 s later at stop
        // 101 (segment seq 2): one sample for segment 1 at ~20 km/h.
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0, 0.01, 1_200_000),
        ]
        .join("\n");

        let stats = mine_shard(&graph, Cursor::new(data), 1, None);
        assert_eq!(stats.len(), 1);

        let acc = stats[&key(1)];
        assert_eq!(acc.count, 1);
        assert_eq!(acc.sum_time_ms, 200_000);
        let expected_distance = graph.segment(&key(1)).unwrap().distance_km;
        assert!((acc.sum_distance_km - expected_distance).abs() < 1e-9);
        let speed = acc.avg_speed_kmh().unwrap();
        assert!(speed > 19.0 && speed < 21.0, "speed was {speed}");
    }

    #[test]
    fn same_segment_pings_only_update_state() {
        let graph = test_graph();
        // Two pings on the same segment, then a transition. The elapsed
        // time must span from the *latest* ping on the old segment.
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0001, 0.0, 1_100_000),
            record(1, 7, 0.0, 0.01, 1_300_000),
        ]
        .join("\n");

        let stats = mine_shard(&graph, Cursor::new(data), 1, None);
        let acc = stats[&key(1)];
        assert_eq!(acc.count, 1);
        assert_eq!(acc.sum_time_ms, 200_000);
    }

    #[test]
    fn outlier_speed_is_never_recorded() {
        let graph = test_graph();
        // Same transition but only 10 s elapsed: ~400 km/h, discarded.
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0, 0.01, 1_010_000),
        ]
        .join("\n");

        let stats = mine_shard(&graph, Cursor::new(data), 1, None);
        assert!(stats.is_empty());
    }

    #[test]
    fn non_positive_elapsed_time_is_ignored() {
        let graph = test_graph();
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0, 0.01, 1_000_000),
        ]
        .join("\n");

        let stats = mine_shard(&graph, Cursor::new(data), 1, None);
        assert!(stats.is_empty());
    }

    #[test]
    fn sequence_jump_starts_new_trip_fragment() {
        let graph = test_graph();
        // Seq 1 to seq 3 is not adjacent: no sample, but state advances, so
        // the following seq 3 -> seq 2 transition does record one.
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0, 0.02, 1_200_000),
            record(1, 7, 0.0, 0.01, 1_400_000),
        ]
        .join("\n");

        let stats = mine_shard(&graph, Cursor::new(data), 1, None);
        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key(&key(3)));
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let graph = test_graph();
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            "garbage,line".to_string(),
            String::new(),
            record(1, 7, 0.0, 0.01, 1_200_000),
        ]
        .join("\n");

        let stats = mine_shard(&graph, Cursor::new(data), 1, None);
        assert_eq!(stats[&key(1)].count, 1);
    }

    #[test]
    fn respects_shard_bounds() {
        let graph = test_graph();
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0, 0.01, 1_200_000),
            record(1, 7, 0.0, 0.02, 1_400_000),
        ]
        .join("\n");

        // Only records 1 and 2: the 2 -> 3 transition is outside the shard.
        let stats = mine_shard(&graph, Cursor::new(&data), 1, Some(3));
        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key(&key(1)));

        // Records 2 and 3 only: the bus state starts fresh at record 2.
        let stats = mine_shard(&graph, Cursor::new(&data), 2, None);
        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key(&key(2)));
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = vec![
            SegmentSample {
                key: key(1),
                sum_distance_km: 2.0,
                sum_time_ms: 600_000,
                count: 2,
            },
            SegmentSample {
                key: key(2),
                sum_distance_km: 1.0,
                sum_time_ms: 300_000,
                count: 1,
            },
        ];
        let b = vec![SegmentSample {
            key: key(1),
            sum_distance_km: 3.0,
            sum_time_ms: 900_000,
            count: 3,
        }];
        let c = vec![SegmentSample {
            key: key(2),
            sum_distance_km: 0.5,
            sum_time_ms: 150_000,
            count: 1,
        }];

        let mut ab_c: AHashMap<SegmentKey, SampleAccumulator> = AHashMap::new();
        merge_samples(&mut ab_c, &a);
        merge_samples(&mut ab_c, &b);
        merge_samples(&mut ab_c, &c);

        let mut c_ba: AHashMap<SegmentKey, SampleAccumulator> = AHashMap::new();
        merge_samples(&mut c_ba, &c);
        merge_samples(&mut c_ba, &b);
        merge_samples(&mut c_ba, &a);

        assert_eq!(ab_c, c_ba);
        assert_eq!(ab_c[&key(1)].count, 5);
        assert_eq!(ab_c[&key(2)].count, 2);
        assert!((ab_c[&key(1)].sum_distance_km - 5.0).abs() < 1e-9);
    }

    #[test]
    fn shard_split_equals_whole_when_buses_do_not_straddle() {
        let graph = test_graph();
        // Bus 1 entirely in the first shard, bus 2 entirely in the second.
        let data = [
            record(1, 7, 0.0, 0.0, 1_000_000),
            record(1, 7, 0.0, 0.01, 1_200_000),
            record(1, 7, 0.0, 0.02, 1_500_000),
            record(2, 7, 0.0, 0.0, 2_000_000),
            record(2, 7, 0.0, 0.01, 2_300_000),
        ]
        .join("\n");

        let whole = mine_shard(&graph, Cursor::new(&data), 1, None);

        let first = mine_shard(&graph, Cursor::new(&data), 1, Some(4));
        let second = mine_shard(&graph, Cursor::new(&data), 4, None);

        let mut merged: AHashMap<SegmentKey, SampleAccumulator> = AHashMap::new();
        merge_samples(&mut merged, &to_samples(&first));
        merge_samples(&mut merged, &to_samples(&second));

        assert_eq!(merged, whole);
    }
}
