// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! In-memory transit topology: stops, lines and directed segments, plus the
//! per-segment average-speed overlay layered on top after an analysis run.
//!
//! The structural graph is immutable once built. The overlay is an
//! atomically swapped snapshot, so query threads never observe a
//! partially-updated set of speeds.

use ahash::AHashMap;
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};

pub mod route_finder;


pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two WGS84 coordinates, in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin() * (d_lat / 2.0).sin()
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin()
            * (d_lon / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: i32,
    pub short_name: String,
    pub long_name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub line_id: i32,
    pub short_name: String,
    pub description: String,
}

/// Unique identity of one directed segment of the network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub line_id: i32,
    pub orientation: i16,
    pub sequence_num: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub line_id: i32,
    pub orientation: i16,
    pub sequence_num: i32,
    pub from_stop: i32,
    pub to_stop: i32,
    pub distance_km: f64,
    /// Filled from the speed overlay when the segment is exported, 0.0 when
    /// no analysis has covered it yet.
    pub avg_speed_kmh: f64,
}

impl Segment {
    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            line_id: self.line_id,
            orientation: self.orientation,
            sequence_num: self.sequence_num,
        }
    }
}

/// One row of the line-stop connectivity input: stop `stop_sequence` of
/// variant `line_variant` of a line, in one orientation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectivityTuple {
    pub line_id: i32,
    pub line_variant: i32,
    pub orientation: i16,
    pub stop_id: i32,
    pub stop_sequence: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub num_lines: usize,
    pub num_stops: usize,
    pub num_segments: usize,
    pub num_segments_orientation_0: usize,
    pub num_segments_orientation_1: usize,
}

pub struct TransitGraph {
    stops: AHashMap<i32, Stop>,
    lines: AHashMap<i32, Line>,
    segments: AHashMap<SegmentKey, Segment>,
    /// Outgoing segments per from-stop.
    outgoing: AHashMap<i32, Vec<SegmentKey>>,
    /// Segments per (line, orientation), sorted by sequence number.
    by_line: AHashMap<(i32, i16), Vec<SegmentKey>>,
    speed_overlay: RwLock<Arc<AHashMap<SegmentKey, f64>>>,
}

impl TransitGraph {
    /// Builds the graph from loaded stops, lines and connectivity tuples.
    ///
    /// Tuples are grouped by (line, variant, orientation) and sorted by
    /// sequence number; each consecutive pair becomes one directed segment.
    /// A tuple whose stop is missing from the stop set is skipped with a
    /// warning. Where two variants produce the same (line, orientation,
    /// sequence) key, the first segment wins.
    pub fn build(stops: Vec<Stop>, lines: Vec<Line>, tuples: Vec<ConnectivityTuple>) -> Self {
        let stops: AHashMap<i32, Stop> = stops.into_iter().map(|s| (s.stop_id, s)).collect();
        let lines: AHashMap<i32, Line> = lines.into_iter().map(|l| (l.line_id, l)).collect();

        let mut segments: AHashMap<SegmentKey, Segment> = AHashMap::new();
        let mut outgoing: AHashMap<i32, Vec<SegmentKey>> = AHashMap::new();
        let mut by_line: AHashMap<(i32, i16), Vec<SegmentKey>> = AHashMap::new();

        let mut grouped: AHashMap<(i32, i32, i16), Vec<ConnectivityTuple>> = AHashMap::new();
        for tuple in tuples {
            grouped
                .entry((tuple.line_id, tuple.line_variant, tuple.orientation))
                .or_default()
                .push(tuple);
        }

        for group in grouped.values_mut() {
            group.sort_by_key(|t| t.stop_sequence);

            for (current, next) in group.iter().tuple_windows() {
                let (from, to) = match (stops.get(&current.stop_id), stops.get(&next.stop_id)) {
                    (Some(from), Some(to)) => (from, to),
                    _ => {
                        warn!(
                            "skipping segment of line {} orientation {} seq {}: endpoint stop {} or {} not loaded",
                            current.line_id,
                            current.orientation,
                            current.stop_sequence,
                            current.stop_id,
                            next.stop_id
                        );
                        continue;
                    }
                };

                let key = SegmentKey {
                    line_id: current.line_id,
                    orientation: current.orientation,
                    sequence_num: current.stop_sequence,
                };

                match segments.entry(key) {
                    Entry::Occupied(_) => continue,
                    Entry::Vacant(vacant) => {
                        vacant.insert(Segment {
                            line_id: key.line_id,
                            orientation: key.orientation,
                            sequence_num: key.sequence_num,
                            from_stop: from.stop_id,
                            to_stop: to.stop_id,
                            distance_km: haversine_km(from.lat, from.lon, to.lat, to.lon),
                            avg_speed_kmh: 0.0,
                        });
                        outgoing.entry(from.stop_id).or_default().push(key);
                        by_line.entry((key.line_id, key.orientation)).or_default().push(key);
                    }
                }
            }
        }

        for keys in by_line.values_mut() {
            keys.sort_by_key(|k| k.sequence_num);
        }

        TransitGraph {
            stops,
            lines,
            segments,
            outgoing,
            by_line,
            speed_overlay: RwLock::new(Arc::new(AHashMap::new())),
        }
    }

    pub fn stop(&self, stop_id: i32) -> Option<&Stop> {
        self.stops.get(&stop_id)
    }

    pub fn has_stop(&self, stop_id: i32) -> bool {
        self.stops.contains_key(&stop_id)
    }

    pub fn line(&self, line_id: i32) -> Option<&Line> {
        self.lines.get(&line_id)
    }

    pub fn has_line(&self, line_id: i32) -> bool {
        self.lines.contains_key(&line_id)
    }

    pub fn segment(&self, key: &SegmentKey) -> Option<&Segment> {
        self.segments.get(key)
    }

    /// Outgoing segments whose from-stop is `stop_id`.
    pub fn segments_from(&self, stop_id: i32) -> &[SegmentKey] {
        self.outgoing.get(&stop_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Segment keys of one (line, orientation), ordered by sequence number.
    pub fn segment_keys_by_line(&self, line_id: i32, orientation: i16) -> &[SegmentKey] {
        self.by_line
            .get(&(line_id, orientation))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_stops_sorted(&self) -> Vec<Stop> {
        let mut stops: Vec<Stop> = self.stops.values().cloned().collect();
        stops.sort_by_key(|s| s.stop_id);
        stops
    }

    pub fn all_lines_sorted(&self) -> Vec<Line> {
        let mut lines: Vec<Line> = self.lines.values().cloned().collect();
        lines.sort_by_key(|l| l.line_id);
        lines
    }

    /// Every segment with its current overlay speed, ordered by
    /// (line, orientation, sequence).
    pub fn all_segments_sorted(&self) -> Vec<Segment> {
        let overlay = self.overlay_snapshot();
        let mut segments: Vec<Segment> = self
            .segments
            .values()
            .map(|s| export_with_speed(s, &overlay))
            .collect();
        segments.sort_by_key(|s| (s.line_id, s.orientation, s.sequence_num));
        segments
    }

    /// Segments of one (line, orientation) with overlay speeds, ordered by
    /// sequence number.
    pub fn segments_by_line(&self, line_id: i32, orientation: i16) -> Vec<Segment> {
        let overlay = self.overlay_snapshot();
        self.export_keys(self.segment_keys_by_line(line_id, orientation), &overlay)
    }

    /// Stops visited by one (line, orientation), in travel order: the first
    /// segment's from-stop followed by every segment's to-stop.
    pub fn stops_by_line(&self, line_id: i32, orientation: i16) -> Vec<Stop> {
        let keys = self.segment_keys_by_line(line_id, orientation);
        let mut stops = Vec::with_capacity(keys.len() + 1);

        for (i, key) in keys.iter().enumerate() {
            let Some(segment) = self.segments.get(key) else {
                continue;
            };
            if i == 0 {
                if let Some(from) = self.stops.get(&segment.from_stop) {
                    stops.push(from.clone());
                }
            }
            if let Some(to) = self.stops.get(&segment.to_stop) {
                stops.push(to.clone());
            }
        }

        stops
    }

    /// Resolves keys to wire segments with the current overlay speed filled
    /// in. The snapshot is taken once, so a whole path sees one consistent
    /// overlay.
    pub fn export_segments(&self, keys: &[SegmentKey]) -> Vec<Segment> {
        let overlay = self.overlay_snapshot();
        self.export_keys(keys, &overlay)
    }

    fn export_keys(&self, keys: &[SegmentKey], overlay: &AHashMap<SegmentKey, f64>) -> Vec<Segment> {
        keys.iter()
            .filter_map(|k| self.segments.get(k))
            .map(|s| export_with_speed(s, overlay))
            .collect()
    }

    /// Sets the overlay speed of one segment. Unknown keys are a no-op.
    pub fn apply_speed(&self, key: SegmentKey, avg_speed_kmh: f64) {
        if !self.segments.contains_key(&key) {
            return;
        }
        let mut overlay = self.speed_overlay.write().unwrap();
        Arc::make_mut(&mut overlay).insert(key, avg_speed_kmh);
    }

    /// Replaces the whole overlay in one atomic swap. Keys that do not name
    /// a known segment are dropped.
    pub fn swap_overlay(&self, speeds: AHashMap<SegmentKey, f64>) {
        let filtered: AHashMap<SegmentKey, f64> = speeds
            .into_iter()
            .filter(|(key, _)| self.segments.contains_key(key))
            .collect();
        *self.speed_overlay.write().unwrap() = Arc::new(filtered);
    }

    pub fn overlay_snapshot(&self) -> Arc<AHashMap<SegmentKey, f64>> {
        Arc::clone(&self.speed_overlay.read().unwrap())
    }

    /// Number of segments with an overlay speed set.
    pub fn num_segments_with_speed(&self) -> usize {
        self.overlay_snapshot().len()
    }

    pub fn statistics(&self) -> GraphStatistics {
        let num_segments_orientation_0 = self
            .segments
            .keys()
            .filter(|k| k.orientation == 0)
            .count();

        GraphStatistics {
            num_lines: self.lines.len(),
            num_stops: self.stops.len(),
            num_segments: self.segments.len(),
            num_segments_orientation_0,
            num_segments_orientation_1: self.segments.len() - num_segments_orientation_0,
        }
    }
}

fn export_with_speed(segment: &Segment, overlay: &AHashMap<SegmentKey, f64>) -> Segment {
    let mut out = segment.clone();
    out.avg_speed_kmh = overlay.get(&segment.key()).copied().unwrap_or(0.0);
    out
}
