// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Breadth-first route search over the directed segment graph.
//!
//! The search minimises the number of segments on the path, not distance or
//! travel time. That is the externally observable contract of the route
//! queries and must not be swapped for a weighted shortest path.

use super::{Segment, SegmentKey, Stop, TransitGraph};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Assumed speed for segments no analysis run has covered yet.
pub const FALLBACK_SPEED_KMH: f64 = 15.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub found: bool,
    pub message: String,
    pub stops: Vec<Stop>,
    pub segments: Vec<Segment>,
    pub total_distance: f64,
    pub num_transfers: i32,
}

impl RouteResult {
    fn not_found(message: String) -> Self {
        RouteResult {
            found: false,
            message,
            stops: Vec::new(),
            segments: Vec::new(),
            total_distance: 0.0,
            num_transfers: 0,
        }
    }
}

/// Shortest route by hop count between two stops.
pub fn shortest_route(graph: &TransitGraph, origin_stop_id: i32, dest_stop_id: i32) -> RouteResult {
    let Some(origin) = graph.stop(origin_stop_id) else {
        return RouteResult::not_found(format!("origin stop not found: {origin_stop_id}"));
    };
    if !graph.has_stop(dest_stop_id) {
        return RouteResult::not_found(format!("destination stop not found: {dest_stop_id}"));
    }

    if origin_stop_id == dest_stop_id {
        return RouteResult {
            found: true,
            message: "origin and destination are the same stop".to_string(),
            stops: vec![origin.clone()],
            segments: Vec::new(),
            total_distance: 0.0,
            num_transfers: 0,
        };
    }

    // Parent pointers: stop -> (previous stop, segment used to reach it).
    let mut parent: AHashMap<i32, (i32, SegmentKey)> = AHashMap::new();
    let mut visited: AHashSet<i32> = AHashSet::new();
    let mut queue: VecDeque<i32> = VecDeque::new();

    visited.insert(origin_stop_id);
    queue.push_back(origin_stop_id);

    let mut found = false;

    'search: while let Some(current) = queue.pop_front() {
        for key in graph.segments_from(current) {
            let Some(segment) = graph.segment(key) else {
                continue;
            };
            let next = segment.to_stop;

            if visited.insert(next) {
                parent.insert(next, (current, *key));
                queue.push_back(next);

                if next == dest_stop_id {
                    found = true;
                    break 'search;
                }
            }
        }
    }

    if !found {
        return RouteResult::not_found(format!(
            "no route found between stops {origin_stop_id} and {dest_stop_id}"
        ));
    }

    // Walk parent pointers back from the destination.
    let mut stop_ids = vec![dest_stop_id];
    let mut path_keys: Vec<SegmentKey> = Vec::new();
    let mut current = dest_stop_id;

    while current != origin_stop_id {
        let (previous, key) = parent[&current];
        path_keys.push(key);
        stop_ids.push(previous);
        current = previous;
    }

    stop_ids.reverse();
    path_keys.reverse();

    let stops: Vec<Stop> = stop_ids
        .iter()
        .filter_map(|id| graph.stop(*id))
        .cloned()
        .collect();
    let segments = graph.export_segments(&path_keys);

    let total_distance: f64 = segments.iter().map(|s| s.distance_km).sum();
    let num_transfers = count_transfers(&segments);

    RouteResult {
        found: true,
        message: format!(
            "route found: {} stops, {:.2} km, {} transfers",
            stops.len(),
            total_distance,
            num_transfers
        ),
        stops,
        segments,
        total_distance,
        num_transfers,
    }
}

/// Every stop reachable from the origin, origin included. Unknown origin
/// yields the empty set.
pub fn reachable_stops(graph: &TransitGraph, origin_stop_id: i32) -> AHashSet<i32> {
    let mut reachable: AHashSet<i32> = AHashSet::new();

    if !graph.has_stop(origin_stop_id) {
        return reachable;
    }

    let mut queue: VecDeque<i32> = VecDeque::new();
    reachable.insert(origin_stop_id);
    queue.push_back(origin_stop_id);

    while let Some(current) = queue.pop_front() {
        for key in graph.segments_from(current) {
            let Some(segment) = graph.segment(key) else {
                continue;
            };
            if reachable.insert(segment.to_stop) {
                queue.push_back(segment.to_stop);
            }
        }
    }

    reachable
}

/// Estimated travel time over a path, in minutes, using each segment's
/// mined average speed where one is set and [`FALLBACK_SPEED_KMH`]
/// otherwise. Only meaningful once the overlay has been populated.
pub fn estimated_travel_time_minutes(segments: &[Segment]) -> f64 {
    segments
        .iter()
        .map(|segment| {
            let speed = if segment.avg_speed_kmh > 0.0 {
                segment.avg_speed_kmh
            } else {
                FALLBACK_SPEED_KMH
            };
            segment.distance_km / speed * 60.0
        })
        .sum()
}

fn count_transfers(segments: &[Segment]) -> i32 {
    segments
        .windows(2)
        .filter(|pair| pair[0].line_id != pair[1].line_id)
        .count() as i32
}
