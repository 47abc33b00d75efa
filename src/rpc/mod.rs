// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Service definitions for the master and worker RPC surfaces, the wire
//! types they exchange, and client spawn helpers.

use crate::speed_miner::SegmentSample;
use crate::transit_graph::route_finder::{self, RouteResult};
use crate::transit_graph::{GraphStatistics, Line, Segment, Stop, TransitGraph};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tarpc::{client, tokio_serde::formats::Bincode};

/// Typed, recoverable query failures. These travel inside the RPC response
/// payload; transport-level failures are a separate layer and trigger the
/// master's local fallback instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum QueryError {
    #[error("stop not found: {stop_id}")]
    StopNotFound { stop_id: i32 },
    #[error("line not found: {line_id}")]
    LineNotFound { line_id: i32 },
    #[error("invalid orientation: {orientation}, must be 0 or 1")]
    InvalidOrientation { orientation: i16 },
}

/// Identity a worker registers with the master: an opaque id plus the
/// socket address its own RPC server listens on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub addr: SocketAddr,
}

/// The master's service surface: graph queries, route queries (dispatched
/// round-robin to workers with local fallback) and worker registration.
#[tarpc::service]
pub trait BuswayRpc {
    async fn get_all_stops() -> Vec<Stop>;

    async fn get_all_lines() -> Vec<Line>;

    async fn get_all_segments() -> Vec<Segment>;

    async fn get_graph_statistics() -> GraphStatistics;

    async fn find_route(origin_stop_id: i32, dest_stop_id: i32)
    -> Result<RouteResult, QueryError>;

    async fn get_reachable_stops(origin_stop_id: i32) -> Result<Vec<i32>, QueryError>;

    async fn get_stops_by_line(line_id: i32, orientation: i16) -> Result<Vec<Stop>, QueryError>;

    async fn get_segments_by_line(
        line_id: i32,
        orientation: i16,
    ) -> Result<Vec<Segment>, QueryError>;

    async fn register_worker(worker: WorkerHandle);
}

/// The worker's service surface: route computation on its own graph copy
/// and shard mining over its local copy of the ping dataset.
#[tarpc::service]
pub trait WorkerRpc {
    async fn find_route(origin_stop_id: i32, dest_stop_id: i32)
    -> Result<RouteResult, QueryError>;

    async fn mine_shard(
        dataset_path: String,
        start_record: u64,
        end_record: Option<u64>,
    ) -> Vec<SegmentSample>;
}

pub async fn spawn_busway_client(
    addr: &SocketAddr,
) -> Result<BuswayRpcClient, Box<dyn std::error::Error + Sync + Send>> {
    let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default).await?;

    Ok(BuswayRpcClient::new(client::Config::default(), transport).spawn())
}

pub async fn spawn_worker_client(
    addr: &SocketAddr,
) -> Result<WorkerRpcClient, Box<dyn std::error::Error + Sync + Send>> {
    let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default).await?;

    Ok(WorkerRpcClient::new(client::Config::default(), transport).spawn())
}

/// Route query with the stop validation both service surfaces perform
/// before searching.
pub fn find_route_checked(
    graph: &TransitGraph,
    origin_stop_id: i32,
    dest_stop_id: i32,
) -> Result<RouteResult, QueryError> {
    if !graph.has_stop(origin_stop_id) {
        return Err(QueryError::StopNotFound {
            stop_id: origin_stop_id,
        });
    }
    if !graph.has_stop(dest_stop_id) {
        return Err(QueryError::StopNotFound {
            stop_id: dest_stop_id,
        });
    }

    Ok(route_finder::shortest_route(graph, origin_stop_id, dest_stop_id))
}

pub fn reachable_stops_checked(
    graph: &TransitGraph,
    origin_stop_id: i32,
) -> Result<Vec<i32>, QueryError> {
    if !graph.has_stop(origin_stop_id) {
        return Err(QueryError::StopNotFound {
            stop_id: origin_stop_id,
        });
    }

    let mut stop_ids: Vec<i32> = route_finder::reachable_stops(graph, origin_stop_id)
        .into_iter()
        .collect();
    stop_ids.sort_unstable();
    Ok(stop_ids)
}

fn check_line_and_orientation(
    graph: &TransitGraph,
    line_id: i32,
    orientation: i16,
) -> Result<(), QueryError> {
    if !graph.has_line(line_id) {
        return Err(QueryError::LineNotFound { line_id });
    }
    if orientation != 0 && orientation != 1 {
        return Err(QueryError::InvalidOrientation { orientation });
    }
    Ok(())
}

pub fn stops_by_line_checked(
    graph: &TransitGraph,
    line_id: i32,
    orientation: i16,
) -> Result<Vec<Stop>, QueryError> {
    check_line_and_orientation(graph, line_id, orientation)?;
    Ok(graph.stops_by_line(line_id, orientation))
}

pub fn segments_by_line_checked(
    graph: &TransitGraph,
    line_id: i32,
    orientation: i16,
) -> Result<Vec<Segment>, QueryError> {
    check_line_and_orientation(graph, line_id, orientation)?;
    Ok(graph.segments_by_line(line_id, orientation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transit_graph::ConnectivityTuple;

    fn graph() -> TransitGraph {
        let stops = vec![
            Stop {
                stop_id: 1,
                short_name: "A".to_string(),
                long_name: "Stop A".to_string(),
                lat: 0.0,
                lon: 0.0,
            },
            Stop {
                stop_id: 2,
                short_name: "B".to_string(),
                long_name: "Stop B".to_string(),
                lat: 0.0,
                lon: 0.01,
            },
        ];
        let lines = vec![Line {
            line_id: 5,
            short_name: "L5".to_string(),
            description: "Line 5".to_string(),
        }];
        let tuples = vec![
            ConnectivityTuple {
                line_id: 5,
                line_variant: 1,
                orientation: 0,
                stop_id: 1,
                stop_sequence: 1,
            },
            ConnectivityTuple {
                line_id: 5,
                line_variant: 1,
                orientation: 0,
                stop_id: 2,
                stop_sequence: 2,
            },
        ];
        TransitGraph::build(stops, lines, tuples)
    }

    #[test]
    fn unknown_stop_is_a_typed_error() {
        let graph = graph();
        assert_eq!(
            find_route_checked(&graph, 99, 1),
            Err(QueryError::StopNotFound { stop_id: 99 })
        );
        assert_eq!(
            reachable_stops_checked(&graph, 99),
            Err(QueryError::StopNotFound { stop_id: 99 })
        );
    }

    #[test]
    fn line_queries_validate_line_then_orientation() {
        let graph = graph();
        assert_eq!(
            stops_by_line_checked(&graph, 404, 0),
            Err(QueryError::LineNotFound { line_id: 404 })
        );
        assert_eq!(
            segments_by_line_checked(&graph, 5, 2),
            Err(QueryError::InvalidOrientation { orientation: 2 })
        );

        let stops = stops_by_line_checked(&graph, 5, 0).unwrap();
        assert_eq!(stops.len(), 2);
        // Valid orientation with no service is an empty list, not an error.
        assert!(stops_by_line_checked(&graph, 5, 1).unwrap().is_empty());
    }

    #[test]
    fn reachable_stops_are_sorted_ids() {
        let graph = graph();
        assert_eq!(reachable_stops_checked(&graph, 1).unwrap(), vec![1, 2]);
    }
}
