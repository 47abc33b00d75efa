// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Master binary: builds the graph from the topology CSVs, serves the
//! query/registration RPC surface, and orchestrates the distributed
//! mining of segment speeds across registered workers.

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::arc_with_non_send_sync,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect
)]

use ahash::AHashMap;
use busway::coordinator::{SharedWorkerRegistry, WorkerRegistry, partition_shards};
use busway::rpc::{self, BuswayRpc, QueryError, WorkerHandle};
use busway::speed_miner::{SampleAccumulator, SegmentSample, merge_samples, to_samples};
use busway::stats_store::{self, DEFAULT_MIN_COVERAGE_SEGMENTS, StatsStore};
use busway::topology_import;
use busway::transit_graph::route_finder::{RouteResult, estimated_travel_time_minutes};
use busway::transit_graph::{GraphStatistics, Line, Segment, SegmentKey, Stop, TransitGraph};
use clap::Parser;
use futures::{future, prelude::*};
use log::{error, info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tarpc::{
    context,
    server::{self, Channel, incoming::Incoming},
    tokio_serde::formats::Bincode,
};
use uuid::Uuid;

/// Mining a shard of a hundred-million-record dataset can run for hours;
/// the dispatch context must outlive it. Recovery from a genuinely stuck
/// worker is reactive, through the transport's own disconnect signal.
const SHARD_DEADLINE: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Parser)]
#[command(name = "ceiba", about = "Master: graph queries and analysis coordination")]
struct Args {
    /// Address the RPC server listens on.
    #[arg(long, default_value = "127.0.0.1:40551")]
    listen: SocketAddr,

    #[arg(long, default_value = "data/stops.csv")]
    stops: PathBuf,

    #[arg(long, default_value = "data/lines.csv")]
    lines: PathBuf,

    #[arg(long, default_value = "data/linestops.csv")]
    linestops: PathBuf,

    /// Ping dataset, counted locally and sent by this same path to every
    /// worker (each worker resolves it against its own working directory).
    #[arg(long, default_value = "data/datagrams.csv")]
    dataset: String,

    /// Cap on how many dataset records the run mines, for scale
    /// experiments. Unset means the whole file.
    #[arg(long)]
    experiment_size: Option<u64>,

    /// Segments with persisted samples at or above which mining is skipped
    /// and speeds are loaded from the store instead.
    #[arg(long, default_value_t = DEFAULT_MIN_COVERAGE_SEGMENTS)]
    min_coverage_segments: i64,

    /// How many 5-second polls to wait for workers before deciding whether
    /// to mine.
    #[arg(long, default_value_t = 6)]
    worker_wait_attempts: u32,

    /// Max concurrent RPC channels served.
    #[arg(long, default_value_t = 32)]
    max_channels: usize,
}

#[derive(Clone)]
struct CeibaServer {
    graph: Arc<TransitGraph>,
    registry: SharedWorkerRegistry,
}

impl BuswayRpc for CeibaServer {
    async fn get_all_stops(self, _: context::Context) -> Vec<Stop> {
        self.graph.all_stops_sorted()
    }

    async fn get_all_lines(self, _: context::Context) -> Vec<Line> {
        self.graph.all_lines_sorted()
    }

    async fn get_all_segments(self, _: context::Context) -> Vec<Segment> {
        self.graph.all_segments_sorted()
    }

    async fn get_graph_statistics(self, _: context::Context) -> GraphStatistics {
        self.graph.statistics()
    }

    async fn find_route(
        self,
        _: context::Context,
        origin_stop_id: i32,
        dest_stop_id: i32,
    ) -> Result<RouteResult, QueryError> {
        // Validate before spending a network hop on a worker.
        if !self.graph.has_stop(origin_stop_id) {
            return Err(QueryError::StopNotFound {
                stop_id: origin_stop_id,
            });
        }
        if !self.graph.has_stop(dest_stop_id) {
            return Err(QueryError::StopNotFound {
                stop_id: dest_stop_id,
            });
        }

        let result = match self.registry.next_worker().await {
            None => rpc::find_route_checked(&self.graph, origin_stop_id, dest_stop_id),
            Some(worker) => {
                match dispatch_route_query(&worker, origin_stop_id, dest_stop_id).await {
                    // A typed error from the worker propagates unchanged.
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!(
                            "worker {} at {} unreachable for route query, computing locally: {e}",
                            worker.worker_id, worker.addr
                        );
                        rpc::find_route_checked(&self.graph, origin_stop_id, dest_stop_id)
                    }
                }
            }
        };

        if let Ok(route) = &result {
            if route.found {
                info!(
                    "route {origin_stop_id} -> {dest_stop_id}: {} stops, {:.2} km, {} transfers, ~{:.1} min",
                    route.stops.len(),
                    route.total_distance,
                    route.num_transfers,
                    estimated_travel_time_minutes(&route.segments)
                );
            } else {
                info!("route {origin_stop_id} -> {dest_stop_id}: {}", route.message);
            }
        }

        result
    }

    async fn get_reachable_stops(
        self,
        _: context::Context,
        origin_stop_id: i32,
    ) -> Result<Vec<i32>, QueryError> {
        let reachable = rpc::reachable_stops_checked(&self.graph, origin_stop_id)?;
        info!(
            "reachability from {origin_stop_id}: {} of {} stops",
            reachable.len(),
            self.graph.statistics().num_stops
        );
        Ok(reachable)
    }

    async fn get_stops_by_line(
        self,
        _: context::Context,
        line_id: i32,
        orientation: i16,
    ) -> Result<Vec<Stop>, QueryError> {
        rpc::stops_by_line_checked(&self.graph, line_id, orientation)
    }

    async fn get_segments_by_line(
        self,
        _: context::Context,
        line_id: i32,
        orientation: i16,
    ) -> Result<Vec<Segment>, QueryError> {
        rpc::segments_by_line_checked(&self.graph, line_id, orientation)
    }

    async fn register_worker(self, _: context::Context, worker: WorkerHandle) {
        info!("worker {} registered from {}", worker.worker_id, worker.addr);
        self.registry.register(worker).await;
    }
}

async fn dispatch_route_query(
    worker: &WorkerHandle,
    origin_stop_id: i32,
    dest_stop_id: i32,
) -> Result<Result<RouteResult, QueryError>, Box<dyn std::error::Error + Sync + Send>> {
    let client = rpc::spawn_worker_client(&worker.addr).await?;
    Ok(client
        .find_route(context::current(), origin_stop_id, dest_stop_id)
        .await?)
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // The store is optional: without it the graph still serves queries,
    // speeds just are not persisted or preloaded.
    let store = match busway::postgres_tools::make_async_pool().await {
        Ok(pool) => {
            info!("connected to postgres");
            Some(StatsStore::new(Arc::new(pool)))
        }
        Err(e) => {
            error!("postgres unavailable, continuing without persistence: {e}");
            None
        }
    };

    // Topology is mandatory: failing to load it aborts before any service
    // is exposed.
    let stops = topology_import::load_stops(&args.stops)?;
    let lines = topology_import::load_lines(&args.lines)?;
    let tuples = topology_import::load_linestops(&args.linestops)?;
    let graph = Arc::new(TransitGraph::build(stops, lines, tuples));

    let stats = graph.statistics();
    info!(
        "graph built: {} lines, {} stops, {} segments ({} orientation 0, {} orientation 1)",
        stats.num_lines,
        stats.num_stops,
        stats.num_segments,
        stats.num_segments_orientation_0,
        stats.num_segments_orientation_1
    );

    let registry: SharedWorkerRegistry = Arc::new(WorkerRegistry::new());

    let mut listener = tarpc::serde_transport::tcp::listen(&args.listen, Bincode::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    info!("listening on {}", listener.local_addr());

    let server_graph = Arc::clone(&graph);
    let server_registry = Arc::clone(&registry);
    let rpc_server = tokio::spawn(async move {
        listener
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .map(move |channel| {
                let server = CeibaServer {
                    graph: Arc::clone(&server_graph),
                    registry: Arc::clone(&server_registry),
                };
                channel.execute(server.serve()).for_each(spawn)
            })
            .buffer_unordered(args.max_channels)
            .for_each(|_| async {})
            .await;
    });

    let mut attempt = 0;
    while registry.is_empty().await && attempt < args.worker_wait_attempts {
        attempt += 1;
        info!(
            "waiting for workers to register (attempt {attempt}/{})",
            args.worker_wait_attempts
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    if registry.is_empty().await {
        warn!("no workers registered, staying up in query-only mode");
    } else {
        run_analysis(&graph, &registry, store.as_ref(), &args).await;
    }

    info!("ready for queries");
    rpc_server.await?;
    Ok(())
}

/// The analysis phase: either load persisted speeds (skip-heuristic) or
/// partition the dataset, dispatch one shard per worker, merge the partial
/// aggregates, apply them to the graph overlay and persist the deltas.
async fn run_analysis(
    graph: &Arc<TransitGraph>,
    registry: &SharedWorkerRegistry,
    store: Option<&StatsStore>,
    args: &Args,
) {
    if let Some(store) = store {
        match store.has_sufficient_coverage(args.min_coverage_segments).await {
            Ok(true) => {
                info!(
                    "store already covers {} or more segments, skipping mining",
                    args.min_coverage_segments
                );
                match store.load_all().await {
                    Ok(rows) => {
                        graph.swap_overlay(stats_store::overlay_from_rows(&rows));
                        info!(
                            "loaded {} segment speeds from the store",
                            graph.num_segments_with_speed()
                        );
                        return;
                    }
                    Err(e) => error!("failed to load persisted speeds, mining instead: {e}"),
                }
            }
            Ok(false) => {}
            Err(e) => error!("coverage check failed, mining instead: {e}"),
        }
    }

    let workers = registry.snapshot().await;

    let mut total_records = match count_records(Path::new(&args.dataset)) {
        Ok(n) => n,
        Err(e) => {
            error!("cannot count dataset records in {}: {e}", args.dataset);
            return;
        }
    };
    if let Some(cap) = args.experiment_size {
        if total_records > cap {
            info!("experiment mode: capping {total_records} records to {cap}");
            total_records = cap;
        }
    }
    if total_records == 0 {
        warn!("dataset {} is empty, nothing to mine", args.dataset);
        return;
    }

    let run_id = match store {
        Some(store) => {
            let description = format!(
                "{} records across {} workers",
                total_records,
                workers.len()
            );
            match store
                .create_run(total_records as i64, workers.len() as i32, &description)
                .await
            {
                Ok(run_id) => Some(run_id),
                Err(e) => {
                    error!("could not record the analysis run: {e}");
                    None
                }
            }
        }
        None => None,
    };

    info!(
        "mining {} records across {} workers",
        total_records,
        workers.len()
    );
    let started = Instant::now();

    let shards = partition_shards(total_records, workers.len());
    let mut shard_tasks = Vec::with_capacity(workers.len());

    for (worker, (start_record, end_record)) in workers.into_iter().zip(shards) {
        let dataset = args.dataset.clone();
        shard_tasks.push(tokio::spawn(async move {
            info!(
                "dispatching records [{start_record}, {end_record}) to worker {}",
                worker.worker_id
            );
            let client = rpc::spawn_worker_client(&worker.addr).await?;
            let mut ctx = context::current();
            ctx.deadline = std::time::Instant::now() + SHARD_DEADLINE;
            let samples = client
                .mine_shard(ctx, dataset, start_record, Some(end_record))
                .await?;
            Ok::<_, Box<dyn std::error::Error + Sync + Send>>((worker, samples))
        }));
    }

    // Collect in submission order. A failed shard is logged and simply
    // absent from the aggregate; there is no retry or reassignment.
    let mut aggregate: AHashMap<SegmentKey, SampleAccumulator> = AHashMap::new();
    for task in shard_tasks {
        match task.await {
            Ok(Ok((worker, samples))) => {
                info!(
                    "worker {} returned {} segment samples",
                    worker.worker_id,
                    samples.len()
                );
                merge_samples(&mut aggregate, &samples);
            }
            Ok(Err(e)) => error!("shard failed, its records are missing from this run: {e}"),
            Err(e) => error!("shard task failed: {e}"),
        }
    }

    let mut overlay: AHashMap<SegmentKey, f64> = AHashMap::new();
    for (key, accumulator) in &aggregate {
        if let Some(speed) = accumulator.avg_speed_kmh() {
            overlay.insert(*key, speed);
        }
    }
    let segments_with_data = overlay.len();
    graph.swap_overlay(overlay);

    let elapsed_ms = started.elapsed().as_millis() as i64;
    let total_measurements: i64 = aggregate.values().map(|a| a.count).sum();
    info!(
        "analysis complete: {} segments with speeds from {} measurements in {} ms ({:.0} records/s)",
        segments_with_data,
        total_measurements,
        elapsed_ms,
        total_records as f64 / (elapsed_ms.max(1) as f64 / 1000.0)
    );

    if let Some(store) = store {
        let samples: Vec<SegmentSample> = to_samples(&aggregate);
        let run = run_id.unwrap_or_else(Uuid::new_v4);
        match store.upsert_batch(&samples, run).await {
            Ok(()) => info!("persisted {} segment aggregates", samples.len()),
            Err(e) => error!("persistence failed, continuing with in-memory speeds only: {e}"),
        }
        if let Some(run) = run_id {
            if let Err(e) = store
                .complete_run(run, elapsed_ms, segments_with_data as i32)
                .await
            {
                error!("could not mark the analysis run as completed: {e}");
            }
        }
    }
}

fn count_records(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut records: u64 = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf)?;
        if bytes == 0 {
            break;
        }
        records += 1;
    }

    Ok(records)
}
