// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Worker binary: serves route queries against its own copy of the graph
//! and mines shards of the ping dataset on request from the master.

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

use busway::rpc::{self, QueryError, WorkerHandle, WorkerRpc};
use busway::speed_miner::{self, SegmentSample};
use busway::topology_import;
use busway::transit_graph::TransitGraph;
use busway::transit_graph::route_finder::RouteResult;
use clap::Parser;
use futures::{future, prelude::*};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tarpc::{
    context,
    server::{self, Channel, incoming::Incoming},
    tokio_serde::formats::Bincode,
};
use uuid::Uuid;

const REGISTRATION_ATTEMPTS: u32 = 6;

#[derive(Parser)]
#[command(name = "guadua", about = "Route and shard-mining worker")]
struct Args {
    /// Address this worker's RPC server listens on.
    #[arg(long, default_value = "127.0.0.1:40561")]
    listen: SocketAddr,

    /// Address of the master (ceiba) to register with.
    #[arg(long, default_value = "127.0.0.1:40551")]
    master: SocketAddr,

    /// Address the master should dial this worker back on, when it differs
    /// from --listen (NAT, multiple interfaces).
    #[arg(long)]
    advertise: Option<SocketAddr>,

    #[arg(long, default_value = "data/stops.csv")]
    stops: PathBuf,

    #[arg(long, default_value = "data/lines.csv")]
    lines: PathBuf,

    #[arg(long, default_value = "data/linestops.csv")]
    linestops: PathBuf,

    /// Max concurrent RPC channels served.
    #[arg(long, default_value_t = 32)]
    max_channels: usize,
}

#[derive(Clone)]
struct GuaduaServer {
    graph: Arc<TransitGraph>,
}

impl WorkerRpc for GuaduaServer {
    async fn find_route(
        self,
        _: context::Context,
        origin_stop_id: i32,
        dest_stop_id: i32,
    ) -> Result<RouteResult, QueryError> {
        rpc::find_route_checked(&self.graph, origin_stop_id, dest_stop_id)
    }

    async fn mine_shard(
        self,
        _: context::Context,
        dataset_path: String,
        start_record: u64,
        end_record: Option<u64>,
    ) -> Vec<SegmentSample> {
        info!(
            "mining shard [{start_record}, {}) of {dataset_path}",
            end_record.map_or("end".to_string(), |end| end.to_string())
        );

        let graph = Arc::clone(&self.graph);
        let path = dataset_path.clone();
        let mined = tokio::task::spawn_blocking(move || {
            speed_miner::mine_shard_file(&graph, Path::new(&path), start_record, end_record)
        })
        .await;

        match mined {
            Ok(Ok(stats)) => {
                let samples = speed_miner::to_samples(&stats);
                info!("shard complete: {} segments with samples", samples.len());
                samples
            }
            Ok(Err(e)) => {
                error!("could not mine dataset {dataset_path}: {e}");
                Vec::new()
            }
            Err(e) => {
                error!("mining task failed: {e}");
                Vec::new()
            }
        }
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Each worker carries its own copy of the topology files.
    let stops = topology_import::load_stops(&args.stops)?;
    let lines = topology_import::load_lines(&args.lines)?;
    let tuples = topology_import::load_linestops(&args.linestops)?;
    let graph = Arc::new(TransitGraph::build(stops, lines, tuples));

    let stats = graph.statistics();
    info!(
        "worker graph built: {} lines, {} stops, {} segments",
        stats.num_lines, stats.num_stops, stats.num_segments
    );

    let mut listener = tarpc::serde_transport::tcp::listen(&args.listen, Bincode::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    info!("worker listening on {}", listener.local_addr());

    let handle = WorkerHandle {
        worker_id: Uuid::new_v4().to_string(),
        addr: args.advertise.unwrap_or(args.listen),
    };
    tokio::spawn(register_with_master(args.master, handle));

    let server_graph = Arc::clone(&graph);
    listener
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        .map(move |channel| {
            let server = GuaduaServer {
                graph: Arc::clone(&server_graph),
            };
            channel.execute(server.serve()).for_each(spawn)
        })
        .buffer_unordered(args.max_channels)
        .for_each(|_| async {})
        .await;

    Ok(())
}

async fn register_with_master(master: SocketAddr, handle: WorkerHandle) {
    for attempt in 1..=REGISTRATION_ATTEMPTS {
        match rpc::spawn_busway_client(&master).await {
            Ok(client) => {
                match client.register_worker(context::current(), handle.clone()).await {
                    Ok(()) => {
                        info!("registered with master at {master} as {}", handle.worker_id);
                        return;
                    }
                    Err(e) => warn!(
                        "registration call to {master} failed (attempt {attempt}/{REGISTRATION_ATTEMPTS}): {e}"
                    ),
                }
            }
            Err(e) => warn!(
                "could not reach master at {master} (attempt {attempt}/{REGISTRATION_ATTEMPTS}): {e}"
            ),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    error!(
        "giving up on registration with {master} after {REGISTRATION_ATTEMPTS} attempts; restart this worker once the master is reachable"
    );
}
