// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Master-side coordination: the worker registry with round-robin
//! selection, and the shard partitioning used to spread a mining run over
//! the registered workers.

use crate::rpc::WorkerHandle;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Registered workers, in registration order. Registration only appends;
/// there is no deregistration, a worker that went away is only discovered
/// when a dispatched call to it fails.
pub struct WorkerRegistry {
    workers: Mutex<Vec<WorkerHandle>>,
    round_robin_cursor: AtomicUsize,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            workers: Mutex::new(Vec::new()),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub async fn register(&self, worker: WorkerHandle) {
        let mut workers = self.workers.lock().await;
        workers.push(worker);
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// All workers in registration order, for shard dispatch.
    pub async fn snapshot(&self) -> Vec<WorkerHandle> {
        self.workers.lock().await.clone()
    }

    /// Next worker in round-robin order, or `None` while the registry is
    /// empty. The cursor advances monotonically; the modulo is taken
    /// against the length read under the lock, so the index is always in
    /// bounds even while registrations race with dispatch.
    pub async fn next_worker(&self) -> Option<WorkerHandle> {
        let workers = self.workers.lock().await;
        if workers.is_empty() {
            return None;
        }
        let cursor = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst);
        Some(workers[cursor % workers.len()].clone())
    }
}

pub type SharedWorkerRegistry = Arc<WorkerRegistry>;

/// Splits `total_records` dataset records into one contiguous half-open
/// 1-based range per worker. Every worker gets `total / workers` records
/// and the last worker absorbs the remainder, ending at `total + 1`.
pub fn partition_shards(total_records: u64, num_workers: usize) -> Vec<(u64, u64)> {
    if num_workers == 0 || total_records == 0 {
        return Vec::new();
    }

    let chunk_size = total_records / num_workers as u64;
    (0..num_workers as u64)
        .map(|i| {
            let start = 1 + i * chunk_size;
            let end = if i == num_workers as u64 - 1 {
                total_records + 1
            } else {
                1 + (i + 1) * chunk_size
            };
            (start, end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;
    use std::net::SocketAddr;

    fn handle(worker_id: &str, port: u16) -> WorkerHandle {
        WorkerHandle {
            worker_id: worker_id.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn partitions_are_contiguous_and_cover_everything() {
        let shards = partition_shards(1000, 3);
        assert_eq!(shards, vec![(1, 334), (334, 667), (667, 1001)]);

        let covered: u64 = shards.iter().map(|(start, end)| end - start).sum();
        assert_eq!(covered, 1000);
        for pair in shards.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn last_shard_absorbs_remainder() {
        let shards = partition_shards(10, 4);
        assert_eq!(shards, vec![(1, 3), (3, 5), (5, 7), (7, 11)]);

        // Even division leaves no remainder to absorb.
        let shards = partition_shards(9, 3);
        assert_eq!(shards, vec![(1, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn degenerate_partitions() {
        assert!(partition_shards(1000, 0).is_empty());
        assert!(partition_shards(0, 3).is_empty());
        assert_eq!(partition_shards(2, 1), vec![(1, 3)]);

        // Fewer records than workers: early shards are empty, the last one
        // carries everything.
        let shards = partition_shards(2, 3);
        assert_eq!(shards, vec![(1, 1), (1, 1), (1, 3)]);
    }

    #[tokio::test]
    async fn round_robin_is_fair_across_live_workers() {
        let registry = WorkerRegistry::new();
        registry.register(handle("a", 40551)).await;
        registry.register(handle("b", 40552)).await;
        registry.register(handle("c", 40553)).await;

        let mut calls: AHashMap<String, usize> = AHashMap::new();
        for _ in 0..9 {
            let worker = registry.next_worker().await.unwrap();
            *calls.entry(worker.worker_id).or_default() += 1;
        }

        assert_eq!(calls.len(), 3);
        assert!(calls.values().all(|n| *n == 3));
    }

    #[tokio::test]
    async fn empty_registry_yields_no_worker() {
        let registry = WorkerRegistry::new();
        assert!(registry.next_worker().await.is_none());
        assert!(registry.is_empty().await);

        registry.register(handle("a", 40551)).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.next_worker().await.unwrap().worker_id, "a");
    }
}
