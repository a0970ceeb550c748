//! Worker table and the live-endpoint snapshot derived from it
//!
//! Readers load the snapshot without locking. Every state transition
//! rebuilds the snapshot while holding the table lock, so a worker leaving
//! `Connected` is gone from the live set before the transition returns.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::models::{ProxyEndpoint, WorkerState, WorkerStatus};
use crate::proxy::rotation::EndpointSource;

/// Shared registry of tunnel workers
pub struct EndpointPool {
    workers: Mutex<BTreeMap<usize, WorkerStatus>>,
    live: ArcSwap<Vec<ProxyEndpoint>>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            live: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Add a worker in `Starting`. An existing entry with the same id is replaced.
    pub fn register(&self, status: WorkerStatus) {
        let mut workers = self.workers.lock();
        workers.insert(status.worker_id, status);
        self.publish(&workers);
    }

    /// Move a worker to `state`.
    ///
    /// Terminal states are final; returns false when the worker is unknown
    /// or already terminal.
    pub fn transition(&self, worker_id: usize, state: WorkerState, error: Option<String>) -> bool {
        let mut workers = self.workers.lock();
        let Some(status) = workers.get_mut(&worker_id) else {
            return false;
        };
        if status.state.is_terminal() {
            return false;
        }

        debug!(
            worker_id,
            port = status.local_port,
            from = %status.state,
            to = %state,
            "Tunnel worker state change"
        );
        status.state = state;
        if error.is_some() {
            status.last_error = error;
        }

        self.publish(&workers);
        true
    }

    pub fn state(&self, worker_id: usize) -> Option<WorkerState> {
        self.workers.lock().get(&worker_id).map(|s| s.state)
    }

    /// Status of every registered worker, ordered by worker id
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers.lock().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.load().len()
    }

    fn publish(&self, workers: &BTreeMap<usize, WorkerStatus>) {
        let live: Vec<ProxyEndpoint> = workers
            .values()
            .filter(|s| s.state.is_live())
            .map(|s| {
                ProxyEndpoint::new(
                    s.worker_id,
                    SocketAddr::from((Ipv4Addr::LOCALHOST, s.local_port)),
                )
            })
            .collect();
        self.live.store(Arc::new(live));
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSource for EndpointPool {
    fn live_endpoints(&self) -> Arc<Vec<ProxyEndpoint>> {
        self.live.load_full()
    }
}
