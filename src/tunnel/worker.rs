//! One supervised tunnel worker

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::models::WorkerState;
use crate::shutdown::stopped;
use crate::tunnel::client::{TunnelClient, WorkerSpec};
use crate::tunnel::pool::EndpointPool;

/// Drive one worker from `Starting` to a terminal state.
///
/// The pool is updated before the session is torn down, so the endpoint
/// leaves the live set while its port is still served.
#[instrument(skip_all, fields(worker_id = spec.worker_id, port = spec.local_port))]
pub async fn run_worker(
    spec: WorkerSpec,
    client: Arc<dyn TunnelClient>,
    pool: Arc<EndpointPool>,
    mut stop: watch::Receiver<bool>,
) {
    let established = tokio::select! {
        result = client.establish(&spec) => result,
        _ = stopped(&mut stop) => {
            pool.transition(spec.worker_id, WorkerState::Stopped, None);
            return;
        }
    };

    let mut session = match established {
        Ok(session) => session,
        Err(e) => {
            warn!(
                "Tunnel worker {} ({}) failed to connect: {}",
                spec.local_port, spec.authorization, e
            );
            pool.transition(spec.worker_id, WorkerState::Failed, Some(e.to_string()));
            return;
        }
    };

    if !pool.transition(spec.worker_id, WorkerState::Connected, None) {
        session.terminate().await;
        return;
    }
    info!(
        "Tunnel worker connected on port {} (region {})",
        spec.local_port,
        if spec.region.is_empty() { "any" } else { spec.region.as_str() }
    );

    tokio::select! {
        result = session.closed() => {
            let reason = match result {
                Ok(()) => "tunnel closed".to_string(),
                Err(e) => e.to_string(),
            };
            warn!("Tunnel worker on port {} went down: {}", spec.local_port, reason);
            pool.transition(spec.worker_id, WorkerState::Failed, Some(reason));
        }
        _ = stopped(&mut stop) => {
            pool.transition(spec.worker_id, WorkerState::Stopped, None);
        }
    }

    session.terminate().await;
    info!("Tunnel worker on port {} released", spec.local_port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorizationRecord, WorkerStatus};
    use crate::shutdown::StopHandle;
    use crate::tunnel::mock::MockTunnelClient;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn spec(token: &str) -> WorkerSpec {
        WorkerSpec {
            worker_id: 0,
            authorization: AuthorizationRecord::new(token),
            region: "US".to_string(),
            local_port: 3081,
            remote_port: 8989,
            upstream_proxy: "http://127.0.0.1:8989".parse().unwrap(),
            tunnel_pool_size: 4,
            worker_pool_size: 8,
        }
    }

    fn registered_pool() -> Arc<EndpointPool> {
        let pool = Arc::new(EndpointPool::new());
        pool.register(WorkerStatus {
            worker_id: 0,
            local_port: 3081,
            remote_port: 8989,
            region: "US".to_string(),
            state: WorkerState::Starting,
            last_error: None,
        });
        pool
    }

    async fn wait_for_state(pool: &EndpointPool, state: WorkerState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.state(0) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never reached expected state");
    }

    #[tokio::test]
    async fn test_connect_then_stop() {
        let client = Arc::new(MockTunnelClient::new());
        let pool = registered_pool();
        let (handle, stop) = StopHandle::new();

        let task = tokio::spawn(run_worker(spec("good"), client.clone(), pool.clone(), stop));
        wait_for_state(&pool, WorkerState::Connected).await;
        assert_eq!(pool.live_count(), 1);

        handle.stop();
        task.await.unwrap();

        assert_eq!(pool.state(0), Some(WorkerState::Stopped));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(client.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_marks_failed() {
        let client = Arc::new(MockTunnelClient::new());
        let pool = registered_pool();
        let (_handle, stop) = StopHandle::new();

        run_worker(spec("fail-token"), client.clone(), pool.clone(), stop).await;

        let status = &pool.statuses()[0];
        assert_eq!(status.state, WorkerState::Failed);
        assert!(status.last_error.is_some());
        assert_eq!(client.terminated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_drop_marks_failed() {
        let client = Arc::new(MockTunnelClient::new());
        let pool = registered_pool();
        let (_handle, stop) = StopHandle::new();

        run_worker(spec("drop-token"), client.clone(), pool.clone(), stop).await;

        assert_eq!(pool.state(0), Some(WorkerState::Failed));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(client.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_during_connect() {
        let client = Arc::new(MockTunnelClient::new());
        let pool = registered_pool();
        let (handle, stop) = StopHandle::new();

        let task = tokio::spawn(run_worker(spec("slow-token"), client, pool.clone(), stop));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("worker ignored stop while connecting")
            .unwrap();
        assert_eq!(pool.state(0), Some(WorkerState::Stopped));
    }
}
