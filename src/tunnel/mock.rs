//! In-process tunnel client for tests
//!
//! Behaviour is chosen by the authorization token prefix:
//! `fail` never connects, `drop` connects then goes down, `slow` never
//! finishes connecting, anything else connects and stays up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{GateError, Result};
use crate::tunnel::client::{TunnelClient, TunnelSession, WorkerSpec};

pub struct MockTunnelClient {
    pub established: AtomicUsize,
    pub terminated: Arc<AtomicUsize>,
}

impl MockTunnelClient {
    pub fn new() -> Self {
        Self {
            established: AtomicUsize::new(0),
            terminated: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct MockSession {
    drops: bool,
    terminated: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelSession for MockSession {
    async fn closed(&mut self) -> Result<()> {
        if self.drops {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(GateError::Internal("connection reset by tunnel".to_string()))
        } else {
            std::future::pending().await
        }
    }

    async fn terminate(&mut self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelClient for MockTunnelClient {
    async fn establish(&self, spec: &WorkerSpec) -> Result<Box<dyn TunnelSession>> {
        let token = spec.authorization.as_str();

        if token.starts_with("fail") {
            return Err(GateError::WorkerConnect {
                port: spec.local_port,
                reason: "authorization rejected".to_string(),
            });
        }
        if token.starts_with("slow") {
            std::future::pending::<()>().await;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        self.established.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            drops: token.starts_with("drop"),
            terminated: self.terminated.clone(),
        }))
    }
}
