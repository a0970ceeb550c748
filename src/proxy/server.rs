//! Proxy Rotator: authenticated SOCKS5 front over the live tunnel endpoints
//!
//! Every accepted client is authenticated, its CONNECT target is read, and
//! the request is dialed through one live endpoint chosen by the rotation
//! strategy. A failed dial is retried on the next candidate until every
//! endpoint in the snapshot has been tried once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RotatorConfig;
use crate::error::{GateError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::middleware::SocksAuth;
use crate::proxy::relay;
use crate::proxy::rotation::{EndpointSelector, EndpointSource};
use crate::proxy::socks5::{self, Reply, TargetAddr};
use crate::shutdown::stopped;

/// Shared per-connection state
struct RotatorContext {
    auth: SocksAuth,
    source: Arc<dyn EndpointSource>,
    selector: Arc<dyn EndpointSelector>,
    buffer_size: usize,
    connect_timeout: Duration,
}

/// Bound rotator, ready to run
pub struct ProxyRotator {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<RotatorContext>,
}

impl ProxyRotator {
    /// Bind the listening socket.
    ///
    /// Fails with [`GateError::Bind`] when the port is taken.
    pub async fn bind(
        config: &RotatorConfig,
        source: Arc<dyn EndpointSource>,
        selector: Arc<dyn EndpointSelector>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GateError::Bind {
                addr: addr.clone(),
                port: config.port,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Proxy Rotator bound on {} using {} rotation",
            local_addr,
            selector.strategy_name()
        );

        Ok(Self {
            listener,
            local_addr,
            ctx: Arc::new(RotatorContext {
                auth: SocksAuth::new(config.username.clone(), config.password.clone()),
                source,
                selector,
                buffer_size: config.buffer_size,
                connect_timeout: config.connect_timeout,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept clients until `stop` is raised, then close open relays
    #[instrument(skip(self, stop), fields(addr = %self.local_addr))]
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let ctx = self.ctx.clone();
                            let conn_stop = stop.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, client_addr, ctx, conn_stop).await {
                                    debug!("Rotator connection from {} ended: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = stopped(&mut stop) => {
                    info!("Proxy Rotator shutting down");
                    break;
                }
            }
        }

        drop(self.listener);
        while connections.join_next().await.is_some() {}
        info!("Proxy Rotator stopped");
        Ok(())
    }
}

/// Authenticate and read the CONNECT target, answering rejected requests
async fn handshake(stream: &mut TcpStream, auth: &SocksAuth) -> Result<TargetAddr> {
    socks5::negotiate(stream, auth).await?;

    match socks5::read_request(stream).await {
        Ok(target) => Ok(target),
        Err(e @ (GateError::UnsupportedCommand(_) | GateError::UnsupportedAddressType(_))) => {
            let _ = socks5::write_reply(stream, e.socks_reply(), None).await;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    ctx: Arc<RotatorContext>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let target = tokio::select! {
        result = timeout(ctx.connect_timeout, handshake(&mut stream, &ctx.auth)) => {
            result.map_err(|_| GateError::Timeout)??
        }
        _ = stopped(&mut stop) => return Ok(()),
    };

    let (backend, endpoint) = tokio::select! {
        result = dial(&ctx, &target) => match result {
            Ok(dialed) => dialed,
            Err(e) => {
                warn!("Rotator request from {} to {} failed: {}", client_addr, target, e);
                let _ = socks5::write_reply(&mut stream, e.socks_reply(), None).await;
                return Err(e);
            }
        },
        _ = stopped(&mut stop) => {
            let _ = socks5::write_reply(&mut stream, Reply::GeneralFailure, None).await;
            return Ok(());
        }
    };

    socks5::write_reply(&mut stream, Reply::Succeeded, backend.local_addr().ok()).await?;
    debug!("{} -> {} via {}", client_addr, target, endpoint);

    let stats = relay::copy_bidirectional(stream, backend, ctx.buffer_size, stop).await;
    debug!(
        client = %client_addr,
        target = %target,
        endpoint = %endpoint,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        "Rotator relay closed"
    );

    Ok(())
}

/// Dial `target` through the live endpoints in strategy order
async fn dial(ctx: &RotatorContext, target: &TargetAddr) -> Result<(TcpStream, ProxyEndpoint)> {
    let live = ctx.source.live_endpoints();
    if live.is_empty() {
        return Err(GateError::NoEndpointsAvailable);
    }

    let candidates = ctx.selector.candidates(&live);
    for (attempt, endpoint) in candidates.iter().enumerate() {
        // The head was marked by candidates()
        if attempt > 0 {
            ctx.selector.mark_used(endpoint);
        }

        match timeout(ctx.connect_timeout, connect_via(endpoint.addr, target)).await {
            Ok(Ok(stream)) => return Ok((stream, *endpoint)),
            Ok(Err(e)) => {
                warn!(
                    "Endpoint {} failed for {} (attempt {}/{}): {}",
                    endpoint,
                    target,
                    attempt + 1,
                    candidates.len(),
                    e
                );
            }
            Err(_) => {
                warn!(
                    "Endpoint {} timed out for {} (attempt {}/{})",
                    endpoint,
                    target,
                    attempt + 1,
                    candidates.len()
                );
            }
        }
    }

    Err(GateError::AllEndpointsExhausted {
        attempts: candidates.len(),
    })
}

async fn connect_via(endpoint: SocketAddr, target: &TargetAddr) -> Result<TcpStream> {
    let stream = match target {
        TargetAddr::Ip(addr) => Socks5Stream::connect(endpoint, *addr).await?,
        TargetAddr::Domain(host, port) => {
            Socks5Stream::connect(endpoint, (host.as_str(), *port)).await?
        }
    };
    Ok(stream.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotation::{create_selector, RotationStrategy};
    use crate::shutdown::StopHandle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct StaticSource(Mutex<Arc<Vec<ProxyEndpoint>>>);

    impl StaticSource {
        fn new(endpoints: Vec<ProxyEndpoint>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Arc::new(endpoints))))
        }
    }

    impl EndpointSource for StaticSource {
        fn live_endpoints(&self) -> Arc<Vec<ProxyEndpoint>> {
            self.0.lock().clone()
        }
    }

    fn rotator_config() -> RotatorConfig {
        RotatorConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            username: "user".to_string(),
            password: "pass".to_string(),
            buffer_size: 1024,
            connect_timeout: Duration::from_secs(2),
            strategy: RotationStrategy::LeastRecentlyUsed,
        }
    }

    /// Minimal no-auth SOCKS5 backend that echoes everything and counts dials
    async fn spawn_echo_backend(dials: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let dials = dials.clone();
                tokio::spawn(async move {
                    let mut head = [0u8; 2];
                    stream.read_exact(&mut head).await.unwrap();
                    let mut methods = vec![0u8; head[1] as usize];
                    stream.read_exact(&mut methods).await.unwrap();
                    stream.write_all(&[5, 0]).await.unwrap();

                    let mut req = [0u8; 4];
                    stream.read_exact(&mut req).await.unwrap();
                    match req[3] {
                        1 => {
                            let mut rest = [0u8; 6];
                            stream.read_exact(&mut rest).await.unwrap();
                        }
                        3 => {
                            let len = stream.read_u8().await.unwrap() as usize;
                            let mut rest = vec![0u8; len + 2];
                            stream.read_exact(&mut rest).await.unwrap();
                        }
                        _ => return,
                    }
                    dials.fetch_add(1, Ordering::SeqCst);
                    stream
                        .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0])
                        .await
                        .unwrap();

                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        addr
    }

    /// Address with nothing listening
    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    async fn start(source: Arc<dyn EndpointSource>) -> (SocketAddr, StopHandle) {
        let rotator = ProxyRotator::bind(
            &rotator_config(),
            source,
            create_selector(RotationStrategy::LeastRecentlyUsed),
        )
        .await
        .unwrap();
        let addr = rotator.local_addr();
        let (handle, stop) = StopHandle::new();
        tokio::spawn(rotator.run(stop));
        (addr, handle)
    }

    async fn greet(stream: &mut TcpStream, user: &[u8], pass: &[u8]) -> [u8; 2] {
        stream.write_all(&[5, 1, 2]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 2]);

        let mut msg = vec![1, user.len() as u8];
        msg.extend_from_slice(user);
        msg.push(pass.len() as u8);
        msg.extend_from_slice(pass);
        stream.write_all(&msg).await.unwrap();

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        status
    }

    async fn connect_domain(stream: &mut TcpStream, host: &str, port: u16) -> [u8; 10] {
        let mut req = vec![5, 1, 0, 3, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = rotator_config();
        config.port = taken.local_addr().unwrap().port();

        let result = ProxyRotator::bind(
            &config,
            StaticSource::new(Vec::new()),
            create_selector(RotationStrategy::LeastRecentlyUsed),
        )
        .await;

        match result {
            Err(e @ GateError::Bind { .. }) => assert!(e.is_fatal()),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("bind should have failed"),
        }
    }

    #[tokio::test]
    async fn test_wrong_credentials_never_dial() {
        let dials = Arc::new(AtomicUsize::new(0));
        let backend = spawn_echo_backend(dials.clone()).await;
        let (addr, _handle) = start(StaticSource::new(vec![ProxyEndpoint::new(0, backend)])).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let status = greet(&mut client, b"user", b"wrong").await;
        assert_eq!(status, [1, 1]);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_live_set_replies_host_unreachable() {
        let (addr, _handle) = start(StaticSource::new(Vec::new())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, b"user", b"pass").await, [1, 0]);

        let reply = connect_domain(&mut client, "example.com", 80).await;
        assert_eq!(reply[1], Reply::HostUnreachable.code());
    }

    #[tokio::test]
    async fn test_relays_through_backend() {
        let dials = Arc::new(AtomicUsize::new(0));
        let backend = spawn_echo_backend(dials.clone()).await;
        let (addr, _handle) = start(StaticSource::new(vec![ProxyEndpoint::new(0, backend)])).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, b"user", b"pass").await, [1, 0]);
        let reply = connect_domain(&mut client, "example.com", 443).await;
        assert_eq!(reply[1], Reply::Succeeded.code());

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_past_dead_endpoint() {
        let dials = Arc::new(AtomicUsize::new(0));
        let backend = spawn_echo_backend(dials.clone()).await;
        let dead = dead_addr().await;

        // Dead endpoint first in live order, so LRU tries it first
        let source = StaticSource::new(vec![
            ProxyEndpoint::new(0, dead),
            ProxyEndpoint::new(1, backend),
        ]);
        let (addr, _handle) = start(source).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, b"user", b"pass").await, [1, 0]);
        let reply = connect_domain(&mut client, "example.com", 80).await;
        assert_eq!(reply[1], Reply::Succeeded.code());
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_dead_replies_host_unreachable() {
        let source = StaticSource::new(vec![
            ProxyEndpoint::new(0, dead_addr().await),
            ProxyEndpoint::new(1, dead_addr().await),
        ]);
        let (addr, _handle) = start(source).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, b"user", b"pass").await, [1, 0]);
        let reply = connect_domain(&mut client, "example.com", 80).await;
        assert_eq!(reply[1], Reply::HostUnreachable.code());
    }

    #[tokio::test]
    async fn test_unsupported_command_rejected() {
        let (addr, _handle) = start(StaticSource::new(Vec::new())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, b"user", b"pass").await, [1, 0]);

        // BIND
        client
            .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported.code());
    }

    #[tokio::test]
    async fn test_stop_closes_open_relays() {
        let dials = Arc::new(AtomicUsize::new(0));
        let backend = spawn_echo_backend(dials).await;
        let (addr, handle) = start(StaticSource::new(vec![ProxyEndpoint::new(0, backend)])).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, b"user", b"pass").await, [1, 0]);
        assert_eq!(connect_domain(&mut client, "example.com", 80).await[1], 0);

        handle.stop();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
        assert!(read.is_ok(), "relay stayed open after stop");
    }
}
