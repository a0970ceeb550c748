//! Domain-Fronting Gateway
//!
//! Accepts raw client connections, works out where each one was headed,
//! and either forwards it unchanged or carries it to a fronting host
//! through the Proxy Rotator. Accept waits are bounded so the stop flag
//! is re-checked at least once per accept timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, error, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::error::{GateError, Result};
use crate::inject::extract::{
    create_extractor, rewrite_host_header, Destination, DestinationExtractor, Extraction,
    PreambleKind, MAX_PREAMBLE,
};
use crate::inject::rules::RuleEngine;
use crate::models::{ConnectionState, InboundConnection, Route};
use crate::proxy::relay;
use crate::proxy::rotation::EndpointSource;
use crate::shutdown::stopped;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// How the gateway reaches the Proxy Rotator
#[derive(Clone)]
pub struct RotatorLink {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
    /// Live set behind the rotator, consulted for the direct fallback
    pub endpoints: Arc<dyn EndpointSource>,
}

impl RotatorLink {
    /// Resolve `addr` (`host:port`) once up front
    pub async fn resolve(
        addr: &str,
        username: String,
        password: String,
        endpoints: Arc<dyn EndpointSource>,
    ) -> Result<Self> {
        let addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| GateError::InvalidConfig(format!("cannot resolve rotator address {}", addr)))?;

        Ok(Self {
            addr,
            username,
            password,
            endpoints,
        })
    }
}

struct GatewayContext {
    rules: RuleEngine,
    extractor: Arc<dyn DestinationExtractor>,
    rotator: RotatorLink,
    connect_timeout: Duration,
    buffer_size: usize,
    front_fallback_direct: bool,
}

/// Bound gateway, ready to run
pub struct Gateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    accept_timeout: Duration,
    ctx: Arc<GatewayContext>,
}

impl Gateway {
    pub async fn bind(config: &GatewayConfig, rotator: RotatorLink) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GateError::Bind {
                addr: addr.clone(),
                port: config.port,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let extractor = create_extractor(config.extractor);
        info!(
            "Gateway bound on {} with {} rules, {} extraction",
            local_addr,
            config.rules.len(),
            extractor.name()
        );

        Ok(Self {
            listener,
            local_addr,
            accept_timeout: config.accept_timeout,
            ctx: Arc::new(GatewayContext {
                rules: RuleEngine::new(config.rules.clone()),
                extractor,
                rotator,
                connect_timeout: config.connect_timeout,
                buffer_size: config.buffer_size,
                front_fallback_direct: config.front_fallback_direct,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `stop` is raised, then close open connections
    #[instrument(skip(self, stop), fields(addr = %self.local_addr))]
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<()> {
        let mut connections = JoinSet::new();

        while !*stop.borrow() {
            while connections.try_join_next().is_some() {}

            match timeout(self.accept_timeout, self.listener.accept()).await {
                // Idle; loop to re-check stop
                Err(_) => continue,
                Ok(Ok((stream, client_addr))) => {
                    let ctx = self.ctx.clone();
                    let conn_stop = stop.clone();
                    connections.spawn(handle_connection(stream, client_addr, ctx, conn_stop));
                }
                Ok(Err(e)) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        info!("Gateway shutting down");
        drop(self.listener);
        while connections.join_next().await.is_some() {}
        info!("Gateway stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    stop: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let mut conn = InboundConnection::accepted(client_addr);

    match forward(stream, &mut conn, &ctx, stop).await {
        Ok(()) => {}
        Err(GateError::Cancelled) => {
            debug!("Gateway connection from {} dropped during shutdown", client_addr);
            return;
        }
        Err(e) => conn.fail(e),
    }

    match conn.state {
        ConnectionState::Failed => warn!(
            client = %conn.client_addr,
            destination = %conn.destination(),
            rule = ?conn.matched_rule,
            route = ?conn.route,
            error = conn.error.as_deref().unwrap_or_default(),
            "Gateway connection failed"
        ),
        _ => info!(
            client = %conn.client_addr,
            destination = %conn.destination(),
            rule = ?conn.matched_rule,
            backend = conn.backend.as_deref().unwrap_or_default(),
            bytes_sent = conn.bytes_sent,
            bytes_received = conn.bytes_received,
            elapsed_ms = conn.elapsed().as_millis() as u64,
            "Gateway connection closed"
        ),
    }
}

async fn forward(
    mut stream: TcpStream,
    conn: &mut InboundConnection,
    ctx: &GatewayContext,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut preamble = BytesMut::with_capacity(4096);
    let dest = setup_step(
        ctx,
        &mut stop,
        read_destination(&mut stream, &mut preamble, ctx.extractor.as_ref()),
    )
    .await?;

    conn.host = Some(dest.host.clone());
    conn.port = Some(dest.port);

    let matched = ctx.rules.classify(&dest.host, Some(dest.port));
    conn.matched_rule = matched.as_ref().map(|m| m.rule_index);

    let fronting = matched.and_then(|m| m.front.map(|front| (front, m.tunnel_type)));

    let (mut backend, route, front_host) = match fronting {
        Some((front, tunnel_type)) => {
            let port = front.port_or(dest.port);
            let rotator_empty = ctx.rotator.endpoints.live_endpoints().is_empty();

            if rotator_empty && ctx.front_fallback_direct {
                debug!("No live tunnels, dialing front {}:{} directly", front.host(), port);
                let backend = setup_step(ctx, &mut stop, dial_direct(front.host(), port)).await?;
                let route = Route::FrontedDirect {
                    front: front.to_string(),
                    tunnel_type,
                };
                (backend, route, Some(front))
            } else {
                let backend = setup_step(ctx, &mut stop, dial_via_rotator(&ctx.rotator, front.host(), port))
                    .await?;
                let route = Route::Fronted {
                    front: front.to_string(),
                    tunnel_type,
                };
                (backend, route, Some(front))
            }
        }
        None => {
            let backend = setup_step(ctx, &mut stop, dial_direct(&dest.host, dest.port)).await?;
            (backend, Route::Direct, None)
        }
    };

    conn.backend = Some(match &front_host {
        Some(front) => format!("{}:{}", front.host(), front.port_or(dest.port)),
        None => format!("{}:{}", dest.host, dest.port),
    });
    conn.route = Some(route);
    let _ = backend.set_nodelay(true);

    let forwarded = send_opening(
        &mut stream,
        &mut backend,
        &dest,
        &preamble,
        front_host.as_ref().map(|f| f.host()),
    )
    .await?;

    let stats = relay::copy_bidirectional(stream, backend, ctx.buffer_size, stop).await;
    conn.close(stats.bytes_sent + forwarded, stats.bytes_received);
    Ok(())
}

/// Buffer client bytes until the extractor finds a destination
async fn read_destination(
    stream: &mut TcpStream,
    preamble: &mut BytesMut,
    extractor: &dyn DestinationExtractor,
) -> Result<Destination> {
    loop {
        if stream.read_buf(preamble).await? == 0 {
            return Err(GateError::DestinationUnknown(
                "client closed before naming a destination".to_string(),
            ));
        }

        match extractor.extract(preamble) {
            Extraction::Found(dest) => return Ok(dest),
            Extraction::Incomplete if preamble.len() < MAX_PREAMBLE => continue,
            Extraction::Incomplete => {
                return Err(GateError::DestinationUnknown(
                    "opening bytes exceed limit".to_string(),
                ))
            }
            Extraction::Unrecognized(reason) => return Err(GateError::DestinationUnknown(reason)),
        }
    }
}

/// Hand the buffered opening bytes to the backend.
///
/// Returns how many bytes were written to the backend.
async fn send_opening(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    dest: &Destination,
    preamble: &[u8],
    front_host: Option<&str>,
) -> Result<u64> {
    let (head, rest) = preamble.split_at(dest.head_len.min(preamble.len()));

    let written = match (dest.kind, front_host) {
        // Answer the CONNECT ourselves and pass only what followed it
        (PreambleKind::HttpConnect, None) => {
            client.write_all(CONNECT_ESTABLISHED).await?;
            backend.write_all(rest).await?;
            rest.len()
        }
        (PreambleKind::HttpConnect | PreambleKind::HttpRequest, Some(front)) => {
            let rewritten = rewrite_host_header(head, front);
            backend.write_all(&rewritten).await?;
            backend.write_all(rest).await?;
            rewritten.len() + rest.len()
        }
        (PreambleKind::HttpRequest | PreambleKind::Tls, _) => {
            backend.write_all(preamble).await?;
            preamble.len()
        }
    };

    backend.flush().await?;
    Ok(written as u64)
}

/// Run one setup step under the connect deadline, giving up on stop
async fn setup_step<T, F>(
    ctx: &GatewayContext,
    stop: &mut watch::Receiver<bool>,
    step: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        result = timeout(ctx.connect_timeout, step) => result.map_err(|_| GateError::Timeout)?,
        _ = stopped(stop) => Err(GateError::Cancelled),
    }
}

async fn dial_direct(host: &str, port: u16) -> Result<TcpStream> {
    TcpStream::connect((host, port)).await.map_err(|e| {
        GateError::ProxyConnectionFailed(format!("direct connect to {}:{} failed: {}", host, port, e))
    })
}

async fn dial_via_rotator(link: &RotatorLink, host: &str, port: u16) -> Result<TcpStream> {
    let stream = Socks5Stream::connect_with_password(
        link.addr,
        (host, port),
        &link.username,
        &link.password,
    )
    .await?;
    Ok(stream.into_inner())
}
