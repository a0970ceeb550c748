//! Bidirectional byte relay between a client and its backend
//!
//! Each direction is pumped through a fixed-size buffer. When one side
//! reaches EOF the opposite write half is shut down so half-closes
//! propagate, and the relay ends once both directions are done or the
//! stop signal fires.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::shutdown::stopped;

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to backend
    pub bytes_sent: u64,
    /// Backend to client
    pub bytes_received: u64,
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    total: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_counted(reader, writer, buffer_size, total).await;
    let _ = writer.shutdown().await;
    result
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    total: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

/// Copy data both ways until both sides close or `stop` is raised
pub async fn copy_bidirectional<C, S>(
    client: C,
    server: S,
    buffer_size: usize,
    mut stop: watch::Receiver<bool>,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let mut stats = RelayStats::default();
    let buffer_size = buffer_size.max(1);

    {
        let transfer = async {
            tokio::join!(
                pump(
                    &mut client_read,
                    &mut server_write,
                    buffer_size,
                    &mut stats.bytes_sent
                ),
                pump(
                    &mut server_read,
                    &mut client_write,
                    buffer_size,
                    &mut stats.bytes_received
                ),
            )
        };

        tokio::select! {
            (up, down) = transfer => {
                if let Err(e) = up {
                    debug!("Client to server copy ended: {}", e);
                }
                if let Err(e) = down {
                    debug!("Server to client copy ended: {}", e);
                }
            }
            _ = stopped(&mut stop) => {
                debug!("Relay interrupted by shutdown");
            }
        }
    }

    debug!(
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        "Relay closed"
    );

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::StopHandle;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_copy_bidirectional() {
        let (handle, stop) = StopHandle::new();
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut target_client, target_server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move {
            copy_bidirectional(client, target_server, 4, stop).await
        });

        server.write_all(b"hello from client").await.unwrap();
        server.shutdown().await.unwrap();

        target_client.write_all(b"hello from server").await.unwrap();
        target_client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        target_client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from server");

        let stats = tokio::time::timeout(Duration::from_secs(1), copy_handle)
            .await
            .expect("copy_bidirectional timed out")
            .unwrap();
        assert_eq!(stats.bytes_sent, 17);
        assert_eq!(stats.bytes_received, 17);
        drop(handle);
    }

    #[tokio::test]
    async fn test_half_close_propagates() {
        let (_handle, stop) = StopHandle::new();
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (server, mut server_peer) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move { copy_bidirectional(client, server, 8, stop).await });

        // Client finishes sending; backend sees EOF but can still answer
        client_peer.write_all(b"request").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        server_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        server_peer.write_all(b"response").await.unwrap();
        server_peer.shutdown().await.unwrap();

        let mut answer = Vec::new();
        client_peer.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, b"response");

        let stats = relay.await.unwrap();
        assert_eq!(stats.bytes_received, 8);
    }

    #[tokio::test]
    async fn test_stop_interrupts_idle_relay() {
        let (handle, stop) = StopHandle::new();
        let (client, _client_peer) = tokio::io::duplex(64);
        let (server, _server_peer) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move { copy_bidirectional(client, server, 8, stop).await });
        handle.stop();

        let stats = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay ignored stop")
            .unwrap();
        assert_eq!(stats, RelayStats::default());
    }
}
