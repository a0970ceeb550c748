//! Server side of the SOCKS5 protocol (RFC 1928) with username/password
//! sub-negotiation (RFC 1929).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{GateError, Result};
use crate::proxy::middleware::SocksAuth;

pub const VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Reply::Succeeded,
            0x01 => Reply::GeneralFailure,
            0x02 => Reply::NotAllowed,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TtlExpired,
            0x07 => Reply::CommandNotSupported,
            0x08 => Reply::AddressTypeNotSupported,
            _ => return None,
        })
    }
}

/// Destination requested by a CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Run method selection and username/password authentication.
///
/// On failure the matching rejection has already been written to the client.
pub async fn negotiate<S>(stream: &mut S, auth: &SocksAuth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(GateError::Handshake(format!(
            "unsupported version {:#04x}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_USERNAME_PASSWORD) {
        stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
        stream.flush().await?;
        return Err(GateError::NoAcceptableMethod);
    }

    stream.write_all(&[VERSION, METHOD_USERNAME_PASSWORD]).await?;
    stream.flush().await?;

    let mut auth_head = [0u8; 2];
    stream.read_exact(&mut auth_head).await?;
    if auth_head[0] != AUTH_VERSION {
        stream.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
        return Err(GateError::Handshake(format!(
            "unsupported auth version {:#04x}",
            auth_head[0]
        )));
    }

    let mut username = vec![0u8; auth_head[1] as usize];
    stream.read_exact(&mut username).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    match auth.validate(&username, &password) {
        Ok(()) => {
            stream.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;
            stream.flush().await?;
            Ok(())
        }
        Err(e) => {
            stream.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
            stream.flush().await?;
            Err(e)
        }
    }
}

/// Read the request following a successful negotiation.
///
/// Only CONNECT is accepted; the caller replies to rejected requests using
/// [`GateError::socks_reply`].
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(GateError::Handshake(format!(
            "unsupported request version {:#04x}",
            head[0]
        )));
    }
    if head[1] != CMD_CONNECT {
        return Err(GateError::UnsupportedCommand(head[1]));
    }

    let target = match head[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(ip),
                port,
                0,
                0,
            )))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(name)
                .map_err(|_| GateError::Handshake("domain is not valid UTF-8".to_string()))?;
            TargetAddr::Domain(host, port)
        }
        other => return Err(GateError::UnsupportedAddressType(other)),
    };

    debug!("SOCKS5 CONNECT request for {}", target);
    Ok(target)
}

/// Write a reply carrying `bound` (or `0.0.0.0:0`) as BND.ADDR/BND.PORT
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[VERSION, reply.code(), 0x00]);
    match bound {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
