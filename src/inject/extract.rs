//! Destination extraction from the first bytes a client sends
//!
//! The gateway buffers the client's opening bytes and asks an extractor
//! where the connection was meant to go. HTTP requests name it in the
//! request line or `Host` header, TLS in the ClientHello server name.

use std::sync::Arc;

use crate::models::split_host_port;

const TLS_RECORD_HEADER: usize = 5;
/// Largest plaintext TLS record body (RFC 8446 section 5.1)
const TLS_MAX_RECORD: usize = 16 * 1024;

/// Upper bound on buffered opening bytes, one full TLS record
pub const MAX_PREAMBLE: usize = TLS_RECORD_HEADER + TLS_MAX_RECORD;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;

/// Which extractor the gateway uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractorKind {
    /// Sniff TLS vs HTTP from the first byte
    #[default]
    Auto,
    Http,
    Sni,
}

impl ExtractorKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "http" => Some(Self::Http),
            "sni" | "tls" => Some(Self::Sni),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Http => "http",
            Self::Sni => "sni",
        }
    }
}

/// How the client expressed its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleKind {
    /// `CONNECT host:port`; the client waits for a proxy reply
    HttpConnect,
    /// Plain HTTP request
    HttpRequest,
    /// TLS ClientHello
    Tls,
}

/// Destination found in a preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub kind: PreambleKind,
    /// Length of the HTTP head including the blank line, 0 for TLS
    pub head_len: usize,
}

/// Result of inspecting the bytes buffered so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(Destination),
    /// Not enough bytes yet
    Incomplete,
    Unrecognized(String),
}

/// Strategy for finding the intended destination of a connection
pub trait DestinationExtractor: Send + Sync {
    fn extract(&self, preamble: &[u8]) -> Extraction;

    fn name(&self) -> &'static str;
}

/// Create an extractor for `kind`
pub fn create_extractor(kind: ExtractorKind) -> Arc<dyn DestinationExtractor> {
    match kind {
        ExtractorKind::Auto => Arc::new(AutoExtractor),
        ExtractorKind::Http => Arc::new(HttpExtractor),
        ExtractorKind::Sni => Arc::new(SniExtractor),
    }
}

/// Reads CONNECT targets, absolute URIs and `Host` headers
pub struct HttpExtractor;

impl DestinationExtractor for HttpExtractor {
    fn extract(&self, preamble: &[u8]) -> Extraction {
        let Some(head_len) = find_head_end(preamble) else {
            if preamble.len() >= MAX_PREAMBLE {
                return Extraction::Unrecognized("HTTP head too large".to_string());
            }
            if !looks_like_method(preamble) {
                return Extraction::Unrecognized("not an HTTP request".to_string());
            }
            return Extraction::Incomplete;
        };

        let Ok(head) = std::str::from_utf8(&preamble[..head_len]) else {
            return Extraction::Unrecognized("HTTP head is not UTF-8".to_string());
        };

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Extraction::Unrecognized(format!("bad request line '{}'", request_line));
        };

        if method.eq_ignore_ascii_case("CONNECT") {
            return match host_port(target, 443) {
                Some((host, port)) => Extraction::Found(Destination {
                    host,
                    port,
                    kind: PreambleKind::HttpConnect,
                    head_len,
                }),
                None => Extraction::Unrecognized(format!("bad CONNECT target '{}'", target)),
            };
        }

        if let Ok(url) = url::Url::parse(target) {
            if let Some(host) = url.host_str() {
                return Extraction::Found(Destination {
                    host: host.to_string(),
                    port: url.port_or_known_default().unwrap_or(80),
                    kind: PreambleKind::HttpRequest,
                    head_len,
                });
            }
        }

        let host_header = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.trim());

        match host_header.and_then(|value| host_port(value, 80)) {
            Some((host, port)) => Extraction::Found(Destination {
                host,
                port,
                kind: PreambleKind::HttpRequest,
                head_len,
            }),
            None => Extraction::Unrecognized("request has no Host header".to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Reads the server name from a TLS ClientHello
pub struct SniExtractor;

impl DestinationExtractor for SniExtractor {
    fn extract(&self, preamble: &[u8]) -> Extraction {
        if preamble.is_empty() {
            return Extraction::Incomplete;
        }
        if preamble[0] != TLS_HANDSHAKE {
            return Extraction::Unrecognized("not a TLS handshake".to_string());
        }
        if preamble.len() < TLS_RECORD_HEADER {
            return Extraction::Incomplete;
        }

        let record_len = u16::from_be_bytes([preamble[3], preamble[4]]) as usize;
        if record_len > TLS_MAX_RECORD {
            return Extraction::Unrecognized(format!("TLS record of {} bytes", record_len));
        }
        let record_end = TLS_RECORD_HEADER + record_len;
        if preamble.len() < record_end {
            return Extraction::Incomplete;
        }

        match parse_client_hello_sni(&preamble[TLS_RECORD_HEADER..record_end]) {
            Some(host) => Extraction::Found(Destination {
                host,
                port: 443,
                kind: PreambleKind::Tls,
                head_len: 0,
            }),
            None => Extraction::Unrecognized("ClientHello carries no server name".to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "sni"
    }
}

/// Picks the TLS or HTTP extractor from the first byte
pub struct AutoExtractor;

impl DestinationExtractor for AutoExtractor {
    fn extract(&self, preamble: &[u8]) -> Extraction {
        match preamble.first() {
            None => Extraction::Incomplete,
            Some(&TLS_HANDSHAKE) => SniExtractor.extract(preamble),
            Some(_) => HttpExtractor.extract(preamble),
        }
    }

    fn name(&self) -> &'static str {
        "auto"
    }
}

/// Replace (or add) the `Host` header of an HTTP head.
///
/// The request line is kept, so a CONNECT still names the true destination.
pub fn rewrite_host_header(head: &[u8], front_host: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(head);
    let body = text.strip_suffix("\r\n\r\n").unwrap_or(&text);

    let mut lines = body.split("\r\n");
    let mut out = String::with_capacity(head.len() + front_host.len());
    out.push_str(lines.next().unwrap_or_default());
    out.push_str("\r\n");

    let mut replaced = false;
    for line in lines {
        let is_host = line
            .split_once(':')
            .map(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
            .unwrap_or(false);

        if is_host {
            if !replaced {
                out.push_str("Host: ");
                out.push_str(front_host);
                out.push_str("\r\n");
                replaced = true;
            }
        } else {
            out.push_str(line);
            out.push_str("\r\n");
        }
    }

    if !replaced {
        out.push_str("Host: ");
        out.push_str(front_host);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn looks_like_method(buf: &[u8]) -> bool {
    buf.iter()
        .take_while(|&&b| b != b' ')
        .take(16)
        .all(|b| b.is_ascii_uppercase())
}

fn host_port(value: &str, default_port: u16) -> Option<(String, u16)> {
    let (host, port) = split_host_port(value).ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port.unwrap_or(default_port)))
}

/// Walk a ClientHello handshake message to its server_name extension
fn parse_client_hello_sni(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);

    if r.u8()? != TLS_CLIENT_HELLO {
        return None;
    }
    let hello_len = r.u24()?;
    let mut hello = Reader::new(r.take(hello_len)?);

    hello.skip(2 + 32)?; // version, random
    let session_id = hello.u8()? as usize;
    hello.skip(session_id)?;
    let ciphers = hello.u16()? as usize;
    hello.skip(ciphers)?;
    let compression = hello.u8()? as usize;
    hello.skip(compression)?;

    let ext_len = hello.u16()? as usize;
    let mut exts = Reader::new(hello.take(ext_len)?);
    while !exts.is_empty() {
        let ext_type = exts.u16()?;
        let len = exts.u16()? as usize;
        let body = exts.take(len)?;
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name_list(body);
        }
    }

    None
}

fn parse_server_name_list(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    let list_len = r.u16()? as usize;
    let mut list = Reader::new(r.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let len = list.u16()? as usize;
        let name = list.take(len)?;
        // host_name
        if name_type == 0 && !name.is_empty() {
            return std::str::from_utf8(name).ok().map(|s| s.to_ascii_lowercase());
        }
    }

    None
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.data.len() {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}
