//! Resolver transports used by the DNS Resolution Layer.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::dns::{DnsError, DnsTransportKind, RecordType};
use crate::tls_wrapper::TlsWrapper;

#[async_trait]
pub trait DnsTransport: Send + Sync {
    fn kind(&self) -> DnsTransportKind;

    fn endpoint(&self) -> &str;

    /// `ech` requests an Encrypted Client Hello handshake with the resolver.
    async fn query(
        &self,
        hostname: &str,
        record: RecordType,
        ech: bool,
    ) -> Result<Vec<IpAddr>, DnsError>;

    async fn probe_ech(&self) -> bool {
        false
    }
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires: Instant,
}

#[derive(Default)]
struct DnsCache {
    entries: Mutex<HashMap<(String, RecordType), CacheEntry>>,
}

impl DnsCache {
    fn get(&self, hostname: &str, record: RecordType) -> Option<Vec<IpAddr>> {
        let entries = self.entries.lock();
        let entry = entries.get(&(hostname.to_string(), record))?;
        if entry.expires > Instant::now() {
            Some(entry.ips.clone())
        } else {
            None
        }
    }

    fn put(&self, hostname: &str, record: RecordType, ips: Vec<IpAddr>, ttl: u32) {
        let expires = Instant::now() + Duration::from_secs(u64::from(ttl));
        self.entries
            .lock()
            .insert((hostname.to_string(), record), CacheEntry { ips, expires });
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

const MAX_CACHE_TTL: u32 = 300;

/// DNS-over-HTTPS using the JSON API (`application/dns-json`).
///
/// The HTTP stack cannot offer ECH, so ECH queries are reported as rejected
/// and the layer falls back to a plain DoH handshake.
pub struct DohTransport {
    client: reqwest::Client,
    endpoint: String,
    cache: DnsCache,
}

impl DohTransport {
    /// A hostname endpoint is pinned to `pinned` so the HTTP stack never asks
    /// the system resolver for it. An IP-literal endpoint needs no pin.
    pub fn new(endpoint: impl Into<String>, timeout: Duration, pinned: &[IpAddr]) -> Result<Self, DnsError> {
        let endpoint = endpoint.into();
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| DnsError::Transport(format!("invalid DoH endpoint `{endpoint}`: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| DnsError::Transport(format!("DoH endpoint `{endpoint}` has no host")))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let mut builder = reqwest::Client::builder().https_only(true).timeout(timeout);
        if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_err() {
            if pinned.is_empty() {
                return Err(DnsError::Transport(format!(
                    "DoH endpoint `{endpoint}` names a host but no resolver address pins it"
                )));
            }
            let addrs: Vec<SocketAddr> = pinned.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
            builder = builder.resolve_to_addrs(host, &addrs);
        }
        let client = builder.build().map_err(|e| DnsError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            cache: DnsCache::default(),
        })
    }
}

#[async_trait]
impl DnsTransport for DohTransport {
    fn kind(&self) -> DnsTransportKind {
        DnsTransportKind::Doh
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(
        &self,
        hostname: &str,
        record: RecordType,
        ech: bool,
    ) -> Result<Vec<IpAddr>, DnsError> {
        if ech {
            return Err(DnsError::EchRejected(self.endpoint.clone()));
        }
        if let Some(cached) = self.cache.get(hostname, record) {
            return Ok(cached);
        }

        let mut last_error = None;
        for attempt in 0..2 {
            let response = match self
                .client
                .get(&self.endpoint)
                .query(&[("name", hostname), ("type", record.as_str())])
                .header("Accept", "application/dns-json")
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(attempt, endpoint = %self.endpoint, error = %e, "DoH request failed");
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            let body = match response.json::<DohResponse>().await {
                Ok(body) => body,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            if body.status == 3 {
                return Err(DnsError::ResolutionFailed(hostname.to_string()));
            }

            let mut ips = Vec::new();
            let mut min_ttl = MAX_CACHE_TTL;
            for answer in body.answer.unwrap_or_default() {
                if answer.record_type != record.code() {
                    continue;
                }
                if let Ok(ip) = answer.data.parse::<IpAddr>() {
                    ips.push(ip);
                    min_ttl = min_ttl.min(answer.ttl);
                }
            }
            if !ips.is_empty() {
                self.cache.put(hostname, record, ips.clone(), min_ttl);
            }
            return Ok(ips);
        }

        Err(DnsError::Transport(
            last_error.unwrap_or_else(|| "DoH query failed".to_string()),
        ))
    }
}

/// DNS-over-TLS (RFC 7858): length-prefixed DNS wire messages over TLS on 853.
pub struct DotTransport {
    endpoint: String,
    addr: SocketAddr,
    tls_name: String,
    tls: TlsWrapper,
    cache: DnsCache,
}

impl DotTransport {
    /// `endpoint` must be an `ip:port` literal; resolving the resolver itself
    /// would go through the system resolver.
    pub fn new(endpoint: &str, tls_name: &str) -> Result<Self, DnsError> {
        let addr = endpoint.parse::<SocketAddr>().map_err(|_| {
            DnsError::Transport(format!("DoT endpoint `{endpoint}` must be an ip:port literal"))
        })?;
        let tls = TlsWrapper::with_native_roots().map_err(|e| DnsError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            addr,
            tls_name: tls_name.to_string(),
            tls,
            cache: DnsCache::default(),
        })
    }

    async fn exchange(&self, packet: &[u8]) -> std::io::Result<Vec<u8>> {
        let tcp = TcpStream::connect(self.addr).await?;
        let server_name = TlsWrapper::server_name(&self.tls_name)?;
        let mut stream = self.tls.connector().connect(server_name, tcp).await?;

        let len = u16::try_from(packet.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large"))?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(packet).await?;
        stream.flush().await?;

        let response_len = stream.read_u16().await?;
        let mut response = vec![0u8; usize::from(response_len)];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }
}

#[async_trait]
impl DnsTransport for DotTransport {
    fn kind(&self) -> DnsTransportKind {
        DnsTransportKind::Dot
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(
        &self,
        hostname: &str,
        record: RecordType,
        ech: bool,
    ) -> Result<Vec<IpAddr>, DnsError> {
        if ech {
            return Err(DnsError::EchRejected(self.endpoint.clone()));
        }
        if let Some(cached) = self.cache.get(hostname, record) {
            return Ok(cached);
        }

        let id: u16 = rand::random();
        let packet = encode_query(id, hostname, record)?;
        let response = self.exchange(&packet).await.map_err(|e| {
            warn!(endpoint = %self.endpoint, error = %e, "DoT exchange failed");
            DnsError::Transport(e.to_string())
        })?;
        let (ips, ttl) = decode_response(id, hostname, record, &response)?;
        if !ips.is_empty() {
            self.cache.put(hostname, record, ips.clone(), ttl.min(MAX_CACHE_TTL));
        }
        Ok(ips)
    }
}

/// The operating system resolver. Only ever reachable in Standard mode.
#[derive(Debug, Default)]
pub struct SystemTransport;

#[async_trait]
impl DnsTransport for SystemTransport {
    fn kind(&self) -> DnsTransportKind {
        DnsTransportKind::System
    }

    fn endpoint(&self) -> &str {
        "system"
    }

    async fn query(
        &self,
        hostname: &str,
        record: RecordType,
        _ech: bool,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let addrs = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|_| DnsError::ResolutionFailed(hostname.to_string()))?;
        Ok(addrs
            .map(|addr| addr.ip())
            .filter(|ip| match record {
                RecordType::A => ip.is_ipv4(),
                RecordType::Aaaa => ip.is_ipv6(),
            })
            .collect())
    }
}

pub(crate) fn encode_query(id: u16, hostname: &str, record: RecordType) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(18 + hostname.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in hostname.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(DnsError::InvalidDomain(hostname.to_string()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&record.code().to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // IN
    Ok(packet)
}

fn malformed() -> DnsError {
    DnsError::Transport("malformed DNS response".to_string())
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DnsError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(malformed)
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DnsError> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(malformed)
}

fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, DnsError> {
    loop {
        let len = *buf.get(pos).ok_or_else(malformed)?;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            buf.get(pos + 1).ok_or_else(malformed)?;
            return Ok(pos + 2);
        }
        pos += 1 + usize::from(len);
    }
}

/// Returns the matching addresses and the smallest TTL among them.
pub(crate) fn decode_response(
    id: u16,
    hostname: &str,
    record: RecordType,
    buf: &[u8],
) -> Result<(Vec<IpAddr>, u32), DnsError> {
    if read_u16(buf, 0)? != id {
        return Err(DnsError::Transport("DNS response id mismatch".to_string()));
    }
    let flags = read_u16(buf, 2)?;
    if flags & 0x8000 == 0 {
        return Err(malformed());
    }
    match flags & 0x000F {
        0 => {}
        3 => return Err(DnsError::ResolutionFailed(hostname.to_string())),
        rcode => return Err(DnsError::Transport(format!("resolver returned rcode {rcode}"))),
    }
    let questions = read_u16(buf, 4)?;
    let answers = read_u16(buf, 6)?;

    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(buf, pos)? + 4;
    }

    let mut ips = Vec::new();
    let mut min_ttl = u32::MAX;
    for _ in 0..answers {
        pos = skip_name(buf, pos)?;
        let rtype = read_u16(buf, pos)?;
        let ttl = read_u32(buf, pos + 4)?;
        let rdlen = usize::from(read_u16(buf, pos + 8)?);
        pos += 10;
        let rdata = buf.get(pos..pos + rdlen).ok_or_else(malformed)?;
        pos += rdlen;

        let ip = match (record, rtype, rdata.len()) {
            (RecordType::A, 1, 4) => IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            (RecordType::Aaaa, 28, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => continue,
        };
        ips.push(ip);
        min_ttl = min_ttl.min(ttl);
    }
    Ok((ips, min_ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doh_hostname_endpoint_must_be_pinned() {
        let timeout = Duration::from_secs(1);
        let unpinned = DohTransport::new("https://dns.example/dns-query", timeout, &[]);
        assert!(matches!(unpinned, Err(DnsError::Transport(ref m)) if m.contains("no resolver address")));

        let pin = ["192.0.2.53".parse::<IpAddr>().unwrap()];
        assert!(DohTransport::new("https://dns.example/dns-query", timeout, &pin).is_ok());
        assert!(DohTransport::new("https://1.1.1.1/dns-query", timeout, &[]).is_ok());
    }

    fn answer_packet(id: u16, query: &[u8], rcode: u8) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.extend_from_slice(&id.to_be_bytes());
        resp.extend_from_slice(&[0x81, 0x80 | rcode]);
        resp.extend_from_slice(&1u16.to_be_bytes());
        resp.extend_from_slice(&2u16.to_be_bytes());
        resp.extend_from_slice(&[0, 0, 0, 0]);
        resp.extend_from_slice(&query[12..]);
        // CNAME answer that must be skipped, then the A record.
        resp.extend_from_slice(&[0xC0, 0x0C, 0, 5, 0, 1, 0, 0, 0, 60, 0, 2, 0xC0, 0x0C]);
        resp.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 30, 0, 4, 93, 184, 216, 34]);
        resp
    }

    #[test]
    fn query_encodes_labels() {
        let packet = encode_query(0xBEEF, "example.com", RecordType::A).unwrap();
        assert_eq!(&packet[..2], &[0xBE, 0xEF]);
        assert_eq!(&packet[12..25], b"\x07example\x03com\x00");
        assert_eq!(&packet[25..], &[0, 1, 0, 1]);
    }

    #[test]
    fn oversized_label_rejected() {
        let label = "a".repeat(64);
        let err = encode_query(1, &format!("{label}.test"), RecordType::A).unwrap_err();
        assert!(matches!(err, DnsError::InvalidDomain(_)));
    }

    #[test]
    fn decode_skips_cname_and_keeps_min_ttl() {
        let query = encode_query(7, "example.com", RecordType::A).unwrap();
        let resp = answer_packet(7, &query, 0);
        let (ips, ttl) = decode_response(7, "example.com", RecordType::A, &resp).unwrap();
        assert_eq!(ips, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert_eq!(ttl, 30);
    }

    #[test]
    fn decode_rejects_wrong_id_and_nxdomain() {
        let query = encode_query(7, "example.com", RecordType::A).unwrap();
        let resp = answer_packet(7, &query, 0);
        assert!(decode_response(8, "example.com", RecordType::A, &resp).is_err());

        let nx = answer_packet(7, &query, 3);
        assert_eq!(
            decode_response(7, "example.com", RecordType::A, &nx).unwrap_err(),
            DnsError::ResolutionFailed("example.com".to_string())
        );
    }

    #[test]
    fn decode_truncated_is_malformed() {
        let query = encode_query(7, "example.com", RecordType::A).unwrap();
        let resp = answer_packet(7, &query, 0);
        let truncated = &resp[..resp.len() - 2];
        assert!(decode_response(7, "example.com", RecordType::A, truncated).is_err());
    }

    #[test]
    fn dot_endpoint_must_be_literal() {
        assert!(matches!(
            DotTransport::new("dns.example:853", "dns.example"),
            Err(DnsError::Transport(_))
        ));
    }
}
