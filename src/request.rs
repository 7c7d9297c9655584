//! Identifiers and the per-attempt connection request.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Browser profile. Exactly one egress mode is active per profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(Arc<str>);

impl ProfileId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolated browsing context (tab group / profile partition).
///
/// A container always belongs to one profile; the pair is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    profile: ProfileId,
    partition: Arc<str>,
}

impl ContainerId {
    pub fn new(profile: ProfileId, partition: impl Into<String>) -> Self {
        Self {
            profile,
            partition: Arc::from(partition.into()),
        }
    }

    pub fn profile(&self) -> &ProfileId {
        &self.profile
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile, self.partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Content,
    Gpu,
    Utility,
    Extension,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessKind::Content => "content",
            ProcessKind::Gpu => "gpu",
            ProcessKind::Utility => "utility",
            ProcessKind::Extension => "extension",
        };
        f.write_str(name)
    }
}

/// `Dns` requests are resolution-only and are answered inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Dns,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Dns => "dns",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Host(String),
    Ip(IpAddr),
}

impl Destination {
    /// Parses a destination, recognising bracketed and bare IP literals.
    /// Hostnames are lowercased and lose a trailing root dot.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        match unbracketed.parse::<IpAddr>() {
            Ok(ip) => Destination::Ip(ip),
            Err(_) => Destination::Host(trimmed.trim_end_matches('.').to_ascii_lowercase()),
        }
    }

    pub fn is_ip_literal(&self) -> bool {
        matches!(self, Destination::Ip(_))
    }

    /// Host component of the circuit isolation key.
    pub fn isolation_host(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Host(host) => f.write_str(host),
            Destination::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One connection attempt. Created per attempt and never mutated by the broker.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub id: RequestId,
    pub process: ProcessKind,
    pub container: ContainerId,
    pub destination: Destination,
    pub port: u16,
    pub protocol: Protocol,
    /// Pre-connect or prefetch issued ahead of user navigation.
    pub speculative: bool,
    pub timestamp: SystemTime,
}

impl ConnectionRequest {
    pub fn new(
        process: ProcessKind,
        container: ContainerId,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            id: RequestId::next(),
            process,
            container,
            destination: Destination::parse(host),
            port,
            protocol,
            speculative: false,
            timestamp: SystemTime::now(),
        }
    }

    pub fn speculative(mut self) -> Self {
        self.speculative = true;
        self
    }
}
