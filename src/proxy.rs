//! Proxy Registry: per-container proxy configuration with split-tunnel checks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

use crate::request::{ContainerId, Protocol};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyScope {
    Global,
    Container(ContainerId),
}

impl fmt::Display for ProxyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyScope::Global => f.write_str("global"),
            ProxyScope::Container(id) => write!(f, "container {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    /// Manual HTTP proxy speaking CONNECT.
    Http,
    Socks5,
    /// Proxy auto-config. `allows_direct` is set when the script can return
    /// `DIRECT` for some URL.
    Pac { script: String, allows_direct: bool },
}

impl ProxyKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Pac { .. } => "pac",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The endpoint's address when it is configured as an IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.trim_start_matches('[').trim_end_matches(']').parse().ok()
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Opaque reference into the platform credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialsHandle(Arc<str>);

impl CredentialsHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    fn lookup(&self, handle: &CredentialsHandle) -> Option<Credentials>;
}

#[derive(Default)]
pub struct StaticCredentialStore {
    entries: RwLock<HashMap<CredentialsHandle, Credentials>>,
}

impl StaticCredentialStore {
    pub fn insert(&self, handle: CredentialsHandle, credentials: Credentials) {
        self.entries.write().insert(handle, credentials);
    }
}

impl CredentialStore for StaticCredentialStore {
    fn lookup(&self, handle: &CredentialsHandle) -> Option<Credentials> {
        self.entries.read().get(handle).cloned()
    }
}

/// Traffic classes a proxy configuration has to account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteProtocol {
    Http,
    Https,
    Dns,
    WebRtcIce,
    Quic,
}

impl RouteProtocol {
    pub const ALL: [RouteProtocol; 5] = [
        RouteProtocol::Http,
        RouteProtocol::Https,
        RouteProtocol::Dns,
        RouteProtocol::WebRtcIce,
        RouteProtocol::Quic,
    ];

    pub fn for_request(protocol: Protocol, port: u16) -> Self {
        match (protocol, port) {
            (Protocol::Dns, _) => RouteProtocol::Dns,
            (Protocol::Tcp, 80) => RouteProtocol::Http,
            (Protocol::Tcp, _) => RouteProtocol::Https,
            (Protocol::Udp, 443) => RouteProtocol::Quic,
            (Protocol::Udp, _) => RouteProtocol::WebRtcIce,
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, RouteProtocol::WebRtcIce | RouteProtocol::Quic)
    }
}

impl fmt::Display for RouteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteProtocol::Http => "http",
            RouteProtocol::Https => "https",
            RouteProtocol::Dns => "dns",
            RouteProtocol::WebRtcIce => "webrtc-ice",
            RouteProtocol::Quic => "quic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Proxy,
    Blocked,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scope: ProxyScope,
    pub kind: ProxyKind,
    pub endpoint: Option<ProxyEndpoint>,
    pub credentials: Option<CredentialsHandle>,
    pub routes: BTreeMap<RouteProtocol, RouteTarget>,
    pub split_tunnel_disallowed: bool,
}

impl ProxyConfig {
    /// A config with no routes declared and split tunnelling disallowed.
    pub fn new(scope: ProxyScope, kind: ProxyKind, endpoint: ProxyEndpoint) -> Self {
        Self {
            scope,
            kind,
            endpoint: Some(endpoint),
            credentials: None,
            routes: BTreeMap::new(),
            split_tunnel_disallowed: true,
        }
    }

    /// Stream traffic and DNS through the proxy, datagram traffic blocked.
    pub fn full_tunnel(scope: ProxyScope, kind: ProxyKind, endpoint: ProxyEndpoint) -> Self {
        let mut config = Self::new(scope, kind, endpoint);
        for protocol in RouteProtocol::ALL {
            let target = if protocol.is_datagram() {
                RouteTarget::Blocked
            } else {
                RouteTarget::Proxy
            };
            config.routes.insert(protocol, target);
        }
        config
    }

    pub fn route(mut self, protocol: RouteProtocol, target: RouteTarget) -> Self {
        self.routes.insert(protocol, target);
        self
    }

    pub fn with_credentials(mut self, handle: CredentialsHandle) -> Self {
        self.credentials = Some(handle);
        self
    }

    pub fn allow_split_tunnel(mut self) -> Self {
        self.split_tunnel_disallowed = false;
        self
    }

    pub fn target_for(&self, protocol: RouteProtocol) -> Option<RouteTarget> {
        self.routes.get(&protocol).copied()
    }

    /// Names are handed to the proxy instead of being resolved locally.
    /// Only a `Direct` DNS route lets the broker resolve before connecting.
    pub fn resolves_remotely(&self) -> bool {
        self.target_for(RouteProtocol::Dns) != Some(RouteTarget::Direct)
    }

    /// Only stream-oriented CONNECT relaying is supported, so no proxy kind
    /// carries datagrams.
    pub fn carries_datagrams(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitTunnelProblem {
    Unrouted(RouteProtocol),
    DirectRoute(RouteProtocol),
    PacDirectFallback,
    MissingEndpoint,
    UnsupportedByProxy(RouteProtocol),
}

impl fmt::Display for SplitTunnelProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitTunnelProblem::Unrouted(p) => write!(f, "{p} has no declared route"),
            SplitTunnelProblem::DirectRoute(p) => write!(f, "{p} is routed direct"),
            SplitTunnelProblem::PacDirectFallback => f.write_str("PAC script may return DIRECT"),
            SplitTunnelProblem::MissingEndpoint => f.write_str("proxy endpoint missing"),
            SplitTunnelProblem::UnsupportedByProxy(p) => write!(f, "proxy cannot carry {p}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("split-tunnel violation in {scope} proxy config: {}", render(.problems))]
pub struct SplitTunnelViolation {
    pub scope: ProxyScope,
    pub problems: Vec<SplitTunnelProblem>,
}

fn render(problems: &[SplitTunnelProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Rejects any config under which a declared or implicit route can leave
/// outside the proxy. Structural problems are rejected even when split
/// tunnelling is permitted.
pub fn validate_no_split_tunnel(config: &ProxyConfig) -> Result<(), SplitTunnelViolation> {
    let mut problems = Vec::new();

    let proxied = config.routes.values().any(|t| *t == RouteTarget::Proxy);
    if config.endpoint.is_none() && proxied {
        problems.push(SplitTunnelProblem::MissingEndpoint);
    }
    for (protocol, target) in &config.routes {
        if protocol.is_datagram() && *target == RouteTarget::Proxy && !config.carries_datagrams() {
            problems.push(SplitTunnelProblem::UnsupportedByProxy(*protocol));
        }
    }

    if config.split_tunnel_disallowed {
        for protocol in RouteProtocol::ALL {
            match config.target_for(protocol) {
                None => problems.push(SplitTunnelProblem::Unrouted(protocol)),
                Some(RouteTarget::Direct) => problems.push(SplitTunnelProblem::DirectRoute(protocol)),
                Some(_) => {}
            }
        }
        if matches!(config.kind, ProxyKind::Pac { allows_direct: true, .. }) {
            problems.push(SplitTunnelProblem::PacDirectFallback);
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SplitTunnelViolation {
            scope: config.scope.clone(),
            problems,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySummary {
    pub scope: ProxyScope,
    pub kind: &'static str,
    pub endpoint: Option<String>,
    pub split_tunnel_disallowed: bool,
}

#[derive(Default)]
pub struct ProxyRegistry {
    global: RwLock<Option<ProxyConfig>>,
    containers: RwLock<HashMap<ContainerId, ProxyConfig>>,
    /// Set while any profile is in Hardened or Tor mode.
    enforcing: AtomicBool,
    /// Held by `configure` from its enforcing check to the store, and by
    /// `enforce_with` from the flag flip to the end of its check.
    gate: Mutex<()>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enforcing(&self, enforcing: bool) {
        self.enforcing.store(enforcing, Ordering::SeqCst);
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforcing.load(Ordering::SeqCst)
    }

    /// Turns enforcement on, then runs `check` over the stored configs. No
    /// `configure` can land in between. On failure the previous flag is restored.
    pub fn enforce_with(
        &self,
        check: impl FnOnce(&Self) -> Result<(), SplitTunnelViolation>,
    ) -> Result<(), SplitTunnelViolation> {
        let _gate = self.gate.lock();
        let previous = self.enforcing.swap(true, Ordering::SeqCst);
        let checked = check(self);
        if checked.is_err() {
            self.enforcing.store(previous, Ordering::SeqCst);
        }
        checked
    }

    /// Installs `config` for `scope`. While enforcing, a config that fails
    /// validation is rejected and the previous binding stays in place;
    /// otherwise it is stored and blocks the next move to a protected mode.
    pub fn configure(&self, scope: ProxyScope, mut config: ProxyConfig) -> Result<(), SplitTunnelViolation> {
        config.scope = scope.clone();
        let _gate = self.gate.lock();
        if let Err(violation) = validate_no_split_tunnel(&config) {
            if self.is_enforcing() {
                warn!(%scope, error = %violation, "proxy config rejected");
                return Err(violation);
            }
            warn!(%scope, error = %violation, "proxy config stored with split-tunnel problems");
        }
        info!(%scope, kind = config.kind.label(), "proxy configured");
        match scope {
            ProxyScope::Global => *self.global.write() = Some(config),
            ProxyScope::Container(id) => {
                self.containers.write().insert(id, config);
            }
        }
        Ok(())
    }

    pub fn clear_global(&self) {
        *self.global.write() = None;
    }

    /// Container binding first, then the global config.
    pub fn route_for(&self, container: &ContainerId) -> Option<ProxyConfig> {
        if let Some(config) = self.containers.read().get(container) {
            return Some(config.clone());
        }
        self.global.read().clone()
    }

    pub fn validate_all(&self) -> Result<(), SplitTunnelViolation> {
        if let Some(global) = self.global.read().as_ref() {
            validate_no_split_tunnel(global)?;
        }
        for config in self.containers.read().values() {
            validate_no_split_tunnel(config)?;
        }
        Ok(())
    }

    pub fn remove_container(&self, container: &ContainerId) -> Option<ProxyConfig> {
        self.containers.write().remove(container)
    }

    /// Proxy endpoint addresses known up front, for the expected-path ledger.
    pub fn endpoint_addresses(&self) -> Vec<IpAddr> {
        let global = self.global.read();
        let containers = self.containers.read();
        global
            .iter()
            .chain(containers.values())
            .filter_map(|c| c.endpoint.as_ref().and_then(ProxyEndpoint::ip))
            .collect()
    }

    pub fn summary(&self) -> Vec<ProxySummary> {
        let global = self.global.read();
        let containers = self.containers.read();
        let mut out: Vec<ProxySummary> = global
            .iter()
            .chain(containers.values())
            .map(|c| ProxySummary {
                scope: c.scope.clone(),
                kind: c.kind.label(),
                endpoint: c.endpoint.as_ref().map(ToString::to_string),
                split_tunnel_disallowed: c.split_tunnel_disallowed,
            })
            .collect();
        out.sort_by_key(|s| s.scope.to_string());
        out
    }
}
