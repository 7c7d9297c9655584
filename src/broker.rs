//! Connection Broker.
//!
//! The only path from any process kind to a socket. `acquire` decides the
//! route under the container's policy and returns a [`TransportHandle`];
//! `open` is the only function in the crate that connects a socket for a
//! handle. Every refusal is final: nothing here retries on a weaker path.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::dns::{DnsError, DnsLayer, DnsStrategy, ResolveContext, ResolvedAddress};
use crate::error::EgressError;
use crate::leak::{ExpectedPaths, LeakEvent, LeakKind, LeakLog, Severity};
use crate::observability::{self, RefusalClass, RouteClass};
use crate::policy::{ContainerPolicy, EgressMode, PolicyEngine};
use crate::proxy::{
    CredentialStore, CredentialsHandle, ProxyConfig, ProxyEndpoint, ProxyKind, ProxyRegistry, RouteProtocol, RouteTarget,
};
use crate::real_transport::{connect_direct, BoxedStream};
use crate::relay_transport::{http_connect, socks5_connect};
use crate::request::{ConnectionRequest, ContainerId, Destination, ProcessKind, Protocol, RequestId};
use crate::tor::{CircuitLease, IsolationKey, TorController, TorState};

/// Sandbox allowlist, supplied by the process-policy collaborator.
pub trait ProcessPolicy: Send + Sync {
    fn may_egress(&self, process: ProcessKind) -> bool;
}

pub struct StaticProcessPolicy {
    allowed: HashSet<ProcessKind>,
}

impl StaticProcessPolicy {
    pub fn new(allowed: impl IntoIterator<Item = ProcessKind>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

/// GPU processes have no network capability.
impl Default for StaticProcessPolicy {
    fn default() -> Self {
        Self::new([ProcessKind::Content, ProcessKind::Utility, ProcessKind::Extension])
    }
}

impl ProcessPolicy for StaticProcessPolicy {
    fn may_egress(&self, process: ProcessKind) -> bool {
        self.allowed.contains(&process)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct {
        addresses: Vec<IpAddr>,
        port: u16,
        /// The caller must speak TLS on this connection.
        https: bool,
    },
    Proxy {
        endpoint: ProxyEndpoint,
        kind: ProxyKind,
        credentials: Option<CredentialsHandle>,
        /// Hostname when the proxy resolves remotely, otherwise an address.
        host: String,
        port: u16,
    },
    Circuit {
        lease: CircuitLease,
        host: String,
        port: u16,
    },
    /// Answer to a `Dns` request. Carries no stream.
    Resolution(ResolvedAddress),
}

impl Route {
    fn class(&self) -> RouteClass {
        match self {
            Route::Direct { .. } => RouteClass::DIRECT,
            Route::Proxy { .. } => RouteClass::PROXY,
            Route::Circuit { .. } => RouteClass::CIRCUIT,
            Route::Resolution(_) => RouteClass::RESOLUTION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub request: RequestId,
    pub container: ContainerId,
    /// Mode the request was admitted under.
    pub mode: EgressMode,
    pub protocol: Protocol,
    pub route: Route,
}

impl TransportHandle {
    pub fn circuit(&self) -> Option<&CircuitLease> {
        match &self.route {
            Route::Circuit { lease, .. } => Some(lease),
            _ => None,
        }
    }

    pub fn resolved(&self) -> Option<&ResolvedAddress> {
        match &self.route {
            Route::Resolution(resolved) => Some(resolved),
            _ => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.route, Route::Direct { .. })
    }
}

/// Shared components the broker routes through.
pub struct BrokerContext {
    pub policy: Arc<PolicyEngine>,
    pub dns: Arc<DnsLayer>,
    pub proxies: Arc<ProxyRegistry>,
    pub tor: Arc<TorController>,
    pub ledger: Arc<ExpectedPaths>,
    pub leaks: Arc<LeakLog>,
}

pub struct ConnectionBroker {
    policy: Arc<PolicyEngine>,
    dns: Arc<DnsLayer>,
    proxies: Arc<ProxyRegistry>,
    tor: Arc<TorController>,
    ledger: Arc<ExpectedPaths>,
    leaks: Arc<LeakLog>,
    process_policy: Arc<dyn ProcessPolicy>,
    credentials: Arc<dyn CredentialStore>,
    /// Requests waiting for Tor bootstrap.
    admission: Semaphore,
}

impl ConnectionBroker {
    pub fn new(
        ctx: BrokerContext,
        process_policy: Arc<dyn ProcessPolicy>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let queue = ctx.policy.settings().max_queued_requests;
        Self {
            policy: ctx.policy,
            dns: ctx.dns,
            proxies: ctx.proxies,
            tor: ctx.tor,
            ledger: ctx.ledger,
            leaks: ctx.leaks,
            process_policy,
            credentials,
            admission: Semaphore::new(queue),
        }
    }

    /// Decides the route for `request`. The container's policy is read once,
    /// so a mode change mid-request does not affect it.
    pub async fn acquire(&self, request: &ConnectionRequest) -> Result<TransportHandle, EgressError> {
        let span = debug_span!(
            "acquire",
            request = %request.id,
            process = %request.process,
            container = %request.container,
            destination = %request.destination,
            port = request.port,
            protocol = %request.protocol,
        );
        let outcome = self.route(request).instrument(span).await;
        match &outcome {
            Ok(handle) => {
                observability::record_admitted(handle.route.class());
                self.expect_route(&handle.route);
                debug!(request = %request.id, mode = %handle.mode, route = ?handle.route.class(), "request admitted");
            }
            Err(e) => {
                observability::record_refused(refusal_class(e));
                if e.is_fail_closed() {
                    warn!(request = %request.id, container = %request.container, error = %e, "request refused");
                } else {
                    debug!(request = %request.id, error = %e, "request refused");
                }
            }
        }
        outcome
    }

    async fn route(&self, request: &ConnectionRequest) -> Result<TransportHandle, EgressError> {
        if !self.process_policy.may_egress(request.process) {
            return Err(EgressError::ProcessNotAuthorized(request.process));
        }
        let policy = self.policy.policy_for(&request.container);
        if request.speculative && !policy.speculative_connections_allowed {
            return Err(EgressError::SpeculativeConnectionRefused(policy.mode));
        }
        let port = upgraded_port(&policy, request);

        let route = match policy.mode {
            EgressMode::Standard => self.route_standard(request, &policy, port).await?,
            EgressMode::Hardened => self.route_hardened(request, &policy, port).await?,
            EgressMode::Tor => self.route_tor(request, port).await?,
        };
        // Relayed ICE behind a proxy rides TURN over TCP.
        let protocol = match route {
            Route::Proxy { .. } => Protocol::Tcp,
            _ => request.protocol,
        };
        Ok(TransportHandle {
            request: request.id,
            container: request.container.clone(),
            mode: policy.mode,
            protocol,
            route,
        })
    }

    async fn route_standard(
        &self,
        request: &ConnectionRequest,
        policy: &ContainerPolicy,
        port: u16,
    ) -> Result<Route, EgressError> {
        if request.protocol == Protocol::Dns {
            return Ok(Route::Resolution(self.resolve_name(request, policy).await?));
        }
        Ok(Route::Direct {
            addresses: self.addresses_for(request, policy).await?,
            port,
            https: port == 443 && request.protocol == Protocol::Tcp,
        })
    }

    async fn route_hardened(
        &self,
        request: &ConnectionRequest,
        policy: &ContainerPolicy,
        port: u16,
    ) -> Result<Route, EgressError> {
        let mode = policy.mode;
        let proxy = self.proxies.route_for(&request.container);

        if request.protocol == Protocol::Dns {
            if let Some(config) = &proxy {
                if config.target_for(RouteProtocol::Dns) != Some(RouteTarget::Direct) {
                    return Err(self.refuse(request, mode, "DNS is routed through the proxy; names resolve at connect time"));
                }
            }
            return Ok(Route::Resolution(self.resolve_name(request, policy).await?));
        }

        let protocol = RouteProtocol::for_request(request.protocol, port);
        if protocol == RouteProtocol::WebRtcIce {
            return self.route_ice(request, policy, proxy.as_ref(), port).await;
        }
        let Some(config) = proxy else {
            if policy.proxy_required {
                return Err(self.refuse(request, mode, "no proxy configured for the container"));
            }
            return Ok(Route::Direct {
                addresses: self.addresses_for(request, policy).await?,
                port,
                https: request.protocol == Protocol::Tcp,
            });
        };

        match config.target_for(protocol) {
            Some(RouteTarget::Proxy) if request.protocol == Protocol::Tcp => {
                self.proxy_route(request, policy, &config, port).await
            }
            Some(RouteTarget::Direct) => Ok(Route::Direct {
                addresses: self.addresses_for(request, policy).await?,
                port,
                https: request.protocol == Protocol::Tcp,
            }),
            Some(RouteTarget::Blocked) => Err(self.refuse(request, mode, &format!("{protocol} is blocked by the proxy config"))),
            Some(RouteTarget::Proxy) | None => {
                Err(self.refuse(request, mode, &format!("{protocol} has no route through the proxy")))
            }
        }
    }

    /// ICE traffic in Hardened mode reaches allowlisted servers only. Behind a
    /// proxy, an allowlisted TURN relay is reached with TURN over TCP.
    async fn route_ice(
        &self,
        request: &ConnectionRequest,
        policy: &ContainerPolicy,
        proxy: Option<&ProxyConfig>,
        port: u16,
    ) -> Result<Route, EgressError> {
        let mode = policy.mode;
        let webrtc = &self.policy.settings().webrtc;
        let server = request.destination.to_string();
        let relay = webrtc.relay_allowed(&server, port);
        if !relay && (policy.ice_relay_only || !webrtc.stun_allowed(&server, port)) {
            return Err(self.refuse(request, mode, "ICE server is not allowlisted"));
        }

        match proxy {
            None if policy.proxy_required => Err(self.refuse(request, mode, "no proxy configured for the container")),
            None => Ok(Route::Direct {
                addresses: self.addresses_for(request, policy).await?,
                port,
                https: false,
            }),
            Some(config) if relay => match config.target_for(RouteProtocol::Https) {
                Some(RouteTarget::Proxy) => self.proxy_route(request, policy, config, port).await,
                _ => Err(self.refuse(request, mode, "no stream route through the proxy for TURN over TCP")),
            },
            Some(_) => Err(self.refuse(request, mode, "STUN datagrams cannot traverse the proxy")),
        }
    }

    /// Names are resolved locally only when the config routes DNS direct.
    async fn proxy_route(
        &self,
        request: &ConnectionRequest,
        policy: &ContainerPolicy,
        config: &ProxyConfig,
        port: u16,
    ) -> Result<Route, EgressError> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Err(self.refuse(request, policy.mode, "proxy config has no endpoint"));
        };
        let host = if config.resolves_remotely() {
            request.destination.to_string()
        } else {
            let addresses = self.addresses_for(request, policy).await?;
            addresses
                .first()
                .map(ToString::to_string)
                .ok_or_else(|| EgressError::Dns(DnsError::ResolutionFailed(request.destination.to_string())))?
        };
        Ok(Route::Proxy {
            endpoint,
            kind: config.kind.clone(),
            credentials: config.credentials.clone(),
            host,
            port,
        })
    }

    async fn route_tor(&self, request: &ConnectionRequest, port: u16) -> Result<Route, EgressError> {
        match (request.protocol, &request.destination) {
            (Protocol::Udp, _) => return Err(self.refuse(request, EgressMode::Tor, "UDP cannot be carried over Tor")),
            (Protocol::Dns, Destination::Ip(ip)) => {
                return Err(EgressError::Dns(DnsError::InvalidDomain(ip.to_string())))
            }
            _ => {}
        }

        self.await_tor().await?;
        let key = IsolationKey::new(request.container.clone(), &request.destination);
        let lease = self.tor.circuit_for(&key).await?;

        match (&request.destination, request.protocol) {
            (Destination::Host(host), Protocol::Dns) => {
                let ctx = ResolveContext::over_circuit(EgressMode::Tor, self.tor.as_ref(), &lease);
                let resolved = self.dns.resolve(host, DnsStrategy::TorResolve, ctx).await?;
                Ok(Route::Resolution(resolved))
            }
            _ => Ok(Route::Circuit {
                lease,
                host: request.destination.to_string(),
                port,
            }),
        }
    }

    /// Waits in the bounded admission queue until Tor can build circuits.
    async fn await_tor(&self) -> Result<(), EgressError> {
        if self.tor.state().is_ready() {
            return Ok(());
        }
        let _slot = self
            .admission
            .try_acquire()
            .map_err(|_| EgressError::EgressUnavailable("tor admission queue is full".to_string()))?;
        if self.tor.state() == TorState::Disconnected {
            self.policy.start_tor();
        }
        debug!(state = %self.tor.state(), "waiting for tor bootstrap");
        self.tor.wait_ready(self.policy.settings().admission_timeout()).await
    }

    async fn resolve_name(
        &self,
        request: &ConnectionRequest,
        policy: &ContainerPolicy,
    ) -> Result<ResolvedAddress, EgressError> {
        match &request.destination {
            Destination::Host(host) => Ok(self
                .dns
                .resolve(host, policy.dns_strategy, ResolveContext::local(policy.mode))
                .await?),
            Destination::Ip(ip) => Err(EgressError::Dns(DnsError::InvalidDomain(ip.to_string()))),
        }
    }

    async fn addresses_for(
        &self,
        request: &ConnectionRequest,
        policy: &ContainerPolicy,
    ) -> Result<Vec<IpAddr>, EgressError> {
        match &request.destination {
            Destination::Ip(ip) => Ok(vec![*ip]),
            Destination::Host(_) => Ok(self.resolve_name(request, policy).await?.addresses),
        }
    }

    /// Records a refused direct-egress attempt and returns the refusal.
    fn refuse(&self, request: &ConnectionRequest, mode: EgressMode, reason: &str) -> EgressError {
        self.leaks.record(LeakEvent::new(
            LeakKind::Ip,
            Severity::Warning,
            self.policy.strictest_mode().max(mode),
            format!(
                "{} {}:{} from {} refused: {reason}",
                request.protocol, request.destination, request.port, request.process
            ),
        ));
        EgressError::DirectEgressForbidden {
            mode,
            reason: reason.to_string(),
        }
    }

    /// Circuits need nothing here: entry addresses join the ledger at bootstrap.
    fn expect_route(&self, route: &Route) {
        match route {
            Route::Direct { addresses, .. } => {
                for addr in addresses {
                    self.ledger.allow(*addr);
                }
            }
            Route::Proxy { endpoint, .. } => {
                if let Some(ip) = endpoint.ip() {
                    self.ledger.allow(ip);
                }
            }
            Route::Circuit { .. } | Route::Resolution(_) => {}
        }
    }

    /// Connects the stream a handle describes.
    pub async fn open(&self, handle: &TransportHandle) -> Result<BoxedStream, EgressError> {
        if handle.protocol != Protocol::Tcp {
            return Err(EgressError::Transport(format!(
                "{} handles carry no stream",
                handle.protocol
            )));
        }
        let connect_timeout = self.policy.settings().connect_timeout();
        match &handle.route {
            Route::Circuit { lease, host, port } => self.tor.open_stream(lease, host, *port).await,
            _ if handle.mode == EgressMode::Tor => Err(EgressError::DirectEgressForbidden {
                mode: EgressMode::Tor,
                reason: "tor handle without a circuit".to_string(),
            }),
            Route::Direct { addresses, port, .. } => {
                let stream = connect_direct(addresses, *port, connect_timeout).await?;
                Ok(Box::new(stream))
            }
            Route::Proxy {
                endpoint,
                kind,
                credentials,
                host,
                port,
            } => {
                let addresses = self.proxy_addresses(endpoint, handle.mode).await?;
                let credentials = match credentials {
                    Some(handle) => Some(self.credentials.lookup(handle).ok_or_else(|| {
                        EgressError::Transport(format!("proxy credentials `{}` not found", handle.as_str()))
                    })?),
                    None => None,
                };
                let mut stream = connect_direct(&addresses, endpoint.port, connect_timeout).await?;
                match kind {
                    ProxyKind::Socks5 => socks5_connect(&mut stream, host, *port, credentials.as_ref()).await?,
                    ProxyKind::Http | ProxyKind::Pac { .. } => {
                        http_connect(&mut stream, host, *port, credentials.as_ref()).await?
                    }
                }
                info!(container = %handle.container, proxy = %endpoint, kind = kind.label(), "proxy tunnel open");
                Ok(Box::new(stream))
            }
            Route::Resolution(_) => Err(EgressError::Transport("resolution handles carry no stream".to_string())),
        }
    }

    /// Binds and connects a UDP socket for a direct datagram handle.
    pub async fn open_datagram(&self, handle: &TransportHandle) -> Result<UdpSocket, EgressError> {
        let (Route::Direct { addresses, port, .. }, Protocol::Udp) = (&handle.route, handle.protocol) else {
            return Err(EgressError::DirectEgressForbidden {
                mode: handle.mode,
                reason: "handle does not permit datagrams".to_string(),
            });
        };
        let target = addresses
            .first()
            .map(|ip| SocketAddr::new(*ip, *port))
            .ok_or_else(|| EgressError::Transport("no address to send datagrams to".to_string()))?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(socket)
    }

    async fn proxy_addresses(&self, endpoint: &ProxyEndpoint, mode: EgressMode) -> Result<Vec<IpAddr>, EgressError> {
        if let Some(ip) = endpoint.ip() {
            return Ok(vec![ip]);
        }
        let resolved = self
            .dns
            .resolve(&endpoint.host, DnsStrategy::DohOnly, ResolveContext::local(mode))
            .await?;
        for addr in &resolved.addresses {
            self.ledger.allow(*addr);
        }
        Ok(resolved.addresses)
    }

    /// Best-effort teardown of the container's circuits, guard pin, template
    /// and proxy binding. Returns the number of circuits torn down.
    pub fn close_container(&self, container: &ContainerId) -> JoinHandle<usize> {
        let container = container.clone();
        let proxies = Arc::clone(&self.proxies);
        let policy = Arc::clone(&self.policy);
        let tor = Arc::clone(&self.tor);
        tokio::spawn(async move {
            proxies.remove_container(&container);
            policy.forget_container(&container);
            tor.teardown_container(&container).await
        })
    }
}

fn upgraded_port(policy: &ContainerPolicy, request: &ConnectionRequest) -> u16 {
    if request.protocol == Protocol::Tcp && request.port == 80 && policy.https_upgrade {
        443
    } else {
        request.port
    }
}

fn refusal_class(err: &EgressError) -> RefusalClass {
    match err {
        EgressError::ProcessNotAuthorized(_) => RefusalClass::NOT_AUTHORIZED,
        EgressError::EgressUnavailable(_) | EgressError::Cancelled => RefusalClass::UNAVAILABLE,
        EgressError::Transport(_) => RefusalClass::TRANSPORT_IO,
        e if e.is_fail_closed() => RefusalClass::FAIL_CLOSED,
        _ => RefusalClass::OTHER,
    }
}
