//! Scripted collaborators shared by the unit and scenario tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::time::Instant;

use crate::config::{EgressConfig, PolicySettings, TorSettings};
use crate::dns::{CircuitResolver, DnsError, DnsTransportKind, DnsTransports, RecordType};
use crate::dns_resolver::DnsTransport;
use crate::leak::{CaptureSource, CapturedPacket, ExpectedPaths};
use crate::notify::StatusBus;
use crate::real_transport::BoxedStream;
use crate::request::{ConnectionRequest, ContainerId, Destination, ProcessKind, ProfileId, Protocol};
use crate::system::EgressSystem;
use crate::tor::{
    BackendCircuitId, BackendError, BuiltCircuit, CircuitLease, CircuitTable, HopTriple, IsolationKey,
    PluggableTransport, RelayId, TorBackend, TorController,
};

pub const TOR_ENTRY: &str = "198.51.100.1";
pub const TOR_ANSWER: &str = "198.51.100.7";

/// Resolver transport answering from a fixed table.
pub struct StaticDns {
    kind: DnsTransportKind,
    endpoint: String,
    answers: HashMap<String, Vec<IpAddr>>,
    failing: bool,
    ech_probe: bool,
    rejects_ech: bool,
    queries: AtomicUsize,
}

impl StaticDns {
    pub fn new(kind: DnsTransportKind) -> Self {
        let endpoint = match kind {
            DnsTransportKind::Doh => "static://doh",
            DnsTransportKind::Dot => "static://dot",
            DnsTransportKind::System => "static://system",
            DnsTransportKind::Tor => "static://tor",
        };
        Self {
            kind,
            endpoint: endpoint.to_string(),
            answers: HashMap::new(),
            failing: false,
            ech_probe: false,
            rejects_ech: false,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn answer(mut self, host: &str, ip: &str) -> Self {
        let ip: IpAddr = ip.parse().expect("test address");
        self.answers.entry(host.to_string()).or_default().push(ip);
        self
    }

    /// Every query fails with a transport error.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn with_ech_probe(mut self, supported: bool) -> Self {
        self.ech_probe = supported;
        self
    }

    pub fn rejecting_ech(mut self) -> Self {
        self.rejects_ech = true;
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsTransport for StaticDns {
    fn kind(&self) -> DnsTransportKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&self, hostname: &str, record: RecordType, ech: bool) -> Result<Vec<IpAddr>, DnsError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(DnsError::Transport(format!("{} unreachable", self.endpoint)));
        }
        if ech && self.rejects_ech {
            return Err(DnsError::EchRejected(self.endpoint.clone()));
        }
        let wanted = |ip: &&IpAddr| match record {
            RecordType::A => ip.is_ipv4(),
            RecordType::Aaaa => ip.is_ipv6(),
        };
        Ok(self
            .answers
            .get(hostname)
            .map(|ips| ips.iter().filter(wanted).copied().collect())
            .unwrap_or_default())
    }

    async fn probe_ech(&self) -> bool {
        self.ech_probe
    }
}

pub struct StaticCircuitResolver {
    answer: IpAddr,
}

impl StaticCircuitResolver {
    pub fn new(ip: &str) -> Self {
        Self {
            answer: ip.parse().expect("test address"),
        }
    }
}

#[async_trait]
impl CircuitResolver for StaticCircuitResolver {
    async fn resolve_over(&self, _lease: &CircuitLease, _hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
        Ok(vec![self.answer])
    }
}

/// A lease for `"profile/partition"` and `host`, registered in a throwaway table.
pub fn lease(container: &str, host: &str) -> CircuitLease {
    let (profile, partition) = container.split_once('/').unwrap_or((container, ""));
    let key = IsolationKey::new(
        ContainerId::new(ProfileId::new(profile), partition),
        &Destination::parse(host),
    );
    let built = BuiltCircuit {
        id: BackendCircuitId(1),
        hops: HopTriple {
            guard: RelayId::new("guard-0"),
            middle: RelayId::new("middle-0"),
            exit: RelayId::new("exit-0"),
        },
    };
    CircuitTable::new().insert(key, built, Instant::now()).0
}

/// Returns the same packets from every capture window until replaced.
pub struct ScriptedCapture {
    packets: Mutex<Vec<CapturedPacket>>,
}

impl ScriptedCapture {
    pub fn repeating(packets: Vec<CapturedPacket>) -> Self {
        Self {
            packets: Mutex::new(packets),
        }
    }

    pub fn replace(&self, packets: Vec<CapturedPacket>) {
        *self.packets.lock() = packets;
    }
}

#[async_trait]
impl CaptureSource for ScriptedCapture {
    async fn capture(&self, _window: Duration) -> Vec<CapturedPacket> {
        self.packets.lock().clone()
    }
}

/// In-process Tor backend with scriptable delays and failures.
pub struct ScriptedTorBackend {
    failing_probes: HashSet<PluggableTransport>,
    bootstrap_delay: Mutex<Duration>,
    bootstrap_fails: bool,
    build_delay: Duration,
    fixed_hops: Option<(RelayId, RelayId)>,
    build_failures: Mutex<VecDeque<BackendError>>,
    stream_failures: Mutex<VecDeque<BackendError>>,
    forced_guard: Mutex<Option<RelayId>>,
    guard_selection_failures: AtomicUsize,
    flagged: Mutex<Vec<RelayId>>,
    /// Far ends of opened streams, kept so writes do not fail.
    peers: Mutex<Vec<DuplexStream>>,
    next_guard: AtomicU64,
    next_circuit: AtomicU64,
    builds: AtomicUsize,
    teardowns: AtomicUsize,
}

impl Default for ScriptedTorBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTorBackend {
    pub fn new() -> Self {
        Self {
            failing_probes: HashSet::new(),
            bootstrap_delay: Mutex::new(Duration::ZERO),
            bootstrap_fails: false,
            build_delay: Duration::ZERO,
            fixed_hops: None,
            build_failures: Mutex::new(VecDeque::new()),
            stream_failures: Mutex::new(VecDeque::new()),
            forced_guard: Mutex::new(None),
            guard_selection_failures: AtomicUsize::new(0),
            flagged: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            next_guard: AtomicU64::new(1),
            next_circuit: AtomicU64::new(1),
            builds: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        }
    }

    pub fn failing_probe(mut self, transport: PluggableTransport) -> Self {
        self.failing_probes.insert(transport);
        self
    }

    pub fn bootstrap_delay(self, delay: Duration) -> Self {
        *self.bootstrap_delay.lock() = delay;
        self
    }

    pub fn failing_bootstrap(mut self) -> Self {
        self.bootstrap_fails = true;
        self
    }

    pub fn build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn fixed_hops(mut self, middle: &str, exit: &str) -> Self {
        self.fixed_hops = Some((RelayId::new(middle), RelayId::new(exit)));
        self
    }

    pub fn set_bootstrap_delay(&self, delay: Duration) {
        *self.bootstrap_delay.lock() = delay;
    }

    /// Queued failures are returned by the next builds, in order.
    pub fn push_build_failure(&self, err: BackendError) {
        self.build_failures.lock().push_back(err);
    }

    pub fn push_stream_failure(&self, err: BackendError) {
        self.stream_failures.lock().push_back(err);
    }

    pub fn force_guard(&self, guard: RelayId) {
        *self.forced_guard.lock() = Some(guard);
    }

    /// The next `count` guard selections find no usable guard.
    pub fn fail_guard_selections(&self, count: usize) {
        self.guard_selection_failures.store(count, Ordering::SeqCst);
    }

    pub fn flag_guard(&self, guard: RelayId) {
        self.flagged.lock().push(guard);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TorBackend for ScriptedTorBackend {
    async fn probe_transport(&self, transport: PluggableTransport) -> Result<(), BackendError> {
        if self.failing_probes.contains(&transport) {
            return Err(BackendError::ProbeFailed(format!("{transport} blocked")));
        }
        Ok(())
    }

    async fn bootstrap(&self, _transport: Option<PluggableTransport>) -> Result<(), BackendError> {
        let delay = *self.bootstrap_delay.lock();
        tokio::time::sleep(delay).await;
        if self.bootstrap_fails {
            return Err(BackendError::Bootstrap("consensus download failed".to_string()));
        }
        Ok(())
    }

    async fn select_guard(&self, exclude: &[RelayId]) -> Result<RelayId, BackendError> {
        let failing = self
            .guard_selection_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BackendError::BuildFailed("no usable guard in consensus".to_string()));
        }
        if let Some(forced) = self.forced_guard.lock().clone() {
            return Ok(forced);
        }
        loop {
            let n = self.next_guard.fetch_add(1, Ordering::SeqCst);
            let guard = RelayId::new(format!("guard-{n}"));
            if !exclude.contains(&guard) {
                return Ok(guard);
            }
        }
    }

    async fn build_circuit(&self, _key: &IsolationKey, guard: &RelayId) -> Result<BuiltCircuit, BackendError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.build_delay).await;
        if let Some(err) = self.build_failures.lock().pop_front() {
            return Err(err);
        }
        let id = self.next_circuit.fetch_add(1, Ordering::SeqCst);
        let (middle, exit) = match &self.fixed_hops {
            Some((middle, exit)) => (middle.clone(), exit.clone()),
            None => (RelayId::new(format!("middle-{id}")), RelayId::new(format!("exit-{id}"))),
        };
        Ok(BuiltCircuit {
            id: BackendCircuitId(id),
            hops: HopTriple {
                guard: guard.clone(),
                middle,
                exit,
            },
        })
    }

    async fn resolve(&self, _circuit: BackendCircuitId, _hostname: &str) -> Result<Vec<IpAddr>, BackendError> {
        Ok(vec![TOR_ANSWER.parse().expect("test address")])
    }

    async fn open_stream(&self, _circuit: BackendCircuitId, _host: &str, _port: u16) -> Result<BoxedStream, BackendError> {
        if let Some(err) = self.stream_failures.lock().pop_front() {
            return Err(err);
        }
        let (near, far) = tokio::io::duplex(4096);
        self.peers.lock().push(far);
        Ok(Box::new(near))
    }

    async fn teardown(&self, _circuit: BackendCircuitId) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn flagged_guards(&self) -> Vec<RelayId> {
        self.flagged.lock().clone()
    }

    fn entry_addresses(&self) -> Vec<IpAddr> {
        vec![TOR_ENTRY.parse().expect("test address")]
    }
}

pub fn tor_settings() -> TorSettings {
    TorSettings {
        bootstrap_timeout_secs: 5,
        guard_rotation_threshold: 3,
        fingerprint_window_secs: 600,
        circuit_idle_timeout_secs: 60,
        build_timeout_secs: 2,
        build_max_attempts: 3,
        build_backoff_base_ms: 100,
        build_backoff_max_ms: 1_000,
        transport_preference: vec![PluggableTransport::Obfs4, PluggableTransport::Snowflake],
        maintenance_interval_secs: 30,
    }
}

pub fn controller(backend: Arc<ScriptedTorBackend>, settings: TorSettings) -> TorController {
    TorController::new(
        backend,
        settings,
        StatusBus::default(),
        Arc::new(ExpectedPaths::new(Duration::from_secs(60))),
    )
}

pub fn test_config() -> EgressConfig {
    EgressConfig {
        policy: PolicySettings {
            admission_timeout_ms: 3_000,
            ..PolicySettings::default()
        },
        tor: tor_settings(),
        ..EgressConfig::default()
    }
}

pub fn dns_transports() -> DnsTransports {
    let doh = StaticDns::new(DnsTransportKind::Doh)
        .answer("example.com", "93.184.216.34")
        .answer("tracker.example", "203.0.113.10")
        .answer("news.example", "203.0.113.20")
        .answer("proxy.example", "10.8.0.1");
    let system = StaticDns::new(DnsTransportKind::System).answer("example.com", "93.184.216.34");
    DnsTransports {
        doh: Arc::new(doh),
        dot: None,
        system: Arc::new(system),
    }
}

/// A wired system over scripted collaborators. Background tasks are not started.
pub fn system(config: EgressConfig, backend: Arc<ScriptedTorBackend>) -> EgressSystem {
    system_with_capture(config, backend, Arc::new(ScriptedCapture::repeating(Vec::new())))
}

pub fn system_with_capture(
    config: EgressConfig,
    backend: Arc<ScriptedTorBackend>,
    capture: Arc<ScriptedCapture>,
) -> EgressSystem {
    EgressSystem::builder(config)
        .tor_backend(backend)
        .capture(capture)
        .dns_transports(dns_transports())
        .build()
        .expect("test system")
}

pub fn container(profile: &str, partition: &str) -> ContainerId {
    ContainerId::new(ProfileId::new(profile), partition)
}

pub fn request(container: &ContainerId, host: &str, port: u16, protocol: Protocol) -> ConnectionRequest {
    ConnectionRequest::new(ProcessKind::Content, container.clone(), host, port, protocol)
}
