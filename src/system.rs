//! Wires every component from one [`EgressConfig`] and owns the background
//! tasks (guard-health maintenance and leak sampling).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerContext, ConnectionBroker, ProcessPolicy, StaticProcessPolicy};
use crate::config::{ConfigError, EgressConfig};
use crate::dns::{DnsError, DnsLayer, DnsTransports};
use crate::leak::{CaptureSource, CapturedPacket, ExpectedPaths, LeakHarness, LeakLog};
use crate::notify::StatusBus;
use crate::observability;
use crate::policy::{EgressMode, PolicyEngine};
use crate::proxy::{CredentialStore, ProxyRegistry, StaticCredentialStore};
use crate::real_transport::BoxedStream;
use crate::tor::{
    BackendCircuitId, BackendError, BuiltCircuit, IsolationKey, PluggableTransport, RelayId, TorBackend,
    TorController,
};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up resolver transports: {0}")]
    Dns(#[from] DnsError),
}

/// Stands in when no Tor daemon is wired up: every operation fails, so Tor
/// mode fails closed.
pub struct UnavailableTorBackend;

const NO_DAEMON: &str = "no tor daemon configured";

#[async_trait]
impl TorBackend for UnavailableTorBackend {
    async fn probe_transport(&self, _transport: PluggableTransport) -> Result<(), BackendError> {
        Err(BackendError::ProbeFailed(NO_DAEMON.to_string()))
    }

    async fn bootstrap(&self, _transport: Option<PluggableTransport>) -> Result<(), BackendError> {
        Err(BackendError::Bootstrap(NO_DAEMON.to_string()))
    }

    async fn select_guard(&self, _exclude: &[RelayId]) -> Result<RelayId, BackendError> {
        Err(BackendError::BuildFailed(NO_DAEMON.to_string()))
    }

    async fn build_circuit(&self, _key: &IsolationKey, _guard: &RelayId) -> Result<BuiltCircuit, BackendError> {
        Err(BackendError::BuildFailed(NO_DAEMON.to_string()))
    }

    async fn resolve(&self, _circuit: BackendCircuitId, _hostname: &str) -> Result<Vec<IpAddr>, BackendError> {
        Err(BackendError::Resolve(NO_DAEMON.to_string()))
    }

    async fn open_stream(
        &self,
        _circuit: BackendCircuitId,
        _host: &str,
        _port: u16,
    ) -> Result<BoxedStream, BackendError> {
        Err(BackendError::Stream(NO_DAEMON.to_string()))
    }

    async fn teardown(&self, _circuit: BackendCircuitId) {}

    async fn flagged_guards(&self) -> Vec<RelayId> {
        Vec::new()
    }

    fn entry_addresses(&self) -> Vec<IpAddr> {
        Vec::new()
    }
}

/// Capture source for builds without a packet tap. Waits out the window and
/// sees nothing.
pub struct NullCapture;

#[async_trait]
impl CaptureSource for NullCapture {
    async fn capture(&self, window: Duration) -> Vec<CapturedPacket> {
        tokio::time::sleep(window).await;
        Vec::new()
    }
}

pub struct EgressSystemBuilder {
    config: EgressConfig,
    tor_backend: Option<Arc<dyn TorBackend>>,
    capture: Option<Arc<dyn CaptureSource>>,
    process_policy: Option<Arc<dyn ProcessPolicy>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    dns_transports: Option<DnsTransports>,
}

impl EgressSystemBuilder {
    pub fn tor_backend(mut self, backend: Arc<dyn TorBackend>) -> Self {
        self.tor_backend = Some(backend);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn CaptureSource>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn process_policy(mut self, policy: Arc<dyn ProcessPolicy>) -> Self {
        self.process_policy = Some(policy);
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Replaces the DoH/DoT/system transports built from `config.dns`.
    pub fn dns_transports(mut self, transports: DnsTransports) -> Self {
        self.dns_transports = Some(transports);
        self
    }

    pub fn build(self) -> Result<EgressSystem, SystemError> {
        let config = self.config;
        config.validate()?;

        let bus = StatusBus::default();
        let leaks = Arc::new(LeakLog::new(bus.clone()));
        let ledger = Arc::new(ExpectedPaths::new(config.leak.expected_path_ttl()));
        for resolver in &config.dns.resolver_addresses {
            ledger.allow_permanent(*resolver);
        }

        let transports = match self.dns_transports {
            Some(transports) => transports,
            None => DnsTransports::from_settings(&config.dns)?,
        };
        let dns = Arc::new(DnsLayer::new(transports, &config.dns, leaks.clone()));
        let proxies = Arc::new(ProxyRegistry::new());
        let tor = Arc::new(TorController::new(
            self.tor_backend.unwrap_or_else(|| Arc::new(UnavailableTorBackend)),
            config.tor.clone(),
            bus.clone(),
            ledger.clone(),
        ));
        let policy = Arc::new(PolicyEngine::new(
            config.policy.clone(),
            proxies.clone(),
            tor.clone(),
            leaks.clone(),
            bus.clone(),
        ));
        let broker = Arc::new(ConnectionBroker::new(
            BrokerContext {
                policy: policy.clone(),
                dns: dns.clone(),
                proxies: proxies.clone(),
                tor: tor.clone(),
                ledger: ledger.clone(),
                leaks: leaks.clone(),
            },
            self.process_policy
                .unwrap_or_else(|| Arc::new(StaticProcessPolicy::default())),
            self.credentials
                .unwrap_or_else(|| Arc::new(StaticCredentialStore::default())),
        ));
        let harness = Arc::new(LeakHarness::new(
            self.capture.unwrap_or_else(|| Arc::new(NullCapture)),
            policy.watch_strictest(),
            ledger.clone(),
            leaks.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(EgressSystem {
            config,
            bus,
            leaks,
            ledger,
            proxies,
            dns,
            tor,
            policy,
            broker,
            harness,
            shutdown,
            tasks: Vec::new(),
        })
    }
}

pub struct EgressSystem {
    config: EgressConfig,
    bus: StatusBus,
    leaks: Arc<LeakLog>,
    ledger: Arc<ExpectedPaths>,
    proxies: Arc<ProxyRegistry>,
    dns: Arc<DnsLayer>,
    tor: Arc<TorController>,
    policy: Arc<PolicyEngine>,
    broker: Arc<ConnectionBroker>,
    harness: Arc<LeakHarness>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EgressSystem {
    pub fn builder(config: EgressConfig) -> EgressSystemBuilder {
        EgressSystemBuilder {
            config,
            tor_backend: None,
            capture: None,
            process_policy: None,
            credentials: None,
            dns_transports: None,
        }
    }

    /// Starts guard-health maintenance and leak sampling. Bootstraps Tor when
    /// it is the configured default mode.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        self.tasks
            .push(self.tor.clone().spawn_maintenance(self.shutdown.subscribe()));
        self.tasks.push(self.harness.clone().spawn(
            self.config.leak.sample_interval(),
            self.config.leak.sample_window(),
            self.shutdown.subscribe(),
        ));
        if self.config.policy.default_mode == EgressMode::Tor {
            self.policy.start_tor();
        }
        info!(
            default_mode = %self.config.policy.default_mode,
            tasks = self.tasks.len(),
            "egress system started"
        );
    }

    /// Stops the background tasks and tears down every circuit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.tor.shutdown().await;
        if observability::OBS_DEV {
            debug!(counters = ?observability::snapshot(), "final counters");
        }
        info!("egress system stopped");
    }

    pub fn config(&self) -> &EgressConfig {
        &self.config
    }

    pub fn bus(&self) -> &StatusBus {
        &self.bus
    }

    pub fn leaks(&self) -> &Arc<LeakLog> {
        &self.leaks
    }

    pub fn ledger(&self) -> &Arc<ExpectedPaths> {
        &self.ledger
    }

    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    pub fn dns(&self) -> &Arc<DnsLayer> {
        &self.dns
    }

    pub fn tor(&self) -> &Arc<TorController> {
        &self.tor
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }

    pub fn harness(&self) -> &Arc<LeakHarness> {
        &self.harness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EgressConfig;
    use crate::request::ProfileId;
    use crate::test_support::{system, test_config, ScriptedTorBackend};
    use crate::tor::TorState;

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EgressConfig::default();
        config.tor.guard_rotation_threshold = 0;
        let err = EgressSystem::builder(config).build().err().unwrap();
        assert!(matches!(err, SystemError::Config(_)));
    }

    #[tokio::test]
    async fn resolver_addresses_are_expected() {
        let sys = system(test_config(), Arc::new(ScriptedTorBackend::new()));
        for resolver in &sys.config().dns.resolver_addresses {
            assert!(sys.ledger().contains(resolver));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn without_a_daemon_tor_fails_closed_and_demotes() {
        let sys = EgressSystem::builder(test_config())
            .capture(Arc::new(NullCapture))
            .dns_transports(crate::test_support::dns_transports())
            .build()
            .unwrap();
        let profile = ProfileId::new("p");
        let mut events = sys.policy().subscribe();
        sys.policy().set_mode(&profile, EgressMode::Tor).await.unwrap();

        loop {
            if let crate::notify::StatusEvent::ModeDemoted { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(sys.tor().state(), TorState::Failed);
        assert_eq!(sys.policy().current_mode(&profile), EgressMode::Hardened);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_shutdown_stop_background_tasks() {
        let mut config = test_config();
        config.policy.default_mode = EgressMode::Tor;
        let mut sys = system(config, Arc::new(ScriptedTorBackend::new()));
        sys.start();
        sys.tor().wait_ready(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        let tor = sys.tor().clone();
        sys.shutdown().await;
        assert_eq!(tor.state(), TorState::Disconnected);
    }
}
