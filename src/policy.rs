//! Egress Policy Engine.
//!
//! Holds one [`EgressMode`] per profile and derives the per-container
//! [`ContainerPolicy`] the broker enforces. The engine never touches a
//! socket; it only decides.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::config::{IcePolicy, PolicySettings};
use crate::dns::DnsStrategy;
use crate::error::EgressError;
use crate::leak::{LeakEvent, LeakKind, LeakLog, Severity};
use crate::notify::{StatusBus, StatusEvent};
use crate::proxy::{validate_no_split_tunnel, ProxyRegistry, SplitTunnelViolation};
use crate::request::{ContainerId, ProfileId};
use crate::tor::{TorController, TorState};

/// Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressMode {
    #[default]
    Standard,
    Hardened,
    Tor,
}

impl EgressMode {
    pub const ALL: [EgressMode; 3] = [EgressMode::Standard, EgressMode::Hardened, EgressMode::Tor];

    /// Hardened or Tor: direct egress is refused and leaks are asserted.
    pub fn is_protected(self) -> bool {
        self != EgressMode::Standard
    }

    /// A fallback to a weaker path is a reportable leak in this mode.
    pub fn forbids_fallback(self) -> bool {
        self.is_protected()
    }
}

impl fmt::Display for EgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EgressMode::Standard => "standard",
            EgressMode::Hardened => "hardened",
            EgressMode::Tor => "tor",
        };
        f.write_str(name)
    }
}

/// Container policy bundle. A template can only raise a container's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerTemplate {
    Balanced,
    Research,
    Strict,
    Shopping,
    Banking,
}

impl ContainerTemplate {
    pub fn mode_floor(self) -> EgressMode {
        match self {
            ContainerTemplate::Research => EgressMode::Tor,
            ContainerTemplate::Strict | ContainerTemplate::Banking => EgressMode::Hardened,
            ContainerTemplate::Balanced | ContainerTemplate::Shopping => EgressMode::Standard,
        }
    }
}

impl fmt::Display for ContainerTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerTemplate::Balanced => "balanced",
            ContainerTemplate::Research => "research",
            ContainerTemplate::Strict => "strict",
            ContainerTemplate::Shopping => "shopping",
            ContainerTemplate::Banking => "banking",
        };
        f.write_str(name)
    }
}

/// What the broker enforces for one container. Captured once per request, so
/// a request finishes under the mode it started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPolicy {
    pub mode: EgressMode,
    pub dns_strategy: DnsStrategy,
    pub proxy_required: bool,
    pub tor_required: bool,
    pub speculative_connections_allowed: bool,
    pub https_upgrade: bool,
    /// ICE may only reach allowlisted TURN relays.
    pub ice_relay_only: bool,
    pub mdns_host_candidates: bool,
}

impl ContainerPolicy {
    pub fn derive(mode: EgressMode, settings: &PolicySettings) -> Self {
        match mode {
            EgressMode::Standard => Self {
                mode,
                dns_strategy: DnsStrategy::SystemFallback,
                proxy_required: false,
                tor_required: false,
                speculative_connections_allowed: true,
                https_upgrade: settings.https_upgrade,
                ice_relay_only: false,
                mdns_host_candidates: settings.webrtc.mdns_enabled,
            },
            EgressMode::Hardened => Self {
                mode,
                dns_strategy: DnsStrategy::DohWithEch,
                proxy_required: settings.require_proxy_in_hardened,
                tor_required: false,
                speculative_connections_allowed: false,
                https_upgrade: true,
                ice_relay_only: settings.webrtc.ice_policy == IcePolicy::RelayOnly,
                mdns_host_candidates: true,
            },
            EgressMode::Tor => Self {
                mode,
                dns_strategy: DnsStrategy::TorResolve,
                proxy_required: false,
                tor_required: true,
                speculative_connections_allowed: false,
                https_upgrade: true,
                ice_relay_only: true,
                mdns_host_candidates: true,
            },
        }
    }
}

#[derive(Default)]
struct ModeTable {
    profiles: HashMap<ProfileId, EgressMode>,
    templates: HashMap<ContainerId, ContainerTemplate>,
}

pub struct PolicyEngine {
    settings: PolicySettings,
    table: RwLock<ModeTable>,
    /// Serializes `set_mode`, template changes and demotion.
    transitions: tokio::sync::Mutex<()>,
    strictest: watch::Sender<EgressMode>,
    proxies: Arc<ProxyRegistry>,
    tor: Arc<TorController>,
    leaks: Arc<LeakLog>,
    bus: StatusBus,
}

impl PolicyEngine {
    pub fn new(
        settings: PolicySettings,
        proxies: Arc<ProxyRegistry>,
        tor: Arc<TorController>,
        leaks: Arc<LeakLog>,
        bus: StatusBus,
    ) -> Self {
        let (strictest, _) = watch::channel(settings.default_mode);
        proxies.set_enforcing(settings.default_mode.is_protected());
        Self {
            settings,
            table: RwLock::new(ModeTable::default()),
            transitions: tokio::sync::Mutex::new(()),
            strictest,
            proxies,
            tor,
            leaks,
            bus,
        }
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn current_mode(&self, profile: &ProfileId) -> EgressMode {
        self.table
            .read()
            .profiles
            .get(profile)
            .copied()
            .unwrap_or(self.settings.default_mode)
    }

    /// The stricter of the profile's mode and the container's template floor.
    pub fn effective_mode(&self, container: &ContainerId) -> EgressMode {
        let table = self.table.read();
        let profile = table
            .profiles
            .get(container.profile())
            .copied()
            .unwrap_or(self.settings.default_mode);
        let floor = table
            .templates
            .get(container)
            .map_or(EgressMode::Standard, |t| t.mode_floor());
        profile.max(floor)
    }

    pub fn policy_for(&self, container: &ContainerId) -> ContainerPolicy {
        ContainerPolicy::derive(self.effective_mode(container), &self.settings)
    }

    pub fn template_for(&self, container: &ContainerId) -> Option<ContainerTemplate> {
        self.table.read().templates.get(container).copied()
    }

    /// Switches `profile` to `mode`. Protected modes are refused while any
    /// split-tunnel-disallowed proxy config fails validation. Entering Tor
    /// starts a bootstrap in the background; requests wait for it in the
    /// broker's admission queue.
    pub async fn set_mode(self: &Arc<Self>, profile: &ProfileId, mode: EgressMode) -> Result<(), EgressError> {
        let _transition = self.transitions.lock().await;
        let from = self.current_mode(profile);
        if from == mode {
            return Ok(());
        }
        if mode == EgressMode::Tor && self.tor.state() == TorState::Failed {
            return Err(EgressError::EgressUnavailable(
                "tor controller failed; restart required".to_string(),
            ));
        }
        if mode.is_protected() {
            if let Err(violation) = self.proxies.enforce_with(ProxyRegistry::validate_all) {
                return Err(self.refuse_protected(profile.as_str(), mode, violation));
            }
        }

        self.table.write().profiles.insert(profile.clone(), mode);
        self.refresh_strictest();
        info!(%profile, %from, to = %mode, "egress mode changed");
        self.bus.publish(StatusEvent::ModeChanged {
            profile: profile.clone(),
            from,
            to: mode,
        });
        if mode == EgressMode::Tor {
            self.start_tor();
        }
        Ok(())
    }

    /// Assigns a policy template. A protected floor is refused when the
    /// container's proxy config would split-tunnel.
    pub async fn assign_template(
        self: &Arc<Self>,
        container: &ContainerId,
        template: ContainerTemplate,
    ) -> Result<(), EgressError> {
        let _transition = self.transitions.lock().await;
        let floor = template.mode_floor();
        if floor == EgressMode::Tor && self.tor.state() == TorState::Failed {
            return Err(EgressError::EgressUnavailable(
                "tor controller failed; restart required".to_string(),
            ));
        }
        if floor.is_protected() {
            let checked = self.proxies.enforce_with(|proxies| match proxies.route_for(container) {
                Some(config) => validate_no_split_tunnel(&config),
                None => Ok(()),
            });
            if let Err(violation) = checked {
                return Err(self.refuse_protected(&container.to_string(), floor, violation));
            }
        }

        self.table.write().templates.insert(container.clone(), template);
        self.refresh_strictest();
        info!(%container, %template, "container template assigned");
        if self.effective_mode(container) == EgressMode::Tor {
            self.start_tor();
        }
        Ok(())
    }

    pub fn forget_container(&self, container: &ContainerId) {
        if self.table.write().templates.remove(container).is_some() {
            self.refresh_strictest();
        }
    }

    /// Strictest mode active on any profile or container.
    pub fn strictest_mode(&self) -> EgressMode {
        *self.strictest.borrow()
    }

    pub fn watch_strictest(&self) -> watch::Receiver<EgressMode> {
        self.strictest.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.bus.subscribe()
    }

    fn refuse_protected(&self, subject: &str, mode: EgressMode, violation: SplitTunnelViolation) -> EgressError {
        warn!(subject, %mode, error = %violation, "protected mode refused");
        self.leaks.record(LeakEvent::new(
            LeakKind::SplitTunnel,
            Severity::Warning,
            self.strictest_mode(),
            format!("{mode} refused for {subject}: {violation}"),
        ));
        violation.into()
    }

    /// Runs under the table read lock so a stale recomputation cannot
    /// overwrite a newer one.
    fn refresh_strictest(&self) {
        let table = self.table.read();
        let strictest = table
            .profiles
            .values()
            .copied()
            .chain(table.templates.values().map(|t| t.mode_floor()))
            .fold(self.settings.default_mode, EgressMode::max);
        self.proxies.set_enforcing(strictest.is_protected());
        self.strictest.send_if_modified(|current| {
            if *current == strictest {
                return false;
            }
            *current = strictest;
            true
        });
    }

    /// Bootstraps Tor unless it is already up. A fatal failure demotes.
    pub fn start_tor(self: &Arc<Self>) {
        if self.tor.state().is_ready() {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.tor.bootstrap().await {
                engine.demote_from_tor(&e.to_string()).await;
            }
        });
    }

    /// Tor → Hardened for every profile explicitly in Tor. Containers held in
    /// Tor by a template floor stay there and fail closed.
    async fn demote_from_tor(&self, reason: &str) {
        let _transition = self.transitions.lock().await;
        let demoted: Vec<ProfileId> = {
            let mut table = self.table.write();
            table
                .profiles
                .iter_mut()
                .filter(|(_, mode)| **mode == EgressMode::Tor)
                .map(|(profile, mode)| {
                    *mode = EgressMode::Hardened;
                    profile.clone()
                })
                .collect()
        };
        self.refresh_strictest();
        if demoted.is_empty() {
            error!(reason, "tor bootstrap failed with no profile to demote");
            return;
        }
        for profile in demoted {
            warn!(%profile, reason, "tor mode demoted to hardened");
            self.bus.publish(StatusEvent::ModeDemoted {
                profile,
                from: EgressMode::Tor,
                to: EgressMode::Hardened,
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::proxy::{ProxyConfig, ProxyEndpoint, ProxyKind, ProxyScope, RouteProtocol};
    use crate::test_support::{controller, tor_settings, ScriptedTorBackend};

    struct Fixture {
        engine: Arc<PolicyEngine>,
        proxies: Arc<ProxyRegistry>,
        leaks: Arc<LeakLog>,
        tor: Arc<TorController>,
    }

    fn fixture(backend: ScriptedTorBackend) -> Fixture {
        let bus = StatusBus::default();
        let leaks = Arc::new(LeakLog::new(bus.clone()));
        let proxies = Arc::new(ProxyRegistry::new());
        let tor = Arc::new(controller(Arc::new(backend), tor_settings()));
        let engine = Arc::new(PolicyEngine::new(
            PolicySettings::default(),
            proxies.clone(),
            tor.clone(),
            leaks.clone(),
            bus,
        ));
        Fixture {
            engine,
            proxies,
            leaks,
            tor,
        }
    }

    fn container(profile: &str, partition: &str) -> ContainerId {
        ContainerId::new(ProfileId::new(profile), partition)
    }

    #[test]
    fn modes_order_and_display() {
        assert!(EgressMode::Standard < EgressMode::Hardened);
        assert!(EgressMode::Hardened < EgressMode::Tor);
        assert_eq!(EgressMode::Tor.to_string(), "tor");
        assert!(!EgressMode::Standard.forbids_fallback());
        assert!(EgressMode::Hardened.forbids_fallback());
    }

    #[test]
    fn derived_policies() {
        let settings = PolicySettings {
            https_upgrade: false,
            ..PolicySettings::default()
        };
        let standard = ContainerPolicy::derive(EgressMode::Standard, &settings);
        assert_eq!(standard.dns_strategy, DnsStrategy::SystemFallback);
        assert!(standard.speculative_connections_allowed);
        assert!(!standard.https_upgrade);

        let hardened = ContainerPolicy::derive(EgressMode::Hardened, &settings);
        assert_eq!(hardened.dns_strategy, DnsStrategy::DohWithEch);
        assert!(!hardened.speculative_connections_allowed);
        assert!(hardened.https_upgrade);
        assert!(!hardened.tor_required);

        assert!(hardened.ice_relay_only);
        assert!(hardened.mdns_host_candidates);

        let tor = ContainerPolicy::derive(EgressMode::Tor, &settings);
        assert_eq!(tor.dns_strategy, DnsStrategy::TorResolve);
        assert!(tor.tor_required);
    }

    #[tokio::test(start_paused = true)]
    async fn template_raises_only_its_container() {
        let f = fixture(ScriptedTorBackend::new());
        let banking = container("p", "bank");
        let other = container("p", "news");
        f.engine
            .assign_template(&banking, ContainerTemplate::Banking)
            .await
            .unwrap();

        assert_eq!(f.engine.current_mode(&ProfileId::new("p")), EgressMode::Standard);
        assert_eq!(f.engine.effective_mode(&banking), EgressMode::Hardened);
        assert_eq!(f.engine.effective_mode(&other), EgressMode::Standard);
        assert_eq!(f.engine.strictest_mode(), EgressMode::Hardened);
        assert!(f.proxies.is_enforcing());

        f.engine.forget_container(&banking);
        assert_eq!(f.engine.strictest_mode(), EgressMode::Standard);
        assert!(!f.proxies.is_enforcing());
    }

    #[tokio::test(start_paused = true)]
    async fn template_floor_never_lowers_the_profile() {
        let f = fixture(ScriptedTorBackend::new());
        let profile = ProfileId::new("p");
        let shop = container("p", "shop");
        f.engine.set_mode(&profile, EgressMode::Hardened).await.unwrap();
        f.engine
            .assign_template(&shop, ContainerTemplate::Shopping)
            .await
            .unwrap();
        assert_eq!(f.engine.effective_mode(&shop), EgressMode::Hardened);
    }

    #[tokio::test(start_paused = true)]
    async fn leaky_proxy_blocks_protected_template() {
        let f = fixture(ScriptedTorBackend::new());
        let c = container("p", "research");
        let mut leaky = ProxyConfig::full_tunnel(
            ProxyScope::Container(c.clone()),
            ProxyKind::Socks5,
            ProxyEndpoint::new("127.0.0.1", 1080),
        );
        leaky.routes.remove(&RouteProtocol::Dns);
        f.proxies.configure(ProxyScope::Container(c.clone()), leaky).unwrap();

        let err = f
            .engine
            .assign_template(&c, ContainerTemplate::Research)
            .await
            .unwrap_err();
        assert!(matches!(err, EgressError::SplitTunnelViolation(_)));
        assert_eq!(f.engine.effective_mode(&c), EgressMode::Standard);
        assert_eq!(f.leaks.events()[0].kind, LeakKind::SplitTunnel);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_transition_restores_the_enforcing_flag() {
        let f = fixture(ScriptedTorBackend::new());
        let mut leaky = ProxyConfig::full_tunnel(ProxyScope::Global, ProxyKind::Http, ProxyEndpoint::new("127.0.0.1", 3128));
        leaky.routes.remove(&RouteProtocol::Quic);
        f.proxies.configure(ProxyScope::Global, leaky).unwrap();

        let err = f.engine.set_mode(&ProfileId::new("p"), EgressMode::Hardened).await.unwrap_err();
        assert!(matches!(err, EgressError::SplitTunnelViolation(_)));
        assert!(!f.proxies.is_enforcing());
        assert_eq!(f.engine.strictest_mode(), EgressMode::Standard);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leaky_config_never_lands_alongside_a_protected_mode() {
        for _ in 0..64 {
            let f = fixture(ScriptedTorBackend::new());
            let mut leaky = ProxyConfig::full_tunnel(ProxyScope::Global, ProxyKind::Http, ProxyEndpoint::new("127.0.0.1", 3128));
            leaky.routes.remove(&RouteProtocol::Dns);

            let configure = {
                let proxies = f.proxies.clone();
                tokio::spawn(async move { proxies.configure(ProxyScope::Global, leaky) })
            };
            let switch = {
                let engine = f.engine.clone();
                tokio::spawn(async move { engine.set_mode(&ProfileId::new("p"), EgressMode::Hardened).await })
            };
            let configured = configure.await.unwrap();
            let switched = switch.await.unwrap();

            assert!(configured.is_err() || switched.is_err());
            if switched.is_ok() {
                assert!(f.proxies.validate_all().is_ok());
                assert!(f.proxies.is_enforcing());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entering_tor_bootstraps_in_background() {
        let f = fixture(ScriptedTorBackend::new().bootstrap_delay(Duration::from_secs(2)));
        let profile = ProfileId::new("p");
        let mut events = f.engine.subscribe();
        f.engine.set_mode(&profile, EgressMode::Tor).await.unwrap();

        assert_eq!(f.engine.current_mode(&profile), EgressMode::Tor);
        assert!(matches!(events.recv().await.unwrap(), StatusEvent::ModeChanged { to: EgressMode::Tor, .. }));
        f.tor.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(f.tor.state(), TorState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_bootstrap_demotes_with_warning() {
        let f = fixture(ScriptedTorBackend::new().failing_bootstrap());
        let profile = ProfileId::new("p");
        let mut events = f.engine.subscribe();
        f.engine.set_mode(&profile, EgressMode::Tor).await.unwrap();

        let demoted = loop {
            match events.recv().await.unwrap() {
                event @ StatusEvent::ModeDemoted { .. } => break event,
                _ => continue,
            }
        };
        assert!(!demoted.is_dismissable());
        assert_eq!(f.engine.current_mode(&profile), EgressMode::Hardened);
        assert_eq!(f.engine.strictest_mode(), EgressMode::Hardened);

        let err = f.engine.set_mode(&profile, EgressMode::Tor).await.unwrap_err();
        assert!(matches!(err, EgressError::EgressUnavailable(_)));
    }
}
