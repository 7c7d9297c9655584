//! DNS Resolution Layer: encrypted resolution with ordered fallback.
//!
//! The layer holds no mode state of its own. Each call carries the active
//! [`EgressMode`] in its [`ResolveContext`], and the mode decides whether a
//! fallback is a leak.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DnsSettings;
use crate::dns_resolver::{DnsTransport, DohTransport, DotTransport, SystemTransport};
use crate::leak::{LeakEvent, LeakKind, LeakLog, Severity};
use crate::policy::EgressMode;
use crate::tor::CircuitLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsStrategy {
    /// Encrypted first, operating-system resolver second. Standard mode only.
    SystemFallback,
    /// DoH, then DoT. Never touches the system resolver.
    DohOnly,
    /// DoH with Encrypted Client Hello when the endpoint supports it.
    DohWithEch,
    /// Resolution over the request's Tor circuit.
    TorResolve,
}

impl fmt::Display for DnsStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DnsStrategy::SystemFallback => "system-fallback",
            DnsStrategy::DohOnly => "doh-only",
            DnsStrategy::DohWithEch => "doh-with-ech",
            DnsStrategy::TorResolve => "tor-resolve",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsTransportKind {
    Doh,
    Dot,
    System,
    Tor,
}

impl DnsTransportKind {
    pub fn is_encrypted(self) -> bool {
        !matches!(self, DnsTransportKind::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchSupport {
    Unknown,
    Supported,
    Unsupported,
}

/// One query as it happened. Logged at debug level, then dropped.
#[derive(Debug, Clone)]
pub struct DnsQuery<'a> {
    pub hostname: &'a str,
    pub record: RecordType,
    pub transport: DnsTransportKind,
    pub ech_attempted: bool,
    pub fallback_taken: bool,
    pub leak: bool,
}

impl DnsQuery<'_> {
    fn log(&self, outcome: &Result<Vec<IpAddr>, DnsError>) {
        debug!(
            hostname = self.hostname,
            record = self.record.as_str(),
            transport = ?self.transport,
            ech = self.ech_attempted,
            fallback = self.fallback_taken,
            leak = self.leak,
            ok = outcome.is_ok(),
            "dns query"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub transport: DnsTransportKind,
    pub ech: bool,
    pub fallback_taken: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("no addresses for `{0}`")]
    ResolutionFailed(String),

    #[error("query for `{0}` timed out")]
    Timeout(String),

    #[error("invalid domain `{0}`")]
    InvalidDomain(String),

    #[error("ECH handshake rejected by {0}")]
    EchRejected(String),

    #[error("refused local resolution of `{0}`")]
    LeakRefused(String),

    #[error("Tor resolution requested without a circuit")]
    NoCircuit,

    #[error("resolver transport error: {0}")]
    Transport(String),
}

/// Resolves names over an established circuit.
#[async_trait]
pub trait CircuitResolver: Send + Sync {
    async fn resolve_over(
        &self,
        lease: &CircuitLease,
        hostname: &str,
    ) -> Result<Vec<IpAddr>, DnsError>;
}

/// Per-call context: the mode the request started under and, for
/// `TorResolve`, the circuit to resolve over.
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    pub mode: EgressMode,
    pub circuit: Option<(&'a dyn CircuitResolver, &'a CircuitLease)>,
}

impl<'a> ResolveContext<'a> {
    pub fn local(mode: EgressMode) -> Self {
        Self {
            mode,
            circuit: None,
        }
    }

    pub fn over_circuit(
        mode: EgressMode,
        resolver: &'a dyn CircuitResolver,
        lease: &'a CircuitLease,
    ) -> Self {
        Self {
            mode,
            circuit: Some((resolver, lease)),
        }
    }
}

pub struct DnsTransports {
    pub doh: Arc<dyn DnsTransport>,
    pub dot: Option<Arc<dyn DnsTransport>>,
    pub system: Arc<dyn DnsTransport>,
}

impl DnsTransports {
    pub fn from_settings(settings: &DnsSettings) -> Result<Self, DnsError> {
        let doh: Arc<dyn DnsTransport> =
            Arc::new(DohTransport::new(
                settings.doh_endpoint.clone(),
                settings.query_timeout(),
                &settings.resolver_addresses,
            )?);
        let dot: Option<Arc<dyn DnsTransport>> = if settings.dot_endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(DotTransport::new(
                &settings.dot_endpoint,
                &settings.dot_tls_name,
            )?))
        };
        Ok(Self {
            doh,
            dot,
            system: Arc::new(SystemTransport),
        })
    }
}

pub struct DnsLayer {
    transports: DnsTransports,
    ech_enabled: AtomicBool,
    ech_support: Mutex<HashMap<String, EchSupport>>,
    timeout: Duration,
    leaks: Arc<LeakLog>,
}

impl DnsLayer {
    pub fn new(transports: DnsTransports, settings: &DnsSettings, leaks: Arc<LeakLog>) -> Self {
        let ech_support = settings
            .ech_endpoints
            .iter()
            .map(|endpoint| (endpoint.clone(), EchSupport::Supported))
            .collect();
        Self {
            transports,
            ech_enabled: AtomicBool::new(settings.ech_enabled),
            ech_support: Mutex::new(ech_support),
            timeout: settings.query_timeout(),
            leaks,
        }
    }

    pub fn from_settings(settings: &DnsSettings, leaks: Arc<LeakLog>) -> Result<Self, DnsError> {
        Ok(Self::new(DnsTransports::from_settings(settings)?, settings, leaks))
    }

    pub fn disable_ech(&self) {
        self.ech_enabled.store(false, Ordering::Relaxed);
        info!("ECH disabled for all resolver endpoints");
    }

    pub fn ech_support(&self, endpoint: &str) -> EchSupport {
        self.ech_support
            .lock()
            .get(endpoint)
            .copied()
            .unwrap_or(EchSupport::Unknown)
    }

    pub async fn resolve(
        &self,
        hostname: &str,
        strategy: DnsStrategy,
        ctx: ResolveContext<'_>,
    ) -> Result<ResolvedAddress, DnsError> {
        let hostname = normalize(hostname)?;

        if ctx.mode == EgressMode::Tor && strategy != DnsStrategy::TorResolve {
            self.leaks.record(LeakEvent::new(
                LeakKind::Dns,
                Severity::Critical,
                ctx.mode,
                format!("{strategy} lookup of {hostname} attempted in tor mode"),
            ));
            return Err(DnsError::LeakRefused(hostname));
        }

        match strategy {
            DnsStrategy::TorResolve => self.resolve_over_tor(hostname, ctx).await,
            DnsStrategy::DohOnly => self.resolve_encrypted(hostname, false).await,
            DnsStrategy::DohWithEch => self.resolve_with_ech(hostname, ctx.mode).await,
            DnsStrategy::SystemFallback => self.resolve_with_system_fallback(hostname, ctx.mode).await,
        }
    }

    async fn resolve_over_tor(
        &self,
        hostname: String,
        ctx: ResolveContext<'_>,
    ) -> Result<ResolvedAddress, DnsError> {
        let (resolver, lease) = ctx.circuit.ok_or(DnsError::NoCircuit)?;
        let outcome = self
            .timed(&hostname, resolver.resolve_over(lease, &hostname))
            .await;
        DnsQuery {
            hostname: &hostname,
            record: RecordType::A,
            transport: DnsTransportKind::Tor,
            ech_attempted: false,
            fallback_taken: false,
            leak: false,
        }
        .log(&outcome);
        let addresses = outcome?;
        if addresses.is_empty() {
            return Err(DnsError::ResolutionFailed(hostname));
        }
        Ok(ResolvedAddress {
            hostname,
            addresses,
            transport: DnsTransportKind::Tor,
            ech: false,
            fallback_taken: false,
        })
    }

    /// DoH, then DoT. `fallback_taken` on the result is set when DoT answered
    /// or when `already_fell_back` says an earlier step (ECH) was abandoned.
    async fn resolve_encrypted(
        &self,
        hostname: String,
        already_fell_back: bool,
    ) -> Result<ResolvedAddress, DnsError> {
        let doh = self.transports.doh.clone();
        match self.lookup(doh.as_ref(), &hostname, false, already_fell_back, false).await {
            Ok(addresses) => Ok(ResolvedAddress {
                hostname,
                addresses,
                transport: DnsTransportKind::Doh,
                ech: false,
                fallback_taken: already_fell_back,
            }),
            Err(err @ DnsError::ResolutionFailed(_)) => Err(err),
            Err(doh_err) => {
                let Some(dot) = self.transports.dot.clone() else {
                    return Err(doh_err);
                };
                warn!(hostname = %hostname, error = %doh_err, "DoH failed, trying DoT");
                let addresses = self.lookup(dot.as_ref(), &hostname, false, true, false).await?;
                Ok(ResolvedAddress {
                    hostname,
                    addresses,
                    transport: DnsTransportKind::Dot,
                    ech: false,
                    fallback_taken: true,
                })
            }
        }
    }

    async fn resolve_with_ech(
        &self,
        hostname: String,
        mode: EgressMode,
    ) -> Result<ResolvedAddress, DnsError> {
        if !self.ech_enabled.load(Ordering::Relaxed) {
            return self.resolve_encrypted(hostname, false).await;
        }

        let doh = self.transports.doh.clone();
        let endpoint = doh.endpoint().to_string();
        let support = match self.ech_support(&endpoint) {
            EchSupport::Unknown => {
                let probed = if doh.probe_ech().await {
                    EchSupport::Supported
                } else {
                    EchSupport::Unsupported
                };
                debug!(endpoint = %endpoint, support = ?probed, "probed ECH support");
                self.ech_support.lock().insert(endpoint.clone(), probed);
                probed
            }
            known => known,
        };

        if support == EchSupport::Supported {
            match self.lookup(doh.as_ref(), &hostname, true, false, false).await {
                Ok(addresses) => {
                    return Ok(ResolvedAddress {
                        hostname,
                        addresses,
                        transport: DnsTransportKind::Doh,
                        ech: true,
                        fallback_taken: false,
                    })
                }
                Err(DnsError::EchRejected(by)) => {
                    self.ech_support
                        .lock()
                        .insert(endpoint.clone(), EchSupport::Unsupported);
                    if mode.forbids_fallback() {
                        self.leaks.record(LeakEvent::new(
                            LeakKind::Sni,
                            Severity::Warning,
                            mode,
                            format!("ECH rejected by {by}; {hostname} resolved over plain DoH"),
                        ));
                    }
                    return self.resolve_encrypted(hostname, true).await;
                }
                Err(other) => return Err(other),
            }
        }

        self.resolve_encrypted(hostname, false).await
    }

    async fn resolve_with_system_fallback(
        &self,
        hostname: String,
        mode: EgressMode,
    ) -> Result<ResolvedAddress, DnsError> {
        let doh_err = match self.resolve_encrypted(hostname.clone(), false).await {
            Ok(resolved) => return Ok(resolved),
            Err(err @ DnsError::ResolutionFailed(_)) => return Err(err),
            Err(err) => err,
        };

        if mode.is_protected() {
            self.leaks.record(LeakEvent::new(
                LeakKind::Dns,
                Severity::Critical,
                mode,
                format!("system resolver fallback for {hostname} refused: {doh_err}"),
            ));
            return Err(DnsError::LeakRefused(hostname));
        }

        debug!(hostname = %hostname, error = %doh_err, "falling back to system resolver");
        let system = self.transports.system.clone();
        let addresses = self.lookup(system.as_ref(), &hostname, false, true, false).await?;
        Ok(ResolvedAddress {
            hostname,
            addresses,
            transport: DnsTransportKind::System,
            ech: false,
            fallback_taken: true,
        })
    }

    /// A first, AAAA when the name has no IPv4 address.
    async fn lookup(
        &self,
        transport: &dyn DnsTransport,
        hostname: &str,
        ech: bool,
        fallback_taken: bool,
        leak: bool,
    ) -> Result<Vec<IpAddr>, DnsError> {
        for record in [RecordType::A, RecordType::Aaaa] {
            let outcome = self
                .timed(hostname, transport.query(hostname, record, ech))
                .await;
            DnsQuery {
                hostname,
                record,
                transport: transport.kind(),
                ech_attempted: ech,
                fallback_taken,
                leak,
            }
            .log(&outcome);
            let addresses = outcome?;
            if !addresses.is_empty() {
                return Ok(addresses);
            }
        }
        Err(DnsError::ResolutionFailed(hostname.to_string()))
    }

    async fn timed<F>(&self, hostname: &str, fut: F) -> Result<Vec<IpAddr>, DnsError>
    where
        F: Future<Output = Result<Vec<IpAddr>, DnsError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| DnsError::Timeout(hostname.to_string()))?
    }
}

fn normalize(hostname: &str) -> Result<String, DnsError> {
    let host = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if valid {
        Ok(host)
    } else {
        Err(DnsError::InvalidDomain(hostname.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::StatusBus;
    use crate::test_support::{StaticDns, StaticCircuitResolver};

    fn build_layer(doh: StaticDns, dot: Option<StaticDns>) -> (DnsLayer, Arc<LeakLog>, Arc<StaticDns>) {
        let leaks = Arc::new(LeakLog::new(StatusBus::default()));
        let system = Arc::new(
            StaticDns::new(DnsTransportKind::System).answer("example.com", "10.0.0.1"),
        );
        let transports = DnsTransports {
            doh: Arc::new(doh),
            dot: dot.map(|d| Arc::new(d) as Arc<dyn DnsTransport>),
            system: system.clone(),
        };
        let layer = DnsLayer::new(transports, &DnsSettings::default(), leaks.clone());
        (layer, leaks, system)
    }

    fn answering_doh() -> StaticDns {
        StaticDns::new(DnsTransportKind::Doh).answer("example.com", "93.184.216.34")
    }

    #[tokio::test]
    async fn doh_only_answers_over_doh() {
        let (layer, leaks, _) = build_layer(answering_doh(), None);
        let resolved = layer
            .resolve("Example.com.", DnsStrategy::DohOnly, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap();
        assert_eq!(resolved.hostname, "example.com");
        assert_eq!(resolved.transport, DnsTransportKind::Doh);
        assert!(!resolved.fallback_taken);
        assert!(leaks.events().is_empty());
    }

    #[tokio::test]
    async fn doh_failure_falls_back_to_dot_without_leak() {
        let dot = StaticDns::new(DnsTransportKind::Dot).answer("example.com", "93.184.216.34");
        let (layer, leaks, _) = build_layer(answering_doh().failing(), Some(dot));
        let resolved = layer
            .resolve("example.com", DnsStrategy::DohOnly, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap();
        assert_eq!(resolved.transport, DnsTransportKind::Dot);
        assert!(resolved.fallback_taken);
        assert!(leaks.events().is_empty());
    }

    #[tokio::test]
    async fn system_fallback_allowed_in_standard() {
        let (layer, leaks, system) = build_layer(answering_doh().failing(), None);
        let resolved = layer
            .resolve("example.com", DnsStrategy::SystemFallback, ResolveContext::local(EgressMode::Standard))
            .await
            .unwrap();
        assert_eq!(resolved.transport, DnsTransportKind::System);
        assert_eq!(system.queries(), 1);
        assert!(leaks.events().is_empty());
    }

    #[tokio::test]
    async fn system_fallback_refused_in_hardened() {
        let (layer, leaks, system) = build_layer(answering_doh().failing(), None);
        let err = layer
            .resolve("example.com", DnsStrategy::SystemFallback, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::LeakRefused("example.com".to_string()));
        assert_eq!(system.queries(), 0);
        let events = leaks.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LeakKind::Dns);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn local_lookup_in_tor_mode_is_a_leak() {
        let (layer, leaks, _) = build_layer(answering_doh(), None);
        let err = layer
            .resolve("example.com", DnsStrategy::DohOnly, ResolveContext::local(EgressMode::Tor))
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::LeakRefused(_)));
        assert!(leaks.events().iter().any(|e| e.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn tor_resolve_goes_over_the_circuit() {
        let (layer, _, _) = build_layer(answering_doh(), None);
        let resolver = StaticCircuitResolver::new("198.51.100.7");
        let lease = crate::test_support::lease("p/c", "example.com");

        let err = layer
            .resolve("example.com", DnsStrategy::TorResolve, ResolveContext::local(EgressMode::Tor))
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::NoCircuit);

        let resolved = layer
            .resolve(
                "example.com",
                DnsStrategy::TorResolve,
                ResolveContext::over_circuit(EgressMode::Tor, &resolver, &lease),
            )
            .await
            .unwrap();
        assert_eq!(resolved.transport, DnsTransportKind::Tor);
        assert_eq!(resolved.addresses, vec!["198.51.100.7".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn ech_rejection_is_a_leak_only_in_protected_modes() {
        let doh = answering_doh().with_ech_probe(true).rejecting_ech();
        let (layer, leaks, _) = build_layer(doh, None);
        let resolved = layer
            .resolve("example.com", DnsStrategy::DohWithEch, ResolveContext::local(EgressMode::Standard))
            .await
            .unwrap();
        assert!(!resolved.ech);
        assert!(resolved.fallback_taken);
        assert!(leaks.events().is_empty());
        assert_eq!(layer.ech_support("static://doh"), EchSupport::Unsupported);

        let doh = answering_doh().with_ech_probe(true).rejecting_ech();
        let (layer, leaks, _) = build_layer(doh, None);
        layer
            .resolve("example.com", DnsStrategy::DohWithEch, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap();
        let events = leaks.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LeakKind::Sni);
    }

    #[tokio::test]
    async fn ech_used_when_supported() {
        let doh = answering_doh().with_ech_probe(true);
        let (layer, _, _) = build_layer(doh, None);
        let resolved = layer
            .resolve("example.com", DnsStrategy::DohWithEch, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap();
        assert!(resolved.ech);
        assert_eq!(layer.ech_support("static://doh"), EchSupport::Supported);

        layer.disable_ech();
        let resolved = layer
            .resolve("example.com", DnsStrategy::DohWithEch, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap();
        assert!(!resolved.ech);
    }

    #[tokio::test]
    async fn invalid_names_rejected() {
        let (layer, _, _) = build_layer(answering_doh(), None);
        for bad in ["", "-bad.example", "a..b", "exa mple.com"] {
            let err = layer
                .resolve(bad, DnsStrategy::DohOnly, ResolveContext::local(EgressMode::Standard))
                .await
                .unwrap_err();
            assert!(matches!(err, DnsError::InvalidDomain(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn nxdomain_does_not_fall_back() {
        let dot = StaticDns::new(DnsTransportKind::Dot).answer("missing.example", "10.0.0.9");
        let (layer, _, _) = build_layer(answering_doh(), Some(dot));
        let err = layer
            .resolve("missing.example", DnsStrategy::DohOnly, ResolveContext::local(EgressMode::Hardened))
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::ResolutionFailed("missing.example".to_string()));
    }
}
