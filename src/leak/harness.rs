use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExpectedPaths, LeakEvent, LeakKind, LeakLog, Severity};
use crate::policy::EgressMode;
use crate::request::Protocol;

/// One outbound packet seen by the capture collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub destination: SocketAddr,
    pub protocol: Protocol,
    /// Server name from a plaintext ClientHello, if one was seen.
    pub sni: Option<String>,
}

impl CapturedPacket {
    pub fn tcp(destination: SocketAddr) -> Self {
        Self {
            destination,
            protocol: Protocol::Tcp,
            sni: None,
        }
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    fn is_dns(&self) -> bool {
        self.protocol == Protocol::Dns || matches!(self.destination.port(), 53 | 853)
    }

    fn classify(&self) -> LeakKind {
        if self.is_dns() {
            LeakKind::Dns
        } else if self.sni.is_some() {
            LeakKind::Sni
        } else {
            LeakKind::Ip
        }
    }
}

/// Passive capture interface provided by the platform (pcap, eBPF, CI netns).
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self, window: Duration) -> Vec<CapturedPacket>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub dns: bool,
    pub ip: bool,
    pub sni: bool,
    pub timing: bool,
    pub events: Vec<LeakEvent>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.dns && self.ip && self.sni && self.timing
    }
}

pub struct LeakHarness {
    capture: Arc<dyn CaptureSource>,
    mode: watch::Receiver<EgressMode>,
    ledger: Arc<ExpectedPaths>,
    log: Arc<LeakLog>,
}

impl LeakHarness {
    /// `mode` tracks the strictest mode active on any profile.
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        mode: watch::Receiver<EgressMode>,
        ledger: Arc<ExpectedPaths>,
        log: Arc<LeakLog>,
    ) -> Self {
        Self {
            capture,
            mode,
            ledger,
            log,
        }
    }

    /// Samples one window and returns the violations it found. Every
    /// violation is also appended to the leak log.
    pub async fn observe(&self, window: Duration) -> Vec<LeakEvent> {
        let packets = self.capture.capture(window).await;
        // Mode as of the end of the window.
        let mode = *self.mode.borrow();
        if !mode.is_protected() {
            debug!(packets = packets.len(), "standard mode: capture not asserted");
            return Vec::new();
        }

        self.ledger.prune();
        let mut events = Vec::new();
        for packet in packets {
            let ip = packet.destination.ip();
            if ip.is_loopback() || ip.is_unspecified() || self.ledger.contains(&ip) {
                continue;
            }
            let evidence = match &packet.sni {
                Some(sni) => format!("{} {} sni={sni}", packet.protocol, packet.destination),
                None => format!("{} {}", packet.protocol, packet.destination),
            };
            let event = LeakEvent::new(packet.classify(), Severity::Critical, mode, evidence);
            self.log.record(event.clone());
            events.push(event);
        }
        if !events.is_empty() {
            warn!(count = events.len(), mode = %mode, "traffic outside the expected path");
        }
        events
    }

    /// Pre-release DNS/IP/SNI/timing suite. Timing passes only when every
    /// other channel is clean and no timing event was observed.
    pub async fn preflight(&self, window: Duration) -> PreflightReport {
        let events = self.observe(window).await;
        let clean = |kind: LeakKind| !events.iter().any(|e| e.kind == kind);
        let dns = clean(LeakKind::Dns);
        let ip = clean(LeakKind::Ip);
        let sni = clean(LeakKind::Sni);
        let timing = dns && ip && sni && clean(LeakKind::Timing);
        info!(dns, ip, sni, timing, "leak preflight finished");
        PreflightReport {
            dns,
            ip,
            sni,
            timing,
            events,
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        window: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.observe(window).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("leak harness stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}
