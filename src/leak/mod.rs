//! Leak Detection Harness and the append-only leak audit log.

pub mod harness;
pub mod ledger;

use std::fmt;
use std::io::{self, Write};
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, warn};

use crate::notify::{StatusBus, StatusEvent};
use crate::observability;
use crate::policy::EgressMode;

pub use harness::{CaptureSource, CapturedPacket, LeakHarness, PreflightReport};
pub use ledger::ExpectedPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakKind {
    Dns,
    Ip,
    Sni,
    Timing,
    SplitTunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Audit record. `evidence` is a human-readable reference to what was seen;
/// it never carries payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakEvent {
    pub kind: LeakKind,
    pub evidence: String,
    pub severity: Severity,
    /// Strictest mode active when the event was recorded.
    pub mode: EgressMode,
    pub timestamp: SystemTime,
}

impl LeakEvent {
    pub fn new(kind: LeakKind, severity: Severity, mode: EgressMode, evidence: impl Into<String>) -> Self {
        Self {
            kind,
            evidence: evidence.into(),
            severity,
            mode,
            timestamp: SystemTime::now(),
        }
    }

    /// Fails a release: critical while a protected mode was active.
    pub fn fails_release(&self) -> bool {
        self.severity == Severity::Critical && self.mode.is_protected()
    }
}

impl fmt::Display for LeakEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {:?} leak in {} mode: {}",
            self.severity, self.kind, self.mode, self.evidence
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiVerdict {
    Pass,
    Fail(Vec<LeakEvent>),
}

impl CiVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, CiVerdict::Pass)
    }
}

pub struct LeakLog {
    events: RwLock<Vec<LeakEvent>>,
    bus: StatusBus,
}

impl LeakLog {
    pub fn new(bus: StatusBus) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            bus,
        }
    }

    pub fn record(&self, event: LeakEvent) {
        observability::record_leak_event(event.severity == Severity::Critical);
        if event.fails_release() {
            error!(kind = ?event.kind, mode = %event.mode, evidence = %event.evidence, "critical leak");
            self.bus.publish(StatusEvent::IntegrityWarning {
                mode: event.mode,
                event: event.clone(),
            });
        } else {
            warn!(kind = ?event.kind, severity = ?event.severity, evidence = %event.evidence, "leak event");
        }
        self.bus.publish(StatusEvent::LeakDetected(event.clone()));
        self.events.write().push(event);
    }

    pub fn events(&self) -> Vec<LeakEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn ci_verdict(&self) -> CiVerdict {
        let failing: Vec<LeakEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.fails_release())
            .cloned()
            .collect();
        if failing.is_empty() {
            CiVerdict::Pass
        } else {
            CiVerdict::Fail(failing)
        }
    }

    /// One JSON object per line, oldest first.
    pub fn export_jsonl<W: Write>(&self, mut out: W) -> io::Result<()> {
        for event in self.events.read().iter() {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}
