//! Tor Circuit Controller and the types it shares with the rest of the crate.

pub mod backend;
pub mod circuit;
pub mod controller;
pub mod guard;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use backend::{BackendCircuitId, BackendError, BuiltCircuit, TorBackend};
pub use circuit::{Circuit, CircuitId, CircuitLease, CircuitState, CircuitTable, IsolationKey};
pub use controller::{CircuitSummary, TorController};
pub use guard::{FingerprintableError, GuardPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TorState {
    Disconnected,
    Bootstrapping,
    Connected,
    Degraded,
    /// Terminal until an explicit restart.
    Failed,
}

impl TorState {
    /// Circuits may be built and used.
    pub fn is_ready(self) -> bool {
        matches!(self, TorState::Connected | TorState::Degraded)
    }
}

impl fmt::Display for TorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TorState::Disconnected => "disconnected",
            TorState::Bootstrapping => "bootstrapping",
            TorState::Connected => "connected",
            TorState::Degraded => "degraded",
            TorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluggableTransport {
    Vanilla,
    Obfs4,
    Snowflake,
    MeekAzure,
    Webtunnel,
}

impl fmt::Display for PluggableTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluggableTransport::Vanilla => "vanilla",
            PluggableTransport::Obfs4 => "obfs4",
            PluggableTransport::Snowflake => "snowflake",
            PluggableTransport::MeekAzure => "meek_azure",
            PluggableTransport::Webtunnel => "webtunnel",
        };
        f.write_str(name)
    }
}

/// Relay fingerprint or nickname as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayId(Arc<str>);

impl RelayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HopTriple {
    pub guard: RelayId,
    pub middle: RelayId,
    pub exit: RelayId,
}
