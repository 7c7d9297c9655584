use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use super::{HopTriple, IsolationKey, PluggableTransport, RelayId};
use crate::real_transport::BoxedStream;

/// Backend-side handle for a built circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendCircuitId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCircuit {
    pub id: BackendCircuitId,
    pub hops: HopTriple,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("guard {0} unreachable")]
    GuardUnreachable(RelayId),

    #[error("circuit build failed: {0}")]
    BuildFailed(String),

    #[error("transport probe failed: {0}")]
    ProbeFailed(String),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("stream reset mid-flight")]
    StreamReset,

    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("remote resolution failed: {0}")]
    Resolve(String),
}

impl BackendError {
    /// Errors that count toward guard rotation.
    pub fn is_fingerprintable(&self) -> bool {
        matches!(self, BackendError::StreamReset | BackendError::ProtocolAnomaly(_))
    }
}

/// The Tor daemon and consensus, treated as a black box.
#[async_trait]
pub trait TorBackend: Send + Sync {
    async fn probe_transport(&self, transport: PluggableTransport) -> Result<(), BackendError>;

    /// `None` bootstraps over vanilla Tor.
    async fn bootstrap(&self, transport: Option<PluggableTransport>) -> Result<(), BackendError>;

    async fn select_guard(&self, exclude: &[RelayId]) -> Result<RelayId, BackendError>;

    /// Builds a circuit through `guard`; middle and exit follow consensus rules.
    async fn build_circuit(
        &self,
        key: &IsolationKey,
        guard: &RelayId,
    ) -> Result<BuiltCircuit, BackendError>;

    async fn resolve(&self, circuit: BackendCircuitId, hostname: &str) -> Result<Vec<IpAddr>, BackendError>;

    /// `host` is sent to the exit unresolved.
    async fn open_stream(
        &self,
        circuit: BackendCircuitId,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, BackendError>;

    async fn teardown(&self, circuit: BackendCircuitId);

    /// Guards the current consensus marks as bad.
    async fn flagged_guards(&self) -> Vec<RelayId>;

    /// Bridge or guard addresses the daemon connects to.
    fn entry_addresses(&self) -> Vec<IpAddr>;
}
