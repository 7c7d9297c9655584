//! Error taxonomy for the egress subsystem.
//!
//! Every variant that stands in for "would have gone direct" is terminal for
//! the request: the broker fails closed and never retries on a weaker path.

use thiserror::Error;

use crate::dns::DnsError;
use crate::policy::EgressMode;
use crate::proxy::SplitTunnelViolation;
use crate::request::ProcessKind;
use crate::tor::PluggableTransport;

/// `Clone` so every waiter on a single-flight circuit build sees the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EgressError {
    #[error("process kind `{0}` has no egress capability")]
    ProcessNotAuthorized(ProcessKind),

    #[error("egress unavailable: {0}")]
    EgressUnavailable(String),

    #[error("direct egress forbidden in {mode} mode: {reason}")]
    DirectEgressForbidden { mode: EgressMode, reason: String },

    #[error("circuit build failed after {attempts} attempt(s): {reason}")]
    CircuitBuildFailure { attempts: u32, reason: String },

    #[error("guard `{0}` unreachable")]
    GuardUnreachable(String),

    #[error("DNS leak detected while resolving `{0}`")]
    DnsLeakDetected(String),

    #[error(transparent)]
    SplitTunnelViolation(#[from] SplitTunnelViolation),

    #[error("every pluggable transport failed its probe: {0:?}")]
    PluggableTransportExhausted(Vec<PluggableTransport>),

    #[error("speculative connection refused in {0} mode")]
    SpeculativeConnectionRefused(EgressMode),

    #[error("DNS resolution failed: {0}")]
    Dns(DnsError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request cancelled")]
    Cancelled,
}

impl From<DnsError> for EgressError {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::LeakRefused(host) => EgressError::DnsLeakDetected(host),
            other => EgressError::Dns(other),
        }
    }
}

impl From<std::io::Error> for EgressError {
    fn from(err: std::io::Error) -> Self {
        EgressError::Transport(err.to_string())
    }
}

impl EgressError {
    /// True for refusals that guard the zero-direct-egress invariant.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            EgressError::DirectEgressForbidden { .. }
                | EgressError::CircuitBuildFailure { .. }
                | EgressError::GuardUnreachable(_)
                | EgressError::DnsLeakDetected(_)
                | EgressError::SplitTunnelViolation(_)
                | EgressError::PluggableTransportExhausted(_)
        )
    }
}

pub type EgressResult<T> = Result<T, EgressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leak_refusal_maps_to_dns_leak() {
        let err: EgressError = DnsError::LeakRefused("tracker.example".to_string()).into();
        assert_eq!(err, EgressError::DnsLeakDetected("tracker.example".to_string()));
        assert!(err.is_fail_closed());
    }

    #[test]
    fn display_names_the_mode() {
        let err = EgressError::DirectEgressForbidden {
            mode: EgressMode::Tor,
            reason: "udp".to_string(),
        };
        assert!(err.to_string().contains("tor"));
        assert!(err.to_string().contains("udp"));
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: EgressError = io.into();
        assert!(matches!(err, EgressError::Transport(ref m) if m.contains("refused")));
        assert!(!err.is_fail_closed());
    }
}
