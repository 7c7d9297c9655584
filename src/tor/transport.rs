use tracing::{info, warn};

use super::{PluggableTransport, TorBackend};
use crate::error::EgressError;
use crate::notify::{StatusBus, StatusEvent};

/// Probes `preference` in order and returns the first transport that works.
/// An empty preference list means vanilla Tor and yields `None`.
pub async fn select_transport(
    backend: &dyn TorBackend,
    preference: &[PluggableTransport],
    bus: &StatusBus,
) -> Result<Option<PluggableTransport>, EgressError> {
    if preference.is_empty() {
        return Ok(None);
    }
    for &transport in preference {
        match backend.probe_transport(transport).await {
            Ok(()) => {
                info!(%transport, "pluggable transport selected");
                return Ok(Some(transport));
            }
            Err(e) => {
                warn!(%transport, error = %e, "pluggable transport probe failed, skipping");
                bus.publish(StatusEvent::TransportSkipped {
                    transport,
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(EgressError::PluggableTransportExhausted(preference.to_vec()))
}
