//! Status notifications for the dashboard and CI collaborators.
//!
//! Components publish; collaborators subscribe. Publishing never blocks and a
//! bus without subscribers simply drops events.

use tokio::sync::broadcast;
use tracing::trace;

use crate::leak::LeakEvent;
use crate::policy::EgressMode;
use crate::request::{ContainerId, ProfileId};
use crate::tor::{PluggableTransport, RelayId, TorState};

#[derive(Debug, Clone)]
pub enum StatusEvent {
    ModeChanged {
        profile: ProfileId,
        from: EgressMode,
        to: EgressMode,
    },
    ModeDemoted {
        profile: ProfileId,
        from: EgressMode,
        to: EgressMode,
        reason: String,
    },
    TorStateChanged {
        from: TorState,
        to: TorState,
    },
    GuardRotated {
        container: ContainerId,
        old: RelayId,
        new: RelayId,
        rebuilt: usize,
    },
    TransportSkipped {
        transport: PluggableTransport,
        reason: String,
    },
    LeakDetected(LeakEvent),
    /// A critical leak while a protected mode is active.
    IntegrityWarning {
        mode: EgressMode,
        event: LeakEvent,
    },
}

impl StatusEvent {
    /// Demotions and integrity warnings must stay on screen until acknowledged.
    pub fn is_dismissable(&self) -> bool {
        !matches!(
            self,
            StatusEvent::ModeDemoted { .. } | StatusEvent::IntegrityWarning { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            trace!("status event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(256)
    }
}
