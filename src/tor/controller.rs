//! Tor Circuit Controller.
//!
//! One instance is created per browser session and passed to the broker and
//! policy engine. All circuit table mutation goes through its methods so the
//! single-flight build invariant holds: for any isolation key at most one
//! build is in flight, and every concurrent caller observes its outcome.
//!
//! Lock order: `in_flight` → `epochs`, `in_flight` → `guards` → `circuits`.
//! No lock is held across an await.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scopeguard::ScopeGuard;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backend::{BackendError, BuiltCircuit, TorBackend};
use super::circuit::{CircuitLease, CircuitState, CircuitTable, IsolationKey};
use super::guard::{FingerprintableError, GuardPin};
use super::transport::select_transport;
use super::{PluggableTransport, RelayId, TorState};
use crate::config::TorSettings;
use crate::dns::{CircuitResolver, DnsError};
use crate::error::EgressError;
use crate::leak::ExpectedPaths;
use crate::notify::{StatusBus, StatusEvent};
use crate::observability::{self, HealthState};
use crate::policy::EgressMode;
use crate::real_transport::BoxedStream;
use crate::request::ContainerId;

type BuildOutcome = Result<CircuitLease, EgressError>;

enum BuildRole {
    Leader(watch::Sender<Option<BuildOutcome>>),
    Follower(watch::Receiver<Option<BuildOutcome>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSummary {
    pub container: ContainerId,
    pub host: String,
    pub guard: RelayId,
    pub middle: RelayId,
    pub exit: RelayId,
    pub age: Duration,
    pub health: u8,
    pub fingerprint_failures: u32,
    pub state: CircuitState,
}

pub struct TorController {
    backend: Arc<dyn TorBackend>,
    settings: TorSettings,
    state: watch::Sender<TorState>,
    transport: Mutex<Option<PluggableTransport>>,
    circuits: Mutex<CircuitTable>,
    in_flight: Mutex<HashMap<IsolationKey, watch::Receiver<Option<BuildOutcome>>>>,
    guards: Mutex<HashMap<ContainerId, GuardPin>>,
    /// Bumped on container close; builds started under an older epoch are discarded.
    epochs: Mutex<HashMap<ContainerId, u64>>,
    bootstrap_lock: tokio::sync::Mutex<()>,
    bus: StatusBus,
    ledger: Arc<ExpectedPaths>,
}

impl TorController {
    pub fn new(
        backend: Arc<dyn TorBackend>,
        settings: TorSettings,
        bus: StatusBus,
        ledger: Arc<ExpectedPaths>,
    ) -> Self {
        let (state, _) = watch::channel(TorState::Disconnected);
        Self {
            backend,
            settings,
            state,
            transport: Mutex::new(None),
            circuits: Mutex::new(CircuitTable::new()),
            in_flight: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            epochs: Mutex::new(HashMap::new()),
            bootstrap_lock: tokio::sync::Mutex::new(()),
            bus,
            ledger,
        }
    }

    pub fn state(&self) -> TorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TorState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &TorSettings {
        &self.settings
    }

    pub fn pinned_transport(&self) -> Option<PluggableTransport> {
        *self.transport.lock()
    }

    pub fn guard_for(&self, container: &ContainerId) -> Option<RelayId> {
        self.guards.lock().get(container).map(|pin| pin.guard().clone())
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.lock().len()
    }

    fn transition(&self, to: TorState, allowed: impl Fn(TorState) -> bool) -> bool {
        let mut from = to;
        let changed = self.state.send_if_modified(|state| {
            if *state == to || !allowed(*state) {
                return false;
            }
            from = *state;
            *state = to;
            true
        });
        if changed {
            info!(%from, %to, "tor state changed");
            match to {
                TorState::Connected => observability::set_health(HealthState::OK),
                TorState::Degraded => observability::set_health(HealthState::DEGRADED),
                TorState::Failed => observability::set_health(HealthState::FAULTED),
                TorState::Disconnected | TorState::Bootstrapping => {}
            }
            self.bus.publish(StatusEvent::TorStateChanged { from, to });
        }
        changed
    }

    /// Bootstraps the daemon, probing pluggable transports in preference
    /// order. Times out into `Failed`; only [`restart`](Self::restart) leaves
    /// that state.
    pub async fn bootstrap(&self) -> Result<(), EgressError> {
        let _bootstrapping = self.bootstrap_lock.lock().await;
        match self.state() {
            state if state.is_ready() => return Ok(()),
            TorState::Failed => {
                return Err(EgressError::EgressUnavailable(
                    "tor controller failed; restart required".to_string(),
                ))
            }
            _ => {}
        }

        self.transition(TorState::Bootstrapping, |s| s == TorState::Disconnected);
        let timeout = self.settings.bootstrap_timeout();
        let result = match tokio::time::timeout(timeout, self.bootstrap_daemon()).await {
            Ok(result) => result,
            Err(_) => Err(EgressError::EgressUnavailable(format!(
                "tor bootstrap timed out after {timeout:?}"
            ))),
        };

        match result {
            Ok(()) => {
                for addr in self.backend.entry_addresses() {
                    self.ledger.allow_permanent(addr);
                }
                if self.transition(TorState::Connected, |s| s == TorState::Bootstrapping) {
                    Ok(())
                } else {
                    Err(EgressError::Cancelled)
                }
            }
            Err(e) => {
                error!(error = %e, "tor bootstrap failed");
                self.transition(TorState::Failed, |_| true);
                Err(e)
            }
        }
    }

    async fn bootstrap_daemon(&self) -> Result<(), EgressError> {
        let transport =
            select_transport(self.backend.as_ref(), &self.settings.transport_preference, &self.bus).await?;
        *self.transport.lock() = transport;
        self.backend
            .bootstrap(transport)
            .await
            .map_err(|e| EgressError::EgressUnavailable(e.to_string()))
    }

    /// Leaves `Failed` and bootstraps again. The pinned transport is forgotten.
    pub async fn restart(&self) -> Result<(), EgressError> {
        {
            let _bootstrapping = self.bootstrap_lock.lock().await;
            if self.transition(TorState::Disconnected, |s| s == TorState::Failed) {
                info!("restarting tor controller");
                *self.transport.lock() = None;
            }
        }
        self.bootstrap().await
    }

    /// Tears down every circuit and returns to `Disconnected`.
    pub async fn shutdown(&self) {
        let circuits: Vec<_> = {
            let mut table = self.circuits.lock();
            let ids: Vec<_> = table.iter().map(|c| c.id).collect();
            ids.into_iter().filter_map(|id| table.remove(id)).collect()
        };
        {
            let mut epochs = self.epochs.lock();
            for pin_owner in self.guards.lock().drain().map(|(container, _)| container) {
                *epochs.entry(pin_owner).or_insert(0) += 1;
            }
        }
        for circuit in &circuits {
            self.backend.teardown(circuit.backend).await;
        }
        observability::record_circuits_torn_down(circuits.len());
        self.transition(TorState::Disconnected, |_| true);
    }

    /// Connected ⇄ Degraded, driven by the guard-health monitor.
    pub fn report_health(&self, healthy: bool) {
        if healthy {
            self.transition(TorState::Connected, |s| s == TorState::Degraded);
        } else {
            self.transition(TorState::Degraded, |s| s == TorState::Connected);
        }
    }

    /// Waits until circuits can be built. Never waits past `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), EgressError> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_ready() || *s == TorState::Failed)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(Ok(_)) => Err(EgressError::EgressUnavailable("tor bootstrap failed".to_string())),
            Ok(Err(_)) => Err(EgressError::EgressUnavailable("tor controller stopped".to_string())),
            Err(_) => Err(EgressError::EgressUnavailable(format!(
                "tor not connected within {timeout:?}"
            ))),
        }
    }

    /// Returns the circuit for `key`, building it if needed. Concurrent
    /// callers for the same key share one build.
    pub async fn circuit_for(&self, key: &IsolationKey) -> Result<CircuitLease, EgressError> {
        loop {
            let state = self.state();
            if !state.is_ready() {
                return Err(EgressError::EgressUnavailable(format!("tor is {state}")));
            }

            let role = {
                let mut in_flight = self.in_flight.lock();
                if let Some(lease) = self.circuits.lock().touch(key, Instant::now()) {
                    return Ok(lease);
                }
                match in_flight.get(key) {
                    Some(rx) => BuildRole::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(key.clone(), rx);
                        BuildRole::Leader(tx)
                    }
                }
            };

            match role {
                BuildRole::Leader(tx) => return self.lead_build(key, tx).await,
                BuildRole::Follower(mut rx) => {
                    debug!(container = %key.container, host = %key.host, "joining in-flight circuit build");
                    let outcome = rx.wait_for(Option::is_some).await.map(|o| (*o).clone());
                    match outcome {
                        Ok(Some(outcome)) => return outcome,
                        // Leader was cancelled; race to lead the next build.
                        _ => continue,
                    }
                }
            }
        }
    }

    async fn lead_build(
        &self,
        key: &IsolationKey,
        tx: watch::Sender<Option<BuildOutcome>>,
    ) -> BuildOutcome {
        let epoch = self.epoch(&key.container);
        let abandoned = scopeguard::guard(key.clone(), |key| {
            self.in_flight.lock().remove(&key);
            debug!(container = %key.container, host = %key.host, "circuit build abandoned");
        });

        let (outcome, discard) = loop {
            let built = self.build_with_retry(key).await;
            let settled = {
                let mut in_flight = self.in_flight.lock();
                let cancelled = self.epoch(&key.container) != epoch;
                let guards = self.guards.lock();
                let settled = match built {
                    Ok(built) if cancelled => Ok((Err(EgressError::Cancelled), Some(built.id))),
                    // The pin moved while this build was in flight.
                    Ok(built)
                        if guards
                            .get(&key.container)
                            .is_some_and(|pin| *pin.guard() != built.hops.guard) =>
                    {
                        Err(built.id)
                    }
                    Ok(built) => {
                        let (lease, replaced) = self.circuits.lock().insert(key.clone(), built, Instant::now());
                        observability::record_circuit_built();
                        Ok((Ok(lease), replaced.map(|c| c.backend)))
                    }
                    Err(e) => Ok((Err(e), None)),
                };
                if settled.is_ok() {
                    in_flight.remove(key);
                }
                settled
            };
            match settled {
                Ok(done) => break done,
                Err(stale) => {
                    debug!(container = %key.container, host = %key.host, "guard rotated during build; rebuilding");
                    self.backend.teardown(stale).await;
                }
            }
        };
        let _ = ScopeGuard::into_inner(abandoned);
        tx.send_replace(Some(outcome.clone()));

        if let Some(id) = discard {
            self.backend.teardown(id).await;
        }
        match &outcome {
            Ok(lease) => info!(
                container = %key.container,
                host = %key.host,
                guard = %lease.hops.guard,
                "circuit built"
            ),
            Err(e) => warn!(container = %key.container, host = %key.host, error = %e, "circuit build failed"),
        }
        outcome
    }

    fn epoch(&self, container: &ContainerId) -> u64 {
        self.epochs.lock().get(container).copied().unwrap_or(0)
    }

    async fn pinned_guard(&self, container: &ContainerId) -> Result<RelayId, BackendError> {
        let pinned = self.guard_for(container);
        if let Some(guard) = pinned {
            return Ok(guard);
        }
        let selected = self.backend.select_guard(&[]).await?;
        let guard = self
            .guards
            .lock()
            .entry(container.clone())
            .or_insert_with(|| GuardPin::new(selected))
            .guard()
            .clone();
        Ok(guard)
    }

    async fn build_with_retry(&self, key: &IsolationKey) -> Result<BuiltCircuit, EgressError> {
        let attempts = self.settings.build_max_attempts;
        let build_timeout = self.settings.build_timeout();
        let mut reason = String::new();
        let mut unreachable: Option<String> = None;
        let mut only_unreachable = true;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.backoff(attempt - 1)).await;
            }
            let guard = match self.pinned_guard(&key.container).await {
                Ok(guard) => guard,
                Err(e) => {
                    reason = format!("guard selection failed: {e}");
                    unreachable = Some(e.to_string());
                    debug!(attempt, attempts, container = %key.container, %reason, "no guard for circuit build");
                    continue;
                }
            };
            match tokio::time::timeout(build_timeout, self.backend.build_circuit(key, &guard)).await {
                Ok(Ok(built)) => {
                    let shared = self.circuits.lock().triple_used_elsewhere(key, &built.hops);
                    if !shared {
                        return Ok(built);
                    }
                    self.backend.teardown(built.id).await;
                    only_unreachable = false;
                    reason = "hop triple already serves another container".to_string();
                }
                Ok(Err(BackendError::GuardUnreachable(relay))) => {
                    reason = format!("guard {relay} unreachable");
                    unreachable = Some(relay.to_string());
                }
                Ok(Err(e)) => {
                    only_unreachable = false;
                    reason = e.to_string();
                }
                Err(_) => {
                    only_unreachable = false;
                    reason = format!("build timed out after {build_timeout:?}");
                }
            }
            debug!(
                attempt,
                attempts,
                container = %key.container,
                host = %key.host,
                %reason,
                "circuit build attempt failed"
            );
        }

        match unreachable {
            Some(detail) if only_unreachable => Err(EgressError::GuardUnreachable(detail)),
            _ => Err(EgressError::CircuitBuildFailure { attempts, reason }),
        }
    }

    /// Counts one fingerprintable error against the container's guard and
    /// rotates it when the threshold is reached. Returns whether it rotated.
    pub async fn record_fingerprintable_error(
        &self,
        container: &ContainerId,
        error: FingerprintableError,
    ) -> Result<bool, EgressError> {
        let rotate = {
            let mut guards = self.guards.lock();
            let Some(pin) = guards.get_mut(container) else {
                return Ok(false);
            };
            self.circuits.lock().penalize_guard(container, pin.guard());
            pin.record_failure(
                Instant::now(),
                self.settings.fingerprint_window(),
                self.settings.guard_rotation_threshold,
            )
        };
        warn!(%container, %error, "fingerprintable error");
        if !rotate {
            return Ok(false);
        }
        self.rotate_guard(container).await?;
        Ok(true)
    }

    /// Pins a fresh guard and rebuilds every circuit that used the old one.
    /// Returns how many circuits were rebuilt.
    pub async fn rotate_guard(&self, container: &ContainerId) -> Result<usize, EgressError> {
        let Some(old) = self.guard_for(container) else {
            return Ok(0);
        };
        let new = self
            .backend
            .select_guard(std::slice::from_ref(&old))
            .await
            .map_err(|e| EgressError::GuardUnreachable(e.to_string()))?;
        // Repin and unregister together so a build settling in between
        // cannot land on the old guard.
        let stale = {
            let mut guards = self.guards.lock();
            let Some(pin) = guards.get_mut(container) else {
                return Ok(0);
            };
            pin.repin(new.clone());
            self.circuits.lock().remove_container_guard(container, &old)
        };
        for circuit in &stale {
            self.backend.teardown(circuit.backend).await;
        }
        observability::record_circuits_torn_down(stale.len());

        let mut rebuilt = 0;
        for circuit in &stale {
            match self.circuit_for(&circuit.key).await {
                Ok(_) => rebuilt += 1,
                Err(e) => warn!(%container, host = %circuit.key.host, error = %e, "rebuild after rotation failed"),
            }
        }

        observability::record_guard_rotation();
        info!(%container, %old, %new, rebuilt, "guard rotated");
        self.bus.publish(StatusEvent::GuardRotated {
            container: container.clone(),
            old,
            new,
            rebuilt,
        });
        Ok(rebuilt)
    }

    async fn note_backend_error(&self, container: &ContainerId, error: &BackendError) {
        let kind = match error {
            BackendError::StreamReset => FingerprintableError::StreamReset,
            BackendError::ProtocolAnomaly(_) => FingerprintableError::ProtocolAnomaly,
            _ => return,
        };
        if let Err(e) = self.record_fingerprintable_error(container, kind).await {
            warn!(%container, error = %e, "guard rotation failed");
        }
    }

    /// Drops the container's circuits and guard pin; in-flight builds for it
    /// are discarded when they finish.
    pub async fn teardown_container(&self, container: &ContainerId) -> usize {
        *self.epochs.lock().entry(container.clone()).or_insert(0) += 1;
        self.guards.lock().remove(container);
        let circuits = self.circuits.lock().remove_container(container);
        for circuit in &circuits {
            self.backend.teardown(circuit.backend).await;
        }
        observability::record_circuits_torn_down(circuits.len());
        info!(%container, circuits = circuits.len(), "container circuits torn down");
        circuits.len()
    }

    pub async fn teardown_idle(&self) -> usize {
        let idle = self
            .circuits
            .lock()
            .remove_idle(Instant::now(), self.settings.circuit_idle_timeout());
        for circuit in &idle {
            self.backend.teardown(circuit.backend).await;
        }
        if !idle.is_empty() {
            observability::record_circuits_torn_down(idle.len());
            debug!(count = idle.len(), "idle circuits torn down");
        }
        idle.len()
    }

    pub fn is_registered(&self, lease: &CircuitLease) -> bool {
        self.circuits.lock().contains(lease)
    }

    /// Opens a stream to `host:port` over the leased circuit. The hostname is
    /// resolved by the exit.
    pub async fn open_stream(
        &self,
        lease: &CircuitLease,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, EgressError> {
        let registered = {
            let mut table = self.circuits.lock();
            table.contains(lease) && table.touch_id(lease.id, Instant::now())
        };
        if !registered {
            return Err(EgressError::DirectEgressForbidden {
                mode: EgressMode::Tor,
                reason: format!("circuit for {} is no longer registered", lease.key.host),
            });
        }
        match self.backend.open_stream(lease.backend, host, port).await {
            Ok(stream) => {
                observability::record_stream_opened();
                Ok(stream)
            }
            Err(e) => {
                self.note_backend_error(&lease.key.container, &e).await;
                Err(EgressError::Transport(e.to_string()))
            }
        }
    }

    pub fn summary(&self) -> Vec<CircuitSummary> {
        let now = Instant::now();
        let mut out: Vec<CircuitSummary> = self
            .circuits
            .lock()
            .iter()
            .map(|c| CircuitSummary {
                container: c.key.container.clone(),
                host: c.key.host.clone(),
                guard: c.hops.guard.clone(),
                middle: c.hops.middle.clone(),
                exit: c.hops.exit.clone(),
                age: now.saturating_duration_since(c.created),
                health: c.health,
                fingerprint_failures: c.fingerprint_failures,
                state: c.state,
            })
            .collect();
        out.sort_by(|a, b| (&a.container, &a.host).cmp(&(&b.container, &b.host)));
        out
    }

    /// One maintenance pass: idle teardown, then consensus-flagged guards are
    /// counted as fingerprintable errors.
    pub async fn maintain(&self) {
        if !self.state().is_ready() {
            return;
        }
        self.teardown_idle().await;
        let flagged = self.backend.flagged_guards().await;
        if flagged.is_empty() {
            return;
        }
        let affected: Vec<ContainerId> = self
            .guards
            .lock()
            .iter()
            .filter(|(_, pin)| flagged.contains(pin.guard()))
            .map(|(container, _)| container.clone())
            .collect();
        for container in affected {
            if let Err(e) = self
                .record_fingerprintable_error(&container, FingerprintableError::ConsensusFlagged)
                .await
            {
                warn!(%container, error = %e, "guard rotation failed");
            }
        }
    }

    pub fn spawn_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.maintenance_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.maintain().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("tor maintenance stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CircuitResolver for TorController {
    async fn resolve_over(&self, lease: &CircuitLease, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
        if !self.is_registered(lease) {
            return Err(DnsError::NoCircuit);
        }
        match self.backend.resolve(lease.backend, hostname).await {
            Ok(addresses) => Ok(addresses),
            Err(e) => {
                self.note_backend_error(&lease.key.container, &e).await;
                Err(match e {
                    BackendError::Resolve(_) => DnsError::ResolutionFailed(hostname.to_string()),
                    other => DnsError::Transport(other.to_string()),
                })
            }
        }
    }
}
