#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityLevel {
    OBS_NONE,
    OBS_SAFE,
    OBS_DEV,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalClass {
    NOT_AUTHORIZED,
    UNAVAILABLE,
    FAIL_CLOSED,
    TRANSPORT_IO,
    OTHER,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    DIRECT,
    PROXY,
    CIRCUIT,
    RESOLUTION,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    OK,
    DEGRADED,
    FAULTED,
}

#[cfg(feature = "obs_none")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_NONE;

#[cfg(feature = "obs_dev")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_DEV;

#[cfg(all(not(feature = "obs_none"), not(feature = "obs_dev")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_SAFE;

pub const OBS_NONE: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_NONE);
pub const OBS_DEV: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_DEV);

use std::sync::atomic::{AtomicU64, Ordering};

const REFUSAL_CLASSES: usize = 5;
const ROUTE_CLASSES: usize = 4;

static REFUSALS: [AtomicU64; REFUSAL_CLASSES] = [const { AtomicU64::new(0) }; REFUSAL_CLASSES];
static ADMITTED: [AtomicU64; ROUTE_CLASSES] = [const { AtomicU64::new(0) }; ROUTE_CLASSES];
static HEALTH_STATE: AtomicU64 = AtomicU64::new(HealthState::OK as u64);

static CIRCUITS_BUILT: AtomicU64 = AtomicU64::new(0);
static CIRCUITS_TORN_DOWN: AtomicU64 = AtomicU64::new(0);
static GUARD_ROTATIONS: AtomicU64 = AtomicU64::new(0);
static LEAK_EVENTS: AtomicU64 = AtomicU64::new(0);
static CRITICAL_LEAK_EVENTS: AtomicU64 = AtomicU64::new(0);
static STREAMS_OPENED: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn record_admitted(route: RouteClass) {
    if OBS_NONE {
        return;
    }
    ADMITTED[route as usize].fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_refused(class: RefusalClass) {
    if OBS_NONE {
        return;
    }
    REFUSALS[class as usize].fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_circuit_built() {
    if OBS_NONE {
        return;
    }
    CIRCUITS_BUILT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_circuits_torn_down(count: usize) {
    if OBS_NONE {
        return;
    }
    CIRCUITS_TORN_DOWN.fetch_add(count as u64, Ordering::Relaxed);
}

#[inline]
pub fn record_guard_rotation() {
    if OBS_NONE {
        return;
    }
    GUARD_ROTATIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_leak_event(critical: bool) {
    if OBS_NONE {
        return;
    }
    LEAK_EVENTS.fetch_add(1, Ordering::Relaxed);
    if critical {
        CRITICAL_LEAK_EVENTS.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_stream_opened() {
    if OBS_NONE {
        return;
    }
    STREAMS_OPENED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn set_health(state: HealthState) {
    HEALTH_STATE.store(state as u64, Ordering::Relaxed);
}

#[inline]
pub fn get_health() -> HealthState {
    match HEALTH_STATE.load(Ordering::Relaxed) {
        x if x == HealthState::OK as u64 => HealthState::OK,
        x if x == HealthState::DEGRADED as u64 => HealthState::DEGRADED,
        _ => HealthState::FAULTED,
    }
}

#[derive(Debug, Clone)]
pub struct ObservabilitySnapshot {
    pub admitted: [u64; ROUTE_CLASSES],
    pub refused: [u64; REFUSAL_CLASSES],
    pub circuits_built: u64,
    pub circuits_torn_down: u64,
    pub guard_rotations: u64,
    pub leak_events: u64,
    pub critical_leak_events: u64,
    pub streams_opened: u64,
    pub health: HealthState,
}

impl ObservabilitySnapshot {
    pub fn admitted_via(&self, route: RouteClass) -> u64 {
        self.admitted[route as usize]
    }

    pub fn refused_as(&self, class: RefusalClass) -> u64 {
        self.refused[class as usize]
    }
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        admitted: ADMITTED.each_ref().map(|c| c.load(Ordering::Relaxed)),
        refused: REFUSALS.each_ref().map(|c| c.load(Ordering::Relaxed)),
        circuits_built: CIRCUITS_BUILT.load(Ordering::Relaxed),
        circuits_torn_down: CIRCUITS_TORN_DOWN.load(Ordering::Relaxed),
        guard_rotations: GUARD_ROTATIONS.load(Ordering::Relaxed),
        leak_events: LEAK_EVENTS.load(Ordering::Relaxed),
        critical_leak_events: CRITICAL_LEAK_EVENTS.load(Ordering::Relaxed),
        streams_opened: STREAMS_OPENED.load(Ordering::Relaxed),
        health: get_health(),
    }
}

#[cfg(all(test, not(feature = "obs_none")))]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        record_admitted(RouteClass::CIRCUIT);
        record_refused(RefusalClass::FAIL_CLOSED);
        record_leak_event(true);
        let after = snapshot();
        assert!(after.admitted_via(RouteClass::CIRCUIT) > before.admitted_via(RouteClass::CIRCUIT));
        assert!(after.refused_as(RefusalClass::FAIL_CLOSED) > before.refused_as(RefusalClass::FAIL_CLOSED));
        assert!(after.critical_leak_events > before.critical_leak_events);
    }
}
