//! Arena-backed circuit table keyed by isolation key.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::{BackendCircuitId, BuiltCircuit, HopTriple};
use crate::request::{ContainerId, Destination};

/// A circuit serves exactly one (container, destination host) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolationKey {
    pub container: ContainerId,
    pub host: String,
}

impl IsolationKey {
    pub fn new(container: ContainerId, destination: &Destination) -> Self {
        Self {
            container,
            host: destination.isolation_host(),
        }
    }
}

/// Slot index plus generation; stale ids never alias a newer circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Ready,
    /// Health exhausted by fingerprintable errors; kept until rotation rebuilds it.
    Suspect,
}

const FULL_HEALTH: u8 = 100;
const HEALTH_PENALTY: u8 = 25;

#[derive(Debug, Clone)]
pub struct Circuit {
    pub id: CircuitId,
    pub key: IsolationKey,
    pub hops: HopTriple,
    pub backend: BackendCircuitId,
    pub created: Instant,
    pub last_used: Instant,
    pub health: u8,
    pub fingerprint_failures: u32,
    pub state: CircuitState,
}

impl Circuit {
    pub fn lease(&self) -> CircuitLease {
        CircuitLease {
            id: self.id,
            key: self.key.clone(),
            hops: self.hops.clone(),
            backend: self.backend,
        }
    }

    fn penalize(&mut self) {
        self.fingerprint_failures += 1;
        self.health = self.health.saturating_sub(HEALTH_PENALTY);
        if self.health == 0 {
            self.state = CircuitState::Suspect;
        }
    }
}

/// Copy of a registered circuit's identity, handed out with transport handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitLease {
    pub id: CircuitId,
    pub key: IsolationKey,
    pub hops: HopTriple,
    pub backend: BackendCircuitId,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    circuit: Option<Circuit>,
}

#[derive(Debug, Default)]
pub struct CircuitTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<IsolationKey, CircuitId>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a built circuit. Any circuit already registered for `key`
    /// is returned so the caller can tear it down.
    pub fn insert(&mut self, key: IsolationKey, built: BuiltCircuit, now: Instant) -> (CircuitLease, Option<Circuit>) {
        let replaced = self.index.get(&key).copied().and_then(|id| self.remove(id));

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = CircuitId {
            index,
            generation: slot.generation,
        };
        let circuit = Circuit {
            id,
            key: key.clone(),
            hops: built.hops,
            backend: built.id,
            created: now,
            last_used: now,
            health: FULL_HEALTH,
            fingerprint_failures: 0,
            state: CircuitState::Ready,
        };
        let lease = circuit.lease();
        slot.circuit = Some(circuit);
        self.index.insert(key, id);
        (lease, replaced)
    }

    pub fn get(&self, id: CircuitId) -> Option<&Circuit> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.circuit.as_ref())
    }

    fn get_mut(&mut self, id: CircuitId) -> Option<&mut Circuit> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.circuit.as_mut())
    }

    /// Returns a lease for `key` and marks the circuit used.
    pub fn touch(&mut self, key: &IsolationKey, now: Instant) -> Option<CircuitLease> {
        let id = *self.index.get(key)?;
        let circuit = self.get_mut(id)?;
        circuit.last_used = now;
        Some(circuit.lease())
    }

    pub fn touch_id(&mut self, id: CircuitId, now: Instant) -> bool {
        match self.get_mut(id) {
            Some(circuit) => {
                circuit.last_used = now;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, lease: &CircuitLease) -> bool {
        self.get(lease.id).is_some_and(|c| c.key == lease.key)
    }

    pub fn remove(&mut self, id: CircuitId) -> Option<Circuit> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let circuit = slot.circuit.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.index.remove(&circuit.key);
        Some(circuit)
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&Circuit) -> bool) -> Vec<Circuit> {
        let ids: Vec<CircuitId> = self.iter().filter(|c| pred(c)).map(|c| c.id).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn remove_container(&mut self, container: &ContainerId) -> Vec<Circuit> {
        self.remove_where(|c| &c.key.container == container)
    }

    pub fn remove_container_guard(&mut self, container: &ContainerId, guard: &super::RelayId) -> Vec<Circuit> {
        self.remove_where(|c| &c.key.container == container && &c.hops.guard == guard)
    }

    pub fn remove_idle(&mut self, now: Instant, idle_timeout: Duration) -> Vec<Circuit> {
        self.remove_where(|c| now.saturating_duration_since(c.last_used) >= idle_timeout)
    }

    /// Records a fingerprintable error on every circuit of `container` built
    /// through `guard`.
    pub fn penalize_guard(&mut self, container: &ContainerId, guard: &super::RelayId) {
        for slot in &mut self.slots {
            if let Some(circuit) = slot.circuit.as_mut() {
                if &circuit.key.container == container && &circuit.hops.guard == guard {
                    circuit.penalize();
                }
            }
        }
    }

    /// True when another container already uses `hops` for the same host.
    pub fn triple_used_elsewhere(&self, key: &IsolationKey, hops: &HopTriple) -> bool {
        self.iter()
            .any(|c| c.key.host == key.host && c.key.container != key.container && &c.hops == hops)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Circuit> {
        self.slots.iter().filter_map(|slot| slot.circuit.as_ref())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ProfileId;
    use crate::tor::RelayId;

    fn key(container: &str, host: &str) -> IsolationKey {
        IsolationKey::new(
            ContainerId::new(ProfileId::new("p"), container),
            &Destination::parse(host),
        )
    }

    fn built(id: u64, guard: &str, middle: &str, exit: &str) -> BuiltCircuit {
        BuiltCircuit {
            id: BackendCircuitId(id),
            hops: HopTriple {
                guard: RelayId::new(guard),
                middle: RelayId::new(middle),
                exit: RelayId::new(exit),
            },
        }
    }

    #[test]
    fn removed_slots_are_reused_with_new_generation() {
        let mut table = CircuitTable::new();
        let now = Instant::now();
        let (first, _) = table.insert(key("a", "x.example"), built(1, "g", "m", "e"), now);
        table.remove(first.id).unwrap();
        assert!(!table.contains(&first));

        let (second, _) = table.insert(key("a", "y.example"), built(2, "g", "m2", "e2"), now);
        assert_eq!(second.id.index, first.id.index);
        assert_ne!(second.id, first.id);
        assert!(table.get(first.id).is_none());
        assert!(table.contains(&second));
    }

    #[test]
    fn insert_for_existing_key_returns_replaced() {
        let mut table = CircuitTable::new();
        let now = Instant::now();
        let k = key("a", "x.example");
        let (old, _) = table.insert(k.clone(), built(1, "g", "m", "e"), now);
        let (_, replaced) = table.insert(k, built(2, "g", "m2", "e2"), now);
        assert_eq!(replaced.unwrap().id, old.id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn container_removal_is_scoped() {
        let mut table = CircuitTable::new();
        let now = Instant::now();
        table.insert(key("a", "tracker.example"), built(1, "g1", "m1", "e1"), now);
        table.insert(key("b", "tracker.example"), built(2, "g2", "m2", "e2"), now);
        table.insert(key("a", "news.example"), built(3, "g1", "m3", "e3"), now);

        let removed = table.remove_container(&key("a", "").container);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.iter().all(|c| c.key.container.partition() == "b"));
    }

    #[test]
    fn shared_triple_detected_only_across_containers() {
        let mut table = CircuitTable::new();
        let now = Instant::now();
        let hops = built(1, "g", "m", "e");
        table.insert(key("a", "tracker.example"), hops.clone(), now);
        assert!(table.triple_used_elsewhere(&key("b", "tracker.example"), &hops.hops));
        assert!(!table.triple_used_elsewhere(&key("a", "tracker.example"), &hops.hops));
        assert!(!table.triple_used_elsewhere(&key("b", "other.example"), &hops.hops));
    }

    #[test]
    fn penalties_mark_circuits_suspect() {
        let mut table = CircuitTable::new();
        let now = Instant::now();
        let k = key("a", "x.example");
        let (lease, _) = table.insert(k.clone(), built(1, "g", "m", "e"), now);
        for _ in 0..4 {
            table.penalize_guard(&k.container, &RelayId::new("g"));
        }
        let circuit = table.get(lease.id).unwrap();
        assert_eq!(circuit.fingerprint_failures, 4);
        assert_eq!(circuit.state, CircuitState::Suspect);
    }
}
