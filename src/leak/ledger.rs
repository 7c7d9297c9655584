use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Addresses the broker has legitimately sent traffic to.
///
/// Entries added with [`allow`](Self::allow) expire after the TTL; resolver
/// and Tor entry addresses are added with
/// [`allow_permanent`](Self::allow_permanent).
pub struct ExpectedPaths {
    entries: Mutex<HashMap<IpAddr, Option<Instant>>>,
    ttl: Duration,
}

impl ExpectedPaths {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn allow(&self, addr: IpAddr) {
        let expires = Instant::now() + self.ttl;
        let mut entries = self.entries.lock();
        match entries.get_mut(&addr) {
            Some(None) => {}
            Some(Some(existing)) => *existing = (*existing).max(expires),
            None => {
                entries.insert(addr, Some(expires));
            }
        }
    }

    pub fn allow_permanent(&self, addr: IpAddr) {
        self.entries.lock().insert(addr, None);
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match self.entries.lock().get(addr) {
            Some(None) => true,
            Some(Some(expires)) => *expires > Instant::now(),
            None => false,
        }
    }

    /// Drops expired entries and returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, expires| expires.map_or(true, |at| at > now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn temporary_entries_expire() {
        let ledger = ExpectedPaths::new(Duration::from_secs(10));
        let dest: IpAddr = "93.184.216.34".parse().unwrap();
        let resolver: IpAddr = "1.1.1.1".parse().unwrap();
        ledger.allow(dest);
        ledger.allow_permanent(resolver);
        assert!(ledger.contains(&dest));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!ledger.contains(&dest));
        assert!(ledger.contains(&resolver));
        assert_eq!(ledger.prune(), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_does_not_demote_permanent_entries() {
        let ledger = ExpectedPaths::new(Duration::from_secs(1));
        let entry: IpAddr = "198.51.100.1".parse().unwrap();
        ledger.allow_permanent(entry);
        ledger.allow(entry);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(ledger.contains(&entry));
    }
}
