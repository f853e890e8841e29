//! Peer membership and failure-detection state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    /// Missed at least one heartbeat window; still addressed.
    Suspect,
    Failed,
}

#[derive(Clone, Copy, Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub missed_heartbeats: u32,
}

#[derive(Clone, Copy, Debug)]
struct PeerEntry {
    last_seen: Instant,
    missed: u32,
}

/// The active peer table; the heartbeat loop sweeps it once per interval.
#[derive(Debug, Default)]
pub(crate) struct PeerSet {
    peers: HashMap<SocketAddr, PeerEntry>,
}

impl PeerSet {
    /// Adds or refreshes a peer; returns whether it was new.
    pub(crate) fn upsert(&mut self, addr: SocketAddr) -> bool {
        let now = Instant::now();

        match self.peers.get_mut(&addr) {
            Some(entry) => {
                entry.last_seen = now;
                entry.missed = 0;
                false
            }
            None => {
                let _previous = self.peers.insert(
                    addr,
                    PeerEntry {
                        last_seen: now,
                        missed: 0,
                    },
                );
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, addr: &SocketAddr) -> bool {
        self.peers.remove(addr).is_some()
    }

    pub(crate) fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Accounts one heartbeat window; returns peers that crossed the
    /// failure threshold (they are removed from the table).
    pub(crate) fn sweep(
        &mut self,
        interval: Duration,
        threshold: u32,
    ) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut failed = Vec::new();

        for (addr, entry) in &mut self.peers {
            let windows = now
                .saturating_duration_since(entry.last_seen)
                .as_millis()
                .checked_div(interval.as_millis())
                .unwrap_or(0) as u32;
            entry.missed = windows;

            if windows >= threshold {
                failed.push(*addr);
            }
        }

        for addr in &failed {
            let _removed = self.peers.remove(addr);
        }

        failed
    }

    pub(crate) fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    /// Up to `fanout` distinct random peers.
    pub(crate) fn sample(&self, fanout: usize, rng: &mut impl Rng) -> Vec<SocketAddr> {
        let mut addrs = self.addrs();
        addrs.shuffle(rng);
        addrs.truncate(fanout);
        addrs
    }

    pub(crate) fn infos(&self, threshold: u32) -> Vec<PeerInfo> {
        let mut infos: Vec<_> = self
            .peers
            .iter()
            .map(|(addr, entry)| PeerInfo {
                addr: *addr,
                state: if entry.missed == 0 {
                    PeerState::Alive
                } else if entry.missed < threshold {
                    PeerState::Suspect
                } else {
                    PeerState::Failed
                },
                missed_heartbeats: entry.missed,
            })
            .collect();

        infos.sort_by_key(|info| info.addr);
        infos
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn upsert_reports_new_peers_once() {
        let mut set = PeerSet::default();

        assert!(set.upsert(addr(1000)));
        assert!(!set.upsert(addr(1000)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn sample_is_bounded_by_fanout() {
        let mut set = PeerSet::default();
        for port in 1000..1010 {
            set.upsert(addr(port));
        }

        let sampled = set.sample(3, &mut rand::thread_rng());
        assert_eq!(sampled.len(), 3);

        let all = set.sample(100, &mut rand::thread_rng());
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn sweep_fails_silent_peers() {
        let mut set = PeerSet::default();
        set.upsert(addr(1000));

        // A zero-length window means every peer has missed "infinitely"
        // many heartbeats at the next sweep.
        std::thread::sleep(Duration::from_millis(5));
        let failed = set.sweep(Duration::from_millis(1), 3);

        assert_eq!(failed, vec![addr(1000)]);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn sweep_keeps_fresh_peers() {
        let mut set = PeerSet::default();
        set.upsert(addr(1000));

        let failed = set.sweep(Duration::from_secs(60), 3);

        assert!(failed.is_empty());
        assert_eq!(set.len(), 1);
    }
}
