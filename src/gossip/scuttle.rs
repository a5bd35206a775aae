use super::peer_state::{Delta, PeerState};
use crate::crypto::PublicKey;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Highest version known per peer.
pub type Digest = BTreeMap<PublicKey, u64>;

/// What a digest receiver sends back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScuttleResult {
    pub deltas: Vec<Delta>,
    /// Peers the receiver wants deltas for, after the given version.
    pub requests: Digest,
    pub new_peers: Vec<PublicKey>,
}

/// Scuttlebutt reconciliation over the set of known peer states.
#[derive(Debug, Clone)]
pub struct ScuttleService {
    local: PublicKey,
    peers: BTreeMap<PublicKey, PeerState>,
}

impl ScuttleService {
    pub fn new(local: PublicKey) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(local, PeerState::new(local));
        ScuttleService { local, peers }
    }

    pub fn local_key(&self) -> PublicKey {
        self.local
    }

    pub fn add_peer(&mut self, public_key: PublicKey) {
        self.peers
            .entry(public_key)
            .or_insert_with(|| PeerState::new(public_key));
    }

    pub fn peer(&self, public_key: &PublicKey) -> Option<&PeerState> {
        self.peers.get(public_key)
    }

    pub fn peer_mut(&mut self, public_key: &PublicKey) -> Option<&mut PeerState> {
        self.peers.get_mut(public_key)
    }

    pub fn local_state(&self) -> Option<&PeerState> {
        self.peers.get(&self.local)
    }

    pub fn local_state_mut(&mut self) -> Option<&mut PeerState> {
        self.peers.get_mut(&self.local)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peers.values_mut()
    }

    pub fn remote_peers_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        let local = self.local;
        self.peers
            .values_mut()
            .filter(move |p| p.public_key() != local)
    }

    pub fn digest(&self) -> Digest {
        self.peers
            .iter()
            .map(|(key, state)| (*key, state.max_version_seen()))
            .collect()
    }

    /// Compare a remote digest against local knowledge.
    ///
    /// Deltas are grouped per peer, ascending by version, with the peers
    /// holding the most deltas first. Peers the remote did not mention at
    /// all are sent in full.
    pub fn scuttle(&self, remote: &Digest) -> ScuttleResult {
        let mut result = ScuttleResult::default();
        let mut groups: Vec<Vec<Delta>> = Vec::new();

        for (peer, remote_version) in remote {
            match self.peers.get(peer) {
                None => {
                    result.new_peers.push(*peer);
                    result.requests.insert(*peer, 0);
                }
                Some(state) => {
                    let local_version = state.max_version_seen();
                    if local_version > *remote_version {
                        groups.push(state.deltas_after(*remote_version));
                    } else if local_version < *remote_version {
                        result.requests.insert(*peer, local_version);
                    }
                }
            }
        }

        for (peer, state) in &self.peers {
            if !remote.contains_key(peer) && state.max_version_seen() > 0 {
                groups.push(state.deltas_after(0));
            }
        }

        groups.retain(|g| !g.is_empty());
        groups.sort_by(|a, b| b.len().cmp(&a.len()));
        result.deltas = groups.into_iter().flatten().collect();

        trace!(
            deltas = result.deltas.len(),
            requests = result.requests.len(),
            new_peers = result.new_peers.len(),
            "Gossip: scuttle"
        );
        result
    }

    /// Deltas answering a set of `(peer, after_version)` requests.
    pub fn fetch_deltas(&self, requests: &Digest) -> Vec<Delta> {
        let mut out = Vec::new();
        for (peer, version) in requests {
            if let Some(state) = self.peers.get(peer) {
                out.extend(state.deltas_after(*version));
            }
        }
        out
    }

    /// Apply remote deltas, returning the ones that changed local state.
    ///
    /// Unsigned or mis-signed deltas are dropped, heartbeats excepted.
    /// Deltas about the local node are never taken from a remote.
    pub fn update_known_state(&mut self, deltas: Vec<Delta>, now: u64) -> Vec<Delta> {
        let mut applied = Vec::new();
        for delta in deltas {
            if delta.peer == self.local {
                continue;
            }
            if !delta.verify() {
                debug!(peer = ?delta.peer, key = %delta.key, "Gossip: dropping unverified delta");
                continue;
            }
            let state = self
                .peers
                .entry(delta.peer)
                .or_insert_with(|| PeerState::new(delta.peer));
            if state.update_with_delta(&delta, now) {
                applied.push(delta);
            }
        }
        applied
    }
}
