//! Node identity, term, role and the static peer table

use crate::crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        role as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Follower),
            1 => Ok(Role::Candidate),
            2 => Ok(Role::Leader),
            other => Err(format!("unknown role {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Cluster member as seen by the replication side: address and liveness only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub public_key: PublicKey,
    pub address: String,
    pub alive: bool,
}

/// Emitted on every successful `set_state`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub role: Role,
    pub term: u64,
    pub leader: Option<PublicKey>,
    pub previous_role: Role,
    pub previous_term: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("term may not decrease: current {current}, requested {requested}")]
    TermRegression { current: u64, requested: u64 },

    #[error("leader role requires a proof")]
    LeaderWithoutProof,
}

/// `ceil(peer_count / 2) + 1`, where `peer_count` excludes the local node.
pub fn majority(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

#[derive(Debug)]
pub struct NodeState {
    pub public_key: PublicKey,
    pub address: String,
    term: u64,
    role: Role,
    leader_public_key: Option<PublicKey>,
    proof: Option<String>,
    proof_minted_at: u64,
    leader_since: u64,
    voted_for: Option<(u64, String)>,
    peers: BTreeMap<PublicKey, PeerInfo>,
    notifier: broadcast::Sender<StateChange>,
}

impl NodeState {
    pub fn new(public_key: PublicKey, address: impl Into<String>) -> Self {
        let (notifier, _) = broadcast::channel(64);
        NodeState {
            public_key,
            address: address.into(),
            term: 0,
            role: Role::Follower,
            leader_public_key: None,
            proof: None,
            proof_minted_at: 0,
            leader_since: 0,
            voted_for: None,
            peers: BTreeMap::new(),
            notifier,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader(&self) -> Option<PublicKey> {
        self.leader_public_key
    }

    pub fn proof(&self) -> Option<&str> {
        self.proof.as_deref()
    }

    pub fn proof_minted_at(&self) -> u64 {
        self.proof_minted_at
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Term at which the current leadership began. Renewals keep it.
    pub fn leader_since(&self) -> u64 {
        self.leader_since
    }

    /// Atomically replace role, term, leader and proof.
    ///
    /// Rejects a lower term and a leader role without a proof; both leave the
    /// state untouched and emit nothing.
    pub fn set_state(
        &mut self,
        role: Role,
        term: u64,
        leader: Option<PublicKey>,
        proof: Option<String>,
        proof_minted_at: u64,
    ) -> Result<(), StateError> {
        if term < self.term {
            return Err(StateError::TermRegression {
                current: self.term,
                requested: term,
            });
        }
        if role == Role::Leader && proof.is_none() {
            return Err(StateError::LeaderWithoutProof);
        }

        let change = StateChange {
            role,
            term,
            leader,
            previous_role: self.role,
            previous_term: self.term,
        };

        if self.role != role || self.term != term {
            info!(
                from_role = %self.role,
                to_role = %role,
                from_term = self.term,
                to_term = term,
                "State change"
            );
        }

        if role == Role::Leader && self.role != Role::Leader {
            self.leader_since = term;
        }
        self.role = role;
        self.term = term;
        self.leader_public_key = leader;
        self.proof = proof;
        self.proof_minted_at = proof_minted_at;

        // No subscribers is fine
        let _ = self.notifier.send(change);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notifier.subscribe()
    }

    /// Highest term this node has cast a vote in, its own candidacies included.
    pub fn voted_term(&self) -> u64 {
        self.voted_for.as_ref().map_or(0, |(term, _)| *term)
    }

    /// Record a vote for `(term, nonce)`. Returns false if this node already
    /// voted for a different nonce in the same term.
    pub fn record_vote(&mut self, term: u64, nonce: &str) -> bool {
        match &self.voted_for {
            Some((voted_term, voted_nonce)) if *voted_term == term => voted_nonce == nonce,
            Some((voted_term, _)) if *voted_term > term => false,
            _ => {
                self.voted_for = Some((term, nonce.to_string()));
                true
            }
        }
    }

    pub fn add_peer(&mut self, public_key: PublicKey, address: impl Into<String>) {
        if public_key == self.public_key {
            return;
        }
        self.peers.insert(
            public_key,
            PeerInfo {
                public_key,
                address: address.into(),
                alive: true,
            },
        );
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub fn peer(&self, public_key: &PublicKey) -> Option<&PeerInfo> {
        self.peers.get(public_key)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn set_peer_alive(&mut self, public_key: &PublicKey, alive: bool) {
        if let Some(peer) = self.peers.get_mut(public_key) {
            peer.alive = alive;
        }
    }

    pub fn majority(&self) -> usize {
        majority(self.peers.len())
    }

    /// Every cluster key including this node's, in ascending order.
    pub fn cluster_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.peers.keys().copied().collect();
        keys.push(self.public_key);
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeIdentity;

    fn state() -> NodeState {
        NodeState::new(NodeIdentity::generate().public_key(), "127.0.0.1:7000")
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(0), 1);
        assert_eq!(majority(1), 2);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 3);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(6), 4);
    }

    #[test]
    fn test_set_state_rejects_term_regression() {
        let mut s = state();
        s.set_state(Role::Follower, 3, None, None, 0).unwrap();
        let err = s.set_state(Role::Follower, 2, None, None, 0).unwrap_err();
        assert_eq!(err, StateError::TermRegression { current: 3, requested: 2 });
        assert_eq!(s.term(), 3);
    }

    #[test]
    fn test_leader_since_survives_renewal() {
        let mut s = state();
        let me = s.public_key;
        s.set_state(Role::Leader, 2, Some(me), Some("p2".into()), 0).unwrap();
        s.set_state(Role::Leader, 3, Some(me), Some("p3".into()), 5).unwrap();
        assert_eq!(s.leader_since(), 2);

        s.set_state(Role::Follower, 4, None, None, 0).unwrap();
        s.set_state(Role::Leader, 6, Some(me), Some("p6".into()), 9).unwrap();
        assert_eq!(s.leader_since(), 6);
    }

    #[test]
    fn test_voted_term_tracks_highest_vote() {
        let mut s = state();
        assert_eq!(s.voted_term(), 0);
        assert!(s.record_vote(2, "a"));
        assert!(!s.record_vote(1, "b"));
        assert_eq!(s.voted_term(), 2);
    }

    #[test]
    fn test_leader_requires_proof() {
        let mut s = state();
        assert_eq!(
            s.set_state(Role::Leader, 1, None, None, 0),
            Err(StateError::LeaderWithoutProof)
        );
        assert_eq!(s.role(), Role::Follower);

        let me = s.public_key;
        s.set_state(Role::Leader, 1, Some(me), Some("proof".into()), 10).unwrap();
        assert!(s.is_leader());
        assert_eq!(s.proof(), Some("proof"));
        assert_eq!(s.proof_minted_at(), 10);
    }

    #[test]
    fn test_set_state_notifies_subscribers() {
        let mut s = state();
        let mut rx = s.subscribe();
        s.set_state(Role::Candidate, 1, None, None, 0).unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.role, Role::Candidate);
        assert_eq!(change.term, 1);
        assert_eq!(change.previous_role, Role::Follower);
        assert_eq!(change.previous_term, 0);
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut s = state();
        assert!(s.record_vote(1, "a"));
        assert!(s.record_vote(1, "a"));
        assert!(!s.record_vote(1, "b"));
        assert!(s.record_vote(2, "b"));
        assert!(!s.record_vote(1, "c"));
    }

    #[test]
    fn test_peer_table_excludes_self() {
        let mut s = state();
        let me = s.public_key;
        let other = NodeIdentity::generate().public_key();
        s.add_peer(me, "self");
        s.add_peer(other, "127.0.0.1:7001");

        assert_eq!(s.peer_count(), 1);
        assert_eq!(s.cluster_keys().len(), 2);
        s.set_peer_alive(&other, false);
        assert!(!s.peer(&other).unwrap().alive);
    }

    #[test]
    fn test_role_wire_value() {
        assert_eq!(serde_json::to_string(&Role::Leader).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Role>("1").unwrap(), Role::Candidate);
        assert!(serde_json::from_str::<Role>("9").is_err());
    }
}
