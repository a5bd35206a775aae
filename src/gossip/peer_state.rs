//! Versioned attributes of one gossip participant

use super::failure_detector::AccrualFailureDetector;
use crate::crypto::{sha256, NodeIdentity, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved attribute feeding the failure detector. Never signed.
pub const HEARTBEAT_KEY: &str = "__heartbeat__";

/// One `(key, value, version)` update owned by `peer`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub peer: PublicKey,
    pub key: String,
    pub value: Value,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Delta {
    fn signing_message(peer: &PublicKey, key: &str, value: &Value, version: u64) -> [u8; 32] {
        let value_json = value.to_string();
        sha256(&[
            peer.as_bytes(),
            &(key.len() as u64).to_be_bytes(),
            key.as_bytes(),
            &version.to_be_bytes(),
            value_json.as_bytes(),
        ])
    }

    pub fn is_heartbeat(&self) -> bool {
        self.key == HEARTBEAT_KEY
    }

    /// True for heartbeats and for deltas signed by their owning peer.
    pub fn verify(&self) -> bool {
        if self.is_heartbeat() {
            return true;
        }
        match &self.signature {
            Some(signature) => self.peer.verify_hex(
                &Self::signing_message(&self.peer, &self.key, &self.value, self.version),
                signature,
            ),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Attribute {
    value: Value,
    version: u64,
    signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeerState {
    public_key: PublicKey,
    attributes: HashMap<String, Attribute>,
    max_version_seen: u64,
    detector: AccrualFailureDetector,
    alive: bool,
}

impl PeerState {
    pub fn new(public_key: PublicKey) -> Self {
        PeerState {
            public_key,
            attributes: HashMap::new(),
            max_version_seen: 0,
            detector: AccrualFailureDetector::new(),
            alive: true,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn max_version_seen(&self) -> u64 {
        self.max_version_seen
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).map(|a| &a.value)
    }

    pub fn phi(&self, now: u64) -> f64 {
        self.detector.phi(now)
    }

    /// Apply a remote delta. Anything at or below `max_version_seen` is
    /// ignored, so duplicates and stale reorderings are no-ops.
    pub fn update_with_delta(&mut self, delta: &Delta, now: u64) -> bool {
        if delta.peer != self.public_key || delta.version <= self.max_version_seen {
            return false;
        }
        self.max_version_seen = delta.version;
        if delta.is_heartbeat() {
            self.detector.add(now);
        }
        self.attributes.insert(
            delta.key.clone(),
            Attribute {
                value: delta.value.clone(),
                version: delta.version,
                signature: delta.signature.clone(),
            },
        );
        true
    }

    /// Set an attribute on the local node's own state at the next version.
    pub fn update_local(
        &mut self,
        key: &str,
        value: Value,
        identity: Option<&NodeIdentity>,
    ) -> Delta {
        let version = self.max_version_seen + 1;
        let signature = identity.map(|id| {
            id.sign_hex(&Delta::signing_message(&self.public_key, key, &value, version))
        });
        self.max_version_seen = version;
        self.attributes.insert(
            key.to_string(),
            Attribute {
                value: value.clone(),
                version,
                signature: signature.clone(),
            },
        );
        Delta {
            peer: self.public_key,
            key: key.to_string(),
            value,
            version,
            signature,
        }
    }

    /// Move the local counter past `version`, a value this node issued in an
    /// earlier run. Live attributes are re-issued above it in their original
    /// order so peers holding the old high-water mark accept them.
    pub fn fast_forward(&mut self, version: u64, identity: &NodeIdentity) -> bool {
        if version <= self.max_version_seen {
            return false;
        }
        let mut live: Vec<(String, Attribute)> = self.attributes.drain().collect();
        live.sort_by_key(|(_, attr)| attr.version);
        self.max_version_seen = version;
        for (key, attr) in live {
            let signer = attr.signature.is_some().then_some(identity);
            self.update_local(&key, attr.value, signer);
        }
        true
    }

    /// Latest delta per key with version strictly greater than `version`, ascending.
    pub fn deltas_after(&self, version: u64) -> Vec<Delta> {
        let mut deltas: Vec<Delta> = self
            .attributes
            .iter()
            .filter(|(_, attr)| attr.version > version)
            .map(|(key, attr)| Delta {
                peer: self.public_key,
                key: key.clone(),
                value: attr.value.clone(),
                version: attr.version,
                signature: attr.signature.clone(),
            })
            .collect();
        deltas.sort_by_key(|d| d.version);
        deltas
    }

    /// Re-evaluate liveness. Returns the new state only when it flipped.
    pub fn check_liveness(&mut self, now: u64, threshold: f64) -> Option<bool> {
        // Peers never heard from keep their initial state
        self.detector.last_arrival()?;
        let available = self.detector.is_available(now, threshold);
        if available != self.alive {
            self.alive = available;
            return Some(available);
        }
        None
    }

    /// Drop a non-heartbeat attribute once it no longer needs disseminating.
    /// The version counter is unaffected.
    pub fn forget(&mut self, key: &str) -> bool {
        key != HEARTBEAT_KEY && self.attributes.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::failure_detector::DEFAULT_PHI_THRESHOLD;
    use serde_json::json;

    #[test]
    fn test_update_with_delta_is_idempotent() {
        let id = NodeIdentity::generate();
        let mut origin = PeerState::new(id.public_key());
        let delta = origin.update_local("a", json!(1), Some(&id));

        let mut replica = PeerState::new(id.public_key());
        assert!(replica.update_with_delta(&delta, 0));
        assert!(!replica.update_with_delta(&delta, 0));
        assert_eq!(replica.max_version_seen(), 1);
        assert_eq!(replica.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_stale_delta_after_newer_is_ignored() {
        let id = NodeIdentity::generate();
        let mut origin = PeerState::new(id.public_key());
        let first = origin.update_local("a", json!(1), Some(&id));
        let second = origin.update_local("a", json!(2), Some(&id));

        let mut replica = PeerState::new(id.public_key());
        assert!(replica.update_with_delta(&second, 0));
        assert!(!replica.update_with_delta(&first, 0));
        assert_eq!(replica.get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_deltas_after_sorted() {
        let id = NodeIdentity::generate();
        let mut state = PeerState::new(id.public_key());
        for i in 0..4 {
            state.update_local(&format!("k{}", i), json!(i), Some(&id));
        }
        let versions: Vec<u64> = state.deltas_after(1).iter().map(|d| d.version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[test]
    fn test_signatures() {
        let id = NodeIdentity::generate();
        let mut state = PeerState::new(id.public_key());
        let mut delta = state.update_local("a", json!("x"), Some(&id));
        assert!(delta.verify());

        delta.value = json!("forged");
        assert!(!delta.verify());

        delta.signature = None;
        assert!(!delta.verify());

        let heartbeat = state.update_local(HEARTBEAT_KEY, json!(1), None);
        assert!(heartbeat.verify());
    }

    #[test]
    fn test_signature_does_not_carry_over_shifted_key_boundary() {
        let id = NodeIdentity::generate();
        let mut state = PeerState::new(id.public_key());
        let signed = state.update_local("k", json!(12), Some(&id));
        assert_eq!(signed.version, 1);

        // Without a length prefix, "k\0" followed by version 0x131 and value 2
        // hashes the same bytes as "k", version 1, value 12.
        let shifted = Delta {
            peer: signed.peer,
            key: "k\u{0}".to_string(),
            value: json!(2),
            version: u64::from_be_bytes([0, 0, 0, 0, 0, 0, 1, b'1']),
            signature: signed.signature.clone(),
        };
        assert!(signed.verify());
        assert!(!shifted.verify());
    }

    #[test]
    fn test_fast_forward_reissues_live_attributes() {
        let id = NodeIdentity::generate();
        let mut state = PeerState::new(id.public_key());
        state.update_local(HEARTBEAT_KEY, json!(1), None);
        state.update_local("cmd", json!("x"), Some(&id));

        assert!(state.fast_forward(50, &id));
        assert!(!state.fast_forward(50, &id));
        assert_eq!(state.max_version_seen(), 52);

        let deltas = state.deltas_after(50);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].key, HEARTBEAT_KEY);
        assert_eq!(deltas[1].key, "cmd");
        assert_eq!(deltas[1].version, 52);
        assert!(deltas.iter().all(Delta::verify));
    }

    #[test]
    fn test_liveness_flips_once_each_way() {
        let id = NodeIdentity::generate();
        let mut origin = PeerState::new(id.public_key());
        let mut replica = PeerState::new(id.public_key());

        let mut now = 0;
        for _ in 0..50 {
            now += 200;
            let hb = origin.update_local(HEARTBEAT_KEY, json!(now), None);
            replica.update_with_delta(&hb, now);
            assert_eq!(replica.check_liveness(now, DEFAULT_PHI_THRESHOLD), None);
        }

        now += 10_000;
        assert_eq!(replica.check_liveness(now, DEFAULT_PHI_THRESHOLD), Some(false));
        assert_eq!(replica.check_liveness(now + 1_000, DEFAULT_PHI_THRESHOLD), None);
        assert!(!replica.is_alive());

        let hb = origin.update_local(HEARTBEAT_KEY, json!(now), None);
        replica.update_with_delta(&hb, now);
        assert_eq!(replica.check_liveness(now, DEFAULT_PHI_THRESHOLD), Some(true));
        assert_eq!(replica.check_liveness(now, DEFAULT_PHI_THRESHOLD), None);
    }
}
