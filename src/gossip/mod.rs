//! Scuttlebutt anti-entropy for disseminating uncommitted commands
//!
//! A round is three messages: the initiator sends its digest
//! (`GossipRequest`), the receiver answers with the deltas the initiator
//! lacks plus its own requests (`GossipFirstResponse`), and the initiator
//! closes with the deltas asked for (`GossipSecondResponse`).
//!
//! ## Structure
//! - `failure_detector.rs` - phi accrual detector fed by heartbeat deltas
//! - `peer_state.rs` - versioned attributes of one peer
//! - `scuttle.rs` - digest comparison and delta reconciliation
//! - `engine.rs` - per-node driver used by the node's gossip loop

pub mod engine;
pub mod failure_detector;
pub mod peer_state;
pub mod scuttle;

pub use engine::{GossipEngine, LivenessChange};
pub use failure_detector::{AccrualFailureDetector, DEFAULT_PHI_THRESHOLD};
pub use peer_state::{Delta, PeerState, HEARTBEAT_KEY};
pub use scuttle::{Digest, ScuttleResult, ScuttleService};

use crate::crypto::PublicKey;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GossipRequest {
    pub digest: Digest,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GossipFirstResponse {
    pub deltas: Vec<Delta>,
    pub requests: Digest,
    #[serde(rename = "newPeerIds")]
    pub new_peers: Vec<PublicKey>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GossipSecondResponse {
    pub deltas: Vec<Delta>,
}
