use super::failure_detector::DEFAULT_PHI_THRESHOLD;
use super::peer_state::{Delta, HEARTBEAT_KEY};
use super::scuttle::{Digest, ScuttleService};
use super::{GossipFirstResponse, GossipRequest, GossipSecondResponse};
use crate::crypto::{NodeIdentity, PublicKey};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Liveness transition for a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessChange {
    pub peer: PublicKey,
    pub alive: bool,
}

/// Drives the three-message gossip exchange for one node.
///
/// Purely synchronous; the caller owns the timer and the transport.
pub struct GossipEngine {
    identity: Arc<NodeIdentity>,
    scuttle: ScuttleService,
    heartbeats: u64,
    phi_threshold: f64,
}

impl GossipEngine {
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        let scuttle = ScuttleService::new(identity.public_key());
        GossipEngine {
            identity,
            scuttle,
            heartbeats: 0,
            phi_threshold: DEFAULT_PHI_THRESHOLD,
        }
    }

    pub fn with_phi_threshold(mut self, threshold: f64) -> Self {
        self.phi_threshold = threshold;
        self
    }

    pub fn add_peer(&mut self, public_key: PublicKey) {
        self.scuttle.add_peer(public_key);
    }

    pub fn scuttle(&self) -> &ScuttleService {
        &self.scuttle
    }

    pub fn digest(&self) -> Digest {
        self.scuttle.digest()
    }

    pub fn max_version_seen(&self, peer: &PublicKey) -> Option<u64> {
        self.scuttle.peer(peer).map(|p| p.max_version_seen())
    }

    /// Bump the local heartbeat attribute.
    pub fn beat_heart(&mut self) {
        self.heartbeats += 1;
        let beat = Value::from(self.heartbeats);
        if let Some(local) = self.scuttle.local_state_mut() {
            local.update_local(HEARTBEAT_KEY, beat, None);
        }
    }

    /// Publish a signed attribute under the local key.
    pub fn push(&mut self, key: &str, value: Value) -> Option<Delta> {
        if key == HEARTBEAT_KEY {
            warn!("Gossip: refusing to overwrite the heartbeat attribute");
            return None;
        }
        let identity = self.identity.clone();
        self.scuttle
            .local_state_mut()
            .map(|local| local.update_local(key, value, Some(&identity)))
    }

    /// Stop disseminating `key` from whichever peer published it.
    pub fn forget(&mut self, key: &str) {
        for state in self.scuttle.peers_mut() {
            state.forget(key);
        }
    }

    pub fn request(&self) -> GossipRequest {
        GossipRequest {
            digest: self.scuttle.digest(),
        }
    }

    /// Step 2: answer a digest with what the requester lacks plus what we lack.
    pub fn handle_request(&mut self, request: &GossipRequest) -> GossipFirstResponse {
        if let Some(seen) = request.digest.get(&self.scuttle.local_key()) {
            self.catch_up(*seen);
        }
        let result = self.scuttle.scuttle(&request.digest);
        for peer in &result.new_peers {
            debug!(peer = ?peer, "Gossip: learned of new peer");
            self.scuttle.add_peer(*peer);
        }
        GossipFirstResponse {
            deltas: result.deltas,
            requests: result.requests,
            new_peers: result.new_peers,
        }
    }

    /// Step 3: apply the first response and answer its requests.
    /// Returns the reply together with the deltas that were new here.
    pub fn handle_first_response(
        &mut self,
        response: GossipFirstResponse,
        now: u64,
    ) -> (GossipSecondResponse, Vec<Delta>) {
        self.catch_up_with(&response.deltas);
        let applied = self.scuttle.update_known_state(response.deltas, now);
        let reply = GossipSecondResponse {
            deltas: self.scuttle.fetch_deltas(&response.requests),
        };
        (reply, applied)
    }

    /// Final step on the side that answered the request.
    pub fn handle_second_response(&mut self, response: GossipSecondResponse, now: u64) -> Vec<Delta> {
        self.catch_up_with(&response.deltas);
        self.scuttle.update_known_state(response.deltas, now)
    }

    fn catch_up_with(&mut self, deltas: &[Delta]) {
        let local = self.scuttle.local_key();
        let seen = deltas
            .iter()
            .filter(|delta| delta.peer == local)
            .map(|delta| delta.version)
            .max();
        if let Some(seen) = seen {
            self.catch_up(seen);
        }
    }

    /// Peers remember versions from before a restart; continue above them.
    fn catch_up(&mut self, seen: u64) {
        let identity = self.identity.clone();
        if let Some(local) = self.scuttle.local_state_mut() {
            if local.fast_forward(seen, &identity) {
                info!(
                    version = seen,
                    now_at = local.max_version_seen(),
                    "Gossip: local versions fast-forwarded past an earlier run"
                );
            }
        }
    }

    /// Lazily re-evaluate every remote peer's phi.
    pub fn check_liveness(&mut self, now: u64) -> Vec<LivenessChange> {
        let threshold = self.phi_threshold;
        let mut changes = Vec::new();
        for state in self.scuttle.remote_peers_mut() {
            if let Some(alive) = state.check_liveness(now, threshold) {
                if alive {
                    info!(peer = ?state.public_key(), "Gossip: peer is alive");
                } else {
                    warn!(peer = ?state.public_key(), phi = state.phi(now), "Gossip: peer suspected dead");
                }
                changes.push(LivenessChange {
                    peer: state.public_key(),
                    alive,
                });
            }
        }
        changes
    }

    /// Pick a gossip target uniformly among `candidates`.
    pub fn choose_peer<'a, R: Rng + ?Sized, T>(candidates: &'a [T], rng: &mut R) -> Option<&'a T> {
        candidates.choose(rng)
    }
}
