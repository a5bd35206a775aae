//! Follower / candidate / leader state machine
//!
//! The controller owns the node's `NodeState` and the current vote round. It
//! never touches the network: every handler returns the packets to send and
//! the node's loops deliver them.

use super::proof::{Proof, ProofService};
use super::state::{NodeState, Role};
use super::vote::{root_for_term, VoteRound};
use super::ConsensusError;
use crate::config::NodeConfig;
use crate::crypto::{NodeIdentity, PublicKey};
use crate::network::packet::{
    ErrorReply, HeartbeatData, LogPosition, Packet, PacketType, VoteReply, VoteRequest,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A packet addressed to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: PublicKey,
    pub address: String,
    pub packet: Packet,
}

/// Result of presenting a leader announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// Sender is the leader for its term.
    Accepted,
    /// Sender is behind; tell it our term.
    Stale(Outbound),
    Rejected,
}

pub struct ElectionController {
    identity: Arc<NodeIdentity>,
    state: NodeState,
    proofs: ProofService,
    round: Option<VoteRound>,
    round_timeout_ms: u64,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
    next_election_at: u64,
    log_position: LogPosition,
    rng: StdRng,
}

impl ElectionController {
    pub fn new(identity: Arc<NodeIdentity>, config: &NodeConfig, now: u64) -> Self {
        let mut state = NodeState::new(identity.public_key(), config.address.clone());
        for peer in &config.peers {
            state.add_peer(peer.public_key, peer.address.clone());
        }
        let mut controller = ElectionController {
            identity,
            state,
            proofs: ProofService::new(config.proof_expiration_ms),
            round: None,
            round_timeout_ms: config.election_timeout_max_ms,
            election_timeout_min_ms: config.election_timeout_min_ms,
            election_timeout_max_ms: config.election_timeout_max_ms,
            next_election_at: 0,
            log_position: LogPosition::default(),
            rng: StdRng::from_entropy(),
        };
        controller.reset_election_timer(now);
        controller
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    pub fn proofs(&self) -> &ProofService {
        &self.proofs
    }

    pub fn round(&self) -> Option<&VoteRound> {
        self.round.as_ref()
    }

    /// Tip of the local log, advertised when campaigning and compared when voting.
    pub fn set_log_position(&mut self, position: LogPosition) {
        self.log_position = position;
    }

    /// Leader whose proof is still valid at `now`.
    pub fn is_active_leader(&self, now: u64) -> bool {
        self.state.is_leader() && !self.proofs.is_expired(self.state.proof_minted_at(), now)
    }

    /// Known leader, including this node, whose proof is valid at `now`.
    pub fn current_leader(&self, now: u64) -> Option<PublicKey> {
        if self.state.proof().is_none() || self.proofs.is_expired(self.state.proof_minted_at(), now)
        {
            return None;
        }
        self.state.leader()
    }

    fn reset_election_timer(&mut self, now: u64) {
        let timeout = self
            .rng
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        self.next_election_at = now + timeout;
    }

    fn packet<D: Serialize>(
        &self,
        packet_type: PacketType,
        data: &D,
        now: u64,
    ) -> Result<Packet, ConsensusError> {
        Ok(Packet::new(
            packet_type,
            self.state.role(),
            self.state.term(),
            self.state.public_key,
            self.state.proof().map(str::to_string),
            data,
            now,
        )?)
    }

    fn reply_to(&self, to: &PublicKey, packet: Packet) -> Option<Outbound> {
        let peer = self.state.peer(to)?;
        Some(Outbound {
            to: *to,
            address: peer.address.clone(),
            packet,
        })
    }

    fn broadcast(&self, packet: &Packet) -> Vec<Outbound> {
        self.state
            .peers()
            .map(|peer| Outbound {
                to: peer.public_key,
                address: peer.address.clone(),
                packet: packet.clone(),
            })
            .collect()
    }

    fn refusal(
        &self,
        to: &PublicKey,
        nonce: Option<String>,
        reason: &str,
        now: u64,
    ) -> Result<Vec<Outbound>, ConsensusError> {
        let packet = self.packet(
            PacketType::Error,
            &ErrorReply {
                nonce,
                reason: reason.to_string(),
            },
            now,
        )?;
        Ok(self.reply_to(to, packet).into_iter().collect())
    }

    fn step_down(&mut self, term: u64, now: u64) -> Result<(), ConsensusError> {
        self.round = None;
        self.state.set_state(Role::Follower, term, None, None, 0)?;
        self.reset_election_timer(now);
        Ok(())
    }

    /// Move to a higher term seen on the wire. Returns true if it was higher.
    pub fn observe_term(&mut self, term: u64, now: u64) -> Result<bool, ConsensusError> {
        if term <= self.state.term() {
            return Ok(false);
        }
        if self.round.as_ref().is_some_and(|round| round.term >= term) {
            // Peers that voted for our pending round already sit at its term
            return Ok(false);
        }
        debug!(local = self.state.term(), remote = term, "Election: observed higher term");
        self.step_down(term, now)?;
        Ok(true)
    }

    /// Heartbeat-loop entry point.
    ///
    /// An active leader gets its ACK broadcast back and renews its proof at
    /// half life. Everyone else times out rounds, and campaigns once the
    /// election timer has run out.
    pub fn tick(&mut self, now: u64, heartbeat: &HeartbeatData) -> Result<Vec<Outbound>, ConsensusError> {
        if self.state.is_leader() {
            if self.proofs.is_expired(self.state.proof_minted_at(), now) {
                info!(term = self.state.term(), "Election: proof expired, stepping down");
                let term = self.state.term();
                self.step_down(term, now)?;
                self.next_election_at = now;
                return self.promote(now);
            }

            if let Some(round) = &self.round {
                if round.is_timed_out(now, self.round_timeout_ms) {
                    warn!(term = round.term, "Election: proof renewal failed");
                    self.round = None;
                } else {
                    // Voters have moved to the renewal term; hold ACKs until it lands
                    return Ok(Vec::new());
                }
            }

            let half_life = self.proofs.expiration_ms() / 2;
            if self.round.is_none() && now >= self.state.proof_minted_at().saturating_add(half_life) {
                return self.start_round(now);
            }

            return self.heartbeat_packets(now, heartbeat);
        }

        if let Some(round) = &self.round {
            if round.is_timed_out(now, self.round_timeout_ms) {
                info!(term = round.term, votes = round.votes(), "Election: round timed out");
                let term = self.state.term();
                self.step_down(term, now)?;
            }
            return Ok(Vec::new());
        }

        self.promote(now)
    }

    /// Campaign if no valid leader has been heard from within the election timeout.
    pub fn promote(&mut self, now: u64) -> Result<Vec<Outbound>, ConsensusError> {
        if self.round.is_some() || self.is_active_leader(now) {
            return Ok(Vec::new());
        }
        let leader_expired = self.state.leader().is_some() && self.current_leader(now).is_none();
        if now < self.next_election_at && !leader_expired {
            return Ok(Vec::new());
        }
        self.start_round(now)
    }

    fn start_round(&mut self, now: u64) -> Result<Vec<Outbound>, ConsensusError> {
        // A timed-out round may have collected votes at its term; never reuse it
        let term = self.state.term().max(self.state.voted_term()) + 1;
        let keys = self.state.cluster_keys();
        let quorum = self.state.majority();

        let Some(mut round) = VoteRound::start(term, &keys, quorum, now, &mut self.rng) else {
            warn!(term, quorum, "Election: cannot split mint time for this cluster");
            return Ok(Vec::new());
        };
        self.round_timeout_ms = self
            .rng
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);

        if !self.state.is_leader() {
            self.state.set_state(Role::Candidate, term, None, None, 0)?;
        }
        self.state.record_vote(term, &round.nonce);
        if let Some(share) = round.share_for(&self.state.public_key).cloned() {
            let own = self.proofs.build_share(&self.identity, &round.nonce, term, share);
            round.fold(own);
        }

        info!(term, quorum, peers = self.state.peer_count(), "Election: requesting votes");

        let mut outbound = Vec::new();
        for peer in self.state.peers() {
            let Some(share) = round.share_for(&peer.public_key) else {
                continue;
            };
            let request = VoteRequest {
                nonce: round.nonce.clone(),
                root_for_term: round.root_for_term.clone(),
                share: share.clone(),
                last_log: self.log_position,
            };
            let packet = Packet::new(
                PacketType::Vote,
                self.state.role(),
                term,
                self.state.public_key,
                self.state.proof().map(str::to_string),
                &request,
                now,
            )?;
            outbound.push(Outbound {
                to: peer.public_key,
                address: peer.address.clone(),
                packet,
            });
        }

        self.round = Some(round);
        // A single-node cluster is its own quorum
        self.try_finish_round()?;
        Ok(outbound)
    }

    /// ACK packets for every peer. Empty unless this node leads with a valid proof.
    pub fn heartbeat_packets(
        &self,
        now: u64,
        heartbeat: &HeartbeatData,
    ) -> Result<Vec<Outbound>, ConsensusError> {
        if !self.is_active_leader(now) {
            return Ok(Vec::new());
        }
        let packet = self.packet(PacketType::Ack, heartbeat, now)?;
        Ok(self.broadcast(&packet))
    }

    /// Answer a VOTE with our signed share or a refusal carrying our proof.
    pub fn handle_vote(
        &mut self,
        packet: &Packet,
        request: VoteRequest,
        now: u64,
    ) -> Result<Vec<Outbound>, ConsensusError> {
        let candidate = packet.public_key;
        if self.state.peer(&candidate).is_none() {
            debug!(candidate = ?candidate, "Election: vote request from unknown key");
            return Ok(Vec::new());
        }

        if packet.term < self.state.term() {
            return self.refusal(&candidate, Some(request.nonce), "stale term", now);
        }
        if packet.term > self.state.term() && self.state.is_leader() {
            info!(term = packet.term, "Election: higher-term candidate, stepping down");
            self.step_down(packet.term, now)?;
        }
        if self.is_active_leader(now) {
            return self.refusal(&candidate, Some(request.nonce), "leader proof still valid", now);
        }

        let expected_root = root_for_term(packet.term, &self.state.cluster_keys());
        if request.root_for_term != expected_root {
            warn!(candidate = ?candidate, "Election: cluster root mismatch");
            return self.refusal(&candidate, Some(request.nonce), "root mismatch", now);
        }

        if request.last_log < self.log_position {
            debug!(candidate = ?candidate, "Election: candidate log is behind");
            return self.refusal(&candidate, Some(request.nonce), "log behind", now);
        }

        if !self.state.record_vote(packet.term, &request.nonce) {
            return self.refusal(&candidate, Some(request.nonce), "already voted", now);
        }

        if packet.term > self.state.term() {
            self.round = None;
            self.state.set_state(Role::Follower, packet.term, None, None, 0)?;
        }
        self.reset_election_timer(now);

        debug!(candidate = ?candidate, term = packet.term, "Election: granting vote");
        let fragment =
            self.proofs
                .build_share(&self.identity, &request.nonce, packet.term, request.share);
        let reply = self.packet(
            PacketType::Voted,
            &VoteReply {
                nonce: request.nonce,
                fragment,
            },
            now,
        )?;
        Ok(self.reply_to(&candidate, reply).into_iter().collect())
    }

    /// Fold a VOTED reply. Returns true when this reply completed the proof.
    pub fn handle_voted(
        &mut self,
        packet: &Packet,
        reply: VoteReply,
        now: u64,
    ) -> Result<bool, ConsensusError> {
        let Some(round) = self.round.as_mut() else {
            return Ok(false);
        };
        if round.nonce != reply.nonce || round.term != packet.term {
            debug!(term = packet.term, "Election: stale vote reply");
            return Ok(false);
        }
        if round.is_timed_out(now, self.round_timeout_ms) {
            debug!(term = round.term, "Election: vote reply after round timeout");
            return Ok(false);
        }
        if reply.fragment.public_key != packet.public_key
            || !self
                .proofs
                .verify_fragment(&reply.nonce, round.term, &reply.fragment)
        {
            warn!(voter = ?packet.public_key, "Election: invalid vote signature");
            return Ok(false);
        }
        if !round.fold(reply.fragment) {
            return Ok(false);
        }
        self.try_finish_round()
    }

    fn try_finish_round(&mut self) -> Result<bool, ConsensusError> {
        let Some(round) = self.round.as_ref() else {
            return Ok(false);
        };
        if !round.has_quorum() {
            return Ok(false);
        }

        let fragments = round.fragments();
        let Some(proof) = self.proofs.combine(
            round.quorum,
            &round.nonce,
            round.term,
            &fragments,
            round.minted_at,
        ) else {
            warn!(term = round.term, "Election: quorum reached but proof did not combine");
            return Ok(false);
        };

        let term = round.term;
        let minted_at = round.minted_at;
        let encoded = proof.encode()?;
        self.round = None;
        self.state.set_state(
            Role::Leader,
            term,
            Some(self.state.public_key),
            Some(encoded),
            minted_at,
        )?;
        info!(
            term,
            votes = fragments.len(),
            expires_at = self.proofs.expires_at(minted_at),
            "Election: leadership proof minted"
        );
        Ok(true)
    }

    /// Accept a leader announcement whose proof validates for its term.
    pub fn handle_ack(&mut self, packet: &Packet, now: u64) -> Result<AckOutcome, ConsensusError> {
        let sender = packet.public_key;
        if packet.term < self.state.term() {
            let reply = self.refusal(&sender, None, "stale leader", now)?;
            return Ok(match reply.into_iter().next() {
                Some(out) => AckOutcome::Stale(out),
                None => AckOutcome::Rejected,
            });
        }

        let Some(proof) = packet.proof.as_deref() else {
            return Ok(AckOutcome::Rejected);
        };
        let Some(minted_at) = self.validated_minted_at(packet.term, proof, Some(&sender), now) else {
            return Ok(AckOutcome::Rejected);
        };

        if packet.term == self.state.term() && self.state.is_leader() {
            warn!(other = ?sender, term = packet.term, "Election: competing leader for own term");
            return Ok(AckOutcome::Rejected);
        }

        let unchanged = self.state.term() == packet.term
            && self.state.leader() == Some(sender)
            && self.state.proof() == Some(proof);
        if !unchanged {
            info!(leader = ?sender, term = packet.term, "Election: following leader");
            self.round = None;
            self.state.set_state(
                Role::Follower,
                packet.term,
                Some(sender),
                Some(proof.to_string()),
                minted_at,
            )?;
        }
        self.reset_election_timer(now);
        Ok(AckOutcome::Accepted)
    }

    /// A refusal either carries a newer term or the proof of a sitting leader.
    pub fn handle_error(
        &mut self,
        packet: &Packet,
        reply: ErrorReply,
        now: u64,
    ) -> Result<(), ConsensusError> {
        debug!(from = ?packet.public_key, reason = %reply.reason, "Election: refusal");

        if let Some(proof) = packet.proof.as_deref() {
            if packet.term >= self.state.term() && packet.role == Role::Leader {
                if let Some(minted_at) =
                    self.validated_minted_at(packet.term, proof, Some(&packet.public_key), now)
                {
                    if !(packet.term == self.state.term() && self.state.is_leader()) {
                        info!(leader = ?packet.public_key, term = packet.term, "Election: standing down");
                        self.round = None;
                        self.state.set_state(
                            Role::Follower,
                            packet.term,
                            Some(packet.public_key),
                            Some(proof.to_string()),
                            minted_at,
                        )?;
                        self.reset_election_timer(now);
                    }
                    return Ok(());
                }
            }
        }

        self.observe_term(packet.term, now)?;
        Ok(())
    }

    /// Validate a leader proof for `term` and return its mint time if unexpired.
    pub fn validated_minted_at(
        &self,
        term: u64,
        proof: &str,
        leader: Option<&PublicKey>,
        now: u64,
    ) -> Option<u64> {
        let previous = match leader {
            Some(key) if self.state.leader() == Some(*key) && self.state.term() == term => {
                self.state.proof()
            }
            _ => None,
        };
        let keys = self.state.cluster_keys();
        if !self.proofs.validate(term, proof, previous, &keys) {
            debug!(term, "Election: proof rejected");
            return None;
        }
        let minted_at = if previous == Some(proof) {
            self.state.proof_minted_at()
        } else {
            Proof::decode(proof).ok()?.minted_at
        };
        if self.proofs.is_expired(minted_at, now) {
            debug!(term, "Election: proof expired");
            return None;
        }
        Some(minted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static INIT: std::sync::Once = std::sync::Once::new();

    fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    struct Cluster {
        nodes: Vec<ElectionController>,
    }

    impl Cluster {
        fn new(size: usize) -> Self {
            let identities: Vec<Arc<NodeIdentity>> =
                (0..size).map(|_| Arc::new(NodeIdentity::generate())).collect();
            let nodes = identities
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let mut config = NodeConfig::new((**id).clone(), format!("node-{}", i));
                    for (j, other) in identities.iter().enumerate() {
                        if i != j {
                            config = config.with_peer(other.public_key(), format!("node-{}", j));
                        }
                    }
                    ElectionController::new(id.clone(), &config, 0)
                })
                .collect();
            Cluster { nodes }
        }

        fn index_of(&self, address: &str) -> usize {
            self.nodes
                .iter()
                .position(|n| n.state().address == address)
                .unwrap()
        }

        /// Deliver packets (and their replies) until the network is quiet.
        fn deliver(&mut self, mut queue: Vec<Outbound>, now: u64) {
            while let Some(out) = queue.pop() {
                let target = self.index_of(&out.address);
                let node = &mut self.nodes[target];
                let packet = out.packet;
                match packet.packet_type {
                    PacketType::Vote => {
                        let request = packet.data_as().unwrap();
                        queue.extend(node.handle_vote(&packet, request, now).unwrap());
                    }
                    PacketType::Voted => {
                        let reply = packet.data_as().unwrap();
                        node.handle_voted(&packet, reply, now).unwrap();
                    }
                    PacketType::Error => {
                        let reply = packet.data_as().unwrap();
                        node.handle_error(&packet, reply, now).unwrap();
                    }
                    PacketType::Ack => {
                        if let AckOutcome::Stale(out) = node.handle_ack(&packet, now).unwrap() {
                            queue.push(out);
                        }
                    }
                    other => panic!("unexpected {}", other),
                }
            }
        }

        fn leaders(&self, now: u64) -> Vec<usize> {
            (0..self.nodes.len())
                .filter(|i| self.nodes[*i].is_active_leader(now))
                .collect()
        }
    }

    #[test]
    fn test_no_campaign_before_election_timeout() {
        init();
        let mut cluster = Cluster::new(3);
        let out = cluster.nodes[0].tick(100, &HeartbeatData::default()).unwrap();
        assert!(out.is_empty());
        assert_eq!(cluster.nodes[0].state().role(), Role::Follower);
    }

    #[test]
    fn test_single_candidate_wins_term_one() {
        init();
        let mut cluster = Cluster::new(3);
        let now = 1_500;

        let votes = cluster.nodes[0].tick(now, &HeartbeatData::default()).unwrap();
        assert_eq!(votes.len(), 2);
        assert_eq!(cluster.nodes[0].state().role(), Role::Candidate);
        assert_eq!(cluster.nodes[0].state().term(), 1);

        cluster.deliver(votes, now);
        assert_eq!(cluster.leaders(now), vec![0]);
        assert_eq!(cluster.nodes[0].state().term(), 1);

        let acks = cluster.nodes[0].tick(now + 10, &HeartbeatData::default()).unwrap();
        assert_eq!(acks.len(), 2);
        cluster.deliver(acks, now + 10);

        let leader_key = cluster.nodes[0].state().public_key;
        let proof = cluster.nodes[0].state().proof().unwrap().to_string();
        for follower in &cluster.nodes[1..] {
            assert_eq!(follower.state().role(), Role::Follower);
            assert_eq!(follower.state().leader(), Some(leader_key));
            assert_eq!(follower.state().proof(), Some(proof.as_str()));
            let keys = follower.state().cluster_keys();
            assert!(follower.proofs().validate(1, &proof, None, &keys));
        }
    }

    #[test]
    fn test_one_vote_per_term() {
        init();
        let mut cluster = Cluster::new(3);
        let now = 1_500;

        let first = cluster.nodes[0].tick(now, &HeartbeatData::default()).unwrap();
        let second = cluster.nodes[1].tick(now, &HeartbeatData::default()).unwrap();

        // Node 2 hears node 0 first; node 1 already voted for itself
        let to_two: Vec<Outbound> = first
            .iter()
            .chain(second.iter())
            .filter(|o| o.address == "node-2")
            .cloned()
            .collect();
        assert_eq!(to_two.len(), 2);
        let first_to_two = to_two[0].clone();
        let second_to_two = to_two[1].clone();

        let reply = cluster.nodes[2]
            .handle_vote(&first_to_two.packet, first_to_two.packet.data_as().unwrap(), now)
            .unwrap();
        assert_eq!(reply[0].packet.packet_type, PacketType::Voted);

        let refused = cluster.nodes[2]
            .handle_vote(&second_to_two.packet, second_to_two.packet.data_as().unwrap(), now)
            .unwrap();
        assert_eq!(refused[0].packet.packet_type, PacketType::Error);

        cluster.deliver(reply, now);
        cluster.deliver(
            first.into_iter().chain(second).filter(|o| o.address != "node-2").collect(),
            now,
        );
        let leaders = cluster.leaders(now);
        assert_eq!(leaders, vec![0]);
    }

    #[test]
    fn test_leader_steps_down_on_expiry() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500);
        assert!(cluster.nodes[0].is_active_leader(1_500));

        let expired = 1_500 + DEFAULT_EXPIRATION + 1;
        assert!(!cluster.nodes[0].is_active_leader(expired));
        let out = cluster.nodes[0].tick(expired, &HeartbeatData::default()).unwrap();
        // Immediately campaigns again at the next term
        assert_eq!(cluster.nodes[0].state().role(), Role::Candidate);
        assert_eq!(cluster.nodes[0].state().term(), 2);
        assert!(out.iter().all(|o| o.packet.packet_type == PacketType::Vote));
    }

    #[test]
    fn test_leader_renews_proof_at_half_life() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500);

        let renew_at = 1_500 + DEFAULT_EXPIRATION / 2;
        let out = cluster.nodes[0].tick(renew_at, &HeartbeatData::default()).unwrap();
        assert!(out.iter().all(|o| o.packet.packet_type == PacketType::Vote));
        assert!(cluster.nodes[0].state().is_leader());

        cluster.deliver(out, renew_at);
        assert_eq!(cluster.nodes[0].state().term(), 2);
        assert_eq!(cluster.nodes[0].state().proof_minted_at(), renew_at);
        assert!(cluster.nodes[0].is_active_leader(1_500 + DEFAULT_EXPIRATION + 1));
    }

    #[test]
    fn test_renewing_leader_keeps_role_at_round_term() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500);

        let renew_at = 1_500 + DEFAULT_EXPIRATION / 2;
        cluster.nodes[0].tick(renew_at, &HeartbeatData::default()).unwrap();
        assert!(!cluster.nodes[0].observe_term(2, renew_at).unwrap());
        assert!(cluster.nodes[0].state().is_leader());

        assert!(cluster.nodes[0].observe_term(3, renew_at).unwrap());
        assert_eq!(cluster.nodes[0].state().role(), Role::Follower);
    }

    fn only_to(out: Vec<Outbound>, address: &str) -> Vec<Outbound> {
        out.into_iter().filter(|o| o.address == address).collect()
    }

    #[test]
    fn test_renewal_retry_after_lost_vote_replies() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500);

        // Both voters grant term 2 but their replies never arrive
        let renew_at = 1_500 + DEFAULT_EXPIRATION / 2;
        let out = cluster.nodes[0].tick(renew_at, &HeartbeatData::default()).unwrap();
        for address in ["node-1", "node-2"] {
            let target = cluster.index_of(address);
            for vote in only_to(out.clone(), address) {
                let request = vote.packet.data_as().unwrap();
                let replies = cluster.nodes[target]
                    .handle_vote(&vote.packet, request, renew_at)
                    .unwrap();
                assert_eq!(replies[0].packet.packet_type, PacketType::Voted);
            }
        }

        let retry_at = renew_at + 1_201;
        let retry = cluster.nodes[0].tick(retry_at, &HeartbeatData::default()).unwrap();
        assert!(!retry.is_empty());
        assert!(retry.iter().all(|o| o.packet.packet_type == PacketType::Vote && o.packet.term == 3));

        cluster.deliver(only_to(retry, "node-1"), retry_at);
        assert_eq!(cluster.leaders(retry_at), vec![0]);
        assert_eq!(cluster.nodes[0].state().term(), 3);
        assert_eq!(cluster.nodes[0].state().proof_minted_at(), retry_at);
        assert!(cluster.nodes[0].is_active_leader(1_500 + DEFAULT_EXPIRATION + 1));
    }

    #[test]
    fn test_late_vote_reply_is_ignored() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();

        let mut replies = Vec::new();
        for vote in only_to(votes, "node-1") {
            let request = vote.packet.data_as().unwrap();
            replies.extend(cluster.nodes[1].handle_vote(&vote.packet, request, 1_500).unwrap());
        }
        assert_eq!(replies.len(), 1);

        let late = 1_500 + 1_201;
        let reply = replies.remove(0);
        let data = reply.packet.data_as().unwrap();
        assert!(!cluster.nodes[0].handle_voted(&reply.packet, data, late).unwrap());
        assert!(cluster.leaders(late).is_empty());
        assert_eq!(cluster.nodes[0].state().role(), Role::Candidate);
    }

    #[test]
    fn test_candidate_timeout_keeps_term() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        drop(votes);

        let later = 1_500 + 1_200;
        cluster.nodes[0].tick(later, &HeartbeatData::default()).unwrap();
        assert_eq!(cluster.nodes[0].state().role(), Role::Follower);
        assert_eq!(cluster.nodes[0].state().term(), 1);
        assert!(cluster.nodes[0].round().is_none());
    }

    #[test]
    fn test_stale_leader_learns_higher_term() {
        init();
        let mut cluster = Cluster::new(3);
        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500);

        // Node 1 is far ahead after a partition
        cluster.nodes[1].observe_term(9, 1_500).unwrap();
        let acks = cluster.nodes[0].tick(1_600, &HeartbeatData::default()).unwrap();
        cluster.deliver(acks, 1_600);

        assert_eq!(cluster.nodes[0].state().role(), Role::Follower);
        assert_eq!(cluster.nodes[0].state().term(), 9);
    }

    #[test]
    fn test_vote_refused_for_shorter_log() {
        init();
        let mut cluster = Cluster::new(3);
        let ahead = LogPosition {
            last_term: 1,
            last_index: 4,
        };
        cluster.nodes[1].set_log_position(ahead);
        cluster.nodes[2].set_log_position(ahead);

        let votes = cluster.nodes[0].tick(1_500, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500);
        assert!(cluster.leaders(1_500).is_empty());

        cluster.nodes[0].set_log_position(ahead);
        cluster.nodes[0].tick(1_500 + 1_200, &HeartbeatData::default()).unwrap();
        let votes = cluster.nodes[0].tick(1_500 + 2_400, &HeartbeatData::default()).unwrap();
        cluster.deliver(votes, 1_500 + 2_400);
        assert_eq!(cluster.leaders(1_500 + 2_400), vec![0]);
    }

    #[test]
    fn test_forged_ack_is_rejected() {
        init();
        let mut cluster = Cluster::new(3);
        let intruder = NodeIdentity::generate();
        let packet = Packet::new(
            PacketType::Ack,
            Role::Leader,
            1,
            intruder.public_key(),
            Some("01".to_string()),
            &HeartbeatData::default(),
            0,
        )
        .unwrap();
        assert_eq!(
            cluster.nodes[1].handle_ack(&packet, 100).unwrap(),
            AckOutcome::Rejected
        );
        assert_eq!(cluster.nodes[1].state().term(), 0);
    }

    #[test]
    fn test_term_never_decreases() {
        init();
        let mut cluster = Cluster::new(3);
        let mut last_terms = vec![0u64; 3];
        let mut now = 0;
        for step in 0..200 {
            now += 97;
            let i = step % 3;
            let out = cluster.nodes[i].tick(now, &HeartbeatData::default()).unwrap();
            cluster.deliver(out, now);
            for (j, node) in cluster.nodes.iter().enumerate() {
                assert!(node.state().term() >= last_terms[j]);
                last_terms[j] = node.state().term();
                if node.state().is_leader() {
                    assert!(node.state().proof().is_some());
                }
            }
            assert!(cluster.leaders(now).len() <= 1);
        }
    }

    const DEFAULT_EXPIRATION: u64 = crate::config::DEFAULT_PROOF_EXPIRATION_MS;
}
