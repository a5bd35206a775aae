//! Replica runtime
//!
//! `Node` composes the election controller, the gossip engine and the log
//! store over a transport and a storage adapter. `connect` starts three
//! tasks: the inbound packet loop, the heartbeat/election loop and the
//! gossip loop. `disconnect` cancels them, waits for them to finish (any
//! in-flight send is bounded by the send timeout) and closes the storage.
//!
//! Replication: commands enter through `push`, travel between replicas as
//! signed gossip attributes, and are parked as pending entries. The leader
//! drains pending entries into its chain each tick and ships them with
//! APPEND; followers answer APPEND_ACK or APPEND_FAIL, and the leader commits
//! whatever a majority has stored.

use crate::clock::now_ms;
use crate::config::{ConfigError, NodeConfig};
use crate::consensus::election::{AckOutcome, ElectionController, Outbound};
use crate::consensus::state::{PeerInfo, Role, StateChange};
use crate::consensus::ConsensusError;
use crate::crypto::{NodeIdentity, PublicKey};
use crate::gossip::{Delta, GossipEngine, GossipFirstResponse, GossipRequest, GossipSecondResponse};
use crate::ledger::{AppendOutcome, Applier, ApplyError, LogError, LogStore, PendingEntry};
use crate::network::packet::{
    AppendAcknowledgement, AppendFailure, AppendRequest, ErrorReply, HeartbeatData, LogPosition,
    Packet, PacketType, VoteReply, VoteRequest,
};
use crate::network::{PacketError, Transport, TransportError};
use crate::storage::{Storage, StorageError};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const INBOUND_QUEUE: usize = 1024;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("state error: {0}")]
    Apply(#[from] ApplyError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("node already connected")]
    AlreadyConnected,

    #[error("gossip rejected command")]
    Rejected,
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Snapshot served by `/info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub public_key: PublicKey,
    pub address: String,
    pub role: Role,
    pub term: u64,
    pub leader: Option<PublicKey>,
    pub last_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub pending: usize,
    pub peers: Vec<PeerInfo>,
}

/// Leader-side bookkeeping per follower, reset on every term change.
#[derive(Debug, Default)]
struct Replication {
    term: u64,
    next_index: HashMap<PublicKey, u64>,
    match_index: HashMap<PublicKey, u64>,
}

impl Replication {
    fn reset_if_new_term(&mut self, term: u64, last_index: u64, peers: &[PublicKey]) {
        if self.term == term && !self.next_index.is_empty() {
            return;
        }
        self.term = term;
        self.match_index.clear();
        self.next_index = peers.iter().map(|p| (*p, last_index + 1)).collect();
    }

    /// Highest index stored on a majority, counting the leader's own tip.
    fn majority_index(&self, leader_last: u64, peers: &[PublicKey], quorum: usize) -> u64 {
        let mut indexes: Vec<u64> = peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        indexes.push(leader_last);
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes
            .get(quorum.saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }
}

pub struct Node<T: Transport, S: Storage> {
    config: NodeConfig,
    identity: Arc<NodeIdentity>,
    transport: Arc<T>,
    storage: Arc<S>,
    election: Mutex<ElectionController>,
    gossip: Mutex<GossipEngine>,
    log: LogStore,
    applier: Arc<dyn Applier>,
    replication: Mutex<Replication>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport, S: Storage> Node<T, S> {
    pub fn new(
        config: NodeConfig,
        transport: T,
        storage: S,
        applier: Arc<dyn Applier>,
    ) -> NodeResult<Arc<Self>> {
        config.validate()?;
        let identity = Arc::new(config.identity.clone());
        let storage = Arc::new(storage);
        let dyn_storage: Arc<dyn Storage> = storage.clone();

        let election = ElectionController::new(identity.clone(), &config, now_ms());
        let mut gossip = GossipEngine::new(identity.clone());
        for peer in &config.peers {
            gossip.add_peer(peer.public_key);
        }

        Ok(Arc::new(Node {
            identity,
            transport: Arc::new(transport),
            storage,
            election: Mutex::new(election),
            gossip: Mutex::new(gossip),
            log: LogStore::new(dyn_storage),
            applier,
            replication: Mutex::new(Replication::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        }))
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn role(&self) -> Role {
        self.election.lock().state().role()
    }

    pub fn term(&self) -> u64 {
        self.election.lock().state().term()
    }

    pub fn leader(&self) -> Option<PublicKey> {
        self.election.lock().current_leader(now_ms())
    }

    pub fn proof(&self) -> Option<String> {
        self.election.lock().state().proof().map(str::to_string)
    }

    pub fn is_leader(&self) -> bool {
        self.election.lock().is_active_leader(now_ms())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.election.lock().state().subscribe()
    }

    /// Validate `proof` for `term` against this node's view of the cluster.
    pub fn validate_proof(&self, term: u64, proof: &str) -> bool {
        let election = self.election.lock();
        let keys = election.state().cluster_keys();
        election.proofs().validate(term, proof, None, &keys)
    }

    pub fn gossip_version(&self, peer: &PublicKey) -> Option<u64> {
        self.gossip.lock().max_version_seen(peer)
    }

    /// Start the inbound, heartbeat and gossip loops.
    pub fn connect(self: &Arc<Self>) -> NodeResult<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return Err(NodeError::AlreadyConnected);
        }

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.transport.listen(tx);

        tasks.push(tokio::spawn(self.clone().inbound_loop(rx)));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));
        tasks.push(tokio::spawn(self.clone().gossip_loop()));

        info!(
            public_key = %self.public_key(),
            address = %self.config.address,
            peers = self.config.peers.len(),
            "Node connected"
        );
        Ok(())
    }

    /// Stop every loop, wait for them and close the storage adapter.
    pub async fn disconnect(&self) -> NodeResult<()> {
        self.cancel.cancel();
        self.transport.unlisten();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Node task panicked");
            }
        }

        self.log.close()?;
        info!(public_key = %self.public_key(), "Node disconnected");
        Ok(())
    }

    async fn inbound_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                bytes = rx.recv() => {
                    let Some(bytes) = bytes else { break };
                    if let Err(e) = self.on_data(&bytes).await {
                        warn!(error = %e, "Failed to handle packet");
                    }
                }
            }
        }
        debug!("Inbound loop stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let heartbeat = self.config.heartbeat_ms;
        loop {
            let delay = match self.heartbeat_tick().await {
                Ok(true) => heartbeat,
                Ok(false) => heartbeat * 6 / 5 + rand::thread_rng().gen_range(0..=heartbeat / 2),
                Err(e) => {
                    error!(error = %e, "Heartbeat tick failed");
                    heartbeat
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        debug!("Heartbeat loop stopped");
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_heartbeat());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.gossip_tick().await {
                        warn!(error = %e, "Gossip round failed");
                    }
                }
            }
        }
        debug!("Gossip loop stopped");
    }

    fn log_position(&self) -> NodeResult<LogPosition> {
        let last = self.log.get_last_entry()?;
        Ok(LogPosition {
            last_term: last.as_ref().map(|e| e.term).unwrap_or(0),
            last_index: last.map(|e| e.index).unwrap_or(0),
        })
    }

    fn heartbeat_data(&self) -> NodeResult<HeartbeatData> {
        let commit_index = self.log.commit_index()?;
        let commit_hash = self
            .log
            .get_entry(commit_index)?
            .map(|e| e.hash)
            .unwrap_or_default();
        Ok(HeartbeatData {
            commit_index,
            last_index: self.log.last_index()?,
            commit_hash,
        })
    }

    /// One heartbeat/election step. Returns true while leading with a settled proof.
    async fn heartbeat_tick(&self) -> NodeResult<bool> {
        let now = now_ms();
        let data = self.heartbeat_data()?;
        let position = self.log_position()?;
        let (outbound, leading) = {
            let mut election = self.election.lock();
            election.set_log_position(position);
            let outbound = election.tick(now, &data)?;
            // No APPENDs while a proof renewal is collecting votes
            (
                outbound,
                election.is_active_leader(now) && election.round().is_none(),
            )
        };
        self.send_all(outbound).await;

        if leading {
            self.replicate(now).await?;
        }
        Ok(leading)
    }

    async fn gossip_tick(&self) -> NodeResult<()> {
        let now = now_ms();
        let (changes, packet) = {
            let mut gossip = self.gossip.lock();
            gossip.beat_heart();
            let changes = gossip.check_liveness(now);
            (changes, gossip.request())
        };

        let target = {
            let mut election = self.election.lock();
            for change in &changes {
                election
                    .state_mut()
                    .set_peer_alive(&change.peer, change.alive);
            }
            let peers: Vec<(PublicKey, String)> = election
                .state()
                .peers()
                .map(|p| (p.public_key, p.address.clone()))
                .collect();
            let mut rng = rand::thread_rng();
            let choice = GossipEngine::choose_peer(&peers, &mut rng).cloned();
            choice
        };

        let Some((to, address)) = target else {
            return Ok(());
        };
        let request = self.packet(PacketType::GossipRequest, &packet, now)?;
        let bytes = request.encode()?;
        match tokio::time::timeout(self.config.gossip_timeout(), self.transport.send(&address, bytes))
            .await
        {
            Ok(Ok(())) => trace!(peer = ?to, "Gossip: request sent"),
            Ok(Err(e)) => debug!(peer = ?to, error = %e, "Gossip: request failed"),
            Err(_) => debug!(peer = ?to, "Gossip: request timed out"),
        }
        Ok(())
    }

    fn packet<D: Serialize>(&self, packet_type: PacketType, data: &D, now: u64) -> NodeResult<Packet> {
        let election = self.election.lock();
        let state = election.state();
        Ok(Packet::new(
            packet_type,
            state.role(),
            state.term(),
            state.public_key,
            state.proof().map(str::to_string),
            data,
            now,
        )?)
    }

    fn address_of(&self, peer: &PublicKey) -> Option<String> {
        self.election
            .lock()
            .state()
            .peer(peer)
            .map(|p| p.address.clone())
    }

    async fn reply<D: Serialize>(
        &self,
        to: &PublicKey,
        packet_type: PacketType,
        data: &D,
    ) -> NodeResult<()> {
        let Some(address) = self.address_of(to) else {
            return Ok(());
        };
        let packet = self.packet(packet_type, data, now_ms())?;
        self.send_all(vec![Outbound {
            to: *to,
            address,
            packet,
        }])
        .await;
        Ok(())
    }

    /// Deliver concurrently; each send is bounded by the send timeout.
    async fn send_all(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let timeout = self.config.send_timeout();
        let mut sends = JoinSet::new();
        for out in outbound {
            let bytes = match out.packet.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "Failed to encode packet");
                    continue;
                }
            };
            let transport = self.transport.clone();
            let packet_type = out.packet.packet_type;
            sends.spawn(async move {
                match tokio::time::timeout(timeout, transport.send(&out.address, bytes)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(to = %out.address, packet = %packet_type, error = %e, "Send failed")
                    }
                    Err(_) => debug!(to = %out.address, packet = %packet_type, "Send timed out"),
                }
            });
        }
        while sends.join_next().await.is_some() {}
    }

    /// Route one inbound packet.
    pub async fn on_data(&self, bytes: &[u8]) -> NodeResult<()> {
        let packet = Packet::decode(bytes)?;
        let known = {
            let election = self.election.lock();
            election.state().peer(&packet.public_key).is_some()
        };
        if !known {
            debug!(from = ?packet.public_key, "Dropping packet from unknown key");
            return Ok(());
        }
        trace!(from = ?packet.public_key, packet = %packet.packet_type, term = packet.term, "Received");

        let now = now_ms();
        match packet.packet_type {
            PacketType::Vote => {
                let request: VoteRequest = packet.data_as()?;
                let position = self.log_position()?;
                let outbound = {
                    let mut election = self.election.lock();
                    election.set_log_position(position);
                    election.handle_vote(&packet, request, now)?
                };
                self.send_all(outbound).await;
            }
            PacketType::Voted => {
                let reply: VoteReply = packet.data_as()?;
                let elected = self.election.lock().handle_voted(&packet, reply, now)?;
                if elected {
                    self.announce(now).await?;
                }
            }
            PacketType::Error => {
                let reply: ErrorReply = packet.data_as()?;
                self.election.lock().handle_error(&packet, reply, now)?;
            }
            PacketType::Ack => {
                let data: HeartbeatData = packet.data_as()?;
                if self.accept_leader(&packet, now).await? {
                    self.on_leader_heartbeat(&packet.public_key, data).await?;
                }
            }
            PacketType::Append | PacketType::ReAppend => {
                let request: AppendRequest = packet.data_as()?;
                if self.accept_leader(&packet, now).await? {
                    self.on_append(&packet.public_key, request).await?;
                }
            }
            PacketType::AppendFail => {
                let failure: AppendFailure = packet.data_as()?;
                self.on_append_fail(&packet.public_key, failure).await?;
            }
            PacketType::AppendAck => {
                let ack: AppendAcknowledgement = packet.data_as()?;
                self.on_append_ack(&packet.public_key, ack).await?;
            }
            PacketType::GossipRequest => {
                let request: GossipRequest = packet.data_as()?;
                let response = self.gossip.lock().handle_request(&request);
                self.reply(&packet.public_key, PacketType::GossipFirstResponse, &response)
                    .await?;
            }
            PacketType::GossipFirstResponse => {
                let response: GossipFirstResponse = packet.data_as()?;
                let (second, applied) = self.gossip.lock().handle_first_response(response, now);
                self.reply(&packet.public_key, PacketType::GossipSecondResponse, &second)
                    .await?;
                self.ingest(applied)?;
            }
            PacketType::GossipSecondResponse => {
                let response: GossipSecondResponse = packet.data_as()?;
                let applied = self.gossip.lock().handle_second_response(response, now);
                self.ingest(applied)?;
            }
        }
        Ok(())
    }

    /// Run the leader check shared by ACK and APPEND packets.
    async fn accept_leader(&self, packet: &Packet, now: u64) -> NodeResult<bool> {
        let outcome = self.election.lock().handle_ack(packet, now)?;
        match outcome {
            AckOutcome::Accepted => Ok(true),
            AckOutcome::Stale(out) => {
                self.send_all(vec![out]).await;
                Ok(false)
            }
            AckOutcome::Rejected => Ok(false),
        }
    }

    /// Broadcast ACKs right after winning an election.
    async fn announce(&self, now: u64) -> NodeResult<()> {
        let data = self.heartbeat_data()?;
        let outbound = self.election.lock().heartbeat_packets(now, &data)?;
        self.send_all(outbound).await;
        self.replicate(now).await
    }

    /// Turn freshly gossiped commands into pending entries.
    fn ingest(&self, applied: Vec<Delta>) -> NodeResult<()> {
        for delta in applied {
            if delta.is_heartbeat() {
                continue;
            }
            if !PendingEntry::is_command_id(&delta.key) {
                debug!(peer = ?delta.peer, key = %delta.key, "Gossip attribute is not a command");
                continue;
            }
            let pending = PendingEntry {
                command_id: delta.key,
                version: delta.version,
                origin: delta.peer,
                payload: delta.value,
            };
            if self.log.put_pending(&pending)? {
                trace!(command = %pending.command_id, "Pending entry stored");
            }
        }
        Ok(())
    }

    /// Submit a command for replication. Returns its command id.
    pub fn push(&self, command: Value) -> NodeResult<String> {
        let origin = self.public_key();
        let (command_id, version) = {
            let mut gossip = self.gossip.lock();
            let version = gossip.max_version_seen(&origin).unwrap_or(0) + 1;
            let command_id = PendingEntry::command_id(&origin, version, &command);
            let delta = gossip
                .push(&command_id, command.clone())
                .ok_or(NodeError::Rejected)?;
            (command_id, delta.version)
        };

        self.log.put_pending(&PendingEntry {
            command_id: command_id.clone(),
            version,
            origin,
            payload: command,
        })?;
        debug!(command = %command_id, version, "Command pushed");
        Ok(command_id)
    }

    pub fn get_state(&self, key: &str) -> NodeResult<Option<Value>> {
        Ok(self.log.state().get(key)?)
    }

    pub fn info(&self) -> NodeResult<NodeInfo> {
        let now = now_ms();
        let (role, term, leader, peers) = {
            let election = self.election.lock();
            let state = election.state();
            (
                state.role(),
                state.term(),
                election.current_leader(now),
                state.peers().cloned().collect(),
            )
        };
        Ok(NodeInfo {
            public_key: self.public_key(),
            address: self.config.address.clone(),
            role,
            term,
            leader,
            last_index: self.log.last_index()?,
            commit_index: self.log.commit_index()?,
            applied_index: self.log.applied_index()?,
            pending: self.log.pending_entries()?.len(),
            peers,
        })
    }

    fn peer_keys(&self) -> (Vec<PublicKey>, usize, u64) {
        let election = self.election.lock();
        let state = election.state();
        (
            state.peers().map(|p| p.public_key).collect(),
            state.majority(),
            state.term(),
        )
    }

    /// Leader: chain pending commands, ship new entries, advance the commit.
    async fn replicate(&self, now: u64) -> NodeResult<()> {
        let (peers, quorum, term) = self.peer_keys();
        if !self.election.lock().is_active_leader(now) {
            return Ok(());
        }
        let tip = self.log.last_index()?;
        self.replication.lock().reset_if_new_term(term, tip, &peers);

        for pending in self.log.pending_entries()? {
            let entry = self.log.append(
                term,
                pending.payload,
                pending.command_id.clone(),
                &self.identity,
                now,
            )?;
            self.gossip.lock().forget(&pending.command_id);
            debug!(index = entry.index, command = %entry.command_id, "Leader appended entry");
        }

        let last_index = self.log.last_index()?;
        let commit_index = self.advance_commit(last_index, &peers, quorum).await?;

        let batch = self.config.replication_batch;
        let mut outbound = Vec::new();
        for peer in &peers {
            let next = self
                .replication
                .lock()
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(last_index + 1);
            if next > last_index {
                continue;
            }
            let entries = self.log.entries_after(next - 1, batch)?;
            let Some(sent_to) = entries.last().map(|e| e.index) else {
                continue;
            };
            let Some(address) = self.address_of(peer) else {
                continue;
            };
            let packet = self.packet(
                PacketType::Append,
                &AppendRequest {
                    entries,
                    commit_index,
                },
                now,
            )?;
            self.replication.lock().next_index.insert(*peer, sent_to + 1);
            outbound.push(Outbound {
                to: *peer,
                address,
                packet,
            });
        }
        self.send_all(outbound).await;
        Ok(())
    }

    async fn advance_commit(
        &self,
        last_index: u64,
        peers: &[PublicKey],
        quorum: usize,
    ) -> NodeResult<u64> {
        let target = {
            let replication = self.replication.lock();
            replication.majority_index(last_index, peers, quorum)
        };
        let current = self.log.commit_index()?;
        if target <= current {
            return Ok(current);
        }
        // Entries from earlier leaderships commit only beneath one of our own
        let tenure = self.election.lock().state().leader_since();
        let Some(entry) = self.log.get_entry(target)? else {
            return Ok(current);
        };
        if entry.term < tenure {
            debug!(index = target, entry_term = entry.term, tenure, "Commit waits for an entry from this leadership");
            return Ok(current);
        }
        let applied = self.log.apply_committed(target, self.applier.as_ref()).await?;
        info!(commit_index = target, applied, "Leader advanced commit index");
        Ok(target)
    }

    /// Follower: compare the leader's watermark with the local chain.
    async fn on_leader_heartbeat(&self, leader: &PublicKey, data: HeartbeatData) -> NodeResult<()> {
        let local_last = self.log.last_index()?;
        let local_commit = self.log.commit_index()?;

        if data.commit_index > local_commit {
            match self.log.get_entry(data.commit_index)? {
                Some(entry) if entry.hash == data.commit_hash => {
                    self.log
                        .apply_committed(data.commit_index, self.applier.as_ref())
                        .await?;
                }
                _ => {
                    return self
                        .reply(
                            leader,
                            PacketType::AppendFail,
                            &AppendFailure {
                                last_index: local_commit.min(local_last),
                            },
                        )
                        .await;
                }
            }
        }

        if local_last < data.last_index {
            self.reply(
                leader,
                PacketType::AppendFail,
                &AppendFailure {
                    last_index: local_last,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Follower: store entries that extend the chain, then acknowledge.
    async fn on_append(&self, leader: &PublicKey, request: AppendRequest) -> NodeResult<()> {
        let mut matched = None;
        for entry in request.entries {
            let index = entry.index;
            let command_id = entry.command_id.clone();
            match self.log.append_replicated(entry) {
                Ok(AppendOutcome::Appended(i)) | Ok(AppendOutcome::Duplicate(i)) => {
                    self.gossip.lock().forget(&command_id);
                    matched = Some(i);
                }
                Ok(AppendOutcome::Gap { last_index }) => {
                    debug!(index, last_index, "Append gap");
                    return self
                        .reply(leader, PacketType::AppendFail, &AppendFailure { last_index })
                        .await;
                }
                Err(LogError::CommittedConflict { index }) => {
                    error!(index, "Leader entry conflicts with committed chain");
                    let last_index = self.log.commit_index()?;
                    return self
                        .reply(leader, PacketType::AppendFail, &AppendFailure { last_index })
                        .await;
                }
                Err(LogError::InvalidSignature { index }) => {
                    warn!(index, "Dropping append with invalid signature");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(matched) = matched else {
            return Ok(());
        };
        let commit = request.commit_index.min(matched);
        if commit > self.log.commit_index()? {
            self.log.apply_committed(commit, self.applier.as_ref()).await?;
        }
        self.reply(
            leader,
            PacketType::AppendAck,
            &AppendAcknowledgement { index: matched },
        )
        .await
    }

    /// Leader: resend from where the follower's chain ends.
    async fn on_append_fail(&self, peer: &PublicKey, failure: AppendFailure) -> NodeResult<()> {
        let now = now_ms();
        let (term, leading) = {
            let election = self.election.lock();
            (election.state().term(), election.is_active_leader(now))
        };
        if !leading {
            return Ok(());
        }

        let last_index = self.log.last_index()?;
        let from = failure.last_index.min(last_index);
        let entries = self.log.entries_after(from, self.config.replication_batch)?;
        {
            let mut replication = self.replication.lock();
            if replication.term != term {
                return Ok(());
            }
            replication.match_index.entry(*peer).and_modify(|m| *m = (*m).min(from));
            let next = entries.last().map(|e| e.index + 1).unwrap_or(from + 1);
            replication.next_index.insert(*peer, next);
        }
        if entries.is_empty() {
            return Ok(());
        }

        debug!(peer = ?peer, from, count = entries.len(), "Re-appending");
        let commit_index = self.log.commit_index()?;
        self.reply(
            peer,
            PacketType::ReAppend,
            &AppendRequest {
                entries,
                commit_index,
            },
        )
        .await
    }

    /// Leader: record the follower's progress and try to commit.
    async fn on_append_ack(&self, peer: &PublicKey, ack: AppendAcknowledgement) -> NodeResult<()> {
        let now = now_ms();
        let (peers, quorum, term) = self.peer_keys();
        if !self.election.lock().is_active_leader(now) {
            return Ok(());
        }
        {
            let mut replication = self.replication.lock();
            if replication.term != term {
                return Ok(());
            }
            let matched = replication.match_index.entry(*peer).or_insert(0);
            *matched = (*matched).max(ack.index);
            let next = replication.next_index.entry(*peer).or_insert(0);
            *next = (*next).max(ack.index + 1);
        }
        let last_index = self.log.last_index()?;
        self.advance_commit(last_index, &peers, quorum).await?;
        Ok(())
    }
}
