//! Wire packets exchanged between replicas
//!
//! Every packet is a JSON record carrying the sender's role, term, public key
//! and current proof, plus a type-specific `data` payload.

use crate::consensus::proof::ProofFragment;
use crate::consensus::shamir::Share;
use crate::consensus::state::Role;
use crate::crypto::PublicKey;
use crate::ledger::LogEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum PacketType {
    Ack = 10,
    Vote = 11,
    Voted = 12,
    Error = 13,
    Append = 14,
    ReAppend = 15,
    AppendFail = 17,
    AppendAck = 18,
    GossipRequest = 20,
    GossipFirstResponse = 21,
    GossipSecondResponse = 22,
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, <PacketType as TryFrom<u8>>::Error> {
        Ok(match value {
            10 => PacketType::Ack,
            11 => PacketType::Vote,
            12 => PacketType::Voted,
            13 => PacketType::Error,
            14 => PacketType::Append,
            15 => PacketType::ReAppend,
            17 => PacketType::AppendFail,
            18 => PacketType::AppendAck,
            20 => PacketType::GossipRequest,
            21 => PacketType::GossipFirstResponse,
            22 => PacketType::GossipSecondResponse,
            other => return Err(format!("unknown packet type {}", other)),
        })
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Ack => "ACK",
            PacketType::Vote => "VOTE",
            PacketType::Voted => "VOTED",
            PacketType::Error => "ERROR",
            PacketType::Append => "APPEND",
            PacketType::ReAppend => "RE_APPEND",
            PacketType::AppendFail => "APPEND_FAIL",
            PacketType::AppendAck => "APPEND_ACK",
            PacketType::GossipRequest => "GOSSIP_REQUEST",
            PacketType::GossipFirstResponse => "GOSSIP_FIRST_RESPONSE",
            PacketType::GossipSecondResponse => "GOSSIP_SECOND_RESPONSE",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected payload for {packet_type}: {source}")]
    Payload {
        packet_type: PacketType,
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    pub role: Role,
    pub term: u64,
    pub public_key: PublicKey,
    pub proof: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
}

impl Packet {
    pub fn new<D: Serialize>(
        packet_type: PacketType,
        role: Role,
        term: u64,
        public_key: PublicKey,
        proof: Option<String>,
        data: &D,
        timestamp: u64,
    ) -> Result<Self, PacketError> {
        Ok(Packet {
            packet_type,
            role,
            term,
            public_key,
            proof,
            data: serde_json::to_value(data)?,
            timestamp,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        serde_json::from_value(self.data.clone()).map_err(|source| PacketError::Payload {
            packet_type: self.packet_type,
            source,
        })
    }
}

/// VOTE: a candidate hands each peer the share issued to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub nonce: String,
    pub root_for_term: String,
    pub share: Share,
    #[serde(default)]
    pub last_log: LogPosition,
}

/// Tip of a node's log, compared `(last_term, last_index)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
    pub last_term: u64,
    pub last_index: u64,
}

/// VOTED: the voter's signature over its share.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteReply {
    pub nonce: String,
    pub fragment: ProofFragment,
}

/// ERROR: refusal; the packet's `proof` and `term` tell the candidate why.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub nonce: Option<String>,
    pub reason: String,
}

/// ACK: leader announcement with the replication watermark.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub commit_index: u64,
    pub last_index: u64,
    /// Hash of the leader's entry at `commit_index`.
    #[serde(default)]
    pub commit_hash: String,
}

/// APPEND and RE_APPEND.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

/// APPEND_FAIL: the follower's chain ends at `last_index`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppendFailure {
    pub last_index: u64,
}

/// APPEND_ACK: everything up to `index` is stored on the follower.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppendAcknowledgement {
    pub index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeIdentity;
    use crate::gossip::GossipRequest;
    use std::collections::BTreeMap;

    #[test]
    fn test_packet_type_codes() {
        assert_eq!(u8::from(PacketType::AppendFail), 17);
        assert_eq!(PacketType::try_from(22), Ok(PacketType::GossipSecondResponse));
        assert!(PacketType::try_from(16).is_err());
    }

    #[test]
    fn test_wire_field_names() {
        let key = NodeIdentity::generate().public_key();
        let packet = Packet::new(
            PacketType::Ack,
            Role::Leader,
            4,
            key,
            Some("abcd".into()),
            &HeartbeatData {
                commit_index: 2,
                last_index: 3,
                ..Default::default()
            },
            99,
        )
        .unwrap();

        let value: Value = serde_json::from_slice(&packet.encode().unwrap()).unwrap();
        assert_eq!(value["type"], 10);
        assert_eq!(value["role"], 2);
        assert_eq!(value["publicKey"], key.to_hex());
        assert_eq!(value["data"]["commitIndex"], 2);

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(
            decoded.data_as::<HeartbeatData>().unwrap(),
            HeartbeatData {
                commit_index: 2,
                last_index: 3,
                commit_hash: String::new(),
            }
        );
    }

    #[test]
    fn test_gossip_digest_keys_are_hex() {
        let key = NodeIdentity::generate().public_key();
        let mut digest = BTreeMap::new();
        digest.insert(key, 7u64);
        let packet = Packet::new(
            PacketType::GossipRequest,
            Role::Follower,
            0,
            key,
            None,
            &GossipRequest { digest },
            0,
        )
        .unwrap();
        let request: GossipRequest = Packet::decode(&packet.encode().unwrap())
            .unwrap()
            .data_as()
            .unwrap();
        assert_eq!(request.digest.get(&key), Some(&7));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Packet::decode(b"not json").is_err());
        assert!(Packet::decode(br#"{"type":99,"role":0,"term":0}"#).is_err());

        let key = NodeIdentity::generate().public_key();
        let packet =
            Packet::new(PacketType::AppendAck, Role::Follower, 1, key, None, &"oops", 0).unwrap();
        assert!(matches!(
            packet.data_as::<AppendAcknowledgement>(),
            Err(PacketError::Payload { .. })
        ));
    }
}
