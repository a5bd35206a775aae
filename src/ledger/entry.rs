use crate::crypto::{sha256, sha256_hex, NodeIdentity, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Previous-hash value for index 1.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub index: u64,
    pub hash: String,
    pub term: u64,
    pub created_at: u64,
    pub signer: PublicKey,
    pub signature: String,
    pub command_id: String,
    pub payload: Value,
}

impl LogEntry {
    pub fn compute_hash(previous_hash: &str, index: u64, term: u64, payload: &Value) -> String {
        let payload_json = payload.to_string();
        sha256_hex(&[
            previous_hash.as_bytes(),
            &index.to_be_bytes(),
            &term.to_be_bytes(),
            payload_json.as_bytes(),
        ])
    }

    /// Build and sign the entry that follows `previous_hash`.
    pub fn new(
        previous_hash: &str,
        index: u64,
        term: u64,
        created_at: u64,
        command_id: String,
        payload: Value,
        identity: &NodeIdentity,
    ) -> Self {
        let hash = Self::compute_hash(previous_hash, index, term, &payload);
        let signature = identity.sign_hex(&signing_message(&hash, &command_id));
        LogEntry {
            index,
            hash,
            term,
            created_at,
            signer: identity.public_key(),
            signature,
            command_id,
            payload,
        }
    }

    /// True when this entry's hash was derived from `previous_hash`.
    pub fn links_to(&self, previous_hash: &str) -> bool {
        Self::compute_hash(previous_hash, self.index, self.term, &self.payload) == self.hash
    }

    pub fn verify_signature(&self) -> bool {
        self.signer
            .verify_hex(&signing_message(&self.hash, &self.command_id), &self.signature)
    }
}

fn signing_message(hash: &str, command_id: &str) -> [u8; 32] {
    sha256(&[hash.as_bytes(), command_id.as_bytes()])
}

/// A command disseminated by gossip that no chain has incorporated yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub command_id: String,
    pub version: u64,
    pub origin: PublicKey,
    pub payload: Value,
}

impl PendingEntry {
    /// Content hash identifying a command pushed by `origin` at gossip `version`.
    pub fn command_id(origin: &PublicKey, version: u64, payload: &Value) -> String {
        let payload_json = payload.to_string();
        sha256_hex(&[
            origin.as_bytes(),
            &version.to_be_bytes(),
            payload_json.as_bytes(),
        ])
    }

    /// Shape check for gossip keys carrying commands. The version in the id is
    /// the one at push time; a fast-forwarded re-issue travels at a later one.
    pub fn is_command_id(key: &str) -> bool {
        key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
    }
}
