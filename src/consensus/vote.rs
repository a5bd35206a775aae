//! Per-attempt election bookkeeping

use super::proof::ProofFragment;
use super::shamir::{self, Share};
use crate::crypto::{sha256_hex, PublicKey};
use rand::RngCore;
use std::collections::HashMap;

/// Commitment to the eligible key set for `term`.
pub fn root_for_term(term: u64, keys: &[PublicKey]) -> String {
    let mut sorted = keys.to_vec();
    sorted.sort();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(sorted.len() + 1);
    let term_bytes = term.to_be_bytes();
    parts.push(&term_bytes);
    for key in &sorted {
        parts.push(key.as_bytes());
    }
    sha256_hex(&parts)
}

/// One candidate attempt. Discarded on term change, success or timeout.
#[derive(Debug, Clone)]
pub struct VoteRound {
    pub nonce: String,
    pub term: u64,
    pub root_for_term: String,
    pub minted_at: u64,
    pub quorum: usize,
    issued: HashMap<PublicKey, Share>,
    combination_map: HashMap<PublicKey, Share>,
    signature_map: HashMap<PublicKey, Vec<u8>>,
}

impl VoteRound {
    /// Split `minted_at` into one share per cluster key (sorted, x = position + 1).
    pub fn start<R: RngCore>(
        term: u64,
        cluster_keys: &[PublicKey],
        quorum: usize,
        minted_at: u64,
        rng: &mut R,
    ) -> Option<Self> {
        let mut keys = cluster_keys.to_vec();
        keys.sort();
        keys.dedup();

        let shares = shamir::split(&minted_at.to_be_bytes(), quorum, keys.len(), rng)?;
        let mut nonce = [0u8; 16];
        rng.fill_bytes(&mut nonce);

        Some(VoteRound {
            nonce: hex::encode(nonce),
            term,
            root_for_term: root_for_term(term, &keys),
            minted_at,
            quorum,
            issued: keys.into_iter().zip(shares).collect(),
            combination_map: HashMap::new(),
            signature_map: HashMap::new(),
        })
    }

    pub fn share_for(&self, key: &PublicKey) -> Option<&Share> {
        self.issued.get(key)
    }

    /// Record a signed share. Only the share issued to that signer is accepted;
    /// signature checks are the caller's job. Returns true for a new signer.
    pub fn fold(&mut self, fragment: ProofFragment) -> bool {
        if self.issued.get(&fragment.public_key) != Some(&fragment.share) {
            return false;
        }
        if self.combination_map.contains_key(&fragment.public_key) {
            return false;
        }
        self.signature_map
            .insert(fragment.public_key, fragment.signature);
        self.combination_map
            .insert(fragment.public_key, fragment.share);
        true
    }

    pub fn votes(&self) -> usize {
        self.combination_map.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.votes() >= self.quorum
    }

    pub fn fragments(&self) -> Vec<ProofFragment> {
        let mut out: Vec<ProofFragment> = self
            .combination_map
            .iter()
            .filter_map(|(key, share)| {
                self.signature_map.get(key).map(|signature| ProofFragment {
                    public_key: *key,
                    share: share.clone(),
                    signature: signature.clone(),
                })
            })
            .collect();
        out.sort_by_key(|f| f.public_key);
        out
    }

    pub fn is_timed_out(&self, now: u64, timeout_ms: u64) -> bool {
        now >= self.minted_at.saturating_add(timeout_ms)
    }
}
