//! Proof of leadership
//!
//! A proof bundles the signed secret-share fragments a candidate collected
//! from a quorum of the cluster, the quorum size, the term and vote nonce it
//! was collected for, and the mint time that the shares reconstruct.
//!
//! Wire layout (all integers big-endian, hex-encoded inside packets):
//!
//! ```text
//! u8  version
//! u16 quorum
//! u64 term
//! u64 minted_at
//! u16 nonce_len   | nonce bytes
//! u16 fragment_count
//!   [32] public key | u8 x | u16 y_len | y | u16 sig_len | sig
//! ```

use super::shamir::{self, Share};
use super::state::majority;
use crate::crypto::{sha256, NodeIdentity, PublicKey};
use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::debug;

const PROOF_VERSION: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProofError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("unsupported proof version {0}")]
    Version(u8),

    #[error("proof truncated")]
    Truncated,

    #[error("trailing bytes after proof")]
    Trailing,

    #[error("field too large: {0}")]
    TooLarge(&'static str),

    #[error("invalid utf-8 nonce")]
    Nonce,
}

/// One voter's signed share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofFragment {
    pub public_key: PublicKey,
    pub share: Share,
    #[serde(with = "crate::crypto::hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub quorum: u16,
    pub term: u64,
    pub nonce: String,
    pub fragments: Vec<ProofFragment>,
    pub minted_at: u64,
}

fn put_u16_len(buf: &mut Vec<u8>, len: usize, field: &'static str) -> Result<(), ProofError> {
    let len = u16::try_from(len).map_err(|_| ProofError::TooLarge(field))?;
    buf.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, ProofError> {
    let mut out = vec![0u8; len];
    cursor.read_exact(&mut out).map_err(|_| ProofError::Truncated)?;
    Ok(out)
}

impl Proof {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProofError> {
        let mut buf = Vec::with_capacity(32 + self.fragments.len() * 112);
        buf.push(PROOF_VERSION);
        buf.extend_from_slice(&self.quorum.to_be_bytes());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.extend_from_slice(&self.minted_at.to_be_bytes());
        put_u16_len(&mut buf, self.nonce.len(), "nonce")?;
        buf.extend_from_slice(self.nonce.as_bytes());
        put_u16_len(&mut buf, self.fragments.len(), "fragments")?;

        for fragment in &self.fragments {
            buf.extend_from_slice(fragment.public_key.as_bytes());
            buf.push(fragment.share.x);
            put_u16_len(&mut buf, fragment.share.y.len(), "share")?;
            buf.extend_from_slice(&fragment.share.y);
            put_u16_len(&mut buf, fragment.signature.len(), "signature")?;
            buf.extend_from_slice(&fragment.signature);
        }
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut cursor = Cursor::new(bytes);
        let truncated = |_| ProofError::Truncated;

        let version = cursor.read_u8().map_err(truncated)?;
        if version != PROOF_VERSION {
            return Err(ProofError::Version(version));
        }
        let quorum = cursor.read_u16::<BigEndian>().map_err(truncated)?;
        let term = cursor.read_u64::<BigEndian>().map_err(truncated)?;
        let minted_at = cursor.read_u64::<BigEndian>().map_err(truncated)?;

        let nonce_len = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let nonce = String::from_utf8(read_exact(&mut cursor, nonce_len)?)
            .map_err(|_| ProofError::Nonce)?;

        let count = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let mut fragments = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let key: [u8; 32] = read_exact(&mut cursor, 32)?
                .try_into()
                .map_err(|_| ProofError::Truncated)?;
            let x = cursor.read_u8().map_err(truncated)?;
            let y_len = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let y = read_exact(&mut cursor, y_len)?;
            let sig_len = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let signature = read_exact(&mut cursor, sig_len)?;
            fragments.push(ProofFragment {
                public_key: PublicKey::from_bytes(key),
                share: Share { x, y },
                signature,
            });
        }

        if cursor.position() as usize != bytes.len() {
            return Err(ProofError::Trailing);
        }

        Ok(Proof {
            quorum,
            term,
            nonce,
            fragments,
            minted_at,
        })
    }

    /// Hex string carried in packets.
    pub fn encode(&self) -> Result<String, ProofError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    pub fn decode(encoded: &str) -> Result<Self, ProofError> {
        let bytes = hex::decode(encoded).map_err(|e| ProofError::Hex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Message a voter signs for its share.
fn fragment_message(nonce: &str, term: u64, share: &Share) -> [u8; 32] {
    sha256(&[
        b"vote",
        nonce.as_bytes(),
        &term.to_be_bytes(),
        &[share.x],
        &share.y,
    ])
}

/// Builds, combines and validates proofs. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct ProofService {
    expiration_ms: u64,
}

impl ProofService {
    pub fn new(expiration_ms: u64) -> Self {
        Self { expiration_ms }
    }

    pub fn expiration_ms(&self) -> u64 {
        self.expiration_ms
    }

    /// Sign `share` for the vote round `(nonce, term)`.
    pub fn build_share(
        &self,
        identity: &NodeIdentity,
        nonce: &str,
        term: u64,
        share: Share,
    ) -> ProofFragment {
        let signature = identity.sign(&fragment_message(nonce, term, &share));
        ProofFragment {
            public_key: identity.public_key(),
            share,
            signature,
        }
    }

    pub fn verify_fragment(&self, nonce: &str, term: u64, fragment: &ProofFragment) -> bool {
        fragment.public_key.verify(
            &fragment_message(nonce, term, &fragment.share),
            &fragment.signature,
        )
    }

    /// Build a proof once `quorum` distinct signers verify and their shares
    /// reconstruct `minted_at`.
    pub fn combine<'a>(
        &self,
        quorum: usize,
        nonce: &str,
        term: u64,
        fragments: impl IntoIterator<Item = &'a ProofFragment>,
        minted_at: u64,
    ) -> Option<Proof> {
        let mut seen = HashSet::new();
        let accepted: Vec<ProofFragment> = fragments
            .into_iter()
            .filter(|f| self.verify_fragment(nonce, term, f))
            .filter(|f| seen.insert(f.public_key))
            .cloned()
            .collect();

        if accepted.len() < quorum {
            return None;
        }

        let shares: Vec<Share> = accepted.iter().map(|f| f.share.clone()).collect();
        if shamir::combine(&shares)? != minted_at.to_be_bytes() {
            debug!(term, "Shares do not reconstruct mint time");
            return None;
        }

        Some(Proof {
            quorum: u16::try_from(quorum).ok()?,
            term,
            nonce: nonce.to_string(),
            fragments: accepted,
            minted_at,
        })
    }

    /// Pure validity predicate for a proof string presented for `term`.
    ///
    /// `public_keys` is the whole cluster including the local node.
    pub fn validate(
        &self,
        term: u64,
        proof: &str,
        previous: Option<&str>,
        public_keys: &[PublicKey],
    ) -> bool {
        if previous == Some(proof) {
            return true;
        }

        let parsed = match Proof::decode(proof) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Malformed proof");
                return false;
            }
        };

        if parsed.term != term {
            return false;
        }

        let required = majority(public_keys.len().saturating_sub(1));
        if (parsed.quorum as usize) < required {
            return false;
        }

        let mut signers = HashSet::new();
        for fragment in &parsed.fragments {
            if !public_keys.contains(&fragment.public_key)
                || !signers.insert(fragment.public_key)
                || !self.verify_fragment(&parsed.nonce, parsed.term, fragment)
            {
                return false;
            }
        }
        if signers.len() < parsed.quorum as usize {
            return false;
        }

        let shares: Vec<Share> = parsed.fragments.iter().map(|f| f.share.clone()).collect();
        matches!(shamir::combine(&shares), Some(secret) if secret == parsed.minted_at.to_be_bytes())
    }

    pub fn is_expired(&self, minted_at: u64, now: u64) -> bool {
        now >= minted_at.saturating_add(self.expiration_ms)
    }

    pub fn expires_at(&self, minted_at: u64) -> u64 {
        minted_at.saturating_add(self.expiration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Round {
        identities: Vec<NodeIdentity>,
        keys: Vec<PublicKey>,
        fragments: Vec<ProofFragment>,
        minted_at: u64,
    }

    fn round(nodes: usize, nonce: &str, term: u64) -> Round {
        let service = ProofService::new(1000);
        let identities: Vec<NodeIdentity> = (0..nodes).map(|_| NodeIdentity::generate()).collect();
        let keys: Vec<PublicKey> = identities.iter().map(|i| i.public_key()).collect();
        let minted_at: u64 = 1_700_000_000_000;
        let mut rng = StdRng::seed_from_u64(term);
        let shares =
            shamir::split(&minted_at.to_be_bytes(), majority(nodes - 1), nodes, &mut rng).unwrap();
        let fragments = identities
            .iter()
            .zip(shares)
            .map(|(id, share)| service.build_share(id, nonce, term, share))
            .collect();
        Round {
            identities,
            keys,
            fragments,
            minted_at,
        }
    }

    #[test]
    fn test_combine_and_validate() {
        let service = ProofService::new(1000);
        let r = round(3, "n1", 4);

        let proof = service
            .combine(2, "n1", 4, &r.fragments[..2], r.minted_at)
            .unwrap();
        assert_eq!(proof.fragments.len(), 2);
        let encoded = proof.encode().unwrap();

        assert!(service.validate(4, &encoded, None, &r.keys));
        assert!(!service.validate(5, &encoded, None, &r.keys));
    }

    #[test]
    fn test_combine_requires_quorum() {
        let service = ProofService::new(1000);
        let r = round(5, "n", 1);
        assert!(service.combine(3, "n", 1, &r.fragments[..2], r.minted_at).is_none());

        // Duplicates of one signer never count twice
        let dup = vec![r.fragments[0].clone(), r.fragments[0].clone(), r.fragments[1].clone()];
        assert!(service.combine(3, "n", 1, &dup, r.minted_at).is_none());

        assert!(service.combine(3, "n", 1, &r.fragments[..3], r.minted_at).is_some());
    }

    #[test]
    fn test_fragments_are_bound_to_round() {
        let service = ProofService::new(1000);
        let r = round(3, "n1", 2);
        assert!(service.verify_fragment("n1", 2, &r.fragments[0]));
        assert!(!service.verify_fragment("n2", 2, &r.fragments[0]));
        assert!(!service.verify_fragment("n1", 3, &r.fragments[0]));
        assert!(service.combine(2, "n2", 2, &r.fragments, r.minted_at).is_none());
    }

    #[test]
    fn test_forged_signature_rejected() {
        let service = ProofService::new(1000);
        let r = round(3, "n", 1);
        let mut proof = service.combine(2, "n", 1, &r.fragments[..2], r.minted_at).unwrap();
        proof.fragments[1].signature[0] ^= 0xff;
        assert!(!service.validate(1, &proof.encode().unwrap(), None, &r.keys));
    }

    #[test]
    fn test_tampered_mint_time_rejected() {
        let service = ProofService::new(1000);
        let r = round(3, "n", 1);
        let mut proof = service.combine(2, "n", 1, &r.fragments[..2], r.minted_at).unwrap();
        proof.minted_at += 60_000;
        assert!(!service.validate(1, &proof.encode().unwrap(), None, &r.keys));
    }

    #[test]
    fn test_lowered_quorum_rejected() {
        let service = ProofService::new(1000);
        let r = round(5, "n", 1);
        let mut proof = service.combine(3, "n", 1, &r.fragments[..3], r.minted_at).unwrap();
        proof.quorum = 1;
        proof.fragments.truncate(1);
        assert!(!service.validate(1, &proof.encode().unwrap(), None, &r.keys));
    }

    #[test]
    fn test_unknown_signer_rejected() {
        let service = ProofService::new(1000);
        let r = round(3, "n", 1);
        let proof = service.combine(2, "n", 1, &r.fragments[..2], r.minted_at).unwrap();
        let encoded = proof.encode().unwrap();
        let strangers: Vec<PublicKey> = (0..3).map(|_| NodeIdentity::generate().public_key()).collect();
        assert!(!service.validate(1, &encoded, None, &strangers));
        assert_eq!(r.identities.len(), 3);
    }

    #[test]
    fn test_previous_known_proof_short_circuits() {
        let service = ProofService::new(1000);
        assert!(service.validate(9, "not even hex", Some("not even hex"), &[]));
        assert!(!service.validate(9, "not even hex", None, &[]));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Proof::decode("zz"), Err(ProofError::Hex(_))));
        assert_eq!(Proof::from_bytes(&[]), Err(ProofError::Truncated));
        assert_eq!(Proof::from_bytes(&[9]), Err(ProofError::Version(9)));

        let service = ProofService::new(1000);
        let r = round(3, "n", 1);
        let proof = service.combine(2, "n", 1, &r.fragments[..2], r.minted_at).unwrap();
        let mut bytes = proof.to_bytes().unwrap();
        assert_eq!(Proof::from_bytes(&bytes).unwrap(), proof);

        bytes.push(0);
        assert_eq!(Proof::from_bytes(&bytes), Err(ProofError::Trailing));
        bytes.truncate(bytes.len() - 10);
        assert_eq!(Proof::from_bytes(&bytes), Err(ProofError::Truncated));
    }

    #[test]
    fn test_delimiter_bytes_inside_fragments_survive() {
        let proof = Proof {
            quorum: 1,
            term: 1,
            nonce: "x:x".into(),
            fragments: vec![ProofFragment {
                public_key: NodeIdentity::generate().public_key(),
                share: Share { x: b'x', y: b"xxx".to_vec() },
                signature: vec![b'x'; 64],
            }],
            minted_at: u64::from_be_bytes(*b"xxxxxxxx"),
        };
        let decoded = Proof::decode(&proof.encode().unwrap()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_expiry() {
        let service = ProofService::new(1000);
        assert!(!service.is_expired(5000, 5999));
        assert!(service.is_expired(5000, 6000));
        assert_eq!(service.expires_at(5000), 6000);
    }
}
