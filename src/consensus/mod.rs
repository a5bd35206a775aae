//! Proof-of-leadership elections
//!
//! A candidate splits its mint time into one secret share per cluster key and
//! asks every peer to sign the share issued to it. A quorum of signed shares
//! that recombines to the mint time is the leader's proof; it stays valid for
//! a fixed expiration and is carried on every packet the leader sends.
//!
//! ## Structure
//! - `state.rs` - `NodeState`: role, term, leader, proof and the peer table
//! - `shamir.rs` - threshold secret sharing over GF(2^8)
//! - `proof.rs` - proof encoding, combination and validation
//! - `vote.rs` - one candidate attempt
//! - `election.rs` - the follower/candidate/leader state machine

pub mod election;
pub mod proof;
pub mod shamir;
pub mod state;
pub mod vote;

pub use election::{AckOutcome, ElectionController, Outbound};
pub use proof::{Proof, ProofError, ProofFragment, ProofService};
pub use state::{majority, NodeState, PeerInfo, Role, StateChange, StateError};
pub use vote::{root_for_term, VoteRound};

use crate::network::PacketError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("proof error: {0}")]
    Proof(#[from] ProofError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}
