//! Leader-based replication engine
//!
//! Replicas elect a leader with a proof of leadership built from threshold
//! secret shares, disseminate client commands through scuttlebutt gossip and
//! agree on a hash-chained log whose committed entries drive a replicated
//! key-value state.
//!
//! ## Structure
//! - `consensus/` - elections, proofs and node state
//! - `gossip/` - scuttlebutt dissemination and failure detection
//! - `ledger/` - hash-chained log and replicated state
//! - `network/` - wire packets and transports
//! - `storage/` - ordered key-value storage adapters
//! - `node.rs` - the replica runtime tying them together

pub mod clock;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod gossip;
pub mod ledger;
pub mod logger;
pub mod network;
pub mod node;
pub mod storage;

pub use config::{NodeConfig, PeerConfig};
pub use crypto::{NodeIdentity, PublicKey};
pub use ledger::{Applier, KvApplier};
pub use node::{Node, NodeError, NodeInfo};
