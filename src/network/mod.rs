//! Transport seam between a replica and the outside world
//!
//! ## Structure
//! - `packet.rs` - JSON wire packets and their payloads
//! - `channel.rs` - in-process transport used by tests and simulations
//! - `http.rs` - reqwest client plus actix-web endpoints

pub mod channel;
pub mod http;
pub mod packet;

pub use channel::{ChannelNetwork, ChannelTransport};
pub use http::HttpTransport;
pub use packet::{Packet, PacketError, PacketType};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(String),

    #[error("send to {0} timed out")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer {address} answered with status {status}")]
    Status { address: String, status: u16 },

    #[error("transport closed")]
    Closed,
}

/// Byte-level delivery between replicas.
///
/// Inbound packets are handed to the channel registered through `listen`;
/// a transport delivers to at most one listener.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, address: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    fn listen(&self, inbound: mpsc::Sender<Vec<u8>>);

    /// Stop delivering inbound packets.
    fn unlisten(&self);
}
