//! In-memory transport over tokio channels, with partition control

use super::{Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, mpsc::Sender<Vec<u8>>>,
    isolated: HashSet<String>,
}

/// Shared broker routing packets between `ChannelTransport`s by address.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, address: impl Into<String>) -> ChannelTransport {
        ChannelTransport {
            address: address.into(),
            network: self.clone(),
        }
    }

    /// Cut `address` off: nothing is delivered to or from it until `heal`.
    pub fn isolate(&self, address: &str) {
        self.registry.lock().isolated.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.registry.lock().isolated.remove(address);
    }

    fn route(&self, from: &str, to: &str) -> Result<mpsc::Sender<Vec<u8>>, TransportError> {
        let registry = self.registry.lock();
        if registry.isolated.contains(from) || registry.isolated.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        registry
            .listeners
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }
}

#[derive(Clone)]
pub struct ChannelTransport {
    address: String,
    network: ChannelNetwork,
}

impl ChannelTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, address: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let target = self.network.route(&self.address, address)?;
        trace!(from = %self.address, to = %address, len = bytes.len(), "Channel: send");
        target
            .send(bytes)
            .await
            .map_err(|_| TransportError::Unreachable(address.to_string()))
    }

    fn listen(&self, inbound: mpsc::Sender<Vec<u8>>) {
        self.network
            .registry
            .lock()
            .listeners
            .insert(self.address.clone(), inbound);
    }

    fn unlisten(&self) {
        self.network.registry.lock().listeners.remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_and_isolation() {
        let network = ChannelNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let (tx, mut rx) = mpsc::channel(8);
        b.listen(tx);

        a.send("b", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());

        network.isolate("a");
        assert!(matches!(
            a.send("b", vec![1]).await,
            Err(TransportError::Unreachable(_))
        ));

        network.heal("a");
        a.send("b", vec![2]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![2]);

        b.unlisten();
        assert!(a.send("b", vec![3]).await.is_err());
        assert!(a.send("nowhere", vec![4]).await.is_err());
    }
}
