//! Node configuration
//!
//! Built in code through the `with_*` setters or loaded from `REPLICA_*`
//! environment variables (a `.env` file is honoured once the logger is up).

use crate::crypto::{CryptoError, NodeIdentity, PublicKey};
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HEARTBEAT_MS: u64 = 200;
pub const DEFAULT_ELECTION_TIMEOUT_MIN_MS: u64 = 600;
pub const DEFAULT_ELECTION_TIMEOUT_MAX_MS: u64 = 1200;
pub const DEFAULT_PROOF_EXPIRATION_MS: u64 = 5000;
pub const DEFAULT_GOSSIP_HEARTBEAT_MS: u64 = 200;
pub const DEFAULT_GOSSIP_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_REPLICATION_BATCH: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid key: {0}")]
    Key(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub address: String,
}

impl PeerConfig {
    /// Parse `pubkey@host:port`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let (key, address) = spec.trim().split_once('@').ok_or_else(|| ConfigError::Invalid {
            field: "REPLICA_PEERS",
            reason: format!("expected pubkey@address, got {:?}", spec),
        })?;
        if address.is_empty() {
            return Err(ConfigError::Invalid {
                field: "REPLICA_PEERS",
                reason: format!("empty address in {:?}", spec),
            });
        }
        Ok(PeerConfig {
            public_key: key.parse()?,
            address: address.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: NodeIdentity,
    pub address: String,
    pub peers: Vec<PeerConfig>,
    pub heartbeat_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub proof_expiration_ms: u64,
    pub gossip_heartbeat_ms: u64,
    pub gossip_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub replication_batch: usize,
    pub db_path: Option<String>,
}

impl NodeConfig {
    pub fn new(identity: NodeIdentity, address: impl Into<String>) -> Self {
        NodeConfig {
            identity,
            address: address.into(),
            peers: Vec::new(),
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            election_timeout_min_ms: DEFAULT_ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: DEFAULT_ELECTION_TIMEOUT_MAX_MS,
            proof_expiration_ms: DEFAULT_PROOF_EXPIRATION_MS,
            gossip_heartbeat_ms: DEFAULT_GOSSIP_HEARTBEAT_MS,
            gossip_timeout_ms: DEFAULT_GOSSIP_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            replication_batch: DEFAULT_REPLICATION_BATCH,
            db_path: None,
        }
    }

    pub fn with_peer(mut self, public_key: PublicKey, address: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            public_key,
            address: address.into(),
        });
        self
    }

    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_heartbeat_ms(mut self, ms: u64) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    pub fn with_election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min_ms = min;
        self.election_timeout_max_ms = max;
        self
    }

    pub fn with_proof_expiration_ms(mut self, ms: u64) -> Self {
        self.proof_expiration_ms = ms;
        self
    }

    pub fn with_gossip_heartbeat_ms(mut self, ms: u64) -> Self {
        self.gossip_heartbeat_ms = ms;
        self
    }

    pub fn with_gossip_timeout_ms(mut self, ms: u64) -> Self {
        self.gossip_timeout_ms = ms;
        self
    }

    pub fn with_send_timeout_ms(mut self, ms: u64) -> Self {
        self.send_timeout_ms = ms;
        self
    }

    pub fn with_replication_batch(mut self, batch: usize) -> Self {
        self.replication_batch = batch;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn gossip_heartbeat(&self) -> Duration {
        Duration::from_millis(self.gossip_heartbeat_ms)
    }

    pub fn gossip_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.gossip_heartbeat_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "gossip_heartbeat_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(ConfigError::Invalid {
                field: "election_timeout_ms",
                reason: format!(
                    "need 0 < min <= max, got {}..{}",
                    self.election_timeout_min_ms, self.election_timeout_max_ms
                ),
            });
        }
        if self.proof_expiration_ms <= self.heartbeat_ms {
            return Err(ConfigError::Invalid {
                field: "proof_expiration_ms",
                reason: "must exceed the heartbeat".to_string(),
            });
        }
        if self.replication_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "replication_batch",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Load from `REPLICA_*` variables. Durations fall back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let private_key =
            env::var("REPLICA_PRIVATE_KEY").map_err(|_| ConfigError::Missing("REPLICA_PRIVATE_KEY"))?;
        let address =
            env::var("REPLICA_ADDRESS").map_err(|_| ConfigError::Missing("REPLICA_ADDRESS"))?;

        let mut config = NodeConfig::new(NodeIdentity::from_hex(&private_key)?, address);

        if let Ok(peers) = env::var("REPLICA_PEERS") {
            config.peers = peers
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(PeerConfig::parse)
                .collect::<Result<_, _>>()?;
        }

        config.heartbeat_ms = env_u64("REPLICA_HEARTBEAT_MS", config.heartbeat_ms)?;
        config.election_timeout_min_ms =
            env_u64("REPLICA_ELECTION_MIN_MS", config.election_timeout_min_ms)?;
        config.election_timeout_max_ms =
            env_u64("REPLICA_ELECTION_MAX_MS", config.election_timeout_max_ms)?;
        config.proof_expiration_ms =
            env_u64("REPLICA_PROOF_EXPIRATION_MS", config.proof_expiration_ms)?;
        config.gossip_heartbeat_ms =
            env_u64("REPLICA_GOSSIP_HEARTBEAT_MS", config.gossip_heartbeat_ms)?;
        config.gossip_timeout_ms = env_u64("REPLICA_GOSSIP_TIMEOUT_MS", config.gossip_timeout_ms)?;
        config.db_path = env::var("REPLICA_DB_PATH").ok();

        config.validate()?;
        Ok(config)
    }
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            field: name,
            reason: format!("not a number: {:?}", raw),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = NodeConfig::new(NodeIdentity::generate(), "127.0.0.1:7000");
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat(), Duration::from_millis(200));
    }

    #[test]
    fn test_validate_rejects_bad_timings() {
        let base = NodeConfig::new(NodeIdentity::generate(), "a");
        assert!(base.clone().with_election_timeout_ms(900, 300).validate().is_err());
        assert!(base.clone().with_heartbeat_ms(0).validate().is_err());
        assert!(base.clone().with_proof_expiration_ms(100).validate().is_err());
        assert!(base.with_replication_batch(0).validate().is_err());
    }

    #[test]
    fn test_parse_peer() {
        let key = NodeIdentity::generate().public_key();
        let peer = PeerConfig::parse(&format!("{}@10.0.0.2:7001", key)).unwrap();
        assert_eq!(peer.public_key, key);
        assert_eq!(peer.address, "10.0.0.2:7001");

        assert!(PeerConfig::parse("no-separator").is_err());
        assert!(PeerConfig::parse(&format!("{}@", key)).is_err());
        assert!(PeerConfig::parse("zz@host:1").is_err());
    }

    // Kept in one test so parallel tests never see each other's variables
    #[test]
    fn test_from_env() {
        let identity = NodeIdentity::generate();
        let peer = NodeIdentity::generate().public_key();
        env::set_var("REPLICA_PRIVATE_KEY", identity.private_key_hex());
        env::set_var("REPLICA_ADDRESS", "127.0.0.1:7100");
        env::set_var("REPLICA_PEERS", format!("{}@127.0.0.1:7101, ", peer));
        env::set_var("REPLICA_HEARTBEAT_MS", "50");

        let config = NodeConfig::from_env().unwrap();
        assert_eq!(config.identity.public_key(), identity.public_key());
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.heartbeat_ms, 50);
        assert_eq!(config.election_timeout_max_ms, DEFAULT_ELECTION_TIMEOUT_MAX_MS);

        env::set_var("REPLICA_HEARTBEAT_MS", "fast");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Invalid { field: "REPLICA_HEARTBEAT_MS", .. })
        ));

        for var in [
            "REPLICA_PRIVATE_KEY",
            "REPLICA_ADDRESS",
            "REPLICA_PEERS",
            "REPLICA_HEARTBEAT_MS",
        ] {
            env::remove_var(var);
        }
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Missing("REPLICA_PRIVATE_KEY"))
        ));
    }
}
