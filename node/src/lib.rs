//! Serve shard replication over HTTP.
//!
//! # Usage
//!
//! Every server runs the same binary with its own configuration. The `servers` list must be
//! identical (and identically ordered) on every server, as the position of a server in it
//! determines which shard slots it owns.
//!
//! ```bash
//! shardline-node --config server-0.yaml
//! ```
//!
//! ```yaml
//! me: 0
//! listen: 0.0.0.0:8080
//! log_level: info
//! shards_per_server: 1
//! session_timeout_ms: 5000
//! tombstone_ttl_ms: 60000
//! prune_interval_ms: 1000
//! peer_timeout_ms: 2000
//! max_shard_length: 4194304
//! receive_path: /shards
//! servers:
//!   - name: server-0
//!     address: http://10.0.0.1:8080
//!   - name: server-1
//!     address: http://10.0.0.2:8080
//!   - name: server-2
//!     address: http://10.0.0.3:8080
//! ```
//!
//! # Endpoints
//!
//! - `POST /shards`: accepts an encoded envelope from a peer.
//! - `POST /requests/{request_type}`: submits a request and returns the response envelopes.
//! - `GET /metrics`: Prometheus metrics.

use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use shardline_replication::{envelope::CodecConfig, fanout::Peer, Dispatcher, Transport};
use std::{net::SocketAddr, path::Path, time::Duration};
use thiserror::Error;

pub mod dispatcher;
pub mod server;
pub mod transport;

/// Bytes allowed on top of shard contents for envelope framing.
const FRAMING: usize = 64 * 1024;

/// Errors that can occur when starting a node.
#[derive(Error, Debug)]
pub enum Error {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("could not create http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not create engine: {0}")]
    Replication(#[from] shardline_replication::Error),
}

/// A server listed in the configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Server {
    pub name: String,
    pub address: String,
}

/// Configuration for a node.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub me: u16,
    pub listen: SocketAddr,
    pub log_level: String,
    pub shards_per_server: u16,
    pub session_timeout_ms: u64,
    pub tombstone_ttl_ms: u64,
    pub prune_interval_ms: u64,
    pub peer_timeout_ms: u64,
    pub max_shard_length: usize,
    pub receive_path: String,
    pub servers: Vec<Server>,
}

impl Config {
    /// Reads a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Every configured server as a replication peer.
    pub fn peers(&self) -> Vec<Peer> {
        let timeout = Duration::from_millis(self.peer_timeout_ms);
        self.servers
            .iter()
            .map(|server| Peer {
                name: server.name.clone(),
                address: server.address.clone(),
                timeout,
            })
            .collect()
    }

    /// Largest HTTP body the node accepts.
    ///
    /// A request payload never exceeds every shard slot filled to `max_shard_length`, and a
    /// peer envelope carries a subset of those slots.
    pub fn body_limit(&self) -> usize {
        let slots = self.servers.len() * usize::from(self.shards_per_server);
        slots
            .saturating_mul(self.max_shard_length)
            .saturating_add(FRAMING)
    }

    /// Creates the engine served by this node, registering its metrics.
    pub fn engine(&self, registry: &mut Registry) -> Result<server::NodeEngine, Error> {
        let transport = transport::Http::new()?;
        Ok(server::NodeEngine::new(
            self.replication(transport, dispatcher::Echo),
            registry,
        )?)
    }

    /// Builds the replication engine configuration.
    pub fn replication<T: Transport, D: Dispatcher>(
        &self,
        transport: T,
        dispatcher: D,
    ) -> shardline_replication::Config<T, D> {
        shardline_replication::Config {
            me: self.me,
            servers: self.peers(),
            shards_per_server: self.shards_per_server,
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            tombstone_ttl: Duration::from_millis(self.tombstone_ttl_ms),
            prune_interval: Duration::from_millis(self.prune_interval_ms),
            codec: CodecConfig {
                max_shard_length: self.max_shard_length,
                ..CodecConfig::default()
            },
            receive_path: self.receive_path.clone(),
            transport,
            dispatcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatcher::Echo, transport::Http};

    const CONFIG: &str = r#"
me: 1
listen: 127.0.0.1:8081
log_level: debug
shards_per_server: 2
session_timeout_ms: 5000
tombstone_ttl_ms: 60000
prune_interval_ms: 1000
peer_timeout_ms: 250
max_shard_length: 1024
receive_path: /shards
servers:
  - name: server-0
    address: http://127.0.0.1:8080
  - name: server-1
    address: http://127.0.0.1:8081
  - name: server-2
    address: http://127.0.0.1:8082
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = serde_yaml::from_str(CONFIG).unwrap();
        assert_eq!(config.me, 1);
        assert_eq!(config.listen, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.servers.len(), 3);

        let peers = config.peers();
        assert_eq!(peers[2].name, "server-2");
        assert_eq!(peers[2].address, "http://127.0.0.1:8082");
        assert_eq!(peers[2].timeout, Duration::from_millis(250));

        let replication = config.replication(Http::new().unwrap(), Echo);
        assert_eq!(replication.shards_per_server, 2);
        assert_eq!(replication.session_timeout, Duration::from_secs(5));
        assert_eq!(replication.codec.max_shard_length, 1024);
    }

    #[test]
    fn test_body_limit() {
        let mut config: Config = serde_yaml::from_str(CONFIG).unwrap();
        assert_eq!(config.body_limit(), 6 * 1024 + 64 * 1024);

        config.max_shard_length = usize::MAX;
        assert_eq!(config.body_limit(), usize::MAX);
    }

    #[test]
    fn test_reject_incomplete_config() {
        assert!(serde_yaml::from_str::<Config>("me: 0\nlisten: 127.0.0.1:8080\n").is_err());
    }
}
