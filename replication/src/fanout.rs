//! Best-effort delivery of encoded envelopes to peer servers.

use crate::Transport;
use bytes::Bytes;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A server that shards are replicated to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Name used in logs and metric labels.
    pub name: String,

    /// Base address of the peer's shard endpoint (interpreted by the [Transport]).
    pub address: String,

    /// Maximum time a single delivery to this peer may take.
    pub timeout: Duration,
}

/// Label for per-peer fanout metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PeerLabel {
    /// Name of the peer
    pub peer: String,
}

impl PeerLabel {
    fn from(peer: &Peer) -> Self {
        Self {
            peer: peer.name.clone(),
        }
    }
}

/// Sends payloads to peers, one task per peer.
///
/// Failures are logged and counted but never returned: a slow or unreachable peer can only
/// cost the shards it would have delivered.
pub struct Fanout<T: Transport> {
    transport: T,
    path: String,
    sent: Family<PeerLabel, Counter>,
    failed: Family<PeerLabel, Counter>,
}

impl<T: Transport> Fanout<T> {
    /// Creates a fanout that posts to `path` on every peer, registering its metrics.
    pub fn new(transport: T, path: impl Into<String>, registry: &mut Registry) -> Self {
        let sent = Family::<PeerLabel, Counter>::default();
        let failed = Family::<PeerLabel, Counter>::default();
        registry.register(
            "fanout_sent",
            "Number of envelopes delivered to peers",
            sent.clone(),
        );
        registry.register(
            "fanout_failed",
            "Number of envelopes that could not be delivered to peers",
            failed.clone(),
        );
        Self {
            transport,
            path: path.into(),
            sent,
            failed,
        }
    }

    /// Delivers `payload` to `peer` in the background.
    ///
    /// The returned handle resolves to whether delivery succeeded; dropping it does not
    /// cancel delivery.
    pub fn send(&self, peer: &Peer, payload: Bytes) -> JoinHandle<bool> {
        let transport = self.transport.clone();
        let path = self.path.clone();
        let peer = peer.clone();
        let sent = self.sent.get_or_create(&PeerLabel::from(&peer)).clone();
        let failed = self.failed.get_or_create(&PeerLabel::from(&peer)).clone();
        tokio::spawn(async move {
            let len = payload.len();
            match tokio::time::timeout(peer.timeout, transport.send(&peer, &path, payload)).await {
                Ok(Ok(())) => {
                    debug!(peer = %peer.name, len, "delivered envelope");
                    sent.inc();
                    true
                }
                Ok(Err(err)) => {
                    warn!(peer = %peer.name, ?err, "failed to deliver envelope");
                    failed.inc();
                    false
                }
                Err(_) => {
                    warn!(peer = %peer.name, timeout = ?peer.timeout, "envelope delivery timed out");
                    failed.inc();
                    false
                }
            }
        })
    }

    /// Delivers `payload` to every peer in `peers`.
    pub fn broadcast<'a>(
        &self,
        peers: impl IntoIterator<Item = &'a Peer>,
        payload: Bytes,
    ) -> Vec<JoinHandle<bool>> {
        peers
            .into_iter()
            .map(|peer| self.send(peer, payload.clone()))
            .collect()
    }
}
