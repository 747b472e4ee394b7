use crate::{envelope::CodecConfig, fanout::Peer, Dispatcher, Transport};
use std::time::Duration;

/// Configuration for the [`Engine`](super::Engine).
pub struct Config<T: Transport, D: Dispatcher> {
    /// Index of this server in `servers`.
    pub me: u16,

    /// Every cooperating server, including this one, in shard-assignment order.
    ///
    /// Server `i` owns shard slots `[i * shards_per_server, (i + 1) * shards_per_server)`.
    pub servers: Vec<Peer>,

    /// The number of shard slots each server owns.
    pub shards_per_server: u16,

    /// How long a session may wait for shards before it is failed.
    pub session_timeout: Duration,

    /// How long a completed session is remembered so that late shards are dropped.
    pub tombstone_ttl: Duration,

    /// How often expired sessions and tombstones are pruned.
    pub prune_interval: Duration,

    /// Limits applied when decoding inbound envelopes.
    pub codec: CodecConfig,

    /// Path on each peer that accepts encoded envelopes.
    pub receive_path: String,

    /// Delivers envelopes to peers.
    pub transport: T,

    /// Executes reconstructed requests.
    pub dispatcher: D,
}
