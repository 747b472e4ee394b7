//! Replicate requests across servers as erasure-coded shards.
//!
//! # Overview
//!
//! A request submitted to any server is erasure coded into `total_shards` shards (see
//! [shardline_coding]) and split into contiguous slices, one per server. No server is sent
//! the complete payload. Every server that collects `data_shards` distinct shards of a session
//! reconstructs the payload, verifies it against the session commitment, and hands it to its
//! [Dispatcher] exactly once.
//!
//! # Components
//!
//! - [envelope::ShardEnvelope]: a batch of shards of one session, as exchanged between servers.
//! - [aggregator::Aggregator]: accumulates the shards of one session and hands the
//!   reconstruction to exactly one caller.
//! - [registry::Registry]: maps sessions to aggregators and remembers completed sessions.
//! - [fanout::Fanout]: best-effort delivery to peers over a [Transport].
//! - [Engine]: wires the above together behind [Engine::submit] and [Engine::post_shard].
//!
//! # Relay
//!
//! The submitting server sends every peer that peer's slice with `relay` set, and broadcasts
//! its own slice with `relay` cleared. A server receiving a relayed envelope re-broadcasts it
//! to all other servers. Every reachable server therefore sees every surviving slice, and an
//! unreachable server costs only the slice it owns.

use bytes::Bytes;
use std::{fmt::Display, future::Future};
use thiserror::Error;

pub mod aggregator;
pub mod envelope;
pub mod fanout;
pub mod registry;
mod replicator;
pub use replicator::{Config, Delivery, Engine};

#[cfg(test)]
pub mod mocks;

use aggregator::Failure;
use envelope::SessionId;
use fanout::Peer;

/// Errors that can occur when interacting with the [Engine].
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid envelope: {0}")]
    Codec(#[from] shardline_codec::Error),
    #[error("coding error: {0}")]
    Coding(#[from] shardline_coding::Error),
    #[error("invalid shard: {0}")]
    Shard(#[from] aggregator::Error),
    #[error("invalid server index: {0}")]
    InvalidServer(u16),
    #[error("session already completed: {0}")]
    Completed(SessionId),
    #[error("session failed: {0}")]
    SessionFailed(Failure),
    #[error("session timed out")]
    Timeout,
    #[error("session abandoned")]
    Abandoned,
}

/// Delivers encoded envelopes to a peer.
pub trait Transport: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends `payload` to `path` on `peer`.
    ///
    /// Implementations need not enforce [Peer::timeout]; the caller does.
    fn send(
        &self,
        peer: &Peer,
        path: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Executes reconstructed requests.
pub trait Dispatcher: Clone + Send + Sync + 'static {
    type Error: Display + Send;

    /// Processes a reconstructed request and returns the response bytes.
    ///
    /// Called at most once per session on each server that reconstructs it.
    fn dispatch(
        &self,
        request_type: u16,
        payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}
