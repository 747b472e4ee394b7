//! Per-session shard accumulation and exactly-once reconstruction.
//!
//! An [Aggregator] owns the shard matrix of one session. Shards may arrive in any order and
//! from any number of concurrent callers; the call that stores the `data_shards`-th distinct
//! slot receives a [Pending] reconstruction and every later call observes that the session has
//! moved on. Because [Pending] is handed out by value exactly once, at most one reconstruction
//! (and therefore at most one dispatch) can ever run per session.

use crate::envelope::{commit, Commitment, Direction, Header, Key, Parameters, ShardEnvelope};
use bytes::Bytes;
use futures::channel::oneshot;
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::Instant;

/// Errors returned when a shard cannot be stored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("shard index {index} out of range (total {total})")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("shard length {found} does not match session length {expected}")]
    InvalidShardLength { expected: usize, found: usize },
}

/// Why a session ended without a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error("reconstruction failed: {0}")]
    Coding(#[from] shardline_coding::Error),
    #[error("reconstructed payload does not match commitment")]
    CommitmentMismatch,
    #[error("envelope parameters do not match session")]
    ParameterMismatch,
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("session timed out")]
    Timeout,
}

/// The result of a reconstructed session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// The reconstructed payload.
    pub payload: Bytes,

    /// The dispatcher's response, for request sessions.
    pub response: Option<Bytes>,
}

/// What a waiter eventually receives.
pub type Completion = Result<Outcome, Failure>;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Created but no shard stored yet.
    Empty,
    /// At least one shard stored, below the threshold.
    Accumulating,
    /// Threshold reached; a reconstruction is in flight.
    Reconstructing,
    /// Reconstruction (and dispatch, if any) succeeded.
    Reconstructed,
    /// The session ended without a result.
    Failed,
}

impl State {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reconstructed | Self::Failed)
    }
}

/// The effect of storing a shard.
#[derive(Debug)]
pub enum Progress {
    /// The shard was stored and the session still needs more.
    Accumulating { received: usize, required: usize },
    /// The slot was already filled; nothing changed.
    Duplicate { received: usize, required: usize },
    /// The session is no longer accepting shards.
    Ignored,
    /// This shard completed the threshold. The caller owns the reconstruction.
    Ready(Pending),
}

/// A reconstruction handed to exactly one caller.
#[derive(Debug)]
pub struct Pending {
    parameters: Parameters,
    commitment: Commitment,
    shards: Vec<Vec<u8>>,
    present: Vec<bool>,
}

impl Pending {
    /// Decodes the stored shards and checks the result against the session commitment.
    pub fn reconstruct(mut self) -> Result<Bytes, Failure> {
        let payload = shardline_coding::decode(
            &self.parameters.coding(),
            self.parameters.shard_length,
            &mut self.shards,
            &self.present,
        )?;
        if commit(&payload) != self.commitment {
            return Err(Failure::CommitmentMismatch);
        }
        Ok(payload.into())
    }
}

struct Inner {
    state: State,
    shards: Vec<Vec<u8>>,
    present: Vec<bool>,
    received: usize,
    completion: Option<Completion>,
    waiters: Vec<oneshot::Sender<Completion>>,
}

/// Accumulates the shards of one session.
pub struct Aggregator {
    header: Header,
    deadline: Instant,
    inner: Mutex<Inner>,
}

impl Aggregator {
    /// Creates an empty aggregator for the session described by `header`.
    pub fn new(header: Header, deadline: Instant) -> Self {
        let total = usize::from(header.parameters.total_shards);
        Self {
            header,
            deadline,
            inner: Mutex::new(Inner {
                state: State::Empty,
                shards: vec![Vec::new(); total],
                present: vec![false; total],
                received: 0,
                completion: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// The header shared by every shard of the session.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The registry key of the session.
    pub fn key(&self) -> Key {
        self.header.key()
    }

    /// Whether the session carries a request or a response.
    pub fn direction(&self) -> Direction {
        self.header.direction
    }

    /// When the session times out if still unfinished.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The number of data shards required for reconstruction.
    pub fn required(&self) -> usize {
        usize::from(self.header.parameters.data_shards)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// The number of distinct slots filled so far.
    pub fn received(&self) -> usize {
        self.inner.lock().unwrap().received
    }

    /// Whether enough distinct shards have arrived to reconstruct.
    pub fn are_enough_shards(&self) -> bool {
        self.received() >= self.required()
    }

    /// Whether `envelope` describes the same session as this aggregator.
    pub fn matches(&self, envelope: &ShardEnvelope) -> bool {
        envelope.header == self.header
    }

    /// Stores `payload` in slot `index`.
    ///
    /// Slots are write-once: a second write to a filled slot is reported as
    /// [Progress::Duplicate] and does not count toward the threshold.
    pub fn set_shard(&self, index: usize, payload: &[u8]) -> Result<Progress, Error> {
        let total = usize::from(self.header.parameters.total_shards);
        if index >= total {
            return Err(Error::IndexOutOfRange { index, total });
        }
        let expected = self.header.parameters.shard_length;
        if payload.len() != expected {
            return Err(Error::InvalidShardLength {
                expected,
                found: payload.len(),
            });
        }

        let required = self.required();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Empty | State::Accumulating => {}
            State::Reconstructing | State::Reconstructed | State::Failed => {
                return Ok(Progress::Ignored)
            }
        }
        if inner.present[index] {
            return Ok(Progress::Duplicate {
                received: inner.received,
                required,
            });
        }
        inner.shards[index] = payload.to_vec();
        inner.present[index] = true;
        inner.received += 1;
        if inner.received < required {
            inner.state = State::Accumulating;
            return Ok(Progress::Accumulating {
                received: inner.received,
                required,
            });
        }

        // Hand the matrix to the caller; later shards are ignored
        inner.state = State::Reconstructing;
        let shards = std::mem::take(&mut inner.shards);
        let present = std::mem::take(&mut inner.present);
        Ok(Progress::Ready(Pending {
            parameters: self.header.parameters,
            commitment: self.header.commitment,
            shards,
            present,
        }))
    }

    /// Returns a receiver resolved once the session ends.
    ///
    /// Subscribing to an already-ended session resolves immediately.
    pub fn subscribe(&self) -> oneshot::Receiver<Completion> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        match &inner.completion {
            Some(completion) => {
                let _ = sender.send(completion.clone());
            }
            None => inner.waiters.push(sender),
        }
        receiver
    }

    /// Ends the session with `completion` and notifies every waiter.
    ///
    /// Returns `false` (and changes nothing) if the session had already ended.
    pub fn complete(&self, completion: Completion) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = match completion {
            Ok(_) => State::Reconstructed,
            Err(_) => State::Failed,
        };
        inner.shards = Vec::new();
        inner.present = Vec::new();
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(completion.clone());
        }
        inner.completion = Some(completion);
        true
    }

    /// Ends the session with `failure`.
    pub fn fail(&self, failure: Failure) -> bool {
        self.complete(Err(failure))
    }
}

/// Reconstructs the payload carried by a set of envelopes of one session.
///
/// Envelopes are used in order until enough distinct shards have been collected. Envelopes
/// whose header differs from the first are rejected.
pub fn reassemble(envelopes: &[ShardEnvelope]) -> Result<Bytes, Failure> {
    let Some(first) = envelopes.first() else {
        return Err(shardline_coding::Error::NotEnoughShards {
            present: 0,
            required: 1,
        }
        .into());
    };
    let aggregator = Aggregator::new(first.header, Instant::now());
    for envelope in envelopes {
        if !aggregator.matches(envelope) {
            return Err(Failure::ParameterMismatch);
        }
        for (index, payload) in envelope.shards() {
            // Envelopes decoded from the wire are already bounded to the session parameters
            if let Ok(Progress::Ready(pending)) = aggregator.set_shard(index, payload) {
                return pending.reconstruct();
            }
        }
    }
    Err(shardline_coding::Error::NotEnoughShards {
        present: aggregator.received(),
        required: aggregator.required(),
    }
    .into())
}
