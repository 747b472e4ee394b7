use super::{metrics::Metrics, Config};
use crate::{
    aggregator::{Aggregator, Completion, Failure, Outcome, Pending, Progress},
    envelope::{commit, CodecConfig, Direction, Header, Key, Parameters, SessionId, ShardEnvelope},
    fanout::{Fanout, Peer},
    registry::Registry,
    Dispatcher, Error, Transport,
};
use bytes::Bytes;
use prometheus_client::registry::Registry as MetricsRegistry;
use shardline_codec::{Decode, Encode};
use shardline_coding::Config as CodingConfig;
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

/// Summary of what posting an envelope did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The session is still waiting for shards.
    Accumulating { received: usize, required: usize },
    /// The envelope completed the session and it was reconstructed.
    Reconstructed,
    /// The session failed.
    Failed(Failure),
    /// The session had already completed; the shards were dropped.
    Stale,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accumulating { received, required } => {
                write!(f, "accumulating {received}/{required}")
            }
            Self::Reconstructed => f.write_str("reconstructed"),
            Self::Failed(failure) => write!(f, "failed: {failure}"),
            Self::Stale => f.write_str("stale"),
        }
    }
}

/// Reconstructs sessions from shards posted by peers and submits new sessions.
pub struct Engine<T: Transport, D: Dispatcher> {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    me: usize,
    servers: Vec<Peer>,
    shards_per_server: u16,
    coding: CodingConfig,
    session_timeout: Duration,
    prune_interval: Duration,
    codec: CodecConfig,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    registry: Registry,
    fanout: Fanout<T>,
    dispatcher: D,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    metrics: Metrics,
}

impl<T: Transport, D: Dispatcher> Engine<T, D> {
    /// Creates a new engine with the given configuration, registering its metrics.
    pub fn new(cfg: Config<T, D>, metrics: &mut MetricsRegistry) -> Result<Self, Error> {
        let servers = u16::try_from(cfg.servers.len())
            .map_err(|_| shardline_coding::Error::TooManyShards(cfg.servers.len()))?;
        let coding = CodingConfig::for_servers(servers, cfg.shards_per_server)?;
        if cfg.me >= servers {
            return Err(Error::InvalidServer(cfg.me));
        }
        Ok(Self {
            me: usize::from(cfg.me),
            servers: cfg.servers,
            shards_per_server: cfg.shards_per_server,
            coding,
            session_timeout: cfg.session_timeout,
            prune_interval: cfg.prune_interval,
            codec: cfg.codec,
            registry: Registry::new(cfg.tombstone_ttl),
            fanout: Fanout::new(cfg.transport, cfg.receive_path, metrics),
            dispatcher: cfg.dispatcher,
            metrics: Metrics::init(metrics),
        })
    }

    /// Starts the sweeper that fails sessions past their deadline.
    ///
    /// The sweeper exits once the engine is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let interval = self.prune_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("engine dropped, stopping sweeper");
                    return;
                };
                engine.prune();
            }
        })
    }

    /// The coding parameters used for sessions submitted by this server.
    pub fn coding(&self) -> &CodingConfig {
        &self.coding
    }

    /// The number of sessions in flight.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Returns the aggregator of an in-flight session.
    pub fn aggregator(&self, key: &Key) -> Option<Arc<Aggregator>> {
        self.registry.get(key)
    }

    /// Every server except this one.
    fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.servers
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.me)
            .map(|(_, peer)| peer)
    }

    /// Encodes `payload`, replicates it to every server and waits for the local dispatcher.
    ///
    /// Returns the dispatcher's response encoded as [Direction::Response] envelopes of the same
    /// session, one per server. An empty response produces no envelopes.
    pub async fn submit(
        &self,
        request_type: u16,
        payload: &[u8],
    ) -> Result<Vec<ShardEnvelope>, Error> {
        let encoded = shardline_coding::encode(&self.coding, payload)?;
        let header = Header {
            session: SessionId::random(),
            direction: Direction::Request,
            request_type,
            parameters: Parameters::from_encoded(&encoded),
            commitment: commit(payload),
        };
        let session = header.session;

        // Subscribe before any shard is posted so the outcome cannot be missed
        let aggregator = self
            .session(&header)
            .ok_or(Error::Completed(session))?;
        let outcome = aggregator.subscribe();

        // Each peer relays its own slice; ours goes out directly
        let mut envelopes = header.split(&encoded, self.shards_per_server);
        for (server, envelope) in envelopes.iter().enumerate() {
            if server == self.me {
                continue;
            }
            self.fanout
                .send(&self.servers[server], envelope.with_relay(true).encode().freeze());
        }
        let local = envelopes.swap_remove(self.me);
        self.fanout.broadcast(self.peers(), local.encode().freeze());
        info!(%session, request_type, len = payload.len(), "submitted request");
        self.post_shard(local).await?;

        // Wait for the local reconstruction (or the deadline)
        let completion = match tokio::time::timeout_at(aggregator.deadline(), outcome).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => return Err(Error::Abandoned),
            Err(_) => {
                self.finish(&aggregator, Err(Failure::Timeout));
                return Err(Error::Timeout);
            }
        };
        let outcome = completion.map_err(|failure| match failure {
            Failure::Timeout => Error::Timeout,
            failure => Error::SessionFailed(failure),
        })?;
        self.respond(&header, &outcome.response.unwrap_or_default())
    }

    /// Encodes a response to the session described by `request`.
    fn respond(&self, request: &Header, response: &[u8]) -> Result<Vec<ShardEnvelope>, Error> {
        if response.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = shardline_coding::encode(&self.coding, response)?;
        let header = Header {
            session: request.session,
            direction: Direction::Response,
            request_type: request.request_type,
            parameters: Parameters::from_encoded(&encoded),
            commitment: commit(response),
        };
        Ok(header.split(&encoded, self.shards_per_server))
    }

    /// Decodes an envelope received from a peer and posts it.
    pub async fn post_encoded(&self, bytes: Bytes) -> Result<Delivery, Error> {
        let envelope = ShardEnvelope::decode_cfg(bytes, &self.codec)?;
        self.post_shard(envelope).await
    }

    /// Routes the shards of `envelope` into their session.
    ///
    /// If the envelope completes the session, the payload is reconstructed and dispatched before
    /// this returns.
    pub async fn post_shard(&self, envelope: ShardEnvelope) -> Result<Delivery, Error> {
        let session = envelope.header.session;
        let Some(aggregator) = self.session(&envelope.header) else {
            self.metrics
                .shards_stale
                .inc_by(envelope.indices.len() as u64);
            debug!(%session, "dropped shards of completed session");
            return Ok(Delivery::Stale);
        };
        if !aggregator.matches(&envelope) {
            warn!(%session, "envelope does not match session parameters");
            return Ok(self.finish(&aggregator, Err(Failure::ParameterMismatch)));
        }

        // Relay only for sessions still open here
        if envelope.relay {
            let payload = envelope.with_relay(false).encode().freeze();
            self.fanout.broadcast(self.peers(), payload);
            debug!(%session, "relayed envelope");
        }

        let mut delivery = Delivery::Stale;
        for (index, payload) in envelope.shards() {
            match aggregator.set_shard(index, payload)? {
                Progress::Accumulating { received, required } => {
                    self.metrics.shards_received.inc();
                    trace!(%session, index, received, required, "stored shard");
                    delivery = Delivery::Accumulating { received, required };
                }
                Progress::Duplicate { received, required } => {
                    self.metrics.shards_duplicate.inc();
                    trace!(%session, index, "duplicate shard");
                    delivery = Delivery::Accumulating { received, required };
                }
                Progress::Ignored => {
                    self.metrics.shards_stale.inc();
                }
                Progress::Ready(pending) => {
                    self.metrics.shards_received.inc();
                    return Ok(self.reconstruct(&aggregator, pending).await);
                }
            }
        }
        Ok(delivery)
    }

    /// Fails every session past its deadline.
    ///
    /// Returns the number of sessions expired.
    pub fn prune(&self) -> usize {
        let expired = self.registry.prune(Instant::now());
        for aggregator in &expired {
            if aggregator.fail(Failure::Timeout) {
                warn!(session = %aggregator.header().session, "session expired");
                self.metrics.sessions_expired.inc();
            }
        }
        self.metrics.active_sessions.set(self.registry.len() as i64);
        expired.len()
    }

    /// Returns the aggregator for `header`, creating it if needed.
    fn session(&self, header: &Header) -> Option<Arc<Aggregator>> {
        let deadline = Instant::now() + self.session_timeout;
        let (aggregator, created) = self
            .registry
            .get_or_create(header.key(), || Aggregator::new(*header, deadline))?;
        if created {
            debug!(session = %header.session, direction = ?header.direction, "created session");
            self.metrics.sessions_created.inc();
            self.metrics.active_sessions.set(self.registry.len() as i64);
        }
        Some(aggregator)
    }

    /// Decodes the session payload and, for requests, dispatches it.
    async fn reconstruct(&self, aggregator: &Aggregator, pending: Pending) -> Delivery {
        let header = *aggregator.header();
        let session = header.session;
        let payload = match pending.reconstruct() {
            Ok(payload) => payload,
            Err(failure) => {
                warn!(%session, %failure, "reconstruction failed");
                return self.finish(aggregator, Err(failure));
            }
        };
        debug!(%session, len = payload.len(), "reconstructed payload");

        let completion = match header.direction {
            Direction::Response => Ok(Outcome {
                payload,
                response: None,
            }),
            Direction::Request => {
                match self
                    .dispatcher
                    .dispatch(header.request_type, payload.clone())
                    .await
                {
                    Ok(response) => Ok(Outcome {
                        payload,
                        response: Some(response),
                    }),
                    Err(err) => {
                        warn!(%session, %err, "dispatch failed");
                        Err(Failure::Dispatch(err.to_string()))
                    }
                }
            }
        };
        self.finish(aggregator, completion)
    }

    /// Ends the session and tombstones it.
    fn finish(&self, aggregator: &Aggregator, completion: Completion) -> Delivery {
        let delivery = match &completion {
            Ok(_) => Delivery::Reconstructed,
            Err(failure) => Delivery::Failed(failure.clone()),
        };
        let completed = aggregator.complete(completion);
        self.registry.remove(&aggregator.key());
        self.metrics.active_sessions.set(self.registry.len() as i64);
        if !completed {
            // Another caller (usually the sweeper) ended the session first
            return Delivery::Stale;
        }
        match &delivery {
            Delivery::Reconstructed => self.metrics.sessions_reconstructed.inc(),
            Delivery::Failed(Failure::Timeout) => self.metrics.sessions_expired.inc(),
            _ => self.metrics.sessions_failed.inc(),
        };
        delivery
    }
}
