//! Replicate requests across servers and reconstruct them exactly once per server.
//!
//! # Overview
//!
//! The core of the module is the [Engine]. It is responsible for:
//! - Encoding submitted requests and distributing their slices to peers
//! - Relaying slices on behalf of the submitting server
//! - Routing inbound shards into per-session aggregators
//! - Reconstructing and dispatching each session once enough shards have arrived
//! - Failing sessions that do not complete before their deadline
//!
//! # Details
//!
//! Inbound envelopes are handled on the caller's task: the call that stores the
//! `data_shards`-th distinct shard of a session decodes the payload and dispatches it before
//! returning. Concurrent calls for the same session meet in a single aggregator, so no matter
//! how shards are interleaved the session is dispatched at most once.
//!
//! Completed sessions are tombstoned so that shards still in flight are dropped rather than
//! starting a new session. The sweeper started by [Engine::start] fails sessions that never
//! reach the threshold.

mod config;
pub use config::Config;
mod engine;
pub use engine::{Delivery, Engine};
mod metrics;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregator::{reassemble, Failure},
        envelope::{commit, CodecConfig, Direction, Header, Parameters, SessionId, ShardEnvelope},
        fanout::Peer,
        mocks::{Echo, Network, Reject},
        Dispatcher, Error,
    };
    use bytes::Bytes;
    use futures::{channel::mpsc, StreamExt};
    use prometheus_client::registry::Registry;
    use shardline_codec::{Decode, Encode};
    use shardline_coding::{encode, Config as CodingConfig};
    use std::{sync::Arc, time::Duration};
    use tokio::sync::Barrier;

    const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

    fn servers(n: u16) -> Vec<Peer> {
        (0..n)
            .map(|i| Peer {
                name: format!("server-{i}"),
                address: format!("server-{i}"),
                timeout: Duration::from_secs(1),
            })
            .collect()
    }

    fn engine<D: Dispatcher>(
        network: &Network,
        me: u16,
        n: u16,
        dispatcher: D,
    ) -> Arc<Engine<Network, D>> {
        let cfg = Config {
            me,
            servers: servers(n),
            shards_per_server: 1,
            session_timeout: SESSION_TIMEOUT,
            tombstone_ttl: Duration::from_secs(60),
            prune_interval: Duration::from_millis(100),
            codec: CodecConfig::default(),
            receive_path: "/shards".to_string(),
            transport: network.clone(),
            dispatcher,
        };
        Arc::new(Engine::new(cfg, &mut Registry::default()).unwrap())
    }

    /// Posts everything arriving in `inbox` to `engine`, one task per envelope.
    fn serve<D: Dispatcher>(engine: Arc<Engine<Network, D>>, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
        tokio::spawn(async move {
            while let Some(bytes) = inbox.next().await {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let _ = engine.post_encoded(bytes).await;
                });
            }
        });
    }

    /// Starts `n` servers, leaving those in `down` unreachable.
    fn cluster(network: &Network, n: u16, down: &[u16]) -> Vec<(Arc<Engine<Network, Echo>>, Echo)> {
        (0..n)
            .map(|i| {
                let inbox = network.register(&format!("server-{i}"));
                let dispatcher = Echo::default();
                let engine = engine(network, i, n, dispatcher.clone());
                if down.contains(&i) {
                    network.block(&format!("server-{i}"));
                } else {
                    engine.start();
                    serve(engine.clone(), inbox);
                }
                (engine, dispatcher)
            })
            .collect()
    }

    async fn wait_for_calls(dispatcher: &Echo, calls: usize) {
        for _ in 0..200 {
            if dispatcher.calls().len() >= calls {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dispatcher was not called");
    }

    fn request(n: u16, payload: &[u8]) -> (Header, Vec<ShardEnvelope>) {
        let config = CodingConfig::for_servers(n, 1).unwrap();
        let encoded = encode(&config, payload).unwrap();
        let header = Header {
            session: SessionId::random(),
            direction: Direction::Request,
            request_type: 9,
            parameters: Parameters::from_encoded(&encoded),
            commitment: commit(payload),
        };
        let envelopes = header.split(&encoded, 1);
        (header, envelopes)
    }

    #[tokio::test]
    async fn test_submit_replicates_to_every_server() {
        let network = Network::default();
        let cluster = cluster(&network, 3, &[]);

        let response = cluster[0].0.submit(7, b"HelloWorld").await.unwrap();
        assert_eq!(response.len(), 3);
        assert!(response
            .iter()
            .all(|envelope| envelope.header.direction == Direction::Response));
        assert_eq!(&reassemble(&response).unwrap()[..], b"HelloWorld");

        // Every server dispatches the request exactly once
        for (_, dispatcher) in &cluster {
            wait_for_calls(dispatcher, 1).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for (engine, dispatcher) in &cluster {
            assert_eq!(
                dispatcher.calls(),
                vec![(7, Bytes::from_static(b"HelloWorld"))]
            );
            assert_eq!(engine.active_sessions(), 0);
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer_tolerated() {
        let network = Network::default();
        let cluster = cluster(&network, 3, &[2]);

        let payload = b"one server is down";
        let response = cluster[0].0.submit(1, payload).await.unwrap();
        assert_eq!(&reassemble(&response[..2]).unwrap()[..], payload);

        wait_for_calls(&cluster[1].1, 1).await;
        assert!(cluster[2].1.calls().is_empty());
    }

    #[tokio::test]
    async fn test_relay_rebroadcasts() {
        let network = Network::default();
        let mut inbox0 = network.register("server-0");
        let mut inbox2 = network.register("server-2");
        let engine = engine(&network, 1, 3, Echo::default());

        let (_, envelopes) = request(3, b"relay this");
        let relayed = envelopes[1].with_relay(true);
        let delivery = engine.post_shard(relayed).await.unwrap();
        assert_eq!(
            delivery,
            Delivery::Accumulating {
                received: 1,
                required: 2
            }
        );

        for inbox in [&mut inbox0, &mut inbox2] {
            let bytes = inbox.next().await.unwrap();
            let forwarded = ShardEnvelope::decode_cfg(bytes, &CodecConfig::default()).unwrap();
            assert_eq!(forwarded, envelopes[1]);
            assert!(!forwarded.relay);
        }
    }

    #[tokio::test]
    async fn test_late_relay_not_rebroadcast() {
        let network = Network::default();
        let mut inbox0 = network.register("server-0");
        let mut inbox2 = network.register("server-2");
        let engine = engine(&network, 1, 3, Echo::default());

        let (_, envelopes) = request(3, b"completed before relay");
        engine.post_shard(envelopes[0].clone()).await.unwrap();
        assert_eq!(
            engine.post_shard(envelopes[2].clone()).await.unwrap(),
            Delivery::Reconstructed
        );

        // The session is tombstoned, so the relay flag is ignored
        let relayed = envelopes[1].with_relay(true);
        assert_eq!(engine.post_shard(relayed).await.unwrap(), Delivery::Stale);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inbox0.try_next().is_err());
        assert!(inbox2.try_next().is_err());
    }

    #[tokio::test]
    async fn test_hello_world_partial_delivery() {
        let network = Network::default();
        let dispatcher = Echo::default();
        let engine = engine(&network, 0, 3, dispatcher.clone());

        // Shard 1 never arrives
        let (header, envelopes) = request(3, b"HelloWorld");
        assert_eq!(header.parameters.shard_length, 6);
        assert_eq!(
            engine.post_shard(envelopes[0].clone()).await.unwrap(),
            Delivery::Accumulating {
                received: 1,
                required: 2
            }
        );
        assert_eq!(
            engine.post_shard(envelopes[2].clone()).await.unwrap(),
            Delivery::Reconstructed
        );
        assert_eq!(
            dispatcher.calls(),
            vec![(9, Bytes::from_static(b"HelloWorld"))]
        );

        // Late shards are dropped
        assert_eq!(
            engine.post_shard(envelopes[1].clone()).await.unwrap(),
            Delivery::Stale
        );
        assert_eq!(dispatcher.calls().len(), 1);
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_shard_not_counted() {
        let network = Network::default();
        let dispatcher = Echo::default();
        let engine = engine(&network, 0, 5, dispatcher.clone());

        let (_, envelopes) = request(5, b"duplicates");
        for _ in 0..3 {
            assert_eq!(
                engine.post_shard(envelopes[4].clone()).await.unwrap(),
                Delivery::Accumulating {
                    received: 1,
                    required: 3
                }
            );
        }
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_posts_share_aggregator() {
        let network = Network::default();
        let engine = engine(&network, 0, 5, Echo::default());
        let (header, envelopes) = request(5, b"concurrent arrivals");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = envelopes[..2]
            .iter()
            .cloned()
            .map(|envelope| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    engine.post_shard(envelope).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Delivery::Accumulating { required: 3, .. }
            ));
        }

        assert_eq!(engine.active_sessions(), 1);
        let aggregator = engine.aggregator(&header.key()).unwrap();
        assert_eq!(aggregator.received(), 2);
    }

    #[tokio::test]
    async fn test_parameter_mismatch_fails_session() {
        let network = Network::default();
        let dispatcher = Echo::default();
        let engine = engine(&network, 0, 3, dispatcher.clone());

        let (header, envelopes) = request(3, b"mismatch");
        engine.post_shard(envelopes[0].clone()).await.unwrap();
        let waiter = engine.aggregator(&header.key()).unwrap().subscribe();

        let mut conflicting = envelopes[1].clone();
        conflicting.header.request_type += 1;
        assert_eq!(
            engine.post_shard(conflicting).await.unwrap(),
            Delivery::Failed(Failure::ParameterMismatch)
        );
        assert_eq!(waiter.await.unwrap(), Err(Failure::ParameterMismatch));
        assert_eq!(
            engine.post_shard(envelopes[1].clone()).await.unwrap(),
            Delivery::Stale
        );
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_shard_fails_commitment() {
        let network = Network::default();
        let dispatcher = Echo::default();
        let engine = engine(&network, 0, 3, dispatcher.clone());

        let (_, mut envelopes) = request(3, b"HelloWorld");
        let mut corrupted = envelopes[0].payloads[0].to_vec();
        corrupted[0] ^= 0x01;
        envelopes[0].payloads[0] = corrupted.into();

        engine.post_shard(envelopes[0].clone()).await.unwrap();
        assert_eq!(
            engine.post_shard(envelopes[1].clone()).await.unwrap(),
            Delivery::Failed(Failure::CommitmentMismatch)
        );
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_failure_reported() {
        // A lone server holds every shard itself
        let network = Network::default();
        let engine = engine(&network, 0, 1, Reject);
        assert!(matches!(
            engine.submit(3, b"rejected request").await,
            Err(Error::SessionFailed(Failure::Dispatch(_)))
        ));
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_empty_response_has_no_envelopes() {
        #[derive(Clone)]
        struct Silent;

        impl Dispatcher for Silent {
            type Error = &'static str;

            async fn dispatch(&self, _: u16, _: Bytes) -> Result<Bytes, &'static str> {
                Ok(Bytes::new())
            }
        }

        let network = Network::default();
        let engine = engine(&network, 0, 1, Silent);
        assert!(engine.submit(3, b"fire and forget").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_times_out() {
        let network = Network::default();
        let cluster = cluster(&network, 3, &[1, 2]);
        let (engine, dispatcher) = &cluster[0];

        let start = tokio::time::Instant::now();
        assert!(matches!(
            engine.submit(5, b"nobody answers").await,
            Err(Error::Timeout)
        ));
        assert!(start.elapsed() >= SESSION_TIMEOUT);
        assert_eq!(engine.active_sessions(), 0);
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_sessions() {
        let network = Network::default();
        let engine = engine(&network, 0, 3, Echo::default());
        let sweeper = engine.start();

        let (header, envelopes) = request(3, b"abandoned");
        engine.post_shard(envelopes[0].clone()).await.unwrap();
        let waiter = engine.aggregator(&header.key()).unwrap().subscribe();
        assert_eq!(engine.active_sessions(), 1);

        // The waiter resolves once the sweeper runs past the deadline
        assert_eq!(waiter.await.unwrap(), Err(Failure::Timeout));
        assert_eq!(engine.active_sessions(), 0);
        assert_eq!(
            engine.post_shard(envelopes[1].clone()).await.unwrap(),
            Delivery::Stale
        );

        // Dropping the engine stops the sweeper
        drop(engine);
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_envelope_rejected() {
        let network = Network::default();
        let engine = engine(&network, 0, 3, Echo::default());
        assert!(matches!(
            engine.post_encoded(Bytes::from_static(b"garbage")).await,
            Err(Error::Codec(_))
        ));

        let (_, envelopes) = request(3, b"truncated");
        let encoded = envelopes[0].encode().freeze();
        assert!(matches!(
            engine.post_encoded(encoded.slice(..encoded.len() - 1)).await,
            Err(Error::Codec(_))
        ));
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn test_invalid_config() {
        let network = Network::default();
        let cfg = Config {
            me: 3,
            servers: servers(3),
            shards_per_server: 1,
            session_timeout: SESSION_TIMEOUT,
            tombstone_ttl: Duration::from_secs(60),
            prune_interval: Duration::from_millis(100),
            codec: CodecConfig::default(),
            receive_path: "/shards".to_string(),
            transport: network,
            dispatcher: Echo::default(),
        };
        assert!(matches!(
            Engine::new(cfg, &mut Registry::default()),
            Err(Error::InvalidServer(3))
        ));
    }
}
