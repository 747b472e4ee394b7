use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for the [`Engine`](super::Engine)
#[derive(Default)]
pub struct Metrics {
    /// Number of sessions created
    pub sessions_created: Counter,
    /// Number of sessions reconstructed successfully
    pub sessions_reconstructed: Counter,
    /// Number of sessions that failed
    pub sessions_failed: Counter,
    /// Number of sessions that expired before completing
    pub sessions_expired: Counter,
    /// Number of distinct shards stored
    pub shards_received: Counter,
    /// Number of shards received for an already filled slot
    pub shards_duplicate: Counter,
    /// Number of shards received for a completed session
    pub shards_stale: Counter,
    /// Number of sessions in flight
    pub active_sessions: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "sessions_created",
            "Number of sessions created",
            metrics.sessions_created.clone(),
        );
        registry.register(
            "sessions_reconstructed",
            "Number of sessions reconstructed successfully",
            metrics.sessions_reconstructed.clone(),
        );
        registry.register(
            "sessions_failed",
            "Number of sessions that failed",
            metrics.sessions_failed.clone(),
        );
        registry.register(
            "sessions_expired",
            "Number of sessions that expired before completing",
            metrics.sessions_expired.clone(),
        );
        registry.register(
            "shards_received",
            "Number of distinct shards stored",
            metrics.shards_received.clone(),
        );
        registry.register(
            "shards_duplicate",
            "Number of shards received for an already filled slot",
            metrics.shards_duplicate.clone(),
        );
        registry.register(
            "shards_stale",
            "Number of shards received for a completed session",
            metrics.shards_stale.clone(),
        );
        registry.register(
            "active_sessions",
            "Number of sessions in flight",
            metrics.active_sessions.clone(),
        );
        metrics
    }
}
