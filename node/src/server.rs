//! HTTP endpoints.

use crate::{
    dispatcher::Echo,
    transport::{Http, OCTET_STREAM},
};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    serve, Router,
};
use bytes::Bytes;
use prometheus_client::{encoding::text::encode, registry::Registry};
use shardline_codec::Encode;
use shardline_replication::{Engine, Error};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Content type of the Prometheus text exposition.
const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// The engine served by a node.
pub type NodeEngine = Engine<Http, Echo>;

#[derive(Clone)]
struct App {
    engine: Arc<NodeEngine>,
    registry: Arc<Registry>,
}

/// Builds the router serving `engine` and the metrics in `registry`.
///
/// Bodies larger than `body_limit` bytes are rejected with `413 Payload Too Large`.
pub fn router(
    engine: Arc<NodeEngine>,
    registry: Arc<Registry>,
    receive_path: &str,
    body_limit: usize,
) -> Router {
    Router::new()
        .route(receive_path, post(post_shard))
        .route("/requests/{request_type}", post(post_request))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(App { engine, registry })
}

/// Serves `router` on `listener` until the listener fails.
pub async fn run(listener: TcpListener, router: Router) -> std::io::Result<()> {
    serve(listener, router.into_make_service()).await
}

async fn post_shard(State(app): State<App>, body: Bytes) -> Response {
    match app.engine.post_encoded(body).await {
        Ok(delivery) => (StatusCode::OK, delivery.to_string()).into_response(),
        Err(err) => {
            debug!(%err, "rejected envelope");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

async fn post_request(
    State(app): State<App>,
    Path(request_type): Path<u16>,
    body: Bytes,
) -> Response {
    match app.engine.submit(request_type, &body).await {
        Ok(envelopes) => (
            StatusCode::OK,
            [(CONTENT_TYPE, OCTET_STREAM)],
            envelopes.encode().freeze(),
        )
            .into_response(),
        Err(Error::Timeout) => {
            warn!(request_type, "request timed out");
            (StatusCode::GATEWAY_TIMEOUT, Error::Timeout.to_string()).into_response()
        }
        Err(err) => {
            warn!(request_type, %err, "request failed");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

async fn metrics(State(app): State<App>) -> Response {
    let mut buffer = String::new();
    match encode(&mut buffer, &app.registry) {
        Ok(()) => ([(CONTENT_TYPE, OPENMETRICS)], buffer).into_response(),
        Err(err) => {
            warn!(%err, "could not encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
