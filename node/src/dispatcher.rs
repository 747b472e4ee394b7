//! Request processing.

use bytes::Bytes;
use shardline_replication::Dispatcher;
use std::{convert::Infallible, future::Future};
use tracing::info;

/// Answers every request with its own payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct Echo;

impl Dispatcher for Echo {
    type Error = Infallible;

    fn dispatch(
        &self,
        request_type: u16,
        payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, Infallible>> + Send {
        info!(request_type, len = payload.len(), "dispatched request");
        std::future::ready(Ok(payload))
    }
}
