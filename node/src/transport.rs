//! Deliver envelopes to peers over HTTP.

use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client};
use shardline_replication::{fanout::Peer, Transport};
use std::future::Future;

/// Content type of encoded envelopes.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Posts envelopes to `{peer.address}{path}`.
#[derive(Clone)]
pub struct Http {
    client: Client,
}

impl Http {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().build()?,
        })
    }
}

impl Transport for Http {
    type Error = reqwest::Error;

    fn send(
        &self,
        peer: &Peer,
        path: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), reqwest::Error>> + Send {
        let url = format!("{}{}", peer.address.trim_end_matches('/'), path);
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .timeout(peer.timeout)
            .body(payload);
        async move {
            request.send().await?.error_for_status()?;
            Ok(())
        }
    }
}
