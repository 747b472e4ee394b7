//! In-memory [Transport] and [Dispatcher] implementations for tests.

use crate::{fanout::Peer, Dispatcher, Transport};
use bytes::Bytes;
use futures::{channel::mpsc, future::Either};
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    future::Future,
    sync::{Arc, Mutex},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
}

#[derive(Default)]
struct State {
    inboxes: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    blocked: HashSet<String>,
    stalled: HashSet<String>,
}

/// A network of in-memory inboxes keyed by peer address.
#[derive(Clone, Default)]
pub struct Network {
    state: Arc<Mutex<State>>,
}

impl Network {
    /// Creates the inbox for `address`.
    pub fn register(&self, address: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (sender, receiver) = mpsc::unbounded();
        self.state
            .lock()
            .unwrap()
            .inboxes
            .insert(address.to_string(), sender);
        receiver
    }

    /// Makes every send to `address` fail immediately.
    pub fn block(&self, address: &str) {
        self.state
            .lock()
            .unwrap()
            .blocked
            .insert(address.to_string());
    }

    /// Makes every send to `address` hang forever.
    pub fn stall(&self, address: &str) {
        self.state
            .lock()
            .unwrap()
            .stalled
            .insert(address.to_string());
    }
}

impl Transport for Network {
    type Error = Error;

    fn send(
        &self,
        peer: &Peer,
        _path: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        let state = self.state.lock().unwrap();
        if state.stalled.contains(&peer.address) {
            return Either::Left(futures::future::pending::<Result<(), Error>>());
        }
        let result = match state.inboxes.get(&peer.address) {
            Some(inbox) if !state.blocked.contains(&peer.address) => inbox
                .unbounded_send(payload)
                .map_err(|_| Error::Unreachable(peer.address.clone())),
            _ => Err(Error::Unreachable(peer.address.clone())),
        };
        Either::Right(futures::future::ready(result))
    }
}

/// Returns every request unchanged and records each call.
#[derive(Clone, Default)]
pub struct Echo {
    calls: Arc<Mutex<Vec<(u16, Bytes)>>>,
}

impl Echo {
    pub fn calls(&self) -> Vec<(u16, Bytes)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dispatcher for Echo {
    type Error = Infallible;

    fn dispatch(
        &self,
        request_type: u16,
        payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, Infallible>> + Send {
        self.calls
            .lock()
            .unwrap()
            .push((request_type, payload.clone()));
        futures::future::ready(Ok(payload))
    }
}

/// Rejects every request.
#[derive(Clone, Default)]
pub struct Reject;

impl Dispatcher for Reject {
    type Error = &'static str;

    fn dispatch(
        &self,
        _request_type: u16,
        _payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, &'static str>> + Send {
        futures::future::ready(Err("rejected"))
    }
}
