//! The live room relay: owns the set of open connections and fans every
//! well-formed inbound payload out to all of them, sender included.
//!
//! The relay never touches sockets. Transports hand it [`Event`]s and it
//! answers through the [`Peer`] each connection registered with.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::message;

pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Outbound half of a connection as seen by the relay.
///
/// `send` must return without waiting on the network. Transports that can
/// stall queue the frame and write it from their own task.
pub trait Peer: Send + Sync + 'static {
    fn is_open(&self) -> bool;
    fn send(&self, text: &str) -> Result<(), SendError>;
}

#[derive(Debug)]
pub enum Event<P> {
    Connect { id: ConnectionId, peer: P },
    Message { id: ConnectionId, payload: Vec<u8> },
    Close { id: ConnectionId },
    Error { id: ConnectionId, error: String },
}

pub struct Relay<P> {
    state: Mutex<ActiveSet<P>>,
    next_id: AtomicU64,
    welcome: String,
}

struct ActiveSet<P> {
    peers: HashMap<ConnectionId, Arc<P>>,
    /// Set by [`Relay::shutdown`]; later connects are refused.
    closed: bool,
}

impl<P: Peer> Default for Relay<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Peer> Relay<P> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ActiveSet {
                peers: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            welcome: message::welcome_frame(),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn dispatch(&self, event: Event<P>) {
        match event {
            Event::Connect { id, peer } => self.on_connect(id, peer).await,
            Event::Message { id, payload } => {
                self.on_message(id, &payload).await;
            }
            Event::Close { id } => {
                self.on_disconnect(id).await;
            }
            Event::Error { id, error } => {
                self.on_transport_error(id, &error).await;
            }
        }
    }

    pub async fn on_connect(&self, id: ConnectionId, peer: P) {
        // The welcome is queued before the lock is released so no fan-out
        // snapshot can reach this peer ahead of it.
        let mut state = self.state.lock().await;
        if state.closed {
            // Dropping the peer lets its transport wind down.
            info!(connection = id, "relay is shut down, refusing connection");
            return;
        }
        let peer = Arc::new(peer);
        let peers = &mut state.peers;
        if peers.insert(id, Arc::clone(&peer)).is_some() {
            warn!(connection = id, "connection id reused, replacing peer");
        }
        if let Err(error) = peer.send(&self.welcome) {
            warn!(connection = id, %error, "failed to deliver welcome");
        }
        info!(connection = id, active = peers.len(), "participant connected");
    }

    /// Forwards `payload` to every open connection and returns how many
    /// accepted it. Malformed payloads are dropped without touching the
    /// sender's membership.
    pub async fn on_message(&self, id: ConnectionId, payload: &[u8]) -> usize {
        let value = match message::decode(payload) {
            Ok(value) => value,
            Err(error) => {
                warn!(connection = id, %error, "discarding malformed payload");
                return 0;
            }
        };

        let targets: Vec<(ConnectionId, Arc<P>)> = {
            let state = self.state.lock().await;
            let peers = &state.peers;
            if !peers.contains_key(&id) {
                debug!(connection = id, "ignoring message from unknown connection");
                return 0;
            }
            peers
                .iter()
                .map(|(target, peer)| (*target, Arc::clone(peer)))
                .collect()
        };

        let frame = value.get();
        let mut delivered = 0;
        for (target, peer) in targets {
            if !peer.is_open() {
                debug!(connection = target, "skipping closed connection");
                continue;
            }
            match peer.send(frame) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(connection = target, %error, "failed to forward message");
                }
            }
        }

        debug!(connection = id, delivered, "fanned out message");
        delivered
    }

    /// Returns whether the connection was still a member.
    pub async fn on_disconnect(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.peers.remove(&id).is_some();
        if removed {
            info!(connection = id, active = state.peers.len(), "participant disconnected");
        }
        removed
    }

    pub async fn on_transport_error(&self, id: ConnectionId, error: &str) -> bool {
        warn!(connection = id, error, "transport error");
        self.on_disconnect(id).await
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Drops every peer handle so their transports can wind down and refuses
    /// any connection that arrives afterwards. Returns the number of
    /// connections cleared.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.lock().await;
        state.closed = true;
        let cleared = state.peers.len();
        state.peers.clear();
        info!(cleared, "live room relay shut down");
        cleared
    }
}
