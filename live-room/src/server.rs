use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::SplitSink,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::relay::{ConnectionId, Event, Peer, Relay, SendError};

pub type SharedRelay = Arc<Relay<SocketPeer>>;

/// Relay-facing half of a websocket. Frames are queued here and written by
/// the connection's own writer task.
#[derive(Debug)]
pub struct SocketPeer {
    outbound: mpsc::UnboundedSender<String>,
}

impl Peer for SocketPeer {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        self.outbound
            .send(text.to_owned())
            .map_err(|_| SendError::Closed)
    }
}

pub struct Server {
    listener: TcpListener,
    relay: SharedRelay,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            relay: Arc::new(Relay::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> SharedRelay {
        Arc::clone(&self.relay)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, relay } = self;
        let app = router(Arc::clone(&relay));

        let signal = async move {
            shutdown.await;
            info!("live room shutting down");
            relay.shutdown().await;
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .context("live room server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(relay: SharedRelay) -> Router {
    Router::new()
        .route("/ws", get(live_room_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
}

async fn health_handler(State(relay): State<SharedRelay>) -> Json<Health> {
    Json(Health {
        status: "ok",
        connections: relay.active_count().await,
    })
}

async fn live_room_handler(
    State(relay): State<SharedRelay>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, relay))
}

type WriterOutcome = Result<Result<(), axum::Error>, JoinError>;

async fn run_session(socket: WebSocket, relay: SharedRelay) {
    let id = relay.next_id();
    let (sink, mut stream) = socket.split();
    let (outbound, inbox) = mpsc::unbounded_channel();

    relay
        .dispatch(Event::Connect {
            id,
            peer: SocketPeer { outbound },
        })
        .await;
    let mut writer: JoinHandle<Result<(), axum::Error>> =
        tokio::spawn(write_frames(sink, inbox));

    let mut ended = None;
    while ended.is_none() {
        tokio::select! {
            frame = stream.next() => {
                ended = handle_frame(&relay, id, frame).await;
            }
            written = &mut writer => {
                ended = Some(writer_stopped(id, written));
            }
        }
    }

    if let Some(event) = ended {
        relay.dispatch(event).await;
    }
}

async fn handle_frame(
    relay: &SharedRelay,
    id: ConnectionId,
    frame: Option<Result<Message, axum::Error>>,
) -> Option<Event<SocketPeer>> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            relay
                .dispatch(Event::Message {
                    id,
                    payload: text.into_bytes(),
                })
                .await;
            None
        }
        Some(Ok(Message::Binary(payload))) => {
            relay.dispatch(Event::Message { id, payload }).await;
            None
        }
        Some(Ok(Message::Close(_))) | None => Some(Event::Close { id }),
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => None,
        Some(Err(error)) => Some(Event::Error {
            id,
            error: error.to_string(),
        }),
    }
}

fn writer_stopped(id: ConnectionId, outcome: WriterOutcome) -> Event<SocketPeer> {
    match outcome {
        Ok(Ok(())) => {
            debug!(connection = id, "writer released by relay");
            Event::Close { id }
        }
        Ok(Err(error)) => Event::Error {
            id,
            error: error.to_string(),
        },
        Err(error) => Event::Error {
            id,
            error: error.to_string(),
        },
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut inbox: mpsc::UnboundedReceiver<String>,
) -> Result<(), axum::Error> {
    while let Some(text) = inbox.recv().await {
        sink.send(Message::Text(text)).await?;
    }

    // The relay dropped this connection; say goodbye if the socket is still up.
    if let Err(error) = sink.close().await {
        debug!(?error, "failed to close websocket cleanly");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn health_reports_active_connections() {
        let relay: SharedRelay = Arc::new(Relay::new());
        let (outbound, _inbox) = mpsc::unbounded_channel();
        relay
            .dispatch(Event::Connect {
                id: relay.next_id(),
                peer: SocketPeer { outbound },
            })
            .await;

        let response = router(Arc::clone(&relay))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router is infallible");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let health: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(health, serde_json::json!({ "status": "ok", "connections": 1 }));
    }

    #[tokio::test]
    async fn failed_writer_is_reported_as_error_and_leaves_the_room() {
        let relay: SharedRelay = Arc::new(Relay::new());
        let id = relay.next_id();
        let (outbound, _inbox) = mpsc::unbounded_channel();
        relay
            .dispatch(Event::Connect {
                id,
                peer: SocketPeer { outbound },
            })
            .await;

        let broken_pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer reset");
        let event = writer_stopped(id, Ok(Err(axum::Error::new(broken_pipe))));
        assert!(
            matches!(&event, Event::Error { id: failed, error } if *failed == id && error.contains("peer reset")),
            "expected an error event, got {event:?}"
        );

        relay.dispatch(event).await;
        assert_eq!(relay.active_count().await, 0);
    }

    #[test]
    fn released_writer_is_reported_as_close() {
        let event = writer_stopped(7, Ok(Ok(())));
        assert!(matches!(event, Event::Close { id: 7 }));
    }

    #[tokio::test]
    async fn socket_peer_reports_closed_once_writer_is_gone() {
        let (outbound, inbox) = mpsc::unbounded_channel();
        let peer = SocketPeer { outbound };
        assert!(peer.is_open());
        assert!(peer.send("{}").is_ok());

        drop(inbox);
        assert!(!peer.is_open());
        assert!(matches!(peer.send("{}"), Err(SendError::Closed)));
    }
}
