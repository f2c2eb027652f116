//! WebSocket clients of the connection hub.
//!
//! Every upgraded socket is split: the write half lives in a [`WsConnection`]
//! owned by the hub, the read half stays with the task serving the socket and
//! enforces the pong deadline.

use crate::server::ServerState;
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use quizboard_core::{Connection, ConnectionId, QuizError, Result};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// Bound on flushing the close frame to a peer that may already be gone.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

pub async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let limit = state.websocket.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

/// Keep-alive side of a connection, driven by [`ping_loop`].
#[async_trait]
trait Heartbeat: Connection {
    async fn ping(&self) -> Result<()>;

    /// Resolves once [`Connection::close`] has been called.
    async fn wait_closed(&self);
}

pub struct WsConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: watch::Sender<bool>,
}

impl WsConnection {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: ConnectionId::new(),
            sink: Mutex::new(sink),
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(QuizError::Connection("connection closed".to_string()));
        }
        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| QuizError::Connection(format!("payload is not UTF-8: {}", e)))?;

        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| QuizError::Connection(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let flushed = tokio::time::timeout(CLOSE_WAIT, async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            sink.close().await
        })
        .await;
        if !matches!(flushed, Ok(Ok(()))) {
            tracing::debug!("Connection {} closed without a clean close handshake", self.id);
        }
    }
}

#[async_trait]
impl Heartbeat for WsConnection {
    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(QuizError::Connection("connection closed".to_string()));
        }
        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| QuizError::Connection(e.to_string()))
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        loop {
            let is_closed = *closed.borrow_and_update();
            if is_closed || closed.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn serve_socket(socket: WebSocket, state: Arc<ServerState>) {
    let settings = state.websocket.clone();
    let (sink, stream) = socket.split();
    let connection = WsConnection::new(sink);
    let id = connection.id();

    state.hub.add(connection.clone()).await;
    tracing::info!("WebSocket connection {} opened", id);

    let pinger = tokio::spawn(ping_loop(
        connection.clone(),
        settings.ping_period(),
        settings.write_wait(),
    ));

    let end = read_until_closed(id, stream, connection.wait_closed(), settings.pong_wait()).await;

    state.hub.remove(id).await;
    connection.close().await;
    let _ = pinger.await;
    tracing::info!("WebSocket connection {} closed ({:?})", id, end);
}

/// Why the read half of a socket stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    /// The connection was closed from our side.
    Closed,
    PongTimeout,
    PeerClosed,
    ReadError,
}

/// Drains inbound frames until the connection closes or the peer stops
/// answering pings. Only a pong moves the deadline; inbound text and binary
/// carry no meaning and are dropped.
async fn read_until_closed<S, E, C>(
    id: ConnectionId,
    mut stream: S,
    closed: C,
    pong_wait: Duration,
) -> ReadEnd
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
    C: Future<Output = ()>,
{
    tokio::pin!(closed);

    let mut deadline = Instant::now() + pong_wait;
    loop {
        tokio::select! {
            _ = &mut closed => return ReadEnd::Closed,
            frame = tokio::time::timeout_at(deadline, stream.next()) => match frame {
                Err(_) => {
                    tracing::info!("Connection {} missed its pong deadline", id);
                    return ReadEnd::PongTimeout;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return ReadEnd::PeerClosed,
                Ok(Some(Err(error))) => {
                    tracing::debug!("Read error on connection {}: {}", id, error);
                    return ReadEnd::ReadError;
                }
                Ok(Some(Ok(Message::Pong(_)))) => {
                    deadline = Instant::now() + pong_wait;
                }
                Ok(Some(Ok(_))) => {}
            },
        }
    }
}

/// Pings every `period` until the connection closes. A ping that fails or
/// takes longer than `write_wait` closes the connection.
async fn ping_loop<H: Heartbeat>(connection: Arc<H>, period: Duration, write_wait: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    let closed = connection.wait_closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            _ = &mut closed => return,
            _ = ticker.tick() => {
                match tokio::time::timeout(write_wait, connection.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::debug!("Ping to connection {} failed: {}", connection.id(), error);
                        connection.close().await;
                        return;
                    }
                    Err(_) => {
                        tracing::debug!("Ping to connection {} timed out", connection.id());
                        connection.close().await;
                        return;
                    }
                }
            }
        }
    }
}
