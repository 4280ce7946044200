// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One handler per accepted WebSocket: authenticates, joins the session,
//! pumps frames between the socket and the session actor's mailbox, and
//! watches liveness. The actor never blocks on this connection; if we can't
//! keep up with our outbound queue, we get dropped and close as a slow
//! consumer.

use crate::auth::Identity;
use crate::config::Config;
use crate::protocol::{close, ClientMessage, ServerMessage};
use crate::registry::{SessionGone, SessionHandle};
use crate::server::AppState;
use crate::session::{JoinReply, JoinRequest, Outbound, SessionMessage};
use crate::types::{ClientId, CursorPos, DocumentId};
use anyhow::{bail, Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    doc: String,
    token: String,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_socket(socket, query, state).await {
            debug!("Connection ended with error: {e:#}");
        }
    })
}

async fn handle_socket(socket: WebSocket, query: ConnectQuery, state: Arc<AppState>) -> Result<()> {
    let identity = match state.verifier.verify(&query.token) {
        Ok(identity) => identity,
        Err(e) => {
            info!("Rejecting connection with bad token: {e}");
            close_with(socket, close::UNAUTHORIZED, "unauthorized").await;
            return Ok(());
        }
    };
    let document_id = match DocumentId::try_from(query.doc) {
        Ok(document_id) => document_id,
        Err(e) => {
            info!("Rejecting connection with bad document id: {e}");
            close_with(socket, close::PROTOCOL_VIOLATION, "bad_document_id").await;
            return Ok(());
        }
    };

    let client_id = state.next_client_id();
    info!(
        "Client {client_id} ({}) connecting to {document_id}",
        identity.user_id
    );

    // The actor fills `outbound`; `local` carries this connection's own
    // pings, throttle notices and close requests. Both drain into the same
    // socket.
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_queue_limit);
    let (local_tx, local_rx) = mpsc::channel(8);

    let session = join_session(&state, &document_id, client_id, &identity, outbound_tx).await?;

    let (mut sink, mut stream) = socket.split();
    let writer_cancel = CancellationToken::new();
    let mut writer_task = tokio::spawn({
        let cancel = writer_cancel.clone();
        async move {
            tokio::select! {
                () = write_loop(outbound_rx, local_rx, &mut sink) => {}
                () = cancel.cancelled() => {}
            }
            let _ = sink.close().await;
        }
    });

    let desired_close = read_loop(&mut stream, &session, &local_tx, client_id, &state.config).await;

    // Teardown, idempotent from the session's point of view: the close
    // request (if any) goes out first, then we stop feeding the writer, then
    // the roster entry goes away.
    if let Some(code) = desired_close {
        let _ = local_tx
            .send(Outbound::Close { code })
            .await;
    }
    drop(local_tx);
    let _ = session.send(SessionMessage::Leave { client_id }).await;

    if tokio::time::timeout(Duration::from_secs(5), &mut writer_task)
        .await
        .is_err()
    {
        // The sink is wedged on a peer that stopped reading.
        writer_cancel.cancel();
        let _ = writer_task.await;
    }
    info!("Client {client_id} disconnected from {document_id}");
    Ok(())
}

/// Fetches a session handle and joins it. A session that is just draining
/// away bounces the join; we then ask the registry again, which spawns a
/// fresh actor.
async fn join_session(
    state: &AppState,
    document_id: &DocumentId,
    client_id: ClientId,
    identity: &Identity,
    outbound: mpsc::Sender<Outbound>,
) -> Result<SessionHandle> {
    const ATTEMPTS: usize = 5;
    for attempt in 0..ATTEMPTS {
        let handle = state
            .registry
            .get_or_create(document_id)
            .await
            .context("failed to open the document")?;
        let (reply, reply_rx) = tokio::sync::oneshot::channel();
        let join = SessionMessage::Join(JoinRequest {
            client_id,
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            outbound: outbound.clone(),
            reply,
        });
        if handle.send(join).await.is_err() {
            continue;
        }
        match reply_rx.await {
            Ok(JoinReply::Accepted) => return Ok(handle),
            Ok(JoinReply::Draining) | Err(_) => {
                debug!("Session for {document_id} was draining (attempt {attempt}), retrying");
            }
        }
    }
    bail!("session for {document_id} kept draining");
}

/// Drains both outbound queues into the socket. Ends when a close event
/// arrives, when the sink fails, or when both queues are gone. The actor
/// dropping its queue without a close event means we were evicted as a slow
/// consumer.
async fn write_loop(
    mut actor_rx: mpsc::Receiver<Outbound>,
    mut local_rx: mpsc::Receiver<Outbound>,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    let mut actor_gone = false;
    let mut local_gone = false;
    while !(actor_gone && local_gone) {
        let event = tokio::select! {
            event = actor_rx.recv(), if !actor_gone => {
                match event {
                    Some(event) => event,
                    None if local_gone => break,
                    None => {
                        actor_gone = true;
                        Outbound::Close {
                            code: close::SLOW_CONSUMER,
                        }
                    }
                }
            }
            event = local_rx.recv(), if !local_gone => {
                match event {
                    Some(event) => event,
                    None => {
                        local_gone = true;
                        continue;
                    }
                }
            }
        };
        match event {
            Outbound::Frame(message) => {
                let text = serde_json::to_string(&message)
                    .expect("server messages always serialize");
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Outbound::Close { code } => {
                send_close(sink, code).await;
                return;
            }
        }
    }
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, code: u16) {
    let reason = match code {
        close::NORMAL => "bye",
        close::PROTOCOL_VIOLATION => "protocol_violation",
        close::SLOW_CONSUMER => "slow_consumer",
        close::UNAUTHORIZED => "unauthorized",
        _ => "",
    };
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Reads client frames until the connection should end. Returns the close
/// code we want to send, or `None` when the socket is already gone.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    session: &SessionHandle,
    local_tx: &mpsc::Sender<Outbound>,
    client_id: ClientId,
    config: &Config,
) -> Option<u16> {
    let mut limiter = RateLimiter::new(config.max_messages_per_second, config.max_bytes_per_second);
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    let mut last_pong = Instant::now();
    let mut nonce: u64 = 0;
    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > config.pong_timeout {
                    info!("Client {client_id} stopped answering pings");
                    return None;
                }
                nonce += 1;
                let _ = local_tx.try_send(Outbound::Frame(ServerMessage::Ping { nonce }));
            }
            frame = stream.next() => {
                let message = match frame {
                    None => return None,
                    Some(Err(e)) => {
                        debug!("WebSocket error on client {client_id}: {e}");
                        return None;
                    }
                    Some(Ok(message)) => message,
                };
                match message {
                    Message::Close(_) => return None,
                    // Transport-level pings are answered by the stack.
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Binary(_) => {
                        debug!("Client {client_id} sent a binary frame");
                        return Some(close::PROTOCOL_VIOLATION);
                    }
                    Message::Text(text) => {
                        if text.len() > config.max_message_bytes {
                            warn!("Client {client_id} sent an oversized frame ({} bytes)", text.len());
                            return Some(close::PROTOCOL_VIOLATION);
                        }
                        if !limiter.admit(text.len()) {
                            debug!("Throttling client {client_id}");
                            let _ = local_tx.try_send(Outbound::Frame(ServerMessage::Error {
                                kind: "throttled".to_string(),
                                message: "slow down".to_string(),
                            }));
                            continue;
                        }
                        let parsed: ClientMessage = match serde_json::from_str(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!("Client {client_id} sent a malformed frame: {e}");
                                return Some(close::PROTOCOL_VIOLATION);
                            }
                        };
                        if let ClientMessage::Pong { .. } = &parsed {
                            last_pong = Instant::now();
                            continue;
                        }
                        let Some(message) = session_message(client_id, parsed) else {
                            continue;
                        };
                        match session.try_send(message) {
                            Ok(true) => {}
                            Ok(false) => {
                                // The session mailbox is bounded; a client
                                // that overruns it is misbehaving.
                                warn!("Client {client_id} overran the session mailbox");
                                return Some(close::PROTOCOL_VIOLATION);
                            }
                            Err(SessionGone) => return None,
                        }
                    }
                }
            }
        }
    }
}

/// Maps a client frame onto the session mailbox. `Pong` is connection-local
/// and maps to nothing.
fn session_message(client_id: ClientId, message: ClientMessage) -> Option<SessionMessage> {
    match message {
        ClientMessage::Op {
            base_version,
            components,
            client_seq,
        } => Some(SessionMessage::ClientOp {
            client_id,
            base_version,
            operation: components,
            client_seq,
        }),
        ClientMessage::Cursor {
            line,
            column,
            selection,
            at_version,
        } => Some(SessionMessage::CursorUpdate {
            client_id,
            cursor: CursorPos { line, column },
            selection,
            at_version,
        }),
        ClientMessage::SetLanguage { language } => {
            Some(SessionMessage::SetLanguage {
                client_id,
                language,
            })
        }
        ClientMessage::Pong { .. } => None,
    }
}

/// Token buckets for frames per second and bytes per second. A burst of up
/// to one second's allowance is fine; beyond that, frames are dropped.
struct RateLimiter {
    messages: TokenBucket,
    bytes: TokenBucket,
}

impl RateLimiter {
    fn new(messages_per_second: u32, bytes_per_second: u32) -> Self {
        Self {
            messages: TokenBucket::new(messages_per_second),
            bytes: TokenBucket::new(bytes_per_second),
        }
    }

    fn admit(&mut self, bytes: usize) -> bool {
        let now = Instant::now();
        let messages_ok = self.messages.admit_at(now, 1.0);
        let bytes_ok = self.bytes.admit_at(now, bytes as f64);
        messages_ok && bytes_ok
    }
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: u32) -> Self {
        let capacity = f64::from(per_second);
        Self {
            capacity,
            tokens: capacity,
            fill_rate: capacity,
            last_refill: Instant::now(),
        }
    }

    fn admit_at(&mut self, now: Instant, cost: f64) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}
