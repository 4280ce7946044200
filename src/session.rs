// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The session actor: one logically single-threaded task per document that
//! owns the document state and the client roster, serializes all mutations,
//! and fans out transformed operations and presence to the participants.
//!
//! Connections talk to the actor exclusively through its mailbox; the actor
//! talks back through bounded per-client outbound queues and never blocks on
//! a single client.

use crate::config::Config;
use crate::document::{ApplyError, Document};
use crate::ot::{self, TextOperation};
use crate::protocol::{close, ServerMessage, PROTOCOL_VERSION};
use crate::store::{DocumentStore, PersistedDocument};
use crate::types::{hue_for_user, ClientId, CursorPos, DocumentId, PeerInfo, Selection, UserId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the actor pushes into a client's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Ask the connection to close the socket with the given code. The
    /// actor has already dropped the client at this point.
    Close { code: u16 },
}

/// Whether the actor took the client in. A `Draining` reply means the caller
/// raced with an idle shutdown and must fetch a fresh handle from the
/// registry.
#[derive(Debug, PartialEq, Eq)]
pub enum JoinReply {
    Accepted,
    Draining,
}

pub struct JoinRequest {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub display_name: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub reply: oneshot::Sender<JoinReply>,
}

pub enum SessionMessage {
    Join(JoinRequest),
    Leave {
        client_id: ClientId,
    },
    ClientOp {
        client_id: ClientId,
        base_version: u64,
        operation: TextOperation,
        client_seq: u64,
    },
    CursorUpdate {
        client_id: ClientId,
        cursor: CursorPos,
        selection: Option<Selection>,
        at_version: u64,
    },
    SetLanguage {
        client_id: ClientId,
        language: String,
    },
    GetContent {
        reply: oneshot::Sender<PersistedDocument>,
    },
    /// Server-wide shutdown: disconnect everyone and stop.
    Shutdown,
}

impl fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            Self::Join(_) => "join",
            Self::Leave { .. } => "leave",
            Self::ClientOp { .. } => "client op",
            Self::CursorUpdate { .. } => "cursor update",
            Self::SetLanguage { .. } => "set language",
            Self::GetContent { .. } => "get content",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{repr}")
    }
}

/// Why the run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The roster stayed empty for the idle timeout.
    Idle,
    /// The server is shutting down.
    Shutdown,
}

/// The actor's view of one connected client. Cursor and selection are kept
/// as absolute UTF-16 offsets so they can be rebased through operations.
struct Peer {
    user_id: UserId,
    display_name: String,
    color: u16,
    cursor: Option<u64>,
    selection: Option<(u64, u64)>,
    outbound: mpsc::Sender<Outbound>,
}

pub struct SessionActor {
    document_id: DocumentId,
    document: Document,
    clients: HashMap<ClientId, Peer>,
    rx: mpsc::Receiver<SessionMessage>,
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
    idle_since: Option<Instant>,
    last_persist: Instant,
}

impl SessionActor {
    #[must_use]
    pub fn new(
        document_id: DocumentId,
        document: Document,
        rx: mpsc::Receiver<SessionMessage>,
        store: Arc<dyn DocumentStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            document_id,
            document,
            clients: HashMap::new(),
            rx,
            store,
            config,
            idle_since: Some(Instant::now()),
            last_persist: Instant::now(),
        }
    }

    /// Processes messages until the session goes idle or the server shuts
    /// down. Each message is handled to completion before the next one is
    /// dequeued, which is what gives every client the same total order of
    /// operations and versions.
    pub async fn run(mut self) -> (Self, ExitReason) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(SessionMessage::Shutdown) => {
                        info!("Session {} shutting down", self.document_id);
                        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
                        for id in ids {
                            if let Some(peer) = self.clients.remove(&id) {
                                let _ = peer.outbound.try_send(Outbound::Close {
                                    code: close::NORMAL,
                                });
                            }
                        }
                        return (self, ExitReason::Shutdown);
                    }
                    Some(message) => self.handle_message(message).await,
                    // All senders are gone; nobody can reach us anymore.
                    None => return (self, ExitReason::Idle),
                },
                _ = tick.tick() => {
                    if let Some(reason) = self.handle_tick().await {
                        return (self, reason);
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        debug!("Session {} handling message: {message:?}", self.document_id);
        match message {
            SessionMessage::Join(join) => self.handle_join(join),
            SessionMessage::Leave { client_id } => self.handle_leave(client_id).await,
            SessionMessage::ClientOp {
                client_id,
                base_version,
                operation,
                client_seq,
            } => self.handle_client_op(client_id, base_version, operation, client_seq),
            SessionMessage::CursorUpdate {
                client_id,
                cursor,
                selection,
                at_version,
            } => self.handle_cursor(client_id, cursor, selection, at_version),
            SessionMessage::SetLanguage {
                client_id,
                language,
            } => self.handle_set_language(client_id, language),
            SessionMessage::GetContent { reply } => {
                let _ = reply.send(self.document.snapshot());
            }
            SessionMessage::Shutdown => {
                // Handled in the run loop.
            }
        }
    }

    fn handle_join(&mut self, join: JoinRequest) {
        let JoinRequest {
            client_id,
            user_id,
            display_name,
            outbound,
            reply,
        } = join;
        info!(
            "Client {client_id} ({user_id}) joined {} at version {}",
            self.document_id,
            self.document.version()
        );
        let color = hue_for_user(&user_id);
        let sync = self.sync_message(Some(client_id));
        let announcement = ServerMessage::UserJoined {
            client_id,
            user_id: user_id.clone(),
            name: display_name.clone(),
            color,
        };
        self.clients.insert(
            client_id,
            Peer {
                user_id,
                display_name,
                color,
                cursor: None,
                selection: None,
                outbound,
            },
        );
        self.idle_since = None;
        let _ = reply.send(JoinReply::Accepted);
        self.send_to(client_id, sync);
        self.broadcast_except(Some(client_id), &announcement);
    }

    async fn handle_leave(&mut self, client_id: ClientId) {
        // A second leave for the same client is a no-op.
        self.remove_client(client_id);
        if self.clients.is_empty() && self.document.is_dirty() {
            // The last participant is gone; don't sit on their edits until
            // the next persistence tick.
            self.persist().await;
        }
    }

    fn handle_client_op(
        &mut self,
        client_id: ClientId,
        base_version: u64,
        operation: TextOperation,
        client_seq: u64,
    ) {
        let Some(peer) = self.clients.get(&client_id) else {
            debug!("Dropping operation from unknown client {client_id}");
            return;
        };
        let author = peer.user_id.clone();
        match self
            .document
            .apply_client_op(operation, &author, base_version)
        {
            Ok(applied) => {
                // Every stored cursor moves with the text it points into.
                for peer in self.clients.values_mut() {
                    if let Some(cursor) = peer.cursor.as_mut() {
                        *cursor = ot::transform_index(&applied.operation, *cursor);
                    }
                    if let Some((anchor, head)) = peer.selection.as_mut() {
                        *anchor = ot::transform_index(&applied.operation, *anchor);
                        *head = ot::transform_index(&applied.operation, *head);
                    }
                }
                self.send_to(
                    client_id,
                    ServerMessage::Ack {
                        client_seq,
                        version: applied.version,
                    },
                );
                self.broadcast_except(
                    Some(client_id),
                    &ServerMessage::RemoteOp {
                        components: applied.operation,
                        version: applied.version,
                        author_id: author,
                    },
                );
            }
            Err(err) if err.is_resyncable() => {
                warn!(
                    "Client {client_id} needs a resync on {}: {err}",
                    self.document_id
                );
                let sync = self.sync_message(Some(client_id));
                self.send_to(client_id, sync);
            }
            Err(err @ ApplyError::FutureVersion { .. }) => {
                warn!(
                    "Client {client_id} claims a future version on {}: {err}",
                    self.document_id
                );
                self.send_to(
                    client_id,
                    ServerMessage::Error {
                        kind: "future_version".to_string(),
                        message: err.to_string(),
                    },
                );
                self.kick(client_id, close::PROTOCOL_VIOLATION);
            }
            Err(_) => {
                // is_resyncable covers everything but FutureVersion.
            }
        }
    }

    fn handle_cursor(
        &mut self,
        client_id: ClientId,
        cursor: CursorPos,
        selection: Option<Selection>,
        at_version: u64,
    ) {
        if !self.clients.contains_key(&client_id) {
            return;
        }
        let (cursor_offset, selection_offsets) = {
            let document = &self.document;
            // Positions are resolved against the text as it stood at
            // `at_version`, then walked through every operation applied
            // since. A version outside the history window falls back to
            // clamping against the current text; presence is advisory.
            let rebase = |pos: CursorPos| match document.text_at(at_version) {
                Some(text_at) => {
                    let offset = pos.resolve(text_at);
                    document.rebase_index(offset, at_version).unwrap_or(offset)
                }
                None => pos.resolve(document.text()),
            };
            (
                rebase(cursor),
                selection.map(|s| (rebase(s.anchor), rebase(s.head))),
            )
        };
        let version = self.document.version();
        let message = ServerMessage::RemoteCursor {
            client_id,
            cursor: Some(CursorPos::from_offset(cursor_offset, self.document.text())),
            selection: selection_offsets.map(|(anchor, head)| Selection {
                anchor: CursorPos::from_offset(anchor, self.document.text()),
                head: CursorPos::from_offset(head, self.document.text()),
            }),
            version,
        };
        if let Some(peer) = self.clients.get_mut(&client_id) {
            peer.cursor = Some(cursor_offset);
            peer.selection = selection_offsets;
        }
        self.broadcast_except(Some(client_id), &message);
    }

    fn handle_set_language(&mut self, client_id: ClientId, language: String) {
        if !self.clients.contains_key(&client_id) {
            return;
        }
        info!("Client {client_id} set language of {} to {language}", self.document_id);
        self.document.set_language(language.clone());
        // Everyone hears about it, including the client that set it; last
        // writer wins on all replicas.
        self.broadcast_except(None, &ServerMessage::Language { language });
    }

    async fn handle_tick(&mut self) -> Option<ExitReason> {
        if self.document.is_dirty()
            && self.last_persist.elapsed() >= self.config.persist_interval
        {
            self.persist().await;
        }
        if self.clients.is_empty() {
            if let Some(since) = self.idle_since {
                if since.elapsed() >= self.config.idle_timeout {
                    info!("Session {} idle, shutting down", self.document_id);
                    return Some(ExitReason::Idle);
                }
            } else {
                self.idle_since = Some(Instant::now());
            }
        }
        None
    }

    async fn persist(&mut self) {
        let snapshot = self.document.snapshot();
        match self.store.save(&self.document_id, &snapshot).await {
            Ok(()) => {
                debug!(
                    "Persisted {} at version {}",
                    self.document_id, snapshot.version
                );
                self.document.mark_clean();
                self.last_persist = Instant::now();
            }
            Err(e) => {
                // Never fatal; the next tick tries again.
                warn!("Failed to persist {}, will retry: {e:#}", self.document_id);
            }
        }
    }

    /// Final persistence before the actor disappears. Called by the registry
    /// wrapper after the run loop has ended.
    pub async fn persist_final(&mut self) {
        if self.document.is_dirty() {
            self.persist().await;
        }
    }

    /// Closes the mailbox and bounces any queued joins, which makes their
    /// connections fetch a fresh handle from the registry. Must run after
    /// the registry slot has been cleared.
    pub fn refuse_pending(&mut self) {
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let SessionMessage::Join(join) = message {
                let _ = join.reply.send(JoinReply::Draining);
            }
        }
    }

    fn sync_message(&self, exclude: Option<ClientId>) -> ServerMessage {
        ServerMessage::Sync {
            v: PROTOCOL_VERSION,
            text: self.document.text().to_string(),
            language: self.document.language().to_string(),
            version: self.document.version(),
            peers: self.peer_infos(exclude),
        }
    }

    fn peer_infos(&self, exclude: Option<ClientId>) -> Vec<PeerInfo> {
        let text = self.document.text();
        let mut peers: Vec<PeerInfo> = self
            .clients
            .iter()
            .filter(|(&id, _)| Some(id) != exclude)
            .map(|(&client_id, peer)| PeerInfo {
                client_id,
                user_id: peer.user_id.clone(),
                name: peer.display_name.clone(),
                color: peer.color,
                cursor: peer.cursor.map(|offset| CursorPos::from_offset(offset, text)),
                selection: peer.selection.map(|(anchor, head)| Selection {
                    anchor: CursorPos::from_offset(anchor, text),
                    head: CursorPos::from_offset(head, text),
                }),
            })
            .collect();
        peers.sort_by_key(|peer| peer.client_id);
        peers
    }

    /// Queues a frame for one client, evicting it if its queue is full.
    fn send_to(&mut self, client_id: ClientId, message: ServerMessage) {
        let Some(peer) = self.clients.get(&client_id) else {
            return;
        };
        match peer.outbound.try_send(Outbound::Frame(message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Client {client_id} can't keep up, dropping it as a slow consumer");
                self.remove_client(client_id);
            }
            Err(TrySendError::Closed(_)) => {
                self.remove_client(client_id);
            }
        }
    }

    /// Queues a frame for every client except `skip`. Clients whose queue
    /// overflows are evicted; the broadcast to the others is unaffected.
    fn broadcast_except(&mut self, skip: Option<ClientId>, message: &ServerMessage) {
        let mut evicted = Vec::new();
        for (&client_id, peer) in &self.clients {
            if Some(client_id) == skip {
                continue;
            }
            match peer.outbound.try_send(Outbound::Frame(message.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Client {client_id} can't keep up, dropping it as a slow consumer");
                    evicted.push(client_id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(client_id),
            }
        }
        for client_id in evicted {
            self.remove_client(client_id);
        }
    }

    /// Removes a client from the roster and tells the others. Safe to call
    /// twice; the second call does nothing.
    fn remove_client(&mut self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_none() {
            return;
        }
        info!("Client {client_id} left {}", self.document_id);
        self.broadcast_except(Some(client_id), &ServerMessage::UserLeft { client_id });
        if self.clients.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }

    /// Removes a client and asks its connection to close with `code`.
    fn kick(&mut self, client_id: ClientId, code: u16) {
        if let Some(peer) = self.clients.get(&client_id) {
            let _ = peer.outbound.try_send(Outbound::Close { code });
        }
        self.remove_client(client_id);
    }
}
