// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The process-wide map from document id to session actor. Sessions are
//! spawned lazily on the first join and remove themselves after draining;
//! the handshake here guarantees a joiner never ends up holding a handle to
//! a dead session.

use crate::config::Config;
use crate::document::Document;
use crate::session::{SessionActor, SessionMessage};
use crate::store::{DocumentStore, StoreError};
use crate::types::DocumentId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A cheap, cloneable reference to a session actor's mailbox.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMessage>,
}

impl SessionHandle {
    /// Queues a message, waiting if the mailbox is momentarily full. Fails
    /// when the actor is gone.
    pub async fn send(&self, message: SessionMessage) -> Result<(), SessionGone> {
        self.tx.send(message).await.map_err(|_| SessionGone)
    }

    /// Queues a message without waiting. `Ok(false)` means the mailbox was
    /// full.
    pub fn try_send(&self, message: SessionMessage) -> Result<bool, SessionGone> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionGone),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("the session actor is gone")]
pub struct SessionGone;

enum SessionSlot {
    Live {
        handle: SessionHandle,
        task: JoinHandle<()>,
    },
    /// The actor has stopped accepting work but hasn't persisted and
    /// removed itself yet. Joiners wait for the slot to clear.
    Draining,
}

pub struct Registry {
    sessions: Mutex<HashMap<DocumentId, SessionSlot>>,
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
}

impl Registry {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            config,
        })
    }

    /// Returns the handle for a document's session, spawning the actor (and
    /// loading the document) if there is none. At most one live session per
    /// document exists at any time; the map's lock is held across the spawn
    /// to guarantee it.
    pub async fn get_or_create(
        self: &Arc<Self>,
        document_id: &DocumentId,
    ) -> Result<SessionHandle, StoreError> {
        loop {
            {
                let mut sessions = self.sessions.lock().await;
                match sessions.get(document_id) {
                    Some(SessionSlot::Live { handle, .. }) if !handle.is_closed() => {
                        return Ok(handle.clone());
                    }
                    Some(SessionSlot::Live { .. }) => {
                        // The actor died without cleaning up (a panic). The
                        // next joiner — us — reloads the document fresh.
                        debug!("Removing dead session for {document_id}");
                        sessions.remove(document_id);
                    }
                    Some(SessionSlot::Draining) => {}
                    None => {}
                }
                if !matches!(sessions.get(document_id), Some(SessionSlot::Draining)) {
                    let persisted = self.store.load(document_id).await?.unwrap_or_default();
                    info!(
                        "Starting session for {document_id} at version {}",
                        persisted.version
                    );
                    let document = Document::from_persisted(persisted, self.config.history_limit);
                    let (tx, rx) = mpsc::channel(self.config.session_mailbox);
                    let actor = SessionActor::new(
                        document_id.clone(),
                        document,
                        rx,
                        Arc::clone(&self.store),
                        Arc::clone(&self.config),
                    );
                    let handle = SessionHandle { tx };
                    let registry = Arc::clone(self);
                    let id = document_id.clone();
                    let task = tokio::spawn(async move {
                        let (mut actor, reason) = actor.run().await;
                        registry.begin_drain(&id).await;
                        actor.persist_final().await;
                        registry.finish_drain(&id).await;
                        // Joins that were already queued bounce back to the
                        // registry and land on a fresh actor.
                        actor.refuse_pending();
                        debug!("Session for {id} removed ({reason:?})");
                    });
                    sessions.insert(
                        document_id.clone(),
                        SessionSlot::Live {
                            handle: handle.clone(),
                            task,
                        },
                    );
                    return Ok(handle);
                }
            }
            // A draining session still holds the slot; give it a moment to
            // persist and clear out.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn begin_drain(&self, document_id: &DocumentId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(document_id) {
            *slot = SessionSlot::Draining;
        }
    }

    async fn finish_drain(&self, document_id: &DocumentId) {
        let mut sessions = self.sessions.lock().await;
        if matches!(sessions.get(document_id), Some(SessionSlot::Draining)) {
            sessions.remove(document_id);
        }
    }

    /// Tells every live session to disconnect its clients and persist, and
    /// waits until they are all gone. Used on server shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<(DocumentId, SessionHandle, JoinHandle<()>)> = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .drain()
                .filter_map(|(id, slot)| match slot {
                    SessionSlot::Live { handle, task } => Some((id, handle, task)),
                    SessionSlot::Draining => None,
                })
                .collect()
        };
        for (id, handle, task) in entries {
            if handle.send(SessionMessage::Shutdown).await.is_err() {
                debug!("Session for {id} was already gone at shutdown");
            }
            let _ = task.await;
        }
    }
}
