// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end convergence scenarios: scripted and randomized clients talking
//! to real session actors through the registry, each keeping a local replica
//! with the usual one-operation-in-flight client transform. Every scenario
//! ends with all replicas byte-identical to the server.

use cotype::config::Config;
use cotype::ot::{self, Precedence, TextOperation};
use cotype::protocol::ServerMessage;
use cotype::registry::{Registry, SessionHandle};
use cotype::session::{JoinReply, JoinRequest, Outbound, SessionMessage};
use cotype::store::{DocumentStore, MemoryStore, PersistedDocument};
use cotype::types::factories::*;
use cotype::types::{ClientId, DocumentId, UserId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ropey::Rope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

fn test_config() -> Config {
    Config {
        tick_interval: Duration::from_millis(50),
        outbound_queue_limit: 4096,
        ..Config::default()
    }
}

async fn registry_with_document(text: &str, config: Config) -> (Arc<Registry>, DocumentId) {
    let store = Arc::new(MemoryStore::default());
    let id = doc_id("shared");
    store
        .save(
            &id,
            &PersistedDocument {
                text: text.to_string(),
                ..PersistedDocument::default()
            },
        )
        .await
        .expect("seed store");
    let registry = Registry::new(store as Arc<dyn DocumentStore>, Arc::new(config));
    (registry, id)
}

async fn server_content(session: &SessionHandle) -> PersistedDocument {
    let (reply, reply_rx) = oneshot::channel();
    session
        .send(SessionMessage::GetContent { reply })
        .await
        .expect("session should be alive");
    reply_rx.await.expect("content reply")
}

/// A scripted client: a local replica plus the standard client-side OT with
/// at most one operation in flight.
struct TestClient {
    client_id: ClientId,
    user_id: UserId,
    session: SessionHandle,
    rx: mpsc::Receiver<Outbound>,
    text: Rope,
    version: u64,
    pending: Option<TextOperation>,
    seq: u64,
}

impl TestClient {
    async fn join(registry: &Arc<Registry>, document_id: &DocumentId, id: u64, user: &str) -> Self {
        let session = registry
            .get_or_create(document_id)
            .await
            .expect("session should start");
        let (outbound, rx) = mpsc::channel(4096);
        let (reply, reply_rx) = oneshot::channel();
        session
            .send(SessionMessage::Join(JoinRequest {
                client_id: ClientId::from(id),
                user_id: UserId::from(user),
                display_name: user.to_string(),
                outbound,
                reply,
            }))
            .await
            .expect("join should send");
        assert_eq!(reply_rx.await.expect("join reply"), JoinReply::Accepted);

        let mut client = Self {
            client_id: ClientId::from(id),
            user_id: UserId::from(user),
            session,
            rx,
            text: Rope::new(),
            version: 0,
            pending: None,
            seq: 0,
        };
        let frame = client.next_frame().await;
        let ServerMessage::Sync { text, version, .. } = frame else {
            panic!("expected the initial sync, got {frame:?}");
        };
        client.text = Rope::from_str(&text);
        client.version = version;
        client
    }

    /// Applies an edit locally and submits it against the replica's version.
    async fn edit(&mut self, operation: TextOperation) {
        assert!(
            self.pending.is_none(),
            "the scripted client keeps one operation in flight"
        );
        self.text = operation.apply(&self.text).expect("local apply");
        self.session
            .send(SessionMessage::ClientOp {
                client_id: self.client_id,
                base_version: self.version,
                operation: operation.clone(),
                client_seq: self.seq,
            })
            .await
            .expect("op should send");
        self.pending = Some(operation);
    }

    async fn drain_until_acked(&mut self) {
        while self.pending.is_some() {
            let frame = self.next_frame().await;
            self.process(frame);
        }
    }

    async fn drain_until_version(&mut self, version: u64) {
        while self.version < version {
            let frame = self.next_frame().await;
            self.process(frame);
        }
    }

    fn process(&mut self, frame: ServerMessage) {
        match frame {
            ServerMessage::Ack { version, .. } => {
                assert_eq!(version, self.version + 1, "acks arrive in version order");
                self.version = version;
                self.pending = None;
                self.seq += 1;
            }
            ServerMessage::RemoteOp {
                components,
                version,
                author_id,
            } => {
                assert_eq!(version, self.version + 1, "remote ops arrive in version order");
                let applicable = match &mut self.pending {
                    None => components,
                    Some(pending) => {
                        // Mirror of the server's transform: the remote
                        // operation sits in the history before ours, and the
                        // smaller author id wins an insert tie.
                        let precedence = if author_id <= self.user_id {
                            Precedence::Left
                        } else {
                            Precedence::Right
                        };
                        let (remote_prime, pending_prime) =
                            ot::transform(&components, pending, precedence)
                                .expect("client transform");
                        *pending = pending_prime;
                        remote_prime
                    }
                };
                self.text = applicable.apply(&self.text).expect("remote apply");
                self.version = version;
            }
            ServerMessage::Sync { text, version, .. } => {
                // Forced resync: drop everything local.
                self.text = Rope::from_str(&text);
                self.version = version;
                self.pending = None;
            }
            _ => {
                // Presence and roster traffic doesn't affect the replica.
            }
        }
    }

    async fn next_frame(&mut self) -> ServerMessage {
        match tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("expected a frame before the timeout")
            .expect("outbound queue closed unexpectedly")
        {
            Outbound::Frame(frame) => frame,
            Outbound::Close { code } => panic!("unexpected close with code {code}"),
        }
    }
}

#[tokio::test]
async fn concurrent_inserts_at_the_same_position_converge() {
    let (registry, document_id) = registry_with_document("ab", test_config()).await;
    let mut alice = TestClient::join(&registry, &document_id, 1, "alice").await;
    let mut bob = TestClient::join(&registry, &document_id, 2, "bob").await;

    // Both submit against version 0; alice's operation reaches the server
    // first. "alice" < "bob", so X ends up left of Y on every replica.
    alice.edit(insert(2, 1, "X")).await;
    bob.edit(insert(2, 1, "Y")).await;

    alice.drain_until_version(2).await;
    bob.drain_until_version(2).await;

    assert_eq!(alice.text.to_string(), "aXYb");
    assert_eq!(bob.text.to_string(), "aXYb");
    assert_eq!(server_content(&alice.session).await.text, "aXYb");
}

#[tokio::test]
async fn overlapping_deletes_converge() {
    let (registry, document_id) = registry_with_document("hello", test_config()).await;
    let mut alice = TestClient::join(&registry, &document_id, 1, "alice").await;
    let mut bob = TestClient::join(&registry, &document_id, 2, "bob").await;

    alice.edit(delete(5, 1, 3)).await; // removes "ell"
    bob.edit(delete(5, 2, 2)).await; // removes "ll", fully absorbed

    alice.drain_until_version(2).await;
    bob.drain_until_version(2).await;

    assert_eq!(alice.text.to_string(), "ho");
    assert_eq!(bob.text.to_string(), "ho");
    assert_eq!(server_content(&alice.session).await.text, "ho");
}

#[tokio::test]
async fn a_stale_client_resyncs_and_rejoins_the_flow() {
    let (registry, document_id) = registry_with_document(
        "",
        Config {
            history_limit: 2,
            ..test_config()
        },
    )
    .await;
    let mut alice = TestClient::join(&registry, &document_id, 1, "alice").await;
    let mut bob = TestClient::join(&registry, &document_id, 2, "bob").await;

    for i in 0..4 {
        alice.edit(insert(i, i, "a")).await;
        alice.drain_until_acked().await;
    }
    bob.drain_until_version(4).await;

    // Bob's editor glitches and replays an operation against version 0.
    bob.session
        .send(SessionMessage::ClientOp {
            client_id: bob.client_id,
            base_version: 0,
            operation: insert(0, 0, "?"),
            client_seq: 99,
        })
        .await
        .expect("op should send");
    let frame = bob.next_frame().await;
    assert!(
        matches!(frame, ServerMessage::Sync { .. }),
        "the server answers a hopeless operation with a snapshot"
    );
    bob.process(frame);
    assert_eq!(bob.text.to_string(), "aaaa");
    assert_eq!(bob.version, 4);

    // After the resync bob participates normally again.
    bob.edit(insert(4, 4, "b")).await;
    bob.drain_until_acked().await;
    alice.drain_until_version(5).await;
    assert_eq!(alice.text.to_string(), bob.text.to_string());
    assert_eq!(server_content(&bob.session).await.text, "aaaab");
}

const ALPHABET: &[&str] = &["a", "b", "c", "ü", "🥕", "💚", "\n", " "];

fn random_text(rng: &mut StdRng, max_chars: usize) -> String {
    (0..rng.gen_range(0..=max_chars))
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())])
        .collect()
}

/// A random well-formed operation with char-aligned boundaries.
fn random_operation(rng: &mut StdRng, text: &Rope) -> TextOperation {
    let mut operation = TextOperation::new();
    let mut chars_left = text.len_chars();
    let mut char_pos = 0;
    while chars_left > 0 {
        let span = rng.gen_range(1..=chars_left);
        let span_u16 =
            (text.char_to_utf16_cu(char_pos + span) - text.char_to_utf16_cu(char_pos)) as u64;
        match rng.gen_range(0..3) {
            0 => operation.retain(span_u16),
            1 => operation.delete(span_u16),
            _ => {
                operation.insert(&random_text(rng, 4));
                operation.retain(span_u16);
            }
        }
        char_pos += span;
        chars_left -= span;
    }
    if rng.gen_bool(0.5) {
        operation.insert(&random_text(rng, 4));
    }
    operation
}

#[tokio::test]
async fn three_replicas_converge_under_random_concurrent_edits() {
    let (registry, document_id) = registry_with_document("shared document\n", test_config()).await;
    let mut clients = Vec::new();
    for (id, user) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        clients.push(TestClient::join(&registry, &document_id, id, user).await);
    }

    let mut rng = StdRng::seed_from_u64(2025);
    let mut expected_version = 0u64;
    for _ in 0..30 {
        // A random subset submits one concurrent operation each.
        let mut editors = Vec::new();
        for index in 0..clients.len() {
            if rng.gen_bool(0.6) {
                editors.push(index);
            }
        }
        for &index in &editors {
            let operation = {
                let client = &clients[index];
                random_operation(&mut rng, &client.text)
            };
            clients[index].edit(operation).await;
            expected_version += 1;
        }
        for &index in &editors {
            clients[index].drain_until_acked().await;
        }
        for client in &mut clients {
            client.drain_until_version(expected_version).await;
        }
    }

    let server_text = server_content(&clients[0].session).await.text;
    for client in &clients {
        assert_eq!(
            client.text.to_string(),
            server_text,
            "{} diverged",
            client.user_id
        );
        assert_eq!(client.version, expected_version);
    }
}
