// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The messages exchanged with clients over the WebSocket, and the close
//! codes we use. Frames are JSON objects tagged with a `type` field.

use crate::ot::TextOperation;
use crate::types::{ClientId, CursorPos, PeerInfo, Selection, UserId};
use serde::{Deserialize, Serialize};

/// Version of the wire protocol, advertised in the initial `sync`.
pub const PROTOCOL_VERSION: u8 = 1;

/// WebSocket close codes. The 4000-4999 range is reserved for applications.
pub mod close {
    /// Ordinary teardown, e.g. server shutdown.
    pub const NORMAL: u16 = 4000;
    /// The client sent something the protocol doesn't allow.
    pub const PROTOCOL_VIOLATION: u16 = 4008;
    /// The client couldn't keep up with its outbound queue.
    pub const SLOW_CONSUMER: u16 = 4013;
    /// The auth token was missing, malformed or expired.
    pub const UNAUTHORIZED: u16 = 4401;
}

/// A message received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// An edit against the document at `base_version`. The `client_seq` is
    /// echoed back in the `ack` so the client can match up its queue.
    Op {
        base_version: u64,
        components: TextOperation,
        client_seq: u64,
    },
    /// The sender's caret and selection, valid at `at_version`.
    Cursor {
        line: u32,
        column: u32,
        selection: Option<Selection>,
        at_version: u64,
    },
    /// Change the document's syntax-highlighting language.
    SetLanguage { language: String },
    /// Liveness reply to a `ping`.
    Pong { nonce: u64 },
}

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full document state: sent once after joining, and again whenever the
    /// server decides a client must be resynchronized.
    Sync {
        v: u8,
        text: String,
        language: String,
        version: u64,
        peers: Vec<PeerInfo>,
    },
    /// Another participant's operation, already transformed to apply cleanly
    /// on top of version `version - 1`.
    RemoteOp {
        components: TextOperation,
        version: u64,
        author_id: UserId,
    },
    /// The receiver's own operation was applied at `version`.
    Ack { client_seq: u64, version: u64 },
    /// Another participant's caret moved. Positions are valid at `version`.
    RemoteCursor {
        client_id: ClientId,
        cursor: Option<CursorPos>,
        selection: Option<Selection>,
        version: u64,
    },
    /// A participant joined the document.
    UserJoined {
        client_id: ClientId,
        user_id: UserId,
        name: String,
        color: u16,
    },
    /// A participant left the document.
    UserLeft { client_id: ClientId },
    /// The document's language changed. Last writer wins.
    Language { language: String },
    /// A recoverable problem with the client's last message.
    Error { kind: String, message: String },
    /// Liveness probe; the client must answer with `pong`.
    Ping { nonce: u64 },
}
