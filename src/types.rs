// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifier newtypes and the presence value types shared across modules.

use derive_more::{AsRef, Deref, Display, From};
use ropey::Rope;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Identifies a shared document. Opaque to the server except for the
/// restrictions below, which keep it safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Display, AsRef)]
#[must_use]
pub struct DocumentId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidDocumentId {
    #[error("document id is empty")]
    Empty,
    #[error("document id is longer than {max} bytes", max = DocumentId::MAX_LEN)]
    TooLong,
    #[error("document id contains character {0:?}")]
    BadCharacter(char),
    #[error("document id starts with a dot")]
    LeadingDot,
}

impl DocumentId {
    const MAX_LEN: usize = 256;
}

impl TryFrom<String> for DocumentId {
    type Error = InvalidDocumentId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(InvalidDocumentId::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(InvalidDocumentId::TooLong);
        }
        if s.starts_with('.') {
            return Err(InvalidDocumentId::LeadingDot);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(InvalidDocumentId::BadCharacter(c));
        }
        Ok(Self(s))
    }
}

/// Identifies one WebSocket connection. Unique for the lifetime of the
/// process; a user connecting twice gets two client ids.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    From,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
#[must_use]
pub struct ClientId(u64);

/// The authenticated identity behind a connection, as attested by the auth
/// token. Doubles as the tie-break key for concurrent inserts.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, Display, From, Serialize, Deserialize,
)]
#[serde(transparent)]
#[must_use]
pub struct UserId(String);

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A caret position as the editors see it: line plus column, both in UTF-16
/// code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub column: u32,
}

impl CursorPos {
    /// Resolves the position to an absolute UTF-16 offset, clamping to line
    /// and document ends. Presence is advisory, so out-of-range positions
    /// are clamped rather than rejected.
    pub fn resolve(&self, text: &Rope) -> u64 {
        let line = (self.line as usize).min(text.len_lines().saturating_sub(1));
        let line_start = text.char_to_utf16_cu(text.line_to_char(line)) as u64;
        let line_end = if line + 1 < text.len_lines() {
            // Exclude the newline that terminates the line.
            (text.char_to_utf16_cu(text.line_to_char(line + 1)) as u64).saturating_sub(1)
        } else {
            text.len_utf16_cu() as u64
        };
        (line_start + u64::from(self.column)).min(line_end)
    }

    /// The inverse of [`Self::resolve`]: maps an absolute UTF-16 offset back
    /// to line/column coordinates.
    pub fn from_offset(offset: u64, text: &Rope) -> Self {
        let offset = (offset as usize).min(text.len_utf16_cu());
        let char_idx = text.utf16_cu_to_char(offset);
        let line = text.char_to_line(char_idx);
        let line_start = text.char_to_utf16_cu(text.line_to_char(line));
        Self {
            line: line as u32,
            column: (offset - line_start) as u32,
        }
    }
}

/// A selected range; `anchor` is where the selection started, `head` where
/// the caret is. `head` may come before `anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: CursorPos,
    pub head: CursorPos,
}

/// Roster entry sent to joining clients and broadcast on roster changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub name: String,
    pub color: u16,
    pub cursor: Option<CursorPos>,
    pub selection: Option<Selection>,
}

/// A hue in 0..360, derived from a stable hash of the user id so a user
/// keeps their color across reconnects and documents.
pub fn hue_for_user(user_id: &UserId) -> u16 {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() % 360) as u16
}

pub mod factories {
    use super::*;
    use crate::ot::TextOperation;

    /// An operation on a document of `doc_len` code units that inserts `s`
    /// at offset `at`.
    pub fn insert(doc_len: u64, at: u64, s: &str) -> TextOperation {
        let mut op = TextOperation::new();
        op.retain(at);
        op.insert(s);
        op.retain(doc_len - at);
        op
    }

    /// An operation on a document of `doc_len` code units that deletes `n`
    /// code units starting at offset `from`.
    pub fn delete(doc_len: u64, from: u64, n: u64) -> TextOperation {
        let mut op = TextOperation::new();
        op.retain(from);
        op.delete(n);
        op.retain(doc_len - from - n);
        op
    }

    /// An operation on a document of `doc_len` code units that replaces `n`
    /// code units starting at offset `from` with `s`.
    pub fn replace(doc_len: u64, from: u64, n: u64, s: &str) -> TextOperation {
        let mut op = TextOperation::new();
        op.retain(from);
        op.delete(n);
        op.insert(s);
        op.retain(doc_len - from - n);
        op
    }

    pub fn cursor(line: u32, column: u32) -> CursorPos {
        CursorPos { line, column }
    }

    pub fn selection(anchor: (u32, u32), head: (u32, u32)) -> Selection {
        Selection {
            anchor: cursor(anchor.0, anchor.1),
            head: cursor(head.0, head.1),
        }
    }

    pub fn doc_id(s: &str) -> DocumentId {
        DocumentId::try_from(s.to_string()).expect("test document id should be valid")
    }
}

#[cfg(test)]
mod tests {
    use super::factories::*;
    use super::*;

    mod document_ids {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn accepts_reasonable_ids() {
            for id in ["notes", "a", "Design-2.0_final", "x".repeat(256).as_str()] {
                assert!(DocumentId::try_from(id.to_string()).is_ok(), "{id}");
            }
        }

        #[test]
        fn rejects_path_like_ids() {
            assert_eq!(
                DocumentId::try_from("a/b".to_string()),
                Err(InvalidDocumentId::BadCharacter('/'))
            );
            assert_eq!(
                DocumentId::try_from("..".to_string()),
                Err(InvalidDocumentId::LeadingDot)
            );
        }

        #[test]
        fn rejects_empty_and_oversized_ids() {
            assert_eq!(
                DocumentId::try_from(String::new()),
                Err(InvalidDocumentId::Empty)
            );
            assert_eq!(
                DocumentId::try_from("x".repeat(257)),
                Err(InvalidDocumentId::TooLong)
            );
        }
    }

    mod positions {
        use super::*;
        use pretty_assertions::assert_eq;

        //                 offsets  0123456 789012 345
        //                 columns  0123456 012345 012
        const TEXT: &str = "hallo,\nneue7\nwelt";

        #[test]
        fn resolve_and_back() {
            let text = Rope::from_str(TEXT);
            for (pos, offset) in [
                (cursor(0, 0), 0),
                (cursor(0, 3), 3),
                (cursor(1, 0), 7),
                (cursor(1, 2), 9),
                (cursor(2, 3), 16),
            ] {
                assert_eq!(pos.resolve(&text), offset, "{pos:?}");
                assert_eq!(CursorPos::from_offset(offset, &text), pos, "{pos:?}");
            }
        }

        #[test]
        fn astral_chars_count_as_two_columns() {
            let text = Rope::from_str("h🥕llo,\nwelt");
            assert_eq!(cursor(0, 3).resolve(&text), 3);
            assert_eq!(cursor(1, 0).resolve(&text), 8);
            assert_eq!(CursorPos::from_offset(8, &text), cursor(1, 0));
        }

        #[test]
        fn columns_clamp_to_line_end() {
            let text = Rope::from_str(TEXT);
            // Column past the end of the first line stops before the newline.
            assert_eq!(cursor(0, 99).resolve(&text), 6);
            // Line past the end of the document clamps to the last line.
            assert_eq!(cursor(9, 0).resolve(&text), 13);
        }

        #[test]
        fn empty_document_resolves_to_zero() {
            let text = Rope::from_str("");
            assert_eq!(cursor(0, 0).resolve(&text), 0);
            assert_eq!(cursor(3, 7).resolve(&text), 0);
            assert_eq!(CursorPos::from_offset(0, &text), cursor(0, 0));
        }
    }

    mod colors {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn hue_is_stable_and_in_range() {
            let alice = UserId::from("alice");
            assert_eq!(hue_for_user(&alice), hue_for_user(&alice));
            assert!(hue_for_user(&alice) < 360);
        }

        #[test]
        fn different_users_usually_differ() {
            assert_ne!(
                hue_for_user(&UserId::from("alice")),
                hue_for_user(&UserId::from("bob"))
            );
        }
    }
}
