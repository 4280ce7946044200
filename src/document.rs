// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-document state: the text buffer, the monotone version counter and the
//! bounded operation history needed to transform late-arriving client
//! operations. Mutated only by the session actor that owns it.

use crate::ot::{self, OtError, Precedence, TextOperation};
use crate::store::PersistedDocument;
use crate::types::UserId;
use ropey::Rope;
use std::collections::VecDeque;
use thiserror::Error;

/// One applied operation, kept so later operations can be transformed
/// against it. The entry that took the document from version `v` to `v + 1`
/// sits at index `v - oldest_transformable_version()`.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub author: UserId,
    pub operation: TextOperation,
    /// The text the operation was applied to, i.e. the document at the
    /// entry's base version. Cursor positions stamped with an older version
    /// are resolved against this. Rope clones share their chunks, so the
    /// window costs memory proportional to the retained edits, not to
    /// `window size × document size`.
    pub base_text: Rope,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The client claims a version the server has not produced yet.
    #[error("base version {base} is ahead of the document (version {current})")]
    FutureVersion { base: u64, current: u64 },
    /// The client is further behind than the retained history.
    #[error("base version {base} predates the retained history (oldest is {oldest})")]
    VersionTooOld { base: u64, oldest: u64 },
    /// The operation itself is broken.
    #[error(transparent)]
    Operation(#[from] OtError),
}

impl ApplyError {
    /// Whether sending the client a fresh snapshot gets it back in sync.
    /// A client claiming a future version is broken beyond that.
    pub fn is_resyncable(&self) -> bool {
        !matches!(self, Self::FutureVersion { .. })
    }
}

/// The result of applying a client operation: the operation as it was
/// actually applied (transformed against everything the client hadn't seen)
/// and the version it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub operation: TextOperation,
    pub version: u64,
}

#[derive(Debug)]
pub struct Document {
    text: Rope,
    language: String,
    version: u64,
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
    dirty: bool,
}

impl Document {
    pub fn from_persisted(persisted: PersistedDocument, history_limit: usize) -> Self {
        Self {
            text: Rope::from_str(&persisted.text),
            language: persisted.language,
            version: persisted.version,
            history: VecDeque::new(),
            history_limit,
            dirty: false,
        }
    }

    pub fn snapshot(&self) -> PersistedDocument {
        PersistedDocument {
            text: self.text.to_string(),
            language: self.language.clone(),
            version: self.version,
        }
    }

    pub fn text(&self) -> &Rope {
        &self.text
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn set_language(&mut self, language: String) {
        if self.language != language {
            self.language = language;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// The oldest base version a client operation can still be transformed
    /// from. Anything older needs a snapshot resync.
    pub fn oldest_transformable_version(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    /// Takes an operation a client built against `base_version`, transforms
    /// it over everything applied since, applies it, and appends it to the
    /// history. The version advances by exactly one.
    pub fn apply_client_op(
        &mut self,
        mut operation: TextOperation,
        author: &UserId,
        base_version: u64,
    ) -> Result<AppliedOp, ApplyError> {
        if base_version > self.version {
            return Err(ApplyError::FutureVersion {
                base: base_version,
                current: self.version,
            });
        }
        let oldest = self.oldest_transformable_version();
        if base_version < oldest {
            return Err(ApplyError::VersionTooOld {
                base: base_version,
                oldest,
            });
        }
        for entry in self.history.iter().skip((base_version - oldest) as usize) {
            // The entry is already applied, so the incoming operation is the
            // one that has to move. When both insert at the same spot, the
            // lexicographically smaller author goes first; both sides of a
            // concurrent pair derive the same order.
            let precedence = if entry.author <= *author {
                Precedence::Left
            } else {
                Precedence::Right
            };
            let (_, transformed) = ot::transform(&entry.operation, &operation, precedence)?;
            operation = transformed;
        }
        let base_text = self.text.clone();
        self.text = operation.apply(&self.text)?;
        self.version += 1;
        self.history.push_back(HistoryEntry {
            author: author.clone(),
            operation: operation.clone(),
            base_text,
        });
        self.dirty = true;
        self.trim_history();
        Ok(AppliedOp {
            operation,
            version: self.version,
        })
    }

    /// The document text as it stood at `version`, if that version is still
    /// within the retained history window.
    pub fn text_at(&self, version: u64) -> Option<&Rope> {
        if version == self.version {
            return Some(&self.text);
        }
        let oldest = self.oldest_transformable_version();
        if version < oldest || version > self.version {
            return None;
        }
        self.history
            .get((version - oldest) as usize)
            .map(|entry| &entry.base_text)
    }

    /// Rebases a UTF-16 position from `from_version` to the current version
    /// by walking it through every operation applied in between.
    pub fn rebase_index(&self, mut index: u64, from_version: u64) -> Result<u64, ApplyError> {
        if from_version > self.version {
            return Err(ApplyError::FutureVersion {
                base: from_version,
                current: self.version,
            });
        }
        let oldest = self.oldest_transformable_version();
        if from_version < oldest {
            return Err(ApplyError::VersionTooOld {
                base: from_version,
                oldest,
            });
        }
        for entry in self.history.iter().skip((from_version - oldest) as usize) {
            index = ot::transform_index(&entry.operation, index);
        }
        Ok(index)
    }

    /// Drops history entries beyond the retention window. Clients based on a
    /// dropped version can no longer be transformed and get a snapshot
    /// resync instead.
    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}
