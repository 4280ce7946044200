// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pluggable persistence for documents. A session actor saves its document
//! here on a cadence and on last-leave; the registry loads from here when a
//! session is created.

use crate::types::DocumentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// What survives a restart: the text, the language tag and the version the
/// text corresponds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub text: String,
    pub language: String,
    pub version: u64,
}

impl Default for PersistedDocument {
    fn default() -> Self {
        Self {
            text: String::new(),
            language: "plaintext".to_string(),
            version: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Writes are last-write-wins per document, with the version as a monotone
/// guard: a save carrying an older version than what is already stored is
/// silently skipped.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, id: &DocumentId) -> Result<Option<PersistedDocument>, StoreError>;
    async fn save(&self, id: &DocumentId, document: &PersistedDocument) -> Result<(), StoreError>;
}

/// Keeps documents in process memory. The default for tests and for running
/// without a data directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, PersistedDocument>>,
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<PersistedDocument>, StoreError> {
        let documents = self.documents.lock().expect("store lock poisoned");
        Ok(documents.get(id).cloned())
    }

    async fn save(&self, id: &DocumentId, document: &PersistedDocument) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().expect("store lock poisoned");
        if let Some(existing) = documents.get(id) {
            if existing.version > document.version {
                debug!(
                    "Skipping save of {id} at version {}, store already has {}",
                    document.version, existing.version
                );
                return Ok(());
            }
        }
        documents.insert(id.clone(), document.clone());
        Ok(())
    }
}

/// One JSON file per document under a data directory. Writes go through a
/// temporary file and a rename, so a crash can't leave a half-written
/// document behind.
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub async fn new(directory: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    fn path_for(&self, id: &DocumentId) -> PathBuf {
        // Document ids are restricted to a filename-safe alphabet, see
        // `DocumentId::try_from`.
        self.directory.join(format!("{id}.json"))
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<PersistedDocument>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, id: &DocumentId, document: &PersistedDocument) -> Result<(), StoreError> {
        if let Some(existing) = self.load(id).await? {
            if existing.version > document.version {
                debug!(
                    "Skipping save of {id} at version {}, store already has {}",
                    document.version, existing.version
                );
                return Ok(());
            }
        }
        let path = self.path_for(id);
        let tmp_path = self.directory.join(format!(".{id}.json.tmp"));
        let bytes = serde_json::to_vec(document)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::doc_id;
    use pretty_assertions::assert_eq;
    use temp_dir::TempDir;

    fn sample(version: u64) -> PersistedDocument {
        PersistedDocument {
            text: "fn main() {}\n".to_string(),
            language: "rust".to_string(),
            version,
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::default();
        let id = doc_id("scratch");
        assert_eq!(store.load(&id).await.expect("load"), None);

        store.save(&id, &sample(3)).await.expect("save");
        assert_eq!(store.load(&id).await.expect("load"), Some(sample(3)));
    }

    #[tokio::test]
    async fn stale_saves_are_skipped() {
        let store = MemoryStore::default();
        let id = doc_id("scratch");
        store.save(&id, &sample(5)).await.expect("save");
        store.save(&id, &sample(4)).await.expect("stale save");
        assert_eq!(store.load(&id).await.expect("load"), Some(sample(5)));
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf())
            .await
            .expect("create store");
        let id = doc_id("notes");
        assert_eq!(store.load(&id).await.expect("load"), None);

        store.save(&id, &sample(1)).await.expect("save");
        store.save(&id, &sample(2)).await.expect("save");
        assert_eq!(store.load(&id).await.expect("load"), Some(sample(2)));

        // A second store over the same directory sees the same data.
        let reopened = FileStore::new(dir.path().to_path_buf())
            .await
            .expect("reopen store");
        assert_eq!(reopened.load(&id).await.expect("load"), Some(sample(2)));
    }

    #[tokio::test]
    async fn file_store_guards_against_stale_versions() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf())
            .await
            .expect("create store");
        let id = doc_id("notes");
        store.save(&id, &sample(9)).await.expect("save");
        store.save(&id, &sample(2)).await.expect("stale save");
        assert_eq!(store.load(&id).await.expect("load"), Some(sample(9)));
    }

    #[tokio::test]
    async fn corrupt_files_error_instead_of_vanishing() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf())
            .await
            .expect("create store");
        let id = doc_id("notes");
        tokio::fs::write(dir.path().join("notes.json"), b"not json")
            .await
            .expect("write garbage");
        assert!(matches!(
            store.load(&id).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
