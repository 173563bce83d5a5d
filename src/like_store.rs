//! JSON-file store for user feedback pairs.
//!
//! The file always holds a JSON array of `{instruction, response}` records.
//! Missing, empty, or corrupt content is treated as an empty list. Writers are
//! serialized behind a mutex so concurrent appends cannot drop each other's
//! records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LikeRecord {
    pub instruction: String,
    pub response: String,
}

#[derive(thiserror::Error, Debug)]
pub enum LikeStoreError {
    #[error("failed to access the like store: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize like records: {0}")]
    Serialize(serde_json::Error),
}

pub struct LikeStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LikeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one record, rewriting the whole file. Returns the new record
    /// count.
    pub async fn append(&self, record: LikeRecord) -> Result<usize, LikeStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all();
        records.push(record);
        let json = serde_json::to_string_pretty(&records).map_err(LikeStoreError::Serialize)?;
        std::fs::write(&self.path, json)?;
        Ok(records.len())
    }

    /// Current contents; any unreadable or unparsable state degrades to an
    /// empty list instead of failing the caller.
    pub fn read_all(&self) -> Vec<LikeRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        if content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "like store is corrupt, starting fresh");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: &str, r: &str) -> LikeRecord {
        LikeRecord {
            instruction: i.to_string(),
            response: r.to_string(),
        }
    }

    #[tokio::test]
    async fn creates_file_with_single_element_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = LikeStore::new(dir.path().join("like.json"));
        let n = store.append(record("q", "a")).await.unwrap();
        assert_eq!(n, 1);

        let content = std::fs::read_to_string(dir.path().join("like.json")).unwrap();
        let parsed: Vec<LikeRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, vec![record("q", "a")]);
    }

    #[tokio::test]
    async fn sequential_appends_keep_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LikeStore::new(dir.path().join("like.json"));
        store.append(record("first", "1")).await.unwrap();
        let n = store.append(record("second", "2")).await.unwrap();
        assert_eq!(n, 2);

        let records = store.read_all();
        assert_eq!(records[0].instruction, "first");
        assert_eq!(records[1].instruction, "second");
    }

    #[tokio::test]
    async fn corrupt_file_is_replaced_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("like.json");
        std::fs::write(&path, "{{{ definitely not json").unwrap();

        let store = LikeStore::new(&path);
        let n = store.append(record("q", "a")).await.unwrap();
        assert_eq!(n, 1);
        let parsed: Vec<LikeRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[tokio::test]
    async fn append_surfaces_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        // parent directory does not exist, the write must fail
        let store = LikeStore::new(dir.path().join("missing").join("like.json"));
        let err = store.append(record("q", "a")).await.unwrap_err();
        assert!(matches!(err, LikeStoreError::Io(_)));
    }

    #[tokio::test]
    async fn empty_file_reads_as_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("like.json");
        std::fs::write(&path, "  \n").unwrap();
        let store = LikeStore::new(&path);
        assert!(store.read_all().is_empty());
    }
}
