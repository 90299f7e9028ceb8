//! File-backed Discovery State Store
//!
//! Persists the confirmed set and continuation token as one JSON document.
//! Saves write a sibling temp file and rename it over the target, so a
//! reader sees either the old pair or the new pair, never a mix.

use super::identifier::Identifier;
use super::traits::{ConfirmedSet, ContinuationToken, DiscoveryStateStore, StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// On-disk format version
const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    identifiers: BTreeSet<Identifier>,
    /// Hex-encoded continuation token
    token: String,
}

pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DiscoveryStateStore for JsonFileStateStore {
    async fn load(&self) -> StoreResult<ConfirmedSet> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ConfirmedSet::empty()),
            Err(e) => return Err(e.into()),
        };

        let document: StateDocument = serde_json::from_slice(&contents)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))?;

        if document.version != STATE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported state version {}",
                document.version
            )));
        }

        let token = hex::decode(&document.token)
            .map_err(|e| StoreError::Corrupt(format!("invalid token encoding: {}", e)))?;

        Ok(ConfirmedSet {
            identifiers: document.identifiers,
            token: Some(ContinuationToken(token)),
        })
    }

    async fn save(
        &self,
        identifiers: &BTreeSet<Identifier>,
        token: &ContinuationToken,
    ) -> StoreResult<()> {
        let document = StateDocument {
            version: STATE_VERSION,
            identifiers: identifiers.clone(),
            token: hex::encode(&token.0),
        };
        let contents = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::Backend(format!("failed to serialize state: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(raw: &[&str]) -> BTreeSet<Identifier> {
        raw.iter().filter_map(|s| Identifier::sanitize(s)).collect()
    }

    #[tokio::test]
    async fn test_missing_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state.json"));

        let loaded = store.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("nested").join("state.json"));
        let identifiers = ids(&["+15550000001", "+15550000002"]);
        let token = ContinuationToken(vec![0xca, 0xfe]);

        store.save(&identifiers, &token).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.identifiers, identifiers);
        assert_eq!(loaded.token, Some(token));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_save_replaces_whole_pair() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state.json"));

        store
            .save(&ids(&["+15550000001"]), &ContinuationToken(vec![1]))
            .await
            .unwrap();
        store
            .save(&ids(&["+15550000002"]), &ContinuationToken(vec![2]))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.identifiers, ids(&["+15550000002"]));
        assert_eq!(loaded.token, Some(ContinuationToken(vec![2])));
    }

    #[tokio::test]
    async fn test_clear_removes_state() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state.json"));

        store
            .save(&ids(&["+15550000001"]), &ContinuationToken(vec![1]))
            .await
            .unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();

        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = JsonFileStateStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_unsanitized_identifier_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            br#"{"version":1,"identifiers":["5550000001"],"token":"01"}"#,
        )
        .unwrap();

        let store = JsonFileStateStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Corrupt(_))));
    }
}
