//! Durable `{currentTerm, votedFor}` at `data/node-<id>/meta.json`.
//!
//! The file must hit disk before any reply that depends on it: before a vote
//! is granted and before a higher term is acknowledged. Writes go through a
//! temp file and rename so a crash never leaves a torn file behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn open(dir: &Path) -> Self {
        Self {
            path: dir.join("meta.json"),
        }
    }

    /// Load the persisted term and vote, or defaults if none exist yet.
    pub fn load(&self) -> Result<NodeMeta> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeMeta::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    pub fn save(&self, meta: &NodeMeta) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&serde_json::to_vec(meta)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        // Make the rename itself durable.
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_file) = OpenOptions::new().read(true).open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path());
        assert_eq!(store.load().unwrap(), NodeMeta::default());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path());
        let meta = NodeMeta {
            current_term: 7,
            voted_for: Some("n2".to_string()),
        };
        store.save(&meta).unwrap();
        assert_eq!(store.load().unwrap(), meta);

        // Overwrite keeps the latest value.
        let newer = NodeMeta {
            current_term: 9,
            voted_for: None,
        };
        store.save(&newer).unwrap();
        assert_eq!(store.load().unwrap(), newer);
    }

    #[test]
    fn file_is_json_with_expected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path());
        store
            .save(&NodeMeta {
                current_term: 3,
                voted_for: Some("n1".to_string()),
            })
            .unwrap();
        let raw = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        assert!(raw.contains("\"currentTerm\":3"), "{raw}");
        assert!(raw.contains("\"votedFor\":\"n1\""), "{raw}");
    }
}
