//! Point-in-time images of the state machine.
//!
//! A snapshot is one JSON object at `data/node-<id>/snapshot`, written as
//! `snapshot.tmp` and renamed into place so readers only ever see a complete
//! image. It replaces every log entry at or below `lastIncludedIndex`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Once this many applied entries accumulate in the log, the consensus core
/// captures a snapshot and compacts the log.
pub const SNAPSHOT_THRESHOLD: u64 = 1000;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// The full key-value map.
    pub data: HashMap<String, String>,
    /// Highest applied sequence per client, carried so at-most-once
    /// semantics survive compaction.
    pub sequences: HashMap<String, u64>,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Load the latest snapshot, if one has been taken.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        match fs::read(self.path()) {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse {}", self.path().display()))?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", self.path().display()))
            }
        }
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join("snapshot.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&serde_json::to_vec(snapshot)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path())?;
        Ok(())
    }
}
