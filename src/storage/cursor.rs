use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::errors::StateError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorFile {
    #[serde(default)]
    streams: BTreeMap<String, u64>,
    // Older state files only carried a single stream
    #[serde(default, skip_serializing)]
    last_block: Option<u64>,
}

/// Durable "last processed block" per stream, backed by one small JSON file.
///
/// Writes go to a sibling temp file that is then renamed over the original, so a
/// crash mid-write leaves either the old or the new cursor, never a torn file.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
    stream: String,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>, stream: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stream: stream.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// `None` when nothing was persisted yet for this stream.
    pub fn load(&self) -> Result<Option<u64>, StateError> {
        let file = self.read_file()?;
        let cursor = file
            .streams
            .get(&self.stream)
            .copied()
            .or(file.last_block);

        match cursor {
            Some(block) => info!("Loaded cursor for stream {}: block {}", self.stream, block),
            None => info!("No cursor found for stream {}", self.stream),
        }
        Ok(cursor)
    }

    /// Record `block` for this stream, keeping cursors of other streams intact.
    pub fn save(&self, block: u64) -> Result<(), StateError> {
        let mut file = self.read_file()?;
        file.last_block = None;
        file.streams.insert(self.stream.clone(), block);
        self.write_file(&file)?;

        debug!("Persisted cursor {} for stream {}", block, self.stream);
        Ok(())
    }

    fn write_file(&self, file: &CursorFile) -> Result<(), StateError> {
        let body = serde_json::to_vec_pretty(file).map_err(|source| StateError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, body).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    /// Forget this stream's cursor, e.g. after rolling back to before the first block.
    pub fn clear(&self) -> Result<(), StateError> {
        let mut file = self.read_file()?;
        if file.streams.remove(&self.stream).is_none() && file.last_block.is_none() {
            return Ok(());
        }
        file.last_block = None;
        self.write_file(&file)
    }

    fn read_file(&self) -> Result<CursorFile, StateError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CursorFile::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_slice(&raw).map_err(|source| StateError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_has_no_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("state.json"), "logs");
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_then_load_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let logs = CursorStore::new(&path, "logs");
        let transfers = CursorStore::new(&path, "transfers");

        logs.save(100).unwrap();
        transfers.save(7).unwrap();
        logs.save(150).unwrap();

        assert_eq!(logs.load().unwrap(), Some(150));
        assert_eq!(transfers.load().unwrap(), Some(7));
        assert!(!path.with_file_name("state.json.tmp").exists());

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["streams"]["logs"], 150);
    }

    #[test]
    fn reads_legacy_single_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"last_block": 4242}"#).unwrap();

        let store = CursorStore::new(&path, "logs");
        assert_eq!(store.load().unwrap(), Some(4242));

        store.save(4300).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("last_block").is_none());
        assert_eq!(store.load().unwrap(), Some(4300));
    }

    #[test]
    fn clear_forgets_only_this_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let logs = CursorStore::new(&path, "logs");
        let other = CursorStore::new(&path, "other");
        logs.save(10).unwrap();
        other.save(20).unwrap();

        logs.clear().unwrap();

        assert_eq!(logs.load().unwrap(), None);
        assert_eq!(other.load().unwrap(), Some(20));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        let err = CursorStore::new(&path, "logs").load().unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }
}
