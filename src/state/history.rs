//! Persisted conversation history.
//!
//! One pretty-printed JSON document holding every persistable envelope, the
//! unread counters, the delivery status table and the contacts cache. A
//! save rotates the previous file to `<path>.bak`; a load falls back to the
//! backup when the primary file is missing or corrupted.

use crate::chat::delivery::StatusEntry;
use crate::contacts::Contact;
use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HISTORY_VERSION: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub envelopes: Vec<Envelope>,
    #[serde(default)]
    pub unread_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub delivery_status: BTreeMap<i64, StatusEntry>,
    #[serde(default)]
    pub contacts_cache: BTreeMap<String, Contact>,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HistoryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Read history from `path`, or from its backup if `path` is missing or
/// corrupted. Nothing on disk is changed.
pub fn read(path: &Path) -> Result<Option<HistoryDocument>, HistoryError> {
    Ok(read_first(path)?.map(|(doc, _)| doc))
}

/// Like [`read`], but then moves the file that was read to the backup
/// location so the next save starts a fresh primary.
pub fn load(path: &Path) -> Result<Option<HistoryDocument>, HistoryError> {
    let Some((doc, source)) = read_first(path)? else {
        tracing::warn!(path = %path.display(), "could not read history");
        return Ok(None);
    };
    let backup = backup_path(path);
    if source != backup {
        std::fs::rename(&source, &backup).map_err(|e| HistoryError::io(&source, e))?;
    }
    tracing::info!(
        path = %source.display(),
        envelopes = doc.envelopes.len(),
        "loaded history"
    );
    Ok(Some(doc))
}

fn read_first(path: &Path) -> Result<Option<(HistoryDocument, PathBuf)>, HistoryError> {
    let backup = backup_path(path);
    for candidate in [path, backup.as_path()] {
        let text = match std::fs::read_to_string(candidate) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(HistoryError::io(candidate, e)),
        };
        match serde_json::from_str::<HistoryDocument>(&text) {
            Ok(doc) => {
                if doc.version != HISTORY_VERSION {
                    tracing::warn!(version = doc.version, "unexpected history version");
                }
                return Ok(Some((doc, candidate.to_path_buf())));
            }
            Err(e) => {
                tracing::error!(
                    path = %candidate.display(),
                    error = %e,
                    "history file corrupted, trying backup"
                );
            }
        }
    }
    Ok(None)
}

/// Write `doc` to `path`, moving any existing file to the backup location.
pub fn save(path: &Path, doc: &HistoryDocument) -> Result<(), HistoryError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| HistoryError::io(dir, e))?;
    }
    let json = serde_json::to_string_pretty(doc)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).map_err(|e| HistoryError::io(&tmp, e))?;
    if path.exists() {
        let backup = backup_path(path);
        std::fs::rename(path, &backup).map_err(|e| HistoryError::io(path, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| HistoryError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(text: &str) -> HistoryDocument {
        HistoryDocument {
            version: HISTORY_VERSION,
            envelopes: vec![Envelope {
                source: "+15555550001".into(),
                timestamp: Some(1),
                data_message: Some(crate::envelope::DataMessage {
                    message: Some(text.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn missing_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("history")).unwrap().is_none());
    }

    #[test]
    fn save_rotates_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history");
        save(&path, &doc_with("first")).unwrap();
        assert!(!backup_path(&path).exists());
        save(&path, &doc_with("second")).unwrap();

        let backup: HistoryDocument =
            serde_json::from_str(&std::fs::read_to_string(backup_path(&path)).unwrap()).unwrap();
        assert_eq!(backup.envelopes[0].text(), Some("first"));
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.envelopes[0].text(), Some("second"));
    }

    #[test]
    fn corrupted_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        save(&path, &doc_with("good")).unwrap();
        std::fs::rename(&path, backup_path(&path)).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.envelopes[0].text(), Some("good"));
        // The corrupted primary is left alone.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn read_leaves_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        save(&path, &doc_with("x")).unwrap();
        assert!(read(&path).unwrap().is_some());
        assert!(path.exists());
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn loading_moves_primary_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        save(&path, &doc_with("x")).unwrap();
        load(&path).unwrap().unwrap();
        assert!(!path.exists());
        assert!(backup_path(&path).exists());
    }
}
