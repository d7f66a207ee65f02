//! Conversation transcripts written by the agent runtime.
//!
//! ```text
//! <sessions_dir>/
//! ├── sessions.json      optional index: { "<sessionKey>": { "sessionId": "...", ... } }
//! ├── 3f2a....jsonl      one JSON message per line
//! └── ...
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bridge::types::{SessionHistory, SessionInfo};
use crate::error::StoreError;
use crate::store::write_json_atomic;

const TRANSCRIPT_EXT: &str = "jsonl";
const INDEX_FILE: &str = "sessions.json";

/// Session ids become file names, so only a safe alphabet is accepted.
pub fn validate_session_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(id.to_string()))
    }
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{TRANSCRIPT_EXT}"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// All transcripts, most recently updated first. A missing directory is
    /// an empty list.
    pub fn list(&self) -> Result<Vec<SessionInfo>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(&self.dir, e)),
        };
        let index = self.read_index();

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_session_id(id).is_err() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            let message_count = fs::read_to_string(&path)
                .map(|data| data.lines().filter(|l| !l.trim().is_empty()).count())
                .unwrap_or(0);
            let updated_at = metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

            sessions.push(SessionInfo {
                id: id.to_string(),
                key: index_key_for(&index, id),
                size: metadata.len(),
                message_count,
                updated_at,
            });
        }

        // RFC 3339 strings in UTC sort chronologically.
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Parsed transcript, or `None` if the session does not exist. Lines that
    /// are not valid JSON are skipped.
    pub fn history(&self, id: &str) -> Result<Option<SessionHistory>, StoreError> {
        validate_session_id(id)?;
        let path = self.transcript_path(id);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(&path, e)),
        };

        let messages = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Value>(line) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!(session_id = %id, "Skipping malformed transcript line: {}", e);
                    None
                }
            })
            .collect();

        Ok(Some(SessionHistory {
            id: id.to_string(),
            messages,
        }))
    }

    /// Remove a transcript and any index entries pointing at it. Returns
    /// `false` if the session did not exist.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        validate_session_id(id)?;
        let path = self.transcript_path(id);
        let existed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(self.io_err(&path, e)),
        };

        let mut index = self.read_index();
        if let Some(map) = index.as_object_mut() {
            let before = map.len();
            map.retain(|_, entry| session_id_of(entry) != Some(id));
            if map.len() != before {
                write_json_atomic(&self.index_path(), &index, false)?;
                tracing::info!(session_id = %id, "Removed session from index");
                return Ok(true);
            }
        }

        if existed {
            tracing::info!(session_id = %id, "Deleted session transcript");
        }
        Ok(existed)
    }

    fn read_index(&self) -> Value {
        fs::read_to_string(self.index_path())
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or(Value::Null)
    }
}

fn session_id_of(entry: &Value) -> Option<&str> {
    entry.get("sessionId").and_then(Value::as_str)
}

fn index_key_for(index: &Value, id: &str) -> Option<String> {
    index
        .as_object()?
        .iter()
        .find(|(_, entry)| session_id_of(entry) == Some(id))
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(files: &[(&str, &str)]) -> (SessionStore, TempDir) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        (SessionStore::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("abc-123_DEF").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("a.b").is_err());
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_reads_transcripts_and_index() {
        let (store, _dir) = store_with(&[
            ("s1.jsonl", "{\"role\":\"user\"}\n{\"role\":\"assistant\"}\n"),
            ("s2.jsonl", "{\"role\":\"user\"}\n"),
            ("notes.txt", "ignored"),
            (INDEX_FILE, r#"{"agent:main:main":{"sessionId":"s1"}}"#),
        ]);

        let sessions = store.list().unwrap();
        assert_eq!(sessions.len(), 2);
        let s1 = sessions.iter().find(|s| s.id == "s1").unwrap();
        assert_eq!(s1.message_count, 2);
        assert_eq!(s1.key.as_deref(), Some("agent:main:main"));
        assert!(s1.updated_at.is_some());
        let s2 = sessions.iter().find(|s| s.id == "s2").unwrap();
        assert!(s2.key.is_none());
    }

    #[test]
    fn test_history_skips_malformed_lines() {
        let (store, _dir) = store_with(&[(
            "s1.jsonl",
            "{\"role\":\"user\",\"text\":\"hi\"}\nnot json\n\n{\"role\":\"assistant\"}\n",
        )]);
        let history = store.history("s1").unwrap().unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[0]["text"], "hi");

        assert!(store.history("missing").unwrap().is_none());
        assert!(matches!(
            store.history("../s1"),
            Err(StoreError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn test_delete_removes_file_and_index_entry() {
        let (store, dir) = store_with(&[
            ("s1.jsonl", "{}\n"),
            ("s2.jsonl", "{}\n"),
            (
                INDEX_FILE,
                r#"{"a":{"sessionId":"s1"},"b":{"sessionId":"s2"}}"#,
            ),
        ]);

        assert!(store.delete("s1").unwrap());
        assert!(!dir.path().join("s1.jsonl").exists());

        let index: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap())
                .unwrap();
        assert!(index.get("a").is_none());
        assert_eq!(index["b"]["sessionId"], "s2");

        assert!(!store.delete("s1").unwrap());
    }
}
