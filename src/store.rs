//! Client-side persistence for credentials and conversation state.
//!
//! `FileStore` keeps one JSON file per key under the user's data directory and
//! survives restarts. `MemoryStore` lives as long as the process, the same
//! lifetime a browser tab's session storage has.

use crate::error::{ChatError, ChatResult};
use crate::types::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::OffsetDateTime;

pub const TOKEN_KEY: &str = "auth_token";
pub const CONVERSATION_KEY: &str = "conversation_id";
pub const TRANSCRIPT_KEY: &str = "transcript";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl StoredToken {
    pub fn new(token: impl Into<String>, valid_for: time::Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: OffsetDateTime::now_utc() + valid_for,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> ChatResult<()>;
    fn delete(&self, key: &str) -> ChatResult<()>;

    /// Returns the cached bearer token unless it has expired.
    fn token(&self) -> Option<StoredToken> {
        let raw = self.get(TOKEN_KEY)?;
        match serde_json::from_str::<StoredToken>(&raw) {
            Ok(token) if !token.is_expired(OffsetDateTime::now_utc()) => Some(token),
            Ok(_) => {
                tracing::debug!("cached token expired");
                None
            }
            Err(err) => {
                tracing::warn!(%err, "discarding unreadable cached token");
                None
            }
        }
    }

    fn save_token(&self, token: &StoredToken) -> ChatResult<()> {
        self.set(TOKEN_KEY, &serde_json::to_string(token)?)
    }

    fn conversation_id(&self) -> Option<String> {
        self.get(CONVERSATION_KEY)
    }

    fn save_conversation_id(&self, id: &str) -> ChatResult<()> {
        self.set(CONVERSATION_KEY, id)
    }

    fn transcript(&self) -> Vec<ChatMessage> {
        self.get(TRANSCRIPT_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_transcript(&self, messages: &[ChatMessage]) -> ChatResult<()> {
        self.set(TRANSCRIPT_KEY, &serde_json::to_string(messages)?)
    }

    /// Forgets the token, conversation and transcript.
    fn clear(&self) -> ChatResult<()> {
        for key in [TOKEN_KEY, CONVERSATION_KEY, TRANSCRIPT_KEY] {
            self.delete(key)?;
        }
        Ok(())
    }
}

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/homeaffairs`, or `./cache/homeaffairs` when the platform
    /// has no data directory.
    pub fn default_location() -> Self {
        let dir = dirs::data_local_dir()
            .map(|dir| dir.join("homeaffairs"))
            .unwrap_or_else(|| PathBuf::from("cache").join("homeaffairs"));
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            ChatError::Storage(format!("failed to create {}: {err}", self.dir.display()))
        })?;
        fs::write(self.path_for(key), value)
            .map_err(|err| ChatError::Storage(format!("failed to write {key}: {err}")))
    }

    fn delete(&self, key: &str) -> ChatResult<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)
                .map_err(|err| ChatError::Storage(format!("failed to delete {key}: {err}")))?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| ChatError::Storage(err.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> ChatResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| ChatError::Storage(err.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}
