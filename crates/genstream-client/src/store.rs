//! Durable client-side session state.
//!
//! The state document is a flat JSON object with two kinds of keys:
//! `activeSession` holding the running session, and `lastEventId:{sessionId}`
//! holding the highest sequence id received for that session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{ClientError, Result};

const ACTIVE_SESSION_KEY: &str = "activeSession";
const LAST_EVENT_ID_PREFIX: &str = "lastEventId:";

/// The session a client is currently following.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session_id: String,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
}

impl PersistedSession {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            started_at: Utc::now(),
        }
    }
}

/// Storage for the active session and its resume point.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn active_session(&self) -> Result<Option<PersistedSession>>;

    async fn set_active_session(&self, session: &PersistedSession) -> Result<()>;

    /// Highest sequence id seen for the session, 0 if none.
    async fn last_event_id(&self, session_id: &str) -> Result<u64>;

    async fn set_last_event_id(&self, session_id: &str, id: u64) -> Result<()>;

    /// Forget the session. Clears `activeSession` only if it names this session.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
struct StateDocument(Map<String, Value>);

impl StateDocument {
    fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(content)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ClientError::store("state file is not a JSON object")),
        }
    }

    fn active_session(&self) -> Option<PersistedSession> {
        self.0
            .get(ACTIVE_SESSION_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    fn set_active_session(&mut self, session: &PersistedSession) -> Result<()> {
        self.0
            .insert(ACTIVE_SESSION_KEY.to_string(), serde_json::to_value(session)?);
        Ok(())
    }

    fn last_event_id(&self, session_id: &str) -> u64 {
        self.0
            .get(&last_event_key(session_id))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    fn set_last_event_id(&mut self, session_id: &str, id: u64) {
        self.0.insert(last_event_key(session_id), Value::from(id));
    }

    fn clear(&mut self, session_id: &str) {
        if self
            .active_session()
            .is_some_and(|active| active.session_id == session_id)
        {
            self.0.remove(ACTIVE_SESSION_KEY);
        }
        self.0.remove(&last_event_key(session_id));
    }
}

fn last_event_key(session_id: &str) -> String {
    format!("{}{}", LAST_EVENT_ID_PREFIX, session_id)
}

/// JSON file store, by default under the platform data directory.
pub struct FileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data dir>/genstream/session.json`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("genstream")
            .join("session.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StateDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => StateDocument::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &StateDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&document.0)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn update(&self, change: impl FnOnce(&mut StateDocument) -> Result<()>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        change(&mut document)?;
        self.save(&document).await
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn active_session(&self) -> Result<Option<PersistedSession>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.active_session())
    }

    async fn set_active_session(&self, session: &PersistedSession) -> Result<()> {
        self.update(|document| document.set_active_session(session))
            .await
    }

    async fn last_event_id(&self, session_id: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.last_event_id(session_id))
    }

    async fn set_last_event_id(&self, session_id: &str, id: u64) -> Result<()> {
        self.update(|document| {
            document.set_last_event_id(session_id, id);
            Ok(())
        })
        .await
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.update(|document| {
            document.clear(session_id);
            Ok(())
        })
        .await
    }
}

/// In-process store; state is lost with the process.
#[derive(Default)]
pub struct MemorySessionStore {
    document: Mutex<StateDocument>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn active_session(&self) -> Result<Option<PersistedSession>> {
        Ok(self.document.lock().await.active_session())
    }

    async fn set_active_session(&self, session: &PersistedSession) -> Result<()> {
        self.document.lock().await.set_active_session(session)
    }

    async fn last_event_id(&self, session_id: &str) -> Result<u64> {
        Ok(self.document.lock().await.last_event_id(session_id))
    }

    async fn set_last_event_id(&self, session_id: &str, id: u64) -> Result<()> {
        self.document.lock().await.set_last_event_id(session_id, id);
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.document.lock().await.clear(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = FileSessionStore::new(&path);
        let session = PersistedSession::new("S1", "P");
        store.set_active_session(&session).await.unwrap();
        store.set_last_event_id("S1", 7).await.unwrap();

        let reopened = FileSessionStore::new(&path);
        assert_eq!(reopened.active_session().await.unwrap(), Some(session));
        assert_eq!(reopened.last_event_id("S1").await.unwrap(), 7);

        let raw: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(raw["activeSession"]["sessionId"], "S1");
        assert_eq!(raw["lastEventId:S1"], 7);
    }

    #[tokio::test]
    async fn test_clear_only_touches_named_session() {
        let store = MemorySessionStore::new();
        store
            .set_active_session(&PersistedSession::new("S2", "P"))
            .await
            .unwrap();
        store.set_last_event_id("S1", 3).await.unwrap();
        store.set_last_event_id("S2", 4).await.unwrap();

        store.clear("S1").await.unwrap();
        assert_eq!(store.last_event_id("S1").await.unwrap(), 0);
        assert_eq!(store.last_event_id("S2").await.unwrap(), 4);
        assert!(store.active_session().await.unwrap().is_some());

        store.clear("S2").await.unwrap();
        assert!(store.active_session().await.unwrap().is_none());
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("absent.json"));
        tokio_test::block_on(async {
            let active = tokio_test::assert_ok!(store.active_session().await);
            assert!(active.is_none());
            assert_eq!(tokio_test::assert_ok!(store.last_event_id("S1").await), 0);
        });
    }

    #[test]
    fn test_rejects_non_object_state() {
        assert!(StateDocument::parse("[1, 2]").is_err());
        assert!(StateDocument::parse("").is_ok());
    }
}
