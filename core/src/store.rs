//! Persistence backend for the session registry (spec.md §4.6).
//!
//! `Store` is the extension point: `JsonFileStore` below is the
//! dependency-light default (the whole map serialized on every commit),
//! adequate for the orchestrator's scale. A production deployment wanting
//! incremental durability swaps in another `Store` impl without touching
//! `registry.rs`.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use orchestrator_protocol::Session;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::Result;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn set(&self, id: &str, session: &Session) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Session>>;
}

enum Command {
    Write(HashMap<String, Session>),
}

/// Serializes the full `{id: Session}` map to a single JSON file on every
/// commit. Writes go through a background task reached by an mpsc channel,
/// the same async-writer-task shape `codex-core::rollout::RolloutRecorder`
/// uses to keep the commit path off the caller's critical section.
pub struct JsonFileStore {
    path: PathBuf,
    cache: tokio::sync::RwLock<HashMap<String, Session>>,
    writer: mpsc::Sender<Command>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let initial = load_from_disk(&path).await?;

        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let writer_path = path.clone();
        tokio::spawn(async move {
            while let Some(Command::Write(map)) = rx.recv().await {
                if let Err(e) = write_to_disk(&writer_path, &map).await {
                    tracing::error!(error = %e, path = %writer_path.display(), "failed to persist session store");
                }
            }
        });

        Ok(Self {
            path,
            cache: tokio::sync::RwLock::new(initial),
            writer: tx,
        })
    }

    async fn flush(&self, map: HashMap<String, Session>) -> Result<()> {
        self.writer
            .send(Command::Write(map))
            .await
            .map_err(|_| crate::error::CoreError::Sandbox("store writer task stopped".to_string()))
    }
}

async fn load_from_disk(path: &Path) -> Result<HashMap<String, Session>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_to_disk(path: &Path, map: &HashMap<String, Session>) -> Result<()> {
    let json = serde_json::to_vec_pretty(map)?;
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = tokio::fs::File::create(&tmp_path).await?;
    tmp.write_all(&json).await?;
    tmp.flush().await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl Store for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.cache.read().await.get(id).cloned())
    }

    async fn set(&self, id: &str, session: &Session) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache.write().await;
            cache.insert(id.to_string(), session.clone());
            cache.clone()
        };
        self.flush(snapshot).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache.write().await;
            cache.remove(id);
            cache.clone()
        };
        self.flush(snapshot).await
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.cache.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use orchestrator_protocol::PermissionMode;
    use orchestrator_protocol::SessionStatus;

    fn sample_session() -> Session {
        Session::new(
            "/workspace".to_string(),
            "claude-sonnet".to_string(),
            PermissionMode::Default,
        )
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("sessions.json"))
            .await
            .unwrap();
        let session = sample_session();
        store.set("s1", &session).await.unwrap();
        let fetched = store.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn reopening_loads_the_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.set("s1", &sample_session()).await.unwrap();
            // Give the background writer a chance to flush before reopening.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("sessions.json"))
            .await
            .unwrap();
        store.set("s1", &sample_session()).await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
