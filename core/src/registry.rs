//! Persisted session registry (spec.md §4.6): the single process-wide
//! mutex serializing every mutation, backed by a `Store` and fronted by an
//! `LruCache` bound on in-memory residency.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use chrono::Utc;
use orchestrator_protocol::ErrorRecord;
use orchestrator_protocol::ModelInfo;
use orchestrator_protocol::OptionValidationMode;
use orchestrator_protocol::PermissionMode;
use orchestrator_protocol::Session;
use orchestrator_protocol::SessionOptions;
use orchestrator_protocol::SessionStatus;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::event_bus::EventKind;
use crate::lru_cache::LruCache;
use crate::process_manager::ProcessManager;
use crate::sandbox::Sandbox;

/// Everything the registry needs to turn `SessionOptions` into the first
/// `start` call for a session's process: the agent binary and the flags it
/// needs, built shell-safely from validated option fields.
pub type CommandBuilder = Arc<dyn Fn(&Session) -> Vec<String> + Send + Sync>;

/// Persisted map of session id to `Session`, mutation-serialized by one
/// process-wide mutex. Readers call `get`/`list` without taking that lock;
/// they only ever see the last snapshot a writer committed.
pub struct SessionRegistry {
    store: Arc<dyn crate::store::Store>,
    cache: Mutex<LruCache<String, Session>>,
    processes: Arc<ProcessManager>,
    bus: EventBus,
    write_lock: Mutex<()>,
    command_builder: CommandBuilder,
    models: Vec<ModelInfo>,
    pipe_dir: std::path::PathBuf,
    validation_mode: OptionValidationMode,
    self_ref: OnceLock<Weak<SessionRegistry>>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn crate::store::Store>,
        sandbox: Arc<dyn Sandbox>,
        bus: EventBus,
        max_sessions: usize,
        command_builder: CommandBuilder,
        models: Vec<ModelInfo>,
        pipe_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(max_sessions)),
            processes: Arc::new(ProcessManager::new(sandbox, bus.clone())),
            bus,
            write_lock: Mutex::new(()),
            command_builder,
            models,
            pipe_dir,
            validation_mode: OptionValidationMode::Warn,
            self_ref: OnceLock::new(),
        }
    }

    /// Override how `create_session` treats option keys it doesn't
    /// recognize (spec.md §4.6). Defaults to `Warn`.
    pub fn with_validation_mode(mut self, mode: OptionValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    /// Record a weak self-reference so a stream-error callback registered
    /// deep inside `send_message` can reach back into the registry to call
    /// `mark_error` (spec.md §4.5's "stream error converts to session
    /// error"). Callers that wrap the registry in an `Arc` should call this
    /// once, immediately after construction.
    pub fn bind_self(self: &Arc<Self>) {
        let _ = self.self_ref.set(Arc::downgrade(self));
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    /// Validate `options`, assign a fresh id, persist and cache the new
    /// `Session`. The mutex is held for the entire read-modify-persist
    /// span so concurrent creates never observe or overwrite each other's
    /// work; `listSessions` after N concurrent successful creates is
    /// guaranteed to return exactly N distinct sessions.
    pub async fn create_session(&self, options: SessionOptions) -> Result<Session> {
        options.validate(self.validation_mode).map_err(|e| {
            CoreError::invalid_argument(validation_error_field(&e), e.to_string())
        })?;
        if self.validation_mode == OptionValidationMode::Warn {
            for key in options.extra.keys() {
                warn!(key = %key, "createSession: ignoring unrecognized option key");
            }
        }

        let _guard = self.write_lock.lock().await;

        let cwd = options.cwd.clone().unwrap_or_else(|| ".".to_string());
        let model = options.model.clone().unwrap_or_else(|| "default".to_string());
        let permission_mode = options.permission_mode.unwrap_or_default();

        let mut session = Session::new(cwd, model, permission_mode);
        session.fallback_model = options.fallback_model.clone();
        if let Some(sp) = options.system_prompt.clone() {
            session.system_prompt = sp;
        }
        if let Some(tools) = options.tools.clone() {
            session.tools = tools;
        }
        session.allowed_tools = options.allowed_tools.clone();
        session.disallowed_tools = options.disallowed_tools.clone();
        session.mcp_servers = options.mcp_servers.clone();

        self.store.set(&session.id.to_string(), &session).await?;
        self.cache.lock().await.set(session.id.to_string(), session.clone());

        Ok(session)
    }

    /// Point lookup. Prefers the in-memory cache; falls back to the
    /// persisted store on a cache miss (e.g. after eviction) without
    /// taking the write mutex.
    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let key = id.to_string();
        if let Some(session) = self.cache.lock().await.get(&key) {
            return Ok(Some(session.clone()));
        }
        let persisted = self.store.get(&key).await?;
        if let Some(session) = &persisted {
            self.cache.lock().await.set(key, session.clone());
        }
        Ok(persisted)
    }

    pub async fn resume_session(&self, id: Uuid) -> Result<Session> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .get_session(id)
            .await?
            .ok_or(CoreError::SessionNotFound(id))?;
        let _ = session.transition_to(SessionStatus::Active);
        session.last_activity_at = Utc::now();
        self.commit(&session).await?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list().await
    }

    /// Terminate any live process for `id` (tolerant of already-dead),
    /// remove from registry and persistence. Idempotent.
    pub async fn destroy_session(&self, id: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = id.to_string();
        self.processes.kill(&key).await?;
        self.bus.clear_session(&key).await;
        self.cache.lock().await.delete(&key);
        self.store.delete(&key).await?;
        Ok(())
    }

    /// Mark activity, ensure a live process exists (starting one if
    /// necessary), and write the message to its input pipe. The write
    /// itself happens outside the registry mutex (process I/O is a
    /// suspension point); only the bookkeeping around it is serialized.
    pub async fn send_message(&self, id: Uuid, text: &str) -> Result<()> {
        let key = id.to_string();

        let mut session = {
            let _guard = self.write_lock.lock().await;
            let mut session = self
                .get_session(id)
                .await?
                .ok_or(CoreError::SessionNotFound(id))?;
            session.last_activity_at = Utc::now();
            self.commit(&session).await?;
            session.clone()
        };

        if !self.processes.is_alive(&key).await {
            let command = (self.command_builder)(&session);
            let pipe_path = self.pipe_dir.join(format!("claude_input_{key}"));
            self.processes
                .start(&key, command, HashMap::new(), pipe_path)
                .await?;
            self.install_error_forwarding(&key).await;
        }

        self.processes.write(&key, text).await?;

        session.turn_count += 1;
        let _guard = self.write_lock.lock().await;
        self.commit(&session).await?;

        Ok(())
    }

    /// Kill the live process and mark the session interrupted.
    pub async fn interrupt(&self, id: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = id.to_string();
        self.processes.kill(&key).await?;
        let mut session = self
            .get_session(id)
            .await?
            .ok_or(CoreError::SessionNotFound(id))?;
        if !session.transition_to(SessionStatus::Interrupted) {
            warn!(
                session_id = %id,
                status = ?session.status,
                "interrupt: ignoring illegal transition to Interrupted"
            );
            return Ok(());
        }
        self.commit(&session).await?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, id: Uuid, mode: PermissionMode) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .get_session(id)
            .await?
            .ok_or(CoreError::SessionNotFound(id))?;
        session.permission_mode = mode;
        self.commit(&session).await?;
        Ok(())
    }

    /// Record a stream-error-triggered failure: mark not-alive (the
    /// process manager already did this), set status to error with the
    /// error details.
    pub async fn mark_error(&self, id: Uuid, message: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .get_session(id)
            .await?
            .ok_or(CoreError::SessionNotFound(id))?;
        if !session.transition_to(SessionStatus::Error) {
            warn!(
                session_id = %id,
                status = ?session.status,
                "mark_error: ignoring illegal transition to Error, leaving status untouched"
            );
            return Ok(());
        }
        session.error = Some(ErrorRecord {
            message,
            code: None,
            timestamp: Utc::now(),
        });
        self.commit(&session).await?;
        Ok(())
    }

    /// Subscribe once to `error:<id>` so a stream-error event raised by the
    /// process manager (spec.md §4.5) is reflected into `session.status` and
    /// `session.error` without the process manager needing to know about the
    /// registry. Cleaned up automatically by `destroy_session`'s
    /// `bus.clear_session`.
    async fn install_error_forwarding(&self, session_id: &str) {
        let Ok(id) = uuid::Uuid::parse_str(session_id) else {
            return;
        };
        let self_ref = self.self_ref.get().cloned();
        self.bus
            .subscribe(
                EventKind::Error,
                session_id,
                Arc::new(move |event: &orchestrator_protocol::Event| {
                    let Some(self_ref) = self_ref.clone() else {
                        return Ok(());
                    };
                    let orchestrator_protocol::Event::StreamEvent { raw, .. } = event else {
                        return Ok(());
                    };
                    let message = raw
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("stream error")
                        .to_string();
                    tokio::spawn(async move {
                        if let Some(registry) = self_ref.upgrade() {
                            let _ = registry.mark_error(id, message).await;
                        }
                    });
                    Ok(())
                }),
            )
            .await;
    }

    pub fn supported_models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub async fn mcp_server_status(&self, id: Uuid) -> Result<Vec<(String, String)>> {
        let session = self
            .get_session(id)
            .await?
            .ok_or(CoreError::SessionNotFound(id))?;
        Ok(session
            .mcp_servers
            .iter()
            .map(|entry| (entry.name().to_string(), format!("{:?}", entry.status())))
            .collect())
    }

    async fn commit(&self, session: &Session) -> Result<()> {
        self.store.set(&session.id.to_string(), session).await?;
        self.cache
            .lock()
            .await
            .set(session.id.to_string(), session.clone());
        Ok(())
    }
}

/// Maps a `ValidationError` to the option field name it concerns, for
/// `CoreError::InvalidArgument`'s `field` slot.
fn validation_error_field(e: &orchestrator_protocol::ValidationError) -> &'static str {
    use orchestrator_protocol::ValidationError::*;
    match e {
        MustBePositive { field, .. } => field,
        UnsafeCwd(_) => "cwd",
        UnsafeToken { field, .. } => field,
        UnknownKey(_) => "unknown",
        NullByte { field } => field,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::sandbox::ExecOptions;
    use crate::sandbox::ExecOutput;
    use crate::sandbox::SpawnedProcess;
    use async_trait::async_trait;

    struct NullSandbox;

    #[async_trait]
    impl Sandbox for NullSandbox {
        async fn exec(&self, _command: &[String], _opts: ExecOptions) -> Result<ExecOutput> {
            unimplemented!()
        }
        async fn start_process(
            &self,
            _command: &[String],
            _stdin_pipe: &std::path::Path,
            _env: HashMap<String, String>,
        ) -> Result<SpawnedProcess> {
            unimplemented!()
        }
        async fn read_file(&self, _path: &std::path::Path) -> Result<String> {
            unimplemented!()
        }
        async fn write_file(&self, _path: &std::path::Path, _content: &str) -> Result<()> {
            Ok(())
        }
        async fn kill_process(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn registry() -> SessionRegistry {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            crate::store::JsonFileStore::open(dir.path().join("sessions.json"))
                .await
                .unwrap(),
        );
        SessionRegistry::new(
            store,
            Arc::new(NullSandbox),
            EventBus::new(),
            100,
            Arc::new(|_s: &Session| vec!["agent".to_string()]),
            vec![ModelInfo {
                id: "claude-sonnet".to_string(),
                display_name: "Claude Sonnet".to_string(),
                supports_thinking: false,
            }],
            dir.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn concurrent_creates_never_lose_a_session() {
        let registry = Arc::new(registry().await);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let r = registry.clone();
            handles.push(tokio::spawn(async move {
                r.create_session(SessionOptions::default()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.list_sessions().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let registry = registry().await;
        let session = registry.create_session(SessionOptions::default()).await.unwrap();
        registry.destroy_session(session.id).await.unwrap();
        registry.destroy_session(session.id).await.unwrap();
        assert!(registry.get_session(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_traversal_cwd() {
        let registry = registry().await;
        let mut options = SessionOptions::default();
        options.cwd = Some("../etc".to_string());
        assert!(registry.create_session(options).await.is_err());
    }

    #[tokio::test]
    async fn resume_on_missing_session_fails_not_found() {
        let registry = registry().await;
        let err = registry.resume_session(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    struct BrokenPipeSandbox;

    struct ErroringReader;

    impl tokio::io::AsyncRead for ErroringReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("broken pipe")))
        }
    }

    #[async_trait]
    impl Sandbox for BrokenPipeSandbox {
        async fn exec(&self, _command: &[String], _opts: ExecOptions) -> Result<ExecOutput> {
            unimplemented!()
        }
        async fn start_process(
            &self,
            _command: &[String],
            _stdin_pipe: &std::path::Path,
            _env: HashMap<String, String>,
        ) -> Result<SpawnedProcess> {
            let (_stderr_writer, stderr_reader) = tokio::io::duplex(8);
            let (_exit_tx, exit_rx) = tokio::sync::oneshot::channel();
            Ok(SpawnedProcess {
                id: "broken".to_string(),
                stdout: Box::pin(ErroringReader),
                stderr: Box::pin(stderr_reader),
                exited: exit_rx,
            })
        }
        async fn read_file(&self, _path: &std::path::Path) -> Result<String> {
            unimplemented!()
        }
        async fn write_file(&self, _path: &std::path::Path, _content: &str) -> Result<()> {
            Ok(())
        }
        async fn kill_process(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_log_stream_error_before_any_result_marks_the_session_errored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            crate::store::JsonFileStore::open(dir.path().join("sessions.json"))
                .await
                .unwrap(),
        );
        let registry = Arc::new(SessionRegistry::new(
            store,
            Arc::new(BrokenPipeSandbox),
            EventBus::new(),
            100,
            Arc::new(|_s: &Session| vec!["agent".to_string()]),
            vec![],
            dir.path().to_path_buf(),
        ));
        registry.bind_self();

        let session = registry.create_session(SessionOptions::default()).await.unwrap();
        registry.send_message(session.id, "hi").await.unwrap();

        let mut observed = None;
        for _ in 0..50 {
            let current = registry.get_session(session.id).await.unwrap().unwrap();
            if current.status == SessionStatus::Error {
                observed = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let session = observed.expect("session should have transitioned to error status");
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(
            session.error.as_ref().map(|e| e.message.as_str()),
            Some("broken pipe")
        );
    }
}
