//! Per-session child-process lifecycle (spec.md §4.5).
//!
//! Grounded in `codex-exec-command::session_manager`'s task shape: a
//! writer side that owns the process's stdin, a reader task that drains
//! stdout through the session's NDJSON parser onto the event bus, and a
//! oneshot that resolves with the exit code. The PTY machinery in the
//! teacher is replaced by a named Unix FIFO, since PTY passthrough is out
//! of scope here and spec.md §4.5 describes a named input pipe instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use orchestrator_protocol::ErrorRecord;
use orchestrator_protocol::Event;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::event_bus::EventKind;
use crate::sandbox::ExecOptions;
use crate::sandbox::Sandbox;
use crate::stream_parser::NdjsonParser;

/// Record of a live (or just-exited) child process, owned exclusively by
/// its session. Never exposed mutably outside `ProcessManager`: isolation
/// between sessions depends on every record being reachable only through
/// its own session id.
pub struct ProcessRecord {
    pub process_id: String,
    pub session_id: String,
    pub command: Vec<String>,
    pub pipe_path: PathBuf,
    alive: Arc<std::sync::atomic::AtomicBool>,
    exited: Mutex<Option<oneshot::Receiver<i32>>>,
}

impl ProcessRecord {
    pub fn is_alive(&self) -> bool {
        self.alive.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Owns at most one `ProcessRecord` per session id at a time.
pub struct ProcessManager {
    sandbox: Arc<dyn Sandbox>,
    bus: EventBus,
    processes: Mutex<HashMap<String, Arc<ProcessRecord>>>,
}

impl ProcessManager {
    pub fn new(sandbox: Arc<dyn Sandbox>, bus: EventBus) -> Self {
        Self {
            sandbox,
            bus,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// (1) create a named pipe containing the session id, (2) launch the
    /// agent command reading from it, (3) record the process, (4) begin
    /// draining its log stream onto the event bus. Exactly one error
    /// handler is attached here; repeated calls for a session that is
    /// already alive are rejected rather than accumulating handlers.
    pub async fn start(
        &self,
        session_id: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        pipe_path: PathBuf,
    ) -> Result<Arc<ProcessRecord>> {
        {
            let processes = self.processes.lock().await;
            if let Some(existing) = processes.get(session_id)
                && existing.is_alive()
            {
                return Err(CoreError::ProcessAlreadyRunning(
                    uuid::Uuid::parse_str(session_id).unwrap_or_else(|_| uuid::Uuid::nil()),
                ));
            }
        }

        create_input_pipe(&pipe_path)?;

        let spawned = self
            .sandbox
            .start_process(&command, &pipe_path, env)
            .await?;

        let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let record = Arc::new(ProcessRecord {
            process_id: spawned.id.clone(),
            session_id: session_id.to_string(),
            command,
            pipe_path,
            alive: alive.clone(),
            exited: Mutex::new(None),
        });

        self.processes
            .lock()
            .await
            .insert(session_id.to_string(), record.clone());

        let bus = self.bus.clone();
        let sid = session_id.to_string();
        let alive_for_reader = alive.clone();
        let mut stdout = spawned.stdout;
        tokio::spawn(async move {
            let mut parser = NdjsonParser::new(sid.clone());
            let mut buf = [0u8; 8192];
            let mut saw_result = false;
            let stream_result = async {
                loop {
                    let n = stdout.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    for event in parser.parse(&buf[..n]) {
                        saw_result |= matches!(event, Event::Result { .. });
                        dispatch(&bus, &event).await;
                    }
                }
                Ok::<(), std::io::Error>(())
            }
            .await;

            for event in parser.flush() {
                saw_result |= matches!(event, Event::Result { .. });
                dispatch(&bus, &event).await;
            }

            alive_for_reader.store(false, std::sync::atomic::Ordering::SeqCst);

            // spec.md §4.5: the log stream erroring *or closing* before a
            // result event both convert to a session error.
            match stream_result {
                Err(e) => emit_stream_error(&bus, &sid, &e.to_string()).await,
                Ok(()) if !saw_result => {
                    emit_stream_error(&bus, &sid, "log stream closed before a result event").await
                }
                Ok(()) => {}
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        *record.exited.lock().await = Some(exit_rx);
        let exit_source = spawned.exited;
        let alive_for_exit = alive;
        tokio::spawn(async move {
            let code = exit_source.await.unwrap_or(-1);
            alive_for_exit.store(false, std::sync::atomic::Ordering::SeqCst);
            let _ = exit_tx.send(code);
        });

        Ok(record)
    }

    /// Append `text` as a single JSON-encoded line to the session's input
    /// pipe. Fails fast on a dead pipe; the registry decides whether to
    /// restart.
    pub async fn write(&self, session_id: &str, text: &str) -> Result<()> {
        let record = self.get_process(session_id).await.ok_or_else(|| {
            CoreError::SessionNotFound(
                uuid::Uuid::parse_str(session_id).unwrap_or_else(|_| uuid::Uuid::nil()),
            )
        })?;

        if !record.is_alive() {
            return Err(CoreError::DeadPipe(
                uuid::Uuid::parse_str(session_id).unwrap_or_else(|_| uuid::Uuid::nil()),
            ));
        }

        let mut line = serde_json::to_string(&serde_json::json!({ "text": text }))?;
        line.push('\n');

        let pipe_path = record.pipe_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new().write(true).open(&pipe_path)?;
            file.write_all(line.as_bytes())?;
            Ok(())
        })
        .await
        .map_err(CoreError::from)??;

        Ok(())
    }

    /// Terminate the live process for `session_id`, if any. Tolerant of an
    /// already-dead or never-started process.
    pub async fn kill(&self, session_id: &str) -> Result<()> {
        let record = match self.get_process(session_id).await {
            Some(r) => r,
            None => return Ok(()),
        };
        if record.is_alive() {
            self.sandbox.kill_process(&record.process_id).await?;
        }
        record.alive.store(false, std::sync::atomic::Ordering::SeqCst);
        let _ = tokio::fs::remove_file(&record.pipe_path).await;
        Ok(())
    }

    pub async fn is_alive(&self, session_id: &str) -> bool {
        self.get_process(session_id)
            .await
            .is_some_and(|r| r.is_alive())
    }

    pub async fn get_process(&self, session_id: &str) -> Option<Arc<ProcessRecord>> {
        self.processes.lock().await.get(session_id).cloned()
    }

    /// Run a bounded, one-shot command (not tied to any session's live
    /// process). Used for ancillary sandbox calls outside the agent's own
    /// child process.
    pub async fn exec_once(
        &self,
        command: &[String],
        opts: ExecOptions,
    ) -> Result<crate::sandbox::ExecOutput> {
        self.sandbox.exec(command, opts).await
    }
}

async fn dispatch(bus: &EventBus, event: &Event) {
    let kind = match event {
        Event::System { .. }
        | Event::StreamEvent { .. }
        | Event::Assistant { .. }
        | Event::User { .. }
        | Event::Unknown { .. } => EventKind::Output,
        Event::Result { .. } => EventKind::Result,
    };
    bus.emit(kind, event).await;

    if let Event::Assistant { .. } = event {
        for todo in crate::stream_parser::extract_todo_updates(std::slice::from_ref(event)) {
            bus.emit(
                EventKind::Todo,
                &Event::StreamEvent {
                    session_id: todo.session_id.clone(),
                    raw: serde_json::to_value(&todo).unwrap_or(serde_json::Value::Null),
                },
            )
            .await;
        }
        for plan in crate::stream_parser::extract_plan_updates(std::slice::from_ref(event)) {
            bus.emit(
                EventKind::Plan,
                &Event::StreamEvent {
                    session_id: plan.session_id.clone(),
                    raw: serde_json::to_value(&plan).unwrap_or(serde_json::Value::Null),
                },
            )
            .await;
        }
        for tool_use in crate::stream_parser::extract_tool_uses(std::slice::from_ref(event)) {
            bus.emit(
                EventKind::Tool,
                &Event::StreamEvent {
                    session_id: tool_use.session_id.clone(),
                    raw: serde_json::to_value(&tool_use).unwrap_or(serde_json::Value::Null),
                },
            )
            .await;
        }
    }
}

async fn emit_stream_error(bus: &EventBus, session_id: &str, message: &str) {
    let record = ErrorRecord {
        message: message.to_string(),
        code: None,
        timestamp: Utc::now(),
    };
    bus.emit(
        EventKind::Error,
        &Event::StreamEvent {
            session_id: session_id.to_string(),
            raw: serde_json::to_value(&record).unwrap_or(serde_json::Value::Null),
        },
    )
    .await;
}

#[cfg(unix)]
fn create_input_pipe(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600))
        .map_err(|e| CoreError::Sandbox(e.to_string()))
}

#[cfg(not(unix))]
fn create_input_pipe(path: &std::path::Path) -> Result<()> {
    std::fs::File::create(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::sandbox::ExecOutput;
    use crate::sandbox::SpawnedProcess;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FakeSandbox {
        output: Vec<u8>,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn exec(&self, _command: &[String], _opts: ExecOptions) -> Result<ExecOutput> {
            unimplemented!()
        }

        async fn start_process(
            &self,
            _command: &[String],
            _stdin_pipe: &std::path::Path,
            _env: HashMap<String, String>,
        ) -> Result<SpawnedProcess> {
            use tokio::io::AsyncWriteExt;

            let (mut stdout_writer, stdout_reader) = tokio::io::duplex(8192);
            let data = self.output.clone();
            tokio::spawn(async move {
                let _ = stdout_writer.write_all(&data).await;
            });
            let (_stderr_writer, stderr_reader) = tokio::io::duplex(8);

            let (exit_tx, exit_rx) = oneshot::channel();
            let _ = exit_tx.send(0);
            Ok(SpawnedProcess {
                id: "123".to_string(),
                stdout: Box::pin(stdout_reader),
                stderr: Box::pin(stderr_reader),
                exited: exit_rx,
            })
        }

        async fn read_file(&self, _path: &std::path::Path) -> Result<String> {
            unimplemented!()
        }

        async fn write_file(&self, _path: &std::path::Path, _content: &str) -> Result<()> {
            unimplemented!()
        }

        async fn kill_process(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_drains_log_stream_onto_the_bus() {
        let line = serde_json::json!({"type":"result","subtype":"success","session_id":"s1","uuid":null,"duration_ms":1,"duration_api_ms":1,"is_error":false,"num_turns":1,"total_cost_usd":0.0,"usage":{"input_tokens":1,"output_tokens":1},"result":"done"});
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');

        let sandbox = Arc::new(FakeSandbox { output: bytes });
        let bus = EventBus::new();
        let received = Arc::new(AtomicBool::new(false));
        let flag = received.clone();
        bus.subscribe(
            EventKind::Result,
            "s1",
            Arc::new(move |_e| {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        )
        .await;

        let manager = ProcessManager::new(sandbox, bus);
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("pipe_s1");
        manager
            .start("s1", vec!["agent".to_string()], HashMap::new(), pipe)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(received.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn kill_on_unknown_session_is_a_no_op() {
        let sandbox = Arc::new(FakeSandbox { output: Vec::new() });
        let manager = ProcessManager::new(sandbox, EventBus::new());
        manager.kill("nonexistent").await.unwrap();
    }
}
