//! The RPC surface spec.md §4.8/§6 exposes: session ops, messaging,
//! control, and info. Grounded in
//! `codex-mcp-server::message_processor`/`codex_message_processor`'s
//! method-dispatch shape, but generalized from MCP tool-call semantics to
//! this system's own `{id, method, args}` envelope.

use std::sync::Arc;

use orchestrator_core::event_bus::EventBus;
use orchestrator_core::event_bus::EventKind;
use orchestrator_core::registry::SessionRegistry;
use orchestrator_protocol::Event;
use orchestrator_protocol::ModelInfo;
use orchestrator_protocol::PermissionMode;
use orchestrator_protocol::Session;
use orchestrator_protocol::SessionOptions;
use orchestrator_rpc_types::error_codes;
use orchestrator_rpc_types::RpcErrorBody;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::capability::CapabilityMethod;
use crate::capability::CapabilityRef;

pub type FacadeResult<T> = std::result::Result<T, RpcErrorBody>;

/// Everything the facade needs: the registry it mutates and the bus it
/// subscribes to for the callback-forwarding methods.
pub struct Facade {
    registry: Arc<SessionRegistry>,
    bus: EventBus,
}

fn not_found(id: Uuid) -> RpcErrorBody {
    RpcErrorBody {
        code: error_codes::NOT_FOUND,
        message: format!("no session with id: {id}"),
        data: None,
    }
}

fn from_core_error(e: orchestrator_core::CoreError) -> RpcErrorBody {
    use orchestrator_core::CoreError::*;
    match e {
        SessionNotFound(id) => not_found(id),
        InvalidArgument { field, message } => RpcErrorBody {
            code: error_codes::INVALID_ARGUMENT,
            message: format!("{field}: {message}"),
            data: None,
        },
        Sandbox(message) => RpcErrorBody {
            code: error_codes::SANDBOX_ERROR,
            message,
            data: None,
        },
        other => RpcErrorBody {
            code: error_codes::INTERNAL,
            message: other.to_string(),
            data: None,
        },
    }
}

/// Takes the sender out of a `Mutex<Option<_>>` shared between the several
/// subscriptions racing to resolve the same oneshot; a poisoned lock is
/// treated the same as an already-taken one, since no terminal event can
/// be reported past it anyway.
fn take_sender<T>(slot: &std::sync::Mutex<Option<T>>) -> Option<T> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

fn parse_id(id: &str) -> FacadeResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| RpcErrorBody {
        code: error_codes::INVALID_ARGUMENT,
        message: format!("`{id}` is not a valid session id"),
        data: None,
    })
}

impl Facade {
    pub fn new(registry: Arc<SessionRegistry>, bus: EventBus) -> Self {
        Self { registry, bus }
    }

    pub async fn create_session(&self, options: SessionOptions) -> FacadeResult<Session> {
        self.registry
            .create_session(options)
            .await
            .map_err(from_core_error)
    }

    pub async fn get_session(&self, id: &str) -> FacadeResult<Option<Session>> {
        let id = parse_id(id)?;
        self.registry.get_session(id).await.map_err(from_core_error)
    }

    pub async fn resume_session(&self, id: &str) -> FacadeResult<Session> {
        let id = parse_id(id)?;
        self.registry.resume_session(id).await.map_err(from_core_error)
    }

    pub async fn list_sessions(&self) -> FacadeResult<Vec<Session>> {
        self.registry.list_sessions().await.map_err(from_core_error)
    }

    pub async fn destroy_session(&self, id: &str) -> FacadeResult<()> {
        let id = parse_id(id)?;
        self.registry.destroy_session(id).await.map_err(from_core_error)
    }

    pub async fn send_message(&self, id: &str, text: &str) -> FacadeResult<()> {
        let uuid = parse_id(id)?;
        self.registry
            .send_message(uuid, text)
            .await
            .map_err(from_core_error)
    }

    /// Subscribe on the bus to `output:<id>`, `todo:<id>`, `plan:<id>`
    /// with handlers forwarding to the capability's methods, send the
    /// message, and wait for the terminal `result` (or a stream error).
    /// Unsubscribes exactly once regardless of which terminal event wins.
    pub async fn send_message_with_callbacks(
        &self,
        id: &str,
        text: &str,
        callback: CapabilityRef,
    ) -> FacadeResult<()> {
        self.send_message_with_callbacks_capturing(id, text, callback)
            .await
            .map(|_| ())
    }

    /// Same as `send_message_with_callbacks`, but also returns the
    /// textual form of the terminal `result` event (empty string on a
    /// terminal error), for `queryWithCallbacks` to report back.
    async fn send_message_with_callbacks_capturing(
        &self,
        id: &str,
        text: &str,
        callback: CapabilityRef,
    ) -> FacadeResult<String> {
        let uuid = parse_id(id)?;
        let (done_tx, done_rx) = oneshot::channel::<String>();
        let done_tx = std::sync::Arc::new(std::sync::Mutex::new(Some(done_tx)));

        let cap = callback.clone();
        let output_sub = self
            .bus
            .subscribe(
                EventKind::Output,
                id,
                Arc::new(move |event: &Event| {
                    if let Event::Assistant { message, .. } = event {
                        cap.invoke(
                            CapabilityMethod::OnMessage,
                            vec![serde_json::to_value(message).unwrap_or(serde_json::Value::Null)],
                        );
                    }
                    Ok(())
                }),
            )
            .await;

        let done = done_tx.clone();
        let result_sub = self
            .bus
            .subscribe(
                EventKind::Result,
                id,
                Arc::new(move |event: &Event| {
                    if let Event::Result { result, .. } = event
                        && let Some(tx) = take_sender(&done)
                    {
                        let _ = tx.send(result.clone());
                    }
                    Ok(())
                }),
            )
            .await;

        let cap = callback.clone();
        let todo_sub = self
            .bus
            .subscribe(
                EventKind::Todo,
                id,
                Arc::new(move |event: &Event| {
                    if let Event::StreamEvent { raw, .. } = event {
                        cap.invoke(CapabilityMethod::OnTodoUpdate, vec![raw.clone()]);
                    }
                    Ok(())
                }),
            )
            .await;

        let cap = callback.clone();
        let plan_sub = self
            .bus
            .subscribe(
                EventKind::Plan,
                id,
                Arc::new(move |event: &Event| {
                    if let Event::StreamEvent { raw, .. } = event {
                        cap.invoke(CapabilityMethod::OnPlanUpdate, vec![raw.clone()]);
                    }
                    Ok(())
                }),
            )
            .await;

        let cap = callback.clone();
        let tool_sub = self
            .bus
            .subscribe(
                EventKind::Tool,
                id,
                Arc::new(move |event: &Event| {
                    if let Event::StreamEvent { raw, .. } = event {
                        cap.invoke(CapabilityMethod::OnToolUse, vec![raw.clone()]);
                    }
                    Ok(())
                }),
            )
            .await;

        let cap = callback.clone();
        let done_for_error = done_tx.clone();
        let error_sub = self
            .bus
            .subscribe(
                EventKind::Error,
                id,
                Arc::new(move |event: &Event| {
                    if let Event::StreamEvent { raw, .. } = event {
                        cap.invoke(CapabilityMethod::OnError, vec![raw.clone()]);
                    }
                    if let Some(tx) = take_sender(&done_for_error) {
                        let _ = tx.send(String::new());
                    }
                    Ok(())
                }),
            )
            .await;

        let send_result = self.registry.send_message(uuid, text).await;

        let result_text = if send_result.is_ok() {
            done_rx.await.unwrap_or_default()
        } else {
            String::new()
        };

        output_sub.unsubscribe().await;
        result_sub.unsubscribe().await;
        todo_sub.unsubscribe().await;
        plan_sub.unsubscribe().await;
        tool_sub.unsubscribe().await;
        error_sub.unsubscribe().await;

        callback.invoke(CapabilityMethod::OnComplete, vec![]);

        send_result.map_err(from_core_error)?;
        Ok(result_text)
    }

    /// Creates a session, sends `prompt`, and waits for the terminal
    /// `result` event, returning its textual form (spec.md §6's
    /// `query(prompt, options?) -> string`).
    pub async fn query(&self, prompt: &str, options: Option<SessionOptions>) -> FacadeResult<String> {
        let session = self.create_session(options.unwrap_or_default()).await?;
        let id = session.id.to_string();

        let (done_tx, done_rx) = oneshot::channel::<String>();
        let done_tx = std::sync::Arc::new(std::sync::Mutex::new(Some(done_tx)));

        let tx = done_tx.clone();
        let result_sub = self
            .bus
            .subscribe(
                EventKind::Result,
                &id,
                Arc::new(move |event: &Event| {
                    if let Event::Result { result, .. } = event
                        && let Some(tx) = take_sender(&tx)
                    {
                        let _ = tx.send(result.clone());
                    }
                    Ok(())
                }),
            )
            .await;

        let tx = done_tx.clone();
        let error_sub = self
            .bus
            .subscribe(
                EventKind::Error,
                &id,
                Arc::new(move |_event: &Event| {
                    if let Some(tx) = take_sender(&tx) {
                        let _ = tx.send(String::new());
                    }
                    Ok(())
                }),
            )
            .await;

        let send_result = self.registry.send_message(session.id, prompt).await;
        let text = if send_result.is_ok() {
            done_rx.await.unwrap_or_default()
        } else {
            String::new()
        };

        result_sub.unsubscribe().await;
        error_sub.unsubscribe().await;

        send_result.map_err(from_core_error)?;
        Ok(text)
    }

    /// Creates a session, delegates to `sendMessageWithCallbacks`, and
    /// returns the final result's textual form (spec.md §4.8).
    pub async fn query_with_callbacks(
        &self,
        prompt: &str,
        options: SessionOptions,
        callback: CapabilityRef,
    ) -> FacadeResult<String> {
        let session = self.create_session(options).await?;
        let id = session.id.to_string();
        self.send_message_with_callbacks_capturing(&id, prompt, callback)
            .await
    }

    pub async fn interrupt(&self, id: &str) -> FacadeResult<()> {
        let uuid = parse_id(id)?;
        self.registry.interrupt(uuid).await.map_err(from_core_error)
    }

    pub async fn set_permission_mode(&self, id: &str, mode: PermissionMode) -> FacadeResult<()> {
        let uuid = parse_id(id)?;
        self.registry
            .set_permission_mode(uuid, mode)
            .await
            .map_err(from_core_error)
    }

    pub fn supported_models(&self) -> Vec<ModelInfo> {
        self.registry.supported_models().to_vec()
    }

    pub async fn mcp_server_status(&self, id: &str) -> FacadeResult<Vec<(String, String)>> {
        let uuid = parse_id(id)?;
        self.registry
            .mcp_server_status(uuid)
            .await
            .map_err(from_core_error)
    }
}
