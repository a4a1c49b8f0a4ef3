//! Maps an inbound `{id, method, args}` frame (spec.md §6) onto `Facade`
//! calls and serializes the result back into an `RpcMessage`. Positional
//! `args` mirror the RPC surface table in spec.md §6 exactly; this is the
//! "open-coded dispatcher keyed by method name" spec.md §9 names as
//! alternative (b) to a generated-per-method interface, chosen here because
//! the method set is small and fixed.

use orchestrator_protocol::PermissionMode;
use orchestrator_protocol::SessionOptions;
use orchestrator_rpc_types::error_codes;
use orchestrator_rpc_types::RpcErrorBody;
use orchestrator_rpc_types::RpcMessage;
use orchestrator_rpc_types::RpcRequest;
use orchestrator_rpc_types::RpcResponse;
use serde_json::Value;

use crate::capability::CapabilityRef;
use crate::facade::Facade;
use crate::facade::FacadeResult;
use crate::transport::OutboundBroadcaster;

fn invalid_argument(message: impl Into<String>) -> RpcErrorBody {
    RpcErrorBody {
        code: error_codes::INVALID_ARGUMENT,
        message: message.into(),
        data: None,
    }
}

fn unknown_method(method: &str) -> RpcErrorBody {
    RpcErrorBody {
        code: error_codes::INVALID_ARGUMENT,
        message: format!("unknown method: {method}"),
        data: None,
    }
}

fn arg_str(args: &[Value], index: usize, name: &str) -> FacadeResult<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid_argument(format!("argument `{name}` (position {index}) must be a string")))
}

fn arg_opt<T: serde::de::DeserializeOwned>(args: &[Value], index: usize, name: &str) -> FacadeResult<Option<T>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| invalid_argument(format!("argument `{name}` (position {index}): {e}"))),
    }
}

/// Dispatch one request and produce the response (or error) frame that
/// correlates back to it by `id`.
pub async fn dispatch(facade: &Facade, outbound: &OutboundBroadcaster, request: RpcRequest) -> RpcMessage {
    let id = request.id.clone();
    match handle(facade, outbound, &request.method, &request.args).await {
        Ok(result) => RpcMessage::Response(RpcResponse { id, result }),
        Err(error) => RpcMessage::Error(orchestrator_rpc_types::RpcErrorFrame { id, error }),
    }
}

async fn handle(
    facade: &Facade,
    outbound: &OutboundBroadcaster,
    method: &str,
    args: &[Value],
) -> FacadeResult<Value> {
    match method {
        "createSession" => {
            let options: SessionOptions = arg_opt(args, 0, "options")?.unwrap_or_default();
            let session = facade.create_session(options).await?;
            Ok(serde_json::to_value(session).unwrap_or(Value::Null))
        }
        "getSession" => {
            let id = arg_str(args, 0, "id")?;
            let session = facade.get_session(&id).await?;
            Ok(serde_json::to_value(session).unwrap_or(Value::Null))
        }
        "resumeSession" => {
            let id = arg_str(args, 0, "id")?;
            let session = facade.resume_session(&id).await?;
            Ok(serde_json::to_value(session).unwrap_or(Value::Null))
        }
        "listSessions" => {
            let sessions = facade.list_sessions().await?;
            Ok(serde_json::to_value(sessions).unwrap_or(Value::Null))
        }
        "destroySession" => {
            let id = arg_str(args, 0, "id")?;
            facade.destroy_session(&id).await?;
            Ok(Value::Null)
        }
        "sendMessage" => {
            let id = arg_str(args, 0, "id")?;
            let text = arg_str(args, 1, "text")?;
            facade.send_message(&id, &text).await?;
            Ok(Value::Null)
        }
        "sendMessageWithCallbacks" => {
            let id = arg_str(args, 0, "id")?;
            let text = arg_str(args, 1, "text")?;
            let capability_id = arg_str(args, 2, "callbackCap")?;
            let cap = CapabilityRef::new(capability_id, outbound.clone());
            facade.send_message_with_callbacks(&id, &text, cap).await?;
            Ok(Value::Null)
        }
        "query" => {
            let prompt = arg_str(args, 0, "prompt")?;
            let options: Option<SessionOptions> = arg_opt(args, 1, "options")?;
            let text = facade.query(&prompt, options).await?;
            Ok(Value::String(text))
        }
        "queryWithCallbacks" => {
            let prompt = arg_str(args, 0, "prompt")?;
            let options: SessionOptions = arg_opt(args, 1, "options")?.unwrap_or_default();
            let capability_id = arg_str(args, 2, "callbackCap")?;
            let cap = CapabilityRef::new(capability_id, outbound.clone());
            let text = facade.query_with_callbacks(&prompt, options, cap).await?;
            Ok(Value::String(text))
        }
        "interrupt" => {
            let id = arg_str(args, 0, "id")?;
            facade.interrupt(&id).await?;
            Ok(Value::Null)
        }
        "setPermissionMode" => {
            let id = arg_str(args, 0, "id")?;
            let mode: PermissionMode = arg_opt(args, 1, "mode")?
                .ok_or_else(|| invalid_argument("argument `mode` (position 1) is required"))?;
            facade.set_permission_mode(&id, mode).await?;
            Ok(Value::Null)
        }
        "supportedModels" => Ok(serde_json::to_value(facade.supported_models()).unwrap_or(Value::Null)),
        "mcpServerStatus" => {
            let id = arg_str(args, 0, "id")?;
            let statuses = facade.mcp_server_status(&id).await?;
            Ok(serde_json::to_value(statuses).unwrap_or(Value::Null))
        }
        other => Err(unknown_method(other)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::sync::Arc;

    use orchestrator_core::event_bus::EventBus;
    use orchestrator_core::registry::SessionRegistry;
    use orchestrator_core::sandbox::ExecOptions;
    use orchestrator_core::sandbox::ExecOutput;
    use orchestrator_core::sandbox::Sandbox;
    use orchestrator_core::sandbox::SpawnedProcess;
    use orchestrator_core::store::JsonFileStore;
    use orchestrator_protocol::ModelInfo;
    use orchestrator_rpc_types::RequestId;
    use std::collections::HashMap;

    use super::*;

    struct NullSandbox;

    #[async_trait::async_trait]
    impl Sandbox for NullSandbox {
        async fn exec(&self, _command: &[String], _opts: ExecOptions) -> orchestrator_core::Result<ExecOutput> {
            unimplemented!()
        }
        async fn start_process(
            &self,
            _command: &[String],
            _stdin_pipe: &std::path::Path,
            _env: HashMap<String, String>,
        ) -> orchestrator_core::Result<SpawnedProcess> {
            unimplemented!()
        }
        async fn read_file(&self, _path: &std::path::Path) -> orchestrator_core::Result<String> {
            unimplemented!()
        }
        async fn write_file(&self, _path: &std::path::Path, _content: &str) -> orchestrator_core::Result<()> {
            Ok(())
        }
        async fn kill_process(&self, _id: &str) -> orchestrator_core::Result<()> {
            Ok(())
        }
    }

    async fn facade() -> Facade {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path().join("sessions.json")).await.unwrap());
        let bus = EventBus::new();
        let registry = Arc::new(SessionRegistry::new(
            store,
            Arc::new(NullSandbox),
            bus.clone(),
            100,
            Arc::new(|_s| vec!["agent".to_string()]),
            vec![ModelInfo {
                id: "claude-sonnet".to_string(),
                display_name: "Claude Sonnet".to_string(),
                supports_thinking: false,
            }],
            dir.path().to_path_buf(),
        ));
        registry.bind_self();
        Facade::new(registry, bus)
    }

    #[tokio::test]
    async fn create_session_round_trips_through_dispatch() {
        let facade = facade().await;
        let outbound = OutboundBroadcaster::new();
        let request = RpcRequest {
            id: RequestId::Integer(1),
            method: "createSession".to_string(),
            args: vec![serde_json::json!({"cwd": "/w"})],
        };
        let response = dispatch(&facade, &outbound, request).await;
        match response {
            RpcMessage::Response(r) => {
                assert_eq!(r.result["cwd"], "/w");
                assert_eq!(r.result["status"], "active");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_reported_as_invalid_argument() {
        let facade = facade().await;
        let outbound = OutboundBroadcaster::new();
        let request = RpcRequest {
            id: RequestId::Integer(2),
            method: "doSomethingUnsupported".to_string(),
            args: vec![],
        };
        let response = dispatch(&facade, &outbound, request).await;
        match response {
            RpcMessage::Error(e) => assert_eq!(e.error.code, error_codes::INVALID_ARGUMENT),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_session_on_unknown_id_returns_null_not_an_error() {
        let facade = facade().await;
        let outbound = OutboundBroadcaster::new();
        let request = RpcRequest {
            id: RequestId::Integer(3),
            method: "getSession".to_string(),
            args: vec![serde_json::json!(uuid::Uuid::new_v4().to_string())],
        };
        let response = dispatch(&facade, &outbound, request).await;
        match response {
            RpcMessage::Response(r) => assert!(r.result.is_null()),
            other => panic!("expected Response, got {other:?}"),
        }
    }
}
