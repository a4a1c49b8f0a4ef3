//! Assembles `auth`, `rate_limit`, `dispatch`, `transport` and `facade`
//! into one servable unit (spec.md §4.9): a duplex WebSocket endpoint and a
//! batched HTTP endpoint sharing one `Facade`, both gated by the same
//! bearer-token middleware shape `sven-gateway::http::auth::verify_bearer`
//! uses (extract credentials, consult a rate limiter, 401/429 on failure),
//! generalized from per-IP-on-failed-auth to the keyed limiter every
//! request consults per spec.md §4.9's "every request counts against the
//! caller's budget".

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ConnectInfo;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use orchestrator_rpc_types::RpcMessage;
use orchestrator_rpc_types::RpcRequest;
use tokio::sync::mpsc;
use tracing::warn;

use crate::auth::AuthConfig;
use crate::capability::CapabilityRef;
use crate::dispatch::dispatch;
use crate::facade::Facade;
use crate::rate_limit::rate_limit_key;
use crate::rate_limit::ClientRateLimiter;
use crate::transport::run_duplex_connection;
use crate::transport::OutboundBroadcaster;

#[derive(Clone)]
pub struct ServerState {
    pub facade: Arc<Facade>,
    pub outbound: OutboundBroadcaster,
    pub auth: Option<Arc<AuthConfig>>,
    pub rate_limit: Option<Arc<ClientRateLimiter>>,
}

impl ServerState {
    pub fn new(facade: Arc<Facade>) -> Self {
        Self {
            facade,
            outbound: OutboundBroadcaster::new(),
            auth: None,
            rate_limit: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<AuthConfig>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_rate_limit(mut self, limiter: Arc<ClientRateLimiter>) -> Self {
        self.rate_limit = Some(limiter);
        self
    }
}

/// Builds the router spec.md §4.9 describes: `GET /ws` for the duplex
/// transport, `POST /rpc` for a single batched call, `GET /health`
/// unauthenticated and exempt from rate limiting.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .route_layer(from_fn_with_state(state.clone(), guard))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Authenticates then rate-limits, matching `verify_bearer`'s "auth first,
/// then consult the limiter" order, but (unlike that reference) every
/// request consults the limiter, not only failed-auth ones — spec.md
/// §4.9's budget applies to successful traffic too.
async fn guard(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let subject = match &state.auth {
        Some(auth) => match auth.authenticate(&headers) {
            Ok(identity) => Some(identity.subject),
            Err(_) => {
                warn!(%addr, "rejected unauthenticated request");
                return (
                    StatusCode::UNAUTHORIZED,
                    [(axum::http::header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        },
        None => None,
    };

    if let Some(limiter) = &state.rate_limit {
        let path = req.uri().path();
        if !limiter.is_skipped(path) {
            let forwarded = headers
                .get("X-Forwarded-For")
                .and_then(|v| v.to_str().ok());
            let key = rate_limit_key(subject.as_deref(), forwarded.or(Some(&addr.ip().to_string())));
            let decision = limiter.check(&key).await;
            if !decision.allowed {
                let retry_after = decision.retry_after.map(|d| d.as_secs()).unwrap_or(1);
                let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
                let headers = response.headers_mut();
                if let Ok(v) = retry_after.to_string().parse() {
                    headers.insert(axum::http::header::RETRY_AFTER, v);
                }
                if let Ok(v) = decision.limit.to_string().parse() {
                    headers.insert("x-ratelimit-limit", v);
                }
                if let Ok(v) = "0".parse() {
                    headers.insert("x-ratelimit-remaining", v);
                }
                if let Ok(v) = decision.reset.as_secs().to_string().parse() {
                    headers.insert("x-ratelimit-reset", v);
                }
                return response;
            }
        }
    }

    next.run(req).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridges the socket to `dispatch`: every inbound request is handled and
/// its response pushed straight back onto the same connection's outbound
/// channel, alongside any capability notifications the facade publishes
/// while the call is in flight.
async fn handle_socket(socket: axum::extract::ws::WebSocket, state: ServerState) {
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<RpcMessage>(64);
    let outbound_rx = state.outbound.subscribe();

    let facade = state.facade.clone();
    let outbound = state.outbound.clone();
    let responder = tokio::spawn(async move {
        while let Some(msg) = inbound_rx.recv().await {
            if let RpcMessage::Request(request) = msg {
                let response = dispatch(&facade, &outbound, request).await;
                outbound.publish(response);
            }
        }
    });

    run_duplex_connection(socket, inbound_tx, outbound_rx).await;
    responder.abort();
}

/// The batched transport (spec.md §4.7): one request in, one response out,
/// no capability support since there is no server-push path to deliver
/// notifications over.
async fn rpc_handler(
    State(state): State<ServerState>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcMessage> {
    if request.method == "sendMessageWithCallbacks" || request.method == "queryWithCallbacks" {
        return Json(RpcMessage::Error(orchestrator_rpc_types::RpcErrorFrame {
            id: request.id,
            error: orchestrator_rpc_types::RpcErrorBody {
                code: orchestrator_rpc_types::error_codes::INVALID_ARGUMENT,
                message: "callback methods require the duplex transport".to_string(),
                data: None,
            },
        }));
    }
    let response = dispatch(&state.facade, &state.outbound, request).await;
    Json(response)
}

/// Helper for embedders that want a `CapabilityRef` bound to this server's
/// broadcaster without going through `dispatch` (e.g. an internal health
/// probe capability). Not reached by the HTTP routes above.
pub fn capability_for(state: &ServerState, id: impl Into<String>) -> CapabilityRef {
    CapabilityRef::new(id, state.outbound.clone())
}
