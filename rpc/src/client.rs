//! The caller side of the duplex transport (spec.md §4.7): connect, issue
//! calls through the `CallTable` with a per-call timeout, reconnect on an
//! unexpected close, and chain calls onto not-yet-resolved results
//! ("promise pipelining") without ever exposing a `then`-shaped value that
//! a promise-aware framework could mistake for already-resolved (the
//! "thenable trap" spec.md §9 calls out). There is no dynamic proxy here at
//! all: `call`/`pipe` are the only two entry points, matching §9's
//! resolution (a).

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::StreamExt;
use orchestrator_rpc_types::RpcMessage;
use orchestrator_rpc_types::RpcRequest;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;
use tracing::warn;

use crate::call_table::CallResult;
use crate::call_table::CallTable;
use crate::call_table::DEFAULT_CALL_TIMEOUT;
use crate::transport::ConnectionState;
use crate::transport::ReconnectPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("call timed out")]
    Timeout,
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One duplex connection's outbound half plus the pending-call table its
/// inbound reader task resolves against.
pub struct DuplexClient {
    calls: Arc<CallTable>,
    outbound: mpsc::Sender<RpcMessage>,
    state_rx: watch::Receiver<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    connection_task: tokio::task::JoinHandle<()>,
}

impl DuplexClient {
    /// Connect, then spawn the reader task that demultiplexes inbound
    /// frames back onto `calls`, and the reconnect loop that re-establishes
    /// the socket with `policy`'s linear backoff if it closes unexpectedly.
    pub async fn connect(url: String, policy: ReconnectPolicy) -> Result<Self, ClientError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let calls = Arc::new(CallTable::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(128);

        let socket = connect_once(&url).await?;
        let _ = state_tx.send(ConnectionState::Connected);

        let task_state_tx = state_tx.clone();
        let connection_task = tokio::spawn(connection_loop(
            url,
            socket,
            outbound_rx,
            calls.clone(),
            task_state_tx,
            policy,
        ));

        Ok(Self {
            calls,
            outbound: outbound_tx,
            state_rx,
            state_tx,
            connection_task,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub async fn state_changes(&mut self) -> ConnectionState {
        let _ = self.state_rx.changed().await;
        self.state()
    }

    /// Tear down the connection deliberately (spec.md §4.7's `connect()` /
    /// `disconnect()` pair): abort the reader/reconnect task outright so a
    /// caller-initiated disconnect never triggers `policy`'s reconnect
    /// logic, then publish `Disconnected`. Any calls still awaiting a
    /// response resolve with `ClientError::ConnectionClosed` once their
    /// `outbound` send (already accepted) never gets a reply and times out;
    /// closing `outbound` here makes any *new* call fail immediately
    /// instead of waiting out a dead connection.
    pub fn disconnect(&self) {
        self.connection_task.abort();
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }

    /// Issue `method(args...)`, timing out after `timeout` (default 30s).
    /// The pending entry is removed by exactly one of "matching response
    /// arrived" or "timeout elapsed", per spec.md §4.7.
    pub async fn call(
        &self,
        method: impl Into<String>,
        args: Vec<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, ClientError> {
        let id = self.calls.next_request_id();
        let rx = self.calls.register(id.clone()).await;

        let request = RpcRequest {
            id: id.clone(),
            method: method.into(),
            args,
        };
        if self.outbound.send(RpcMessage::Request(request)).await.is_err() {
            self.calls.expire(&id).await;
            return Err(ClientError::ConnectionClosed);
        }

        let wait = timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => map_result(result),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.calls.expire(&id).await;
                Err(ClientError::Timeout)
            }
        }
    }

    /// Promise pipelining (spec.md §4.7/Glossary): dispatch `method` on the
    /// value `antecedent` eventually resolves to, without forcing the
    /// caller to await it first. `antecedent` is any future producing a
    /// call result; `arg_from_antecedent` builds this call's args from it.
    pub fn pipe<F, Fut>(
        self: &Arc<Self>,
        antecedent: Fut,
        method: impl Into<String> + Send + 'static,
        arg_from_antecedent: F,
        timeout: Option<Duration>,
    ) -> tokio::task::JoinHandle<Result<serde_json::Value, ClientError>>
    where
        F: FnOnce(serde_json::Value) -> Vec<serde_json::Value> + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, ClientError>> + Send + 'static,
    {
        let client = self.clone();
        let method = method.into();
        tokio::spawn(async move {
            let upstream = antecedent.await?;
            client.call(method, arg_from_antecedent(upstream), timeout).await
        })
    }
}

fn map_result(result: CallResult) -> Result<serde_json::Value, ClientError> {
    result.map_err(|e| ClientError::Remote {
        code: e.code,
        message: e.message,
    })
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_once(url: &str) -> Result<WsStream, ClientError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(socket)
}

async fn connection_loop(
    url: String,
    mut socket: WsStream,
    mut outbound_rx: mpsc::Receiver<RpcMessage>,
    calls: Arc<CallTable>,
    state_tx: watch::Sender<ConnectionState>,
    policy: ReconnectPolicy,
) {
    let attempts = AtomicU32::new(0);
    loop {
        let closed = tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(RpcMessage::Response(r)) = serde_json::from_str::<RpcMessage>(&text) {
                            calls.resolve(&r.id, Ok(r.result)).await;
                        } else if let Ok(RpcMessage::Error(e)) = serde_json::from_str::<RpcMessage>(&text) {
                            calls.resolve(&e.id, Err(e.error)).await;
                        } else {
                            debug!("ignoring malformed or non-response frame");
                        }
                        false
                    }
                    Some(Ok(WsMessage::Close(_))) | None => true,
                    Some(Ok(_)) => false,
                    Some(Err(e)) => {
                        warn!(error = %e, "duplex client read error");
                        true
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = socket.send(WsMessage::Text(json.into())).await;
                        }
                        false
                    }
                    None => true,
                }
            }
        };

        if closed {
            let _ = state_tx.send(ConnectionState::Disconnected);
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match policy.delay_for_attempt(attempt) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    match connect_once(&url).await {
                        Ok(new_socket) => {
                            socket = new_socket;
                            attempts.store(0, Ordering::SeqCst);
                            let _ = state_tx.send(ConnectionState::Connected);
                        }
                        Err(e) => {
                            warn!(error = %e, attempt, "reconnect attempt failed");
                        }
                    }
                }
                None => {
                    let _ = state_tx.send(ConnectionState::Error);
                    break;
                }
            }
        }
    }
}
