//! Two transports satisfying one contract: a long-lived duplex connection
//! (websocket) and a single-shot batched request/response over HTTP
//! (spec.md §4.7). Grounded in `sven-gateway::http::ws`'s
//! `tokio::select!` bridge between socket recv and an outgoing broadcast
//! channel, generalized from a fixed `ControlCommand`/`ControlEvent` pair
//! to the generic `RpcMessage` envelope.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use futures_util::SinkExt;
use futures_util::StreamExt;
use orchestrator_rpc_types::RpcMessage;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

/// `disconnected -> connecting -> connected -> disconnected -> error`,
/// observable via `ConnectionHandle::state_changes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Linearly growing backoff: `base * attempt`, capped at `max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        Some(self.base * attempt)
    }
}

/// One bridged websocket connection: inbound frames are forwarded to
/// `inbound_tx`; `outbound_rx` is drained onto the socket. Mirrors
/// `sven-gateway`'s `handle_socket`, but carries `RpcMessage` instead of
/// a fixed command/event pair, and frames with no handler are dropped
/// rather than erroring the connection (spec.md §4.7's "malformed inbound
/// frames are ignored").
pub async fn run_duplex_connection(
    mut socket: WebSocket,
    inbound_tx: mpsc::Sender<RpcMessage>,
    mut outbound_rx: broadcast::Receiver<RpcMessage>,
) {
    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RpcMessage>(&text) {
                            Ok(parsed) => {
                                if inbound_tx.send(parsed).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring malformed inbound frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket recv error");
                        break;
                    }
                }
            }
            result = outbound_rx.recv() => {
                match result {
                    Ok(msg) => send_frame(&mut socket, &msg).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "duplex subscriber lagged; events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("duplex connection closed");
}

async fn send_frame(socket: &mut WebSocket, msg: &RpcMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

/// Per-connection outbound broadcast capacity. A slow subscriber drops the
/// oldest frames rather than blocking the sender; callers are warned via
/// `RecvError::Lagged`.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Shared handle used by the facade to push events out over every live
/// duplex connection (the "server-push" half of a long-lived transport).
/// Batched connections never construct one of these — capabilities are
/// not supported in that mode.
#[derive(Clone)]
pub struct OutboundBroadcaster {
    tx: broadcast::Sender<RpcMessage>,
    connected_count: Arc<AtomicU32>,
}

impl OutboundBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(OUTBOUND_CHANNEL_CAPACITY);
        Self {
            tx,
            connected_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcMessage> {
        self.connected_count.fetch_add(1, Ordering::Relaxed);
        self.tx.subscribe()
    }

    pub fn publish(&self, msg: RpcMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn connected_count(&self) -> u32 {
        self.connected_count.load(Ordering::Relaxed)
    }
}

impl Default for OutboundBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_policy_grows_linearly_and_caps() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(100),
            max_attempts: 3,
        };
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay_for_attempt(4), None);
    }

    #[test]
    fn outbound_broadcaster_tracks_subscriber_count() {
        let bus = OutboundBroadcaster::new();
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.connected_count(), 2);
    }
}
