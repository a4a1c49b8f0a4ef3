//! Pending-call table: correlates an outbound RPC call's id with the
//! oneshot the eventual response resolves, and enforces the per-call
//! timeout (spec.md §4.7).
//!
//! Grounded in `codex-mcp-server::outgoing_message::OutgoingMessageSender`'s
//! `request_id_to_callback` map, generalized from a single stdio connection
//! to any `Transport` implementation.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use orchestrator_rpc_types::RequestId;
use orchestrator_rpc_types::RpcErrorBody;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub type CallResult = std::result::Result<serde_json::Value, RpcErrorBody>;

/// Removed exactly once, by whichever of "matching response arrived" or
/// "timeout elapsed" happens first.
pub struct CallTable {
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<CallResult>>>,
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn register(&self, id: RequestId) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Resolve the pending entry for `id`, if it is still outstanding.
    /// A response for an id that already timed out (or was never
    /// registered) is a no-op, per spec.md §4.7's "out-of-order responses
    /// are permitted" / malformed-frame tolerance.
    pub async fn resolve(&self, id: &RequestId, result: CallResult) {
        let sender = self.pending.lock().await.remove(id);
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    /// Remove an entry without resolving it (used once the timeout future
    /// wins the race against `resolve`).
    pub async fn expire(&self, id: &RequestId) {
        self.pending.lock().await.remove(id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_the_registered_receiver() {
        let table = CallTable::new();
        let id = table.next_request_id();
        let rx = table.register(id.clone()).await;
        table.resolve(&id, Ok(serde_json::json!("done"))).await;
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), serde_json::json!("done"));
    }

    #[tokio::test]
    async fn resolving_an_unknown_id_is_a_no_op() {
        let table = CallTable::new();
        table
            .resolve(&RequestId::Integer(999), Ok(serde_json::json!(null)))
            .await;
        assert_eq!(table.pending_count().await, 0);
    }

    #[tokio::test]
    async fn expire_removes_without_resolving() {
        let table = CallTable::new();
        let id = table.next_request_id();
        let _rx = table.register(id.clone()).await;
        table.expire(&id).await;
        assert_eq!(table.pending_count().await, 0);
    }
}
