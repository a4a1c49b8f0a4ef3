//! Capability passing (spec.md §4.7, §4.8): a caller-supplied callback
//! object is represented server-side by an opaque handle; invoking one of
//! its methods is a one-way, fire-and-forget notification over the
//! connection that supplied it. Only duplex connections can carry
//! capabilities — batched request/response has no server-push path.

use orchestrator_rpc_types::RpcMessage;
use orchestrator_rpc_types::RpcNotification;

use crate::transport::OutboundBroadcaster;

/// The fixed set of callback methods spec.md §4.7 names. Each is
/// delivered as a notification; a client that fails to process one (or
/// disconnects) never propagates back to the sender — capability
/// invocation is wrapped so a throwing callback cannot abort whatever
/// triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMethod {
    OnMessage,
    OnTodoUpdate,
    OnPlanUpdate,
    OnToolUse,
    OnError,
    OnComplete,
}

impl CapabilityMethod {
    fn as_str(self) -> &'static str {
        match self {
            CapabilityMethod::OnMessage => "onMessage",
            CapabilityMethod::OnTodoUpdate => "onTodoUpdate",
            CapabilityMethod::OnPlanUpdate => "onPlanUpdate",
            CapabilityMethod::OnToolUse => "onToolUse",
            CapabilityMethod::OnError => "onError",
            CapabilityMethod::OnComplete => "onComplete",
        }
    }
}

/// A remote handle to a callback object supplied by the caller of
/// `sendMessageWithCallbacks` / `queryWithCallbacks`. Cheap to clone:
/// invoking it just publishes onto the owning connection's outbound
/// broadcast.
#[derive(Clone)]
pub struct CapabilityRef {
    id: String,
    outbound: OutboundBroadcaster,
}

impl CapabilityRef {
    pub fn new(id: impl Into<String>, outbound: OutboundBroadcaster) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Invoke `method` with `args`. Never fails visibly to the caller:
    /// the underlying publish is fire-and-forget, matching spec.md §4.7's
    /// "each invocation is one-way ... wrapped so that a throwing
    /// callback does not abort the sender".
    pub fn invoke(&self, method: CapabilityMethod, args: Vec<serde_json::Value>) {
        let notification = RpcNotification {
            capability_id: self.id.clone(),
            method: method.as_str().to_string(),
            args,
        };
        self.outbound.publish(RpcMessage::Notification(notification));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn invoke_publishes_a_notification_for_the_handle() {
        let outbound = OutboundBroadcaster::new();
        let mut rx = outbound.subscribe();
        let cap = CapabilityRef::new("cap-1", outbound);

        cap.invoke(
            CapabilityMethod::OnMessage,
            vec![serde_json::json!({"text": "hi"})],
        );

        let received = rx.try_recv().unwrap();
        match received {
            RpcMessage::Notification(n) => {
                assert_eq!(n.capability_id, "cap-1");
                assert_eq!(n.method, "onMessage");
            }
            other => panic!("expected Notification, got a different variant: {other:?}"),
        }
    }
}
