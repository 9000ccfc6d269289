//! NotifyReliable: fire-and-forget notifications over the reliable
//! transport.
//!
//! The caller's input transform runs once, then the same notice goes to
//! every destination. There is no acknowledgment, no retry, and no ordering
//! guarantee beyond the transport's own. On the receiving node the hook
//! callback runs with the decoded payload; its outcome stays local.

use crate::error::Result;
use crate::message::Message;
use crate::node::Node;
use crate::protocol::{NotifyReliableHook, Payload};
use crate::proxy::SessionProxy;

/// Caller side: transform the arguments and send one notice per
/// destination. Resolves once all sends are issued.
pub(crate) async fn send(
    node: &Node,
    protocol_tag: u32,
    hook_name: &str,
    hook: &NotifyReliableHook,
    destinations: &[SessionProxy],
    args: Payload,
) -> Result<()> {
    let payload = (hook.input)(args).await?;
    let msg = Message::NoticeReliable {
        protocol_tag,
        hook_name: hook_name.to_string(),
        payload,
    };
    for dest in destinations {
        let session = node.resolve(dest)?;
        session.send(&msg).await?;
    }
    Ok(())
}

/// Callee side: run the hook callback. A failure is logged and goes no
/// further; the sender never learns of it.
pub(crate) async fn deliver(
    hook: &NotifyReliableHook,
    hook_name: &str,
    from: SessionProxy,
    payload: Payload,
) {
    if let Err(err) = (hook.on_notice)(from, payload).await {
        tracing::warn!(hook = %hook_name, from = %from, error = %err, "notification callback failed");
    }
}
