//! Declarative protocol installation.
//!
//! A protocol is a named, versioned table of hooks, each bound to one call
//! pattern. Installing a [`ProtocolDef`] on a node computes the protocol's
//! integer tag, wires each hook to its pattern engine, and returns a
//! [`ProtocolHandle`] exposing one caller per hook. The hook table is built
//! once at install time and never mutated afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::pattern;
use crate::proxy::SessionProxy;

/// Encoded payload bytes, as produced by [`crate::payload::encode`].
pub type Payload = Vec<u8>;

/// Boxed future used by hook callbacks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Caller-side transform from call arguments to the notification payload.
pub type InputTransform = Arc<dyn Fn(Payload) -> BoxFuture<Result<Payload>> + Send + Sync>;

/// Caller-side transform from call arguments to `(preauth, data)` payloads.
pub type FirstInput = Arc<dyn Fn(Payload) -> BoxFuture<Result<(Payload, Payload)>> + Send + Sync>;

/// Callee-side notification callback.
pub type NoticeCallback = Arc<dyn Fn(SessionProxy, Payload) -> BoxFuture<Result<()>> + Send + Sync>;

/// Responder-side preauthorization check; failure rejects the exchange
/// before any data transfer.
pub type PreauthCallback = Arc<dyn Fn(SessionProxy, Payload) -> BoxFuture<Result<()>> + Send + Sync>;

/// Responder-side request handler: `(from, preauth payload, request
/// payload) -> response payload`.
pub type RequestCallback =
    Arc<dyn Fn(SessionProxy, Payload, Payload) -> BoxFuture<Result<Payload>> + Send + Sync>;

/// Initiator-side response handler; its return value becomes the call's
/// result.
pub type ResponseCallback = Arc<dyn Fn(Payload) -> BoxFuture<Result<Payload>> + Send + Sync>;

/// Wrap an async closure as an [`InputTransform`].
pub fn input_transform<F, Fut>(f: F) -> InputTransform
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(move |p| Box::pin(f(p)))
}

/// An [`InputTransform`] that forwards the arguments unchanged.
#[must_use]
pub fn identity_input() -> InputTransform {
    Arc::new(|p| Box::pin(async move { Ok(p) }))
}

/// Wrap an async closure as a [`FirstInput`].
pub fn first_input<F, Fut>(f: F) -> FirstInput
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Payload, Payload)>> + Send + 'static,
{
    Arc::new(move |p| Box::pin(f(p)))
}

/// Wrap an async closure as a [`NoticeCallback`] or [`PreauthCallback`].
pub fn session_callback<F, Fut>(f: F) -> Arc<dyn Fn(SessionProxy, Payload) -> BoxFuture<Result<()>> + Send + Sync>
where
    F: Fn(SessionProxy, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |proxy, p| Box::pin(f(proxy, p)))
}

/// Wrap an async closure as a [`RequestCallback`].
pub fn request_callback<F, Fut>(f: F) -> RequestCallback
where
    F: Fn(SessionProxy, Payload, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(move |proxy, preauth, req| Box::pin(f(proxy, preauth, req)))
}

/// Wrap an async closure as a [`ResponseCallback`].
pub fn response_callback<F, Fut>(f: F) -> ResponseCallback
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(move |p| Box::pin(f(p)))
}

/// A [`ResponseCallback`] that returns the response payload unchanged.
#[must_use]
pub fn identity_response() -> ResponseCallback {
    Arc::new(|p| Box::pin(async move { Ok(p) }))
}

/// Hooks for a fire-and-forget reliable notification.
#[derive(Clone)]
pub struct NotifyReliableHook {
    /// Transform from call arguments to the wire payload; may suspend.
    pub input: InputTransform,
    /// Invoked on the receiving node with the decoded payload. Its outcome
    /// is never communicated back to the sender.
    pub on_notice: NoticeCallback,
}

/// Hooks for a preauthorized, multi-destination request/response exchange.
#[derive(Clone)]
pub struct FirstHook {
    /// Transform from call arguments to `(preauth, data)` payloads.
    pub input: FirstInput,
    /// Responder's cheap acceptance check, run before any data transfer.
    pub on_preauth: PreauthCallback,
    /// Responder's request handler; runs once the full request payload is
    /// reassembled.
    pub on_request: RequestCallback,
    /// Initiator's response handler; its return value resolves the call.
    pub on_response: ResponseCallback,
}

/// One hook bound to its call pattern.
#[derive(Clone)]
pub enum HookDef {
    /// Fire-and-forget reliable notification.
    NotifyReliable(NotifyReliableHook),
    /// First-responder-wins request/response.
    First(FirstHook),
}

impl HookDef {
    fn pattern_name(&self) -> &'static str {
        match self {
            Self::NotifyReliable(_) => "notify-reliable",
            Self::First(_) => "first",
        }
    }
}

/// A declarative protocol definition, consumed by
/// [`Node::install_protocol`](crate::Node::install_protocol).
pub struct ProtocolDef {
    /// Protocol name.
    pub name: String,
    /// Protocol version string.
    pub version: String,
    /// Hook table, in declaration order.
    pub hooks: Vec<(String, HookDef)>,
}

impl ProtocolDef {
    /// Start a definition for `name`/`version`.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            hooks: Vec::new(),
        }
    }

    /// Add a hook.
    #[must_use]
    pub fn hook(mut self, name: impl Into<String>, def: HookDef) -> Self {
        self.hooks.push((name.into(), def));
        self
    }
}

/// Derive a protocol's integer tag: the first four bytes of
/// `sha256(name + "/" + version)`, little-endian. Deterministic across
/// nodes, so both peers of a wire exchange agree on it.
#[must_use]
pub fn protocol_tag(name: &str, version: &str) -> u32 {
    let digest = weft_crypto::hash::sha256(format!("{name}/{version}").as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// An installed protocol: the frozen hook table plus identity.
pub(crate) struct InstalledProtocol {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) tag: u32,
    pub(crate) hooks: HashMap<String, HookDef>,
}

impl InstalledProtocol {
    pub(crate) fn build(def: ProtocolDef) -> Arc<Self> {
        let tag = protocol_tag(&def.name, &def.version);
        let hooks: HashMap<String, HookDef> = def.hooks.into_iter().collect();
        for (hook, hook_def) in &hooks {
            tracing::debug!(
                protocol = %def.name,
                version = %def.version,
                tag = format_args!("0x{tag:08x}"),
                hook = %hook,
                pattern = hook_def.pattern_name(),
                "hook installed"
            );
        }
        Arc::new(Self {
            name: def.name,
            version: def.version,
            tag,
            hooks,
        })
    }
}

/// Caller-facing stub for an installed protocol: one callable per hook,
/// fixed at install time.
#[derive(Clone)]
pub struct ProtocolHandle {
    pub(crate) node: Node,
    pub(crate) proto: Arc<InstalledProtocol>,
}

impl ProtocolHandle {
    /// Protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.proto.name
    }

    /// Protocol version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.proto.version
    }

    /// The derived integer tag.
    #[must_use]
    pub fn tag(&self) -> u32 {
        self.proto.tag
    }

    /// Declared hook names.
    #[must_use]
    pub fn hook_names(&self) -> Vec<&str> {
        self.proto.hooks.keys().map(String::as_str).collect()
    }

    /// Fire a NotifyReliable hook at every destination. Resolves once all
    /// sends are issued; no acknowledgment, no retry.
    ///
    /// # Errors
    ///
    /// Returns a violation for an unknown hook or pattern mismatch, the
    /// input transform's failure, or a destination resolution/send error.
    pub async fn notify(
        &self,
        hook: &str,
        destinations: &[SessionProxy],
        args: Payload,
    ) -> Result<()> {
        match self.hook_def(hook)? {
            HookDef::NotifyReliable(h) => {
                pattern::notify::send(&self.node, self.proto.tag, hook, h, destinations, args)
                    .await
            }
            HookDef::First(_) => Err(Error::violation("hook is bound to the first pattern")),
        }
    }

    /// Run a First-pattern call: preauthorize against every destination,
    /// transfer the request to whichever accepts first, and resolve with
    /// the hook's response-handler result.
    ///
    /// A call whose every destination simply never answers does not time
    /// out here; bound it with a surrounding timeout if needed.
    ///
    /// # Errors
    ///
    /// Returns a violation for an unknown hook or pattern mismatch, an
    /// [`Error::Application`] carrying a peer rejection reason, or the
    /// transport error that ended the exchange.
    pub async fn call_first(
        &self,
        hook: &str,
        destinations: &[SessionProxy],
        args: Payload,
    ) -> Result<Payload> {
        match self.hook_def(hook)? {
            HookDef::First(h) => {
                pattern::first::call(&self.node, self.proto.tag, hook, h, destinations, args)
                    .await
            }
            HookDef::NotifyReliable(_) => {
                Err(Error::violation("hook is bound to the notify-reliable pattern"))
            }
        }
    }

    fn hook_def(&self, hook: &str) -> Result<&HookDef> {
        self.proto
            .hooks
            .get(hook)
            .ok_or_else(|| Error::Violation(format!("unknown hook: {hook}").into()))
    }
}
