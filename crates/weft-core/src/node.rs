//! Node orchestration.
//!
//! The [`Node`] is the entry point: it binds listeners, dials peers, owns
//! the session table and the protocol registry, hands out the global
//! message-id counter, and routes call-initiating inbound messages to the
//! installed hook's pattern engine.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use weft_crypto::kx::Keypair;

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::multiaddr::Multiaddr;
use crate::pattern;
use crate::protocol::{HookDef, InstalledProtocol, ProtocolDef, ProtocolHandle};
use crate::proxy::SessionProxy;
use crate::session::Session;
use crate::SessionId;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Notifications a node surfaces to its owner.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A listener came up on this resolved address.
    Bound(Multiaddr),
    /// An accepted connection completed its handshake.
    InboundSession(SessionProxy),
    /// A session (either direction) went away.
    SessionClosed(SessionProxy),
    /// A non-fatal error scoped to one connection or session.
    Error(Arc<Error>),
}

struct ListenerHandle {
    task: JoinHandle<()>,
}

/// Shared node state. Public API lives on [`Node`].
pub(crate) struct NodeInner {
    config: NodeConfig,
    keypair: Keypair,
    sessions: DashMap<SessionId, Arc<Session>>,
    protocols: DashMap<u32, Arc<InstalledProtocol>>,
    listeners: Mutex<Vec<ListenerHandle>>,
    listen_addrs: Mutex<Vec<Multiaddr>>,
    next_message_id: AtomicU64,
    events: mpsc::UnboundedSender<NodeEvent>,
    closed: AtomicBool,
}

/// A WEFT node.
///
/// Cheap to clone; all clones share one underlying node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node with a fresh key-exchange keypair.
    ///
    /// Returns the node plus the receiver for its [`NodeEvent`] stream.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if keypair generation fails.
    pub fn new(config: NodeConfig) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>)> {
        let keypair = Keypair::generate()?;
        Ok(Self::with_keypair(config, keypair))
    }

    /// Create a node around an existing keypair.
    #[must_use]
    pub fn with_keypair(
        config: NodeConfig,
        keypair: Keypair,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(NodeInner {
            config,
            keypair,
            sessions: DashMap::new(),
            protocols: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            listen_addrs: Mutex::new(Vec::new()),
            next_message_id: AtomicU64::new(1),
            events,
            closed: AtomicBool::new(false),
        });
        (Self { inner }, rx)
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Open listeners for `ma`.
    ///
    /// An unset host binds both `0.0.0.0` and `::`; wildcard hosts are
    /// resolved to every matching-family local interface address, and a
    /// [`NodeEvent::Bound`] fires per resolved address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] on a closed node or the bind failure.
    pub async fn bind(&self, ma: &Multiaddr) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let port = ma.tcp_port().unwrap_or(0);
        let hosts: Vec<String> = match ma.host() {
            Some(host) => vec![host.to_string()],
            None => vec!["0.0.0.0".to_string(), "::".to_string()],
        };
        for host in hosts {
            self.inner.bind_one(&host, port).await?;
        }
        Ok(())
    }

    /// Dial a peer and run the client handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] on a closed node, [`Error::Parse`] for an
    /// addressless multiaddr, or the connect/handshake failure.
    pub async fn connect(&self, ma: &Multiaddr) -> Result<SessionProxy> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let conn =
            Connection::connect(ma, &self.inner.keypair, self.inner.config.connect_timeout).await?;
        tracing::info!(peer = %conn.peer_addr(), "outbound session established");
        Ok(self.inner.adopt(conn))
    }

    /// Install a protocol definition, wiring each hook to its pattern
    /// engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TagCollision`] if another installed protocol hashes
    /// to the same integer tag.
    pub fn install_protocol(&self, def: ProtocolDef) -> Result<ProtocolHandle> {
        let proto = InstalledProtocol::build(def);
        match self.inner.protocols.entry(proto.tag) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::TagCollision(proto.tag)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(
                    protocol = %proto.name,
                    version = %proto.version,
                    tag = format_args!("0x{:08x}", proto.tag),
                    "protocol installed"
                );
                slot.insert(Arc::clone(&proto));
                Ok(ProtocolHandle {
                    node: self.clone(),
                    proto,
                })
            }
        }
    }

    /// Resolve a proxy to its live session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown or closed session.
    pub fn resolve(&self, proxy: &SessionProxy) -> Result<Arc<Session>> {
        self.inner.resolve_session(proxy).ok_or(Error::NotFound)
    }

    /// Next globally-unique, monotonically-increasing message id. One call
    /// uses one id across every destination it addresses.
    #[must_use]
    pub fn next_message_id(&self) -> u64 {
        self.inner.next_message_id()
    }

    /// Every address currently bound, one per resolved interface.
    #[must_use]
    pub fn listening_addrs(&self) -> Vec<Multiaddr> {
        lock(&self.inner.listen_addrs).clone()
    }

    /// Close every listener and every session, both directions.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("node closing");

        for listener in lock(&self.inner.listeners).drain(..) {
            listener.task.abort();
        }
        lock(&self.inner.listen_addrs).clear();

        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.close();
        }
        self.inner.sessions.clear();
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("sessions", &self.inner.sessions.len())
            .field("protocols", &self.inner.protocols.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl NodeInner {
    pub(crate) fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn resolve_session(&self, proxy: &SessionProxy) -> Option<Arc<Session>> {
        self.sessions
            .get(proxy.as_bytes())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_error(&self, err: Error) {
        self.emit(NodeEvent::Error(Arc::new(err)));
    }

    pub(crate) fn on_session_closed(&self, id: &SessionId) {
        if let Some((_, session)) = self.sessions.remove(id) {
            self.emit(NodeEvent::SessionClosed(session.proxy()));
        }
    }

    async fn bind_one(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        let local = listener.local_addr()?;

        for addr in resolve_bound_addrs(local) {
            tracing::info!(addr = %addr, "bound");
            lock(&self.listen_addrs).push(addr.clone());
            self.emit(NodeEvent::Bound(addr));
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.accept_loop(listener).await;
        });
        lock(&self.listeners).push(ListenerHandle { task });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "inbound connection");
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        match Connection::accept(
                            stream,
                            &inner.keypair,
                            inner.config.connect_timeout,
                        )
                        .await
                        {
                            Ok(conn) => {
                                let proxy = inner.adopt(conn);
                                inner.emit(NodeEvent::InboundSession(proxy));
                            }
                            Err(err) => {
                                tracing::warn!(%peer, error = %err, "inbound handshake failed");
                                inner.emit_error(err);
                            }
                        }
                    });
                }
                Err(err) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        tracing::error!(error = %err, "accept failed; listener stopping");
                        self.emit_error(Error::Io(err));
                    }
                    break;
                }
            }
        }
    }

    /// Attach an established connection to its session, creating the
    /// session on first sight of the id. Replacing an existing connection
    /// closes the old one first.
    fn adopt(self: &Arc<Self>, conn: Arc<Connection>) -> SessionProxy {
        let id = *conn.session_id();
        let session = self
            .sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, Arc::downgrade(self)))
            .clone();
        session.attach(conn);
        session.proxy()
    }

    /// Route a call-initiating inbound message to its protocol hook.
    pub(crate) async fn dispatch_call(self: &Arc<Self>, from: SessionProxy, msg: Message) {
        let (tag, hook_name, payload, message_id) = match msg {
            Message::NoticeReliable {
                protocol_tag,
                hook_name,
                payload,
            }
            | Message::NoticeUnreliable {
                protocol_tag,
                hook_name,
                payload,
            } => (protocol_tag, hook_name, payload, None),
            Message::PreauthReq {
                message_id,
                protocol_tag,
                hook_name,
                payload,
            } => (protocol_tag, hook_name, payload, Some(message_id)),
            _ => return,
        };

        let Some(proto) = self.protocols.get(&tag).map(|entry| Arc::clone(entry.value()))
        else {
            self.report_violation(&from, format!("unknown protocol tag 0x{tag:08x}"));
            return;
        };
        let Some(hook) = proto.hooks.get(&hook_name) else {
            self.report_violation(&from, format!("unknown hook {}/{hook_name}", proto.name));
            return;
        };

        match (hook, message_id) {
            (HookDef::NotifyReliable(h), None) => {
                pattern::notify::deliver(h, &hook_name, from, payload).await;
            }
            (HookDef::First(h), Some(message_id)) => {
                pattern::first::respond(self, h, &hook_name, from, message_id, payload).await;
            }
            (HookDef::NotifyReliable(_), Some(_)) => {
                self.report_violation(&from, format!("preauth request for notice hook {hook_name}"));
            }
            (HookDef::First(_), None) => {
                self.report_violation(&from, format!("notice for first-pattern hook {hook_name}"));
            }
        }
    }

    fn report_violation(&self, from: &SessionProxy, what: String) {
        tracing::warn!(from = %from, violation = %what, "protocol violation");
        self.emit_error(Error::Violation(what.into()));
    }
}

/// Expand a bound socket address into the multiaddrs it serves: a wildcard
/// host becomes one address per local interface of the matching family.
fn resolve_bound_addrs(local: SocketAddr) -> Vec<Multiaddr> {
    let port = Some(local.port());
    if !local.ip().is_unspecified() {
        return vec![Multiaddr::from_parts(&local.ip().to_string(), port, None)];
    }

    let mut out = Vec::new();
    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        for iface in ifaces {
            let ip = iface.ip();
            if ip.is_ipv4() == local.is_ipv4() {
                out.push(Multiaddr::from_parts(&ip.to_string(), port, None));
            }
        }
    }
    if out.is_empty() {
        // No interface enumeration available; report the wildcard itself.
        out.push(Multiaddr::from_parts(&local.ip().to_string(), port, None));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        identity_input, identity_response, first_input, request_callback, session_callback,
        FirstHook, NotifyReliableHook,
    };

    fn notice_def(name: &str) -> ProtocolDef {
        ProtocolDef::new(name, "1.0.0").hook(
            "announce",
            HookDef::NotifyReliable(NotifyReliableHook {
                input: identity_input(),
                on_notice: session_callback(|_, _| async { Ok(()) }),
            }),
        )
    }

    #[tokio::test]
    async fn message_ids_are_monotonic() {
        let (node, _events) = Node::new(NodeConfig::default()).unwrap();
        let a = node.next_message_id();
        let b = node.next_message_id();
        let c = node.next_message_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn identical_tags_across_nodes() {
        let (node1, _e1) = Node::new(NodeConfig::default()).unwrap();
        let (node2, _e2) = Node::new(NodeConfig::default()).unwrap();
        let h1 = node1.install_protocol(notice_def("X")).unwrap();
        let h2 = node2.install_protocol(notice_def("X")).unwrap();
        assert_eq!(h1.tag(), h2.tag());
    }

    #[tokio::test]
    async fn tag_collision_rejected() {
        let (node, _events) = Node::new(NodeConfig::default()).unwrap();
        node.install_protocol(notice_def("X")).unwrap();
        // Same name/version hashes to the same tag.
        assert!(matches!(
            node.install_protocol(notice_def("X")),
            Err(Error::TagCollision(_))
        ));
        // A different protocol still installs.
        node.install_protocol(notice_def("Y")).unwrap();
    }

    #[tokio::test]
    async fn resolve_unknown_proxy_fails() {
        let (node, _events) = Node::new(NodeConfig::default()).unwrap();
        let bogus = SessionProxy::from_bytes([0x42; 32]);
        assert!(matches!(node.resolve(&bogus), Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn handle_rejects_pattern_mismatch() {
        let (node, _events) = Node::new(NodeConfig::default()).unwrap();
        let handle = node
            .install_protocol(ProtocolDef::new("mix", "1.0.0")
                .hook(
                    "announce",
                    HookDef::NotifyReliable(NotifyReliableHook {
                        input: identity_input(),
                        on_notice: session_callback(|_, _| async { Ok(()) }),
                    }),
                )
                .hook(
                    "order",
                    HookDef::First(FirstHook {
                        input: first_input(|p| async move { Ok((Vec::new(), p)) }),
                        on_preauth: session_callback(|_, _| async { Ok(()) }),
                        on_request: request_callback(|_, _, req| async move { Ok(req) }),
                        on_response: identity_response(),
                    }),
                ))
            .unwrap();

        assert!(matches!(
            handle.notify("order", &[], Vec::new()).await,
            Err(Error::Violation(_))
        ));
        assert!(matches!(
            handle.call_first("announce", &[], Vec::new()).await,
            Err(Error::Violation(_))
        ));
        assert!(matches!(
            handle.notify("missing", &[], Vec::new()).await,
            Err(Error::Violation(_))
        ));
    }

    #[tokio::test]
    async fn bind_reports_and_lists_addresses() {
        let (node, mut events) = Node::new(NodeConfig::default()).unwrap();
        node.bind(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();

        let addrs = node.listening_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].host(), Some("127.0.0.1"));
        assert!(addrs[0].tcp_port().unwrap() > 0);

        match events.recv().await {
            Some(NodeEvent::Bound(addr)) => assert_eq!(addr, addrs[0]),
            other => panic!("expected bound event, got {other:?}"),
        }

        node.close();
        node.close();
    }

    #[tokio::test]
    async fn close_rejects_further_binds_and_connects() {
        let (node, _events) = Node::new(NodeConfig::default()).unwrap();
        node.close();
        assert!(matches!(
            node.bind(&Multiaddr::empty()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            node.connect(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()).await,
            Err(Error::Closed)
        ));
    }
}
