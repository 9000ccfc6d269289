//! Sessions: identifier-keyed logical channels.
//!
//! A session is bound to at most one [`Connection`] at a time and owns the
//! in-flight call registry keyed by message id. Inbound messages either open
//! a call (routed up to the node's protocol registry) or correlate with a
//! registered handler; anything else is a protocol violation isolated to
//! this session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ReaderHalf};
use crate::error::{Error, Result};
use crate::framing::Deframer;
use crate::message::Message;
use crate::multiaddr::Multiaddr;
use crate::node::NodeInner;
use crate::proxy::SessionProxy;
use crate::SessionId;

/// An in-flight call handler, keyed by message id inside one session.
///
/// One handler instance exists per exchange; every correlated inbound
/// message for its id is delivered here, in the peer's send order.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Handle one correlated message arriving from `from`.
    async fn on_message(&self, from: SessionProxy, msg: Message);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A logical channel bound to one transport connection at a time.
pub struct Session {
    id: SessionId,
    node: Weak<NodeInner>,
    conn: Mutex<Option<Arc<Connection>>>,
    in_flight: DashMap<u64, Arc<dyn CallHandler>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: SessionId, node: Weak<NodeInner>) -> Arc<Self> {
        Arc::new(Self {
            id,
            node,
            conn: Mutex::new(None),
            in_flight: DashMap::new(),
            reader_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// The session's identifier bytes.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The capability token for this session.
    #[must_use]
    pub fn proxy(&self) -> SessionProxy {
        SessionProxy::from_bytes(self.id)
    }

    /// The peer's address, while a connection is attached.
    #[must_use]
    pub fn addr(&self) -> Option<Multiaddr> {
        let conn = lock(&self.conn).clone()?;
        let addr: SocketAddr = conn.peer_addr();
        Some(Multiaddr::from_parts(
            &addr.ip().to_string(),
            Some(addr.port()),
            None,
        ))
    }

    /// Number of registered in-flight handlers.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Send one message over the attached connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] with no attached connection, or the
    /// connection's send error.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let conn = lock(&self.conn).clone().ok_or(Error::Closed)?;
        conn.send(msg).await
    }

    /// Register `handler` for correlated messages carrying `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] on a closed session, or a violation if the
    /// id is already registered — ids are never reused within a call.
    pub fn register_handler(&self, id: u64, handler: Arc<dyn CallHandler>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        match self.in_flight.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::violation("message id already registered"))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Drop the handler for `id`. A no-op if none is registered.
    pub fn unregister_handler(&self, id: u64) {
        self.in_flight.remove(&id);
    }

    /// Bind `conn` as this session's transport, closing any previous
    /// connection first, and start its reader task.
    pub(crate) fn attach(self: &Arc<Self>, conn: Arc<Connection>) {
        debug_assert_eq!(conn.session_id(), &self.id, "session id mismatch");
        if self.closed.load(Ordering::SeqCst) {
            conn.close();
            return;
        }

        if let Some(old) = lock(&self.conn).replace(Arc::clone(&conn)) {
            old.close();
        }
        if let Some(old_task) = lock(&self.reader_task).take() {
            old_task.abort();
        }

        let Some(reader) = conn.take_reader() else {
            // A connection can only be attached once.
            self.report(Error::violation("connection reader already taken"));
            return;
        };

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            session.read_loop(reader).await;
            session.close();
        });
        *lock(&self.reader_task) = Some(handle);
    }

    async fn read_loop(self: &Arc<Self>, mut reader: ReaderHalf) {
        let mut deframer = Deframer::with_leftover(&reader.leftover);
        let mut buf = [0u8; 8192];
        loop {
            while let Some(frame) = deframer.next_frame() {
                match Message::decode(&frame) {
                    Ok(msg) => self.dispatch(msg).await,
                    Err(err) => self.report(err),
                }
            }
            match reader.read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => deframer.feed(&buf[..n]),
                Err(err) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        self.report(Error::Io(err));
                    }
                    break;
                }
            }
        }
    }

    /// Route one decoded inbound message.
    pub(crate) async fn dispatch(self: &Arc<Self>, msg: Message) {
        if matches!(msg, Message::KeepAlive) {
            tracing::trace!(session = %self.proxy(), "keepalive");
            return;
        }

        let proxy = self.proxy();
        if msg.is_call_initiating() {
            if let Some(node) = self.node.upgrade() {
                node.dispatch_call(proxy, msg).await;
            }
            return;
        }

        let Some(id) = msg.message_id() else {
            self.report(Error::violation("correlated message without id"));
            return;
        };
        // Clone out of the map so no shard lock is held across the await.
        let handler = self.in_flight.get(&id).map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler.on_message(proxy, msg).await,
            None => self.report(Error::Violation(
                format!("no in-flight handler for message id {id}").into(),
            )),
        }
    }

    /// Report an error scoped to this session: logged and surfaced as a
    /// node event, never fatal to the node.
    pub(crate) fn report(&self, err: Error) {
        tracing::warn!(session = %self.proxy(), error = %err, "session error");
        if let Some(node) = self.node.upgrade() {
            node.emit_error(err);
        }
    }

    /// Close the session: cascades to the connection, stops the reader,
    /// clears the in-flight registry, and removes the session from its
    /// node. Idempotent and safe from any exit path.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.proxy(), "session closed");

        if let Some(conn) = lock(&self.conn).take() {
            conn.close();
        }
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        self.in_flight.clear();

        if let Some(node) = self.node.upgrade() {
            node.on_session_closed(&self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.proxy())
            .field("in_flight", &self.in_flight.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl CallHandler for CountingHandler {
        async fn on_message(&self, _from: SessionProxy, _msg: Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn orphan_session() -> Arc<Session> {
        Session::new([9u8; 32], Weak::new())
    }

    #[tokio::test]
    async fn register_twice_is_an_error() {
        let session = orphan_session();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        session.register_handler(1, handler.clone()).unwrap();
        assert!(matches!(
            session.register_handler(1, handler),
            Err(Error::Violation(_))
        ));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let session = orphan_session();
        session.unregister_handler(5);
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        session.register_handler(5, handler).unwrap();
        session.unregister_handler(5);
        session.unregister_handler(5);
        assert_eq!(session.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn correlated_dispatch_reaches_the_handler() {
        let session = orphan_session();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        session.register_handler(7, handler.clone()).unwrap();

        session
            .dispatch(Message::PreauthAccept { message_id: 7 })
            .await;
        session
            .dispatch(Message::PreauthAck { message_id: 7 })
            .await;
        // Unregistered id: reported, not delivered.
        session
            .dispatch(Message::PreauthAccept { message_id: 8 })
            .await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_clears_registry_and_rejects_new_registrations() {
        let session = orphan_session();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        session.register_handler(1, handler.clone()).unwrap();

        session.close();
        session.close();
        assert_eq!(session.in_flight_count(), 0);
        assert!(matches!(
            session.register_handler(2, handler),
            Err(Error::Closed)
        ));
        assert!(matches!(
            session.send(&Message::KeepAlive).await,
            Err(Error::Closed)
        ));
    }
}
