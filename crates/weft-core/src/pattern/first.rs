//! First: preauthorized request/response with destination racing.
//!
//! One logical call addresses N candidate destinations under a single
//! message id. Whichever destination completes preauthorization first
//! receives the request payload and serves the call; the rest are
//! unregistered and never see a data frame.
//!
//! Initiator states: `init -> awaitAck -> awaitResp -> done/failed`.
//! Responder states, one instance per inbound preauth request:
//! `init -> awaitReq -> done`.
//!
//! Every exit path funnels through one cleanup routine that releases the
//! remaining handler registrations; cleanup failures along a failure path
//! are swallowed, never re-thrown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::node::{Node, NodeInner};
use crate::pattern::{send_chunked, DataDirection, Reassembly};
use crate::protocol::{FirstHook, Payload, RequestCallback, ResponseCallback};
use crate::proxy::SessionProxy;
use crate::session::{CallHandler, Session};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one First-pattern call to completion.
///
/// The returned future settles when a winning destination's response has
/// been fed through the hook's response handler, when the exchange fails,
/// or when the last pending destination stops. A destination that never
/// answers leaves the call pending; any timeout belongs to the caller.
pub(crate) async fn call(
    node: &Node,
    protocol_tag: u32,
    hook_name: &str,
    hook: &FirstHook,
    destinations: &[SessionProxy],
    args: Payload,
) -> Result<Payload> {
    if destinations.is_empty() {
        return Err(Error::violation("first call addresses no destinations"));
    }

    let (preauth, data) = (hook.input)(args).await?;
    let message_id = node.next_message_id();
    let (result_tx, result_rx) = oneshot::channel();

    let initiator = Arc::new(Initiator {
        node: node.downgrade(),
        message_id,
        on_response: Arc::clone(&hook.on_response),
        max_chunk: node.config().max_chunk,
        state: Mutex::new(InitiatorState {
            phase: Phase::AwaitAck,
            pending: destinations.to_vec(),
            data: Some(data),
            result: Some(result_tx),
        }),
    });

    // Register on every destination before the first preauth request goes
    // out, so no reply can beat its own handler.
    let mut sessions: Vec<Arc<Session>> = Vec::with_capacity(destinations.len());
    for dest in destinations {
        let session = match node.resolve(dest) {
            Ok(session) => session,
            Err(err) => {
                initiator.finish(Err(err));
                return take_result(result_rx).await;
            }
        };
        let handler: Arc<dyn CallHandler> = Arc::clone(&initiator) as Arc<dyn CallHandler>;
        if let Err(err) = session.register_handler(message_id, handler) {
            initiator.finish(Err(err));
            return take_result(result_rx).await;
        }
        sessions.push(session);
    }

    let msg = Message::PreauthReq {
        message_id,
        protocol_tag,
        hook_name: hook_name.to_string(),
        payload: preauth,
    };
    let mut last_err = None;
    for session in &sessions {
        if let Err(err) = session.send(&msg).await {
            // The branch is dead; abandon it like a stop and let the rest
            // of the race continue.
            tracing::warn!(message_id, error = %err, "preauth request send failed");
            initiator.abandon_branch(session.proxy());
            last_err = Some(err);
        }
    }
    if let Some(err) = last_err {
        if lock(&initiator.state).pending.is_empty() {
            initiator.finish(Err(err));
        }
    }

    // Registrations hold the initiator, so a call whose destinations never
    // answer pends here instead of erroring out.
    let result = result_rx.await;
    drop(initiator);
    result.unwrap_or(Err(Error::Closed))
}

async fn take_result(rx: oneshot::Receiver<Result<Payload>>) -> Result<Payload> {
    rx.await.unwrap_or(Err(Error::Closed))
}

enum Phase {
    AwaitAck,
    AwaitResp {
        winner: SessionProxy,
        reassembly: Reassembly,
    },
    Done,
}

struct InitiatorState {
    phase: Phase,
    /// Destinations whose in-flight registration is still live.
    pending: Vec<SessionProxy>,
    /// Request payload, held until a winner emerges.
    data: Option<Payload>,
    result: Option<oneshot::Sender<Result<Payload>>>,
}

struct Initiator {
    node: Weak<NodeInner>,
    message_id: u64,
    on_response: ResponseCallback,
    max_chunk: usize,
    state: Mutex<InitiatorState>,
}

impl Initiator {
    /// Resolve the call and release every remaining registration. Safe to
    /// reach from any exit path, any number of times.
    fn finish(&self, result: Result<Payload>) {
        let (sender, remaining) = {
            let mut st = lock(&self.state);
            st.phase = Phase::Done;
            st.data = None;
            (st.result.take(), std::mem::take(&mut st.pending))
        };
        self.unregister(&remaining);
        if let Some(tx) = sender {
            let _ = tx.send(result);
        }
    }

    fn fail(&self, err: Error) {
        self.finish(Err(err));
    }

    /// Drop one destination's branch without resolving the call.
    fn abandon_branch(&self, dest: SessionProxy) {
        lock(&self.state).pending.retain(|p| *p != dest);
        self.unregister(&[dest]);
    }

    fn unregister(&self, destinations: &[SessionProxy]) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        for dest in destinations {
            // A vanished session already dropped its registry with it.
            if let Some(session) = node.resolve_session(dest) {
                session.unregister_handler(self.message_id);
            }
        }
    }

    async fn handle_accept(&self, from: SessionProxy) {
        enum Action {
            Win { losers: Vec<SessionProxy>, data: Payload },
            Unexpected,
        }

        let action = {
            let mut st = lock(&self.state);
            match &st.phase {
                Phase::AwaitAck => {
                    let losers: Vec<SessionProxy> =
                        st.pending.iter().copied().filter(|p| *p != from).collect();
                    st.pending.retain(|p| *p == from);
                    st.phase = Phase::AwaitResp {
                        winner: from,
                        reassembly: Reassembly::new(),
                    };
                    match st.data.take() {
                        Some(data) => Action::Win { losers, data },
                        None => Action::Unexpected,
                    }
                }
                // A duplicate accept from the winner is a protocol error; a
                // straggler accept from an unregistered loser that was
                // already in flight is simply undeliverable.
                Phase::AwaitResp { winner, .. } if *winner == from => Action::Unexpected,
                Phase::AwaitResp { .. } | Phase::Done => return,
            }
        };

        match action {
            Action::Win { losers, data } => {
                tracing::debug!(message_id = self.message_id, winner = %from, "preauth race won");
                self.unregister(&losers);

                let winner_session = self.node.upgrade().and_then(|n| n.resolve_session(&from));
                let Some(session) = winner_session else {
                    self.fail(Error::NotFound);
                    return;
                };
                if let Err(err) = send_chunked(
                    &session,
                    DataDirection::Request,
                    self.message_id,
                    &data,
                    self.max_chunk,
                )
                .await
                {
                    self.fail(err);
                }
            }
            Action::Unexpected => {
                self.fail(Error::violation("preauth accept outside awaitAck"));
            }
        }
    }

    fn handle_stop(&self, from: SessionProxy, reason: String) {
        enum Action {
            Abandon { exhausted: bool },
            FailCall,
            Ignore,
        }

        let action = {
            let mut st = lock(&self.state);
            match &st.phase {
                Phase::AwaitAck => {
                    st.pending.retain(|p| *p != from);
                    Action::Abandon {
                        exhausted: st.pending.is_empty(),
                    }
                }
                Phase::AwaitResp { winner, .. } if *winner == from => Action::FailCall,
                _ => Action::Ignore,
            }
        };

        match action {
            Action::Abandon { exhausted } => {
                tracing::debug!(message_id = self.message_id, from = %from, "destination stopped");
                self.unregister(&[from]);
                if exhausted {
                    // The last candidate rejected; its reason settles the
                    // call. Destinations that never answer at all still
                    // leave it pending.
                    self.fail(Error::Application(reason));
                }
            }
            Action::FailCall => self.fail(Error::Application(reason)),
            Action::Ignore => {}
        }
    }

    async fn handle_response_data(
        &self,
        from: SessionProxy,
        total_len: Option<u32>,
        chunk: Vec<u8>,
    ) {
        let outcome = {
            let mut st = lock(&self.state);
            match &mut st.phase {
                Phase::AwaitResp { winner, reassembly } if *winner == from => match total_len {
                    Some(total) => reassembly.head(total, chunk),
                    None => reassembly.cont(chunk),
                },
                // Data from anyone but the winner is undeliverable, not a
                // call failure.
                Phase::AwaitResp { .. } | Phase::Done => return,
                Phase::AwaitAck => Err(Error::violation("response data before preauth accept")),
            }
        };

        match outcome {
            Ok(None) => {}
            Ok(Some(payload)) => {
                let result = (self.on_response)(payload).await;
                self.finish(result);
            }
            Err(err) => self.fail(err),
        }
    }
}

#[async_trait]
impl CallHandler for Initiator {
    async fn on_message(&self, from: SessionProxy, msg: Message) {
        match msg {
            // Informational; carries no state transition.
            Message::PreauthAck { .. } => {}
            Message::PreauthAccept { .. } => self.handle_accept(from).await,
            Message::PreauthStop { reason, .. } => self.handle_stop(from, reason),
            Message::ResData {
                total_len, chunk, ..
            } => self.handle_response_data(from, Some(total_len), chunk).await,
            Message::ResDataCont { chunk, .. } => {
                self.handle_response_data(from, None, chunk).await;
            }
            other => self.fail(Error::Violation(
                format!("unexpected {:?} during first call", other.kind()).into(),
            )),
        }
    }
}

/// Handle one inbound preauth request: register a responder, ack, run the
/// preauthorization callback, and either accept or stop.
pub(crate) async fn respond(
    node: &Arc<NodeInner>,
    hook: &FirstHook,
    hook_name: &str,
    from: SessionProxy,
    message_id: u64,
    preauth: Payload,
) {
    let Some(session) = node.resolve_session(&from) else {
        tracing::warn!(message_id, from = %from, "preauth request from vanished session");
        return;
    };

    let responder = Arc::new(Responder {
        node: Arc::downgrade(node),
        message_id,
        from,
        preauth: preauth.clone(),
        on_request: Arc::clone(&hook.on_request),
        max_chunk: node.config().max_chunk,
        state: Mutex::new(ResponderPhase::AwaitReq(Reassembly::new())),
    });

    let handler: Arc<dyn CallHandler> = Arc::clone(&responder) as Arc<dyn CallHandler>;
    if let Err(err) = session.register_handler(message_id, handler) {
        session.report(err);
        return;
    }

    if let Err(err) = session.send(&Message::PreauthAck { message_id }).await {
        tracing::warn!(message_id, error = %err, "preauth ack send failed");
        responder.cleanup();
        return;
    }

    match (hook.on_preauth)(from, preauth).await {
        Ok(()) => {
            if let Err(err) = session.send(&Message::PreauthAccept { message_id }).await {
                tracing::warn!(message_id, error = %err, "preauth accept send failed");
                responder.cleanup();
            }
        }
        Err(err) => {
            tracing::debug!(message_id, hook = %hook_name, reason = %err, "preauth rejected");
            let stop = Message::PreauthStop {
                message_id,
                reason: err.to_string(),
            };
            if let Err(send_err) = session.send(&stop).await {
                tracing::warn!(message_id, error = %send_err, "preauth stop send failed");
            }
            responder.cleanup();
        }
    }
}

enum ResponderPhase {
    AwaitReq(Reassembly),
    Done,
}

struct Responder {
    node: Weak<NodeInner>,
    message_id: u64,
    from: SessionProxy,
    /// Preauthorization payload, replayed to the request handler.
    preauth: Payload,
    on_request: RequestCallback,
    max_chunk: usize,
    state: Mutex<ResponderPhase>,
}

impl Responder {
    fn session(&self) -> Option<Arc<Session>> {
        self.node
            .upgrade()
            .and_then(|node| node.resolve_session(&self.from))
    }

    /// Release the registration. Safe from any exit path.
    fn cleanup(&self) {
        *lock(&self.state) = ResponderPhase::Done;
        if let Some(session) = self.session() {
            session.unregister_handler(self.message_id);
        }
    }

    async fn serve(&self, request: Payload) {
        let Some(session) = self.session() else {
            self.cleanup();
            return;
        };

        match (self.on_request)(self.from, self.preauth.clone(), request).await {
            Ok(response) => {
                if let Err(err) = send_chunked(
                    &session,
                    DataDirection::Response,
                    self.message_id,
                    &response,
                    self.max_chunk,
                )
                .await
                {
                    tracing::warn!(message_id = self.message_id, error = %err, "response send failed");
                }
            }
            Err(err) => {
                tracing::debug!(message_id = self.message_id, reason = %err, "request rejected");
                let stop = Message::PreauthStop {
                    message_id: self.message_id,
                    reason: err.to_string(),
                };
                if let Err(send_err) = session.send(&stop).await {
                    tracing::warn!(message_id = self.message_id, error = %send_err, "stop send failed");
                }
            }
        }
        self.cleanup();
    }
}

#[async_trait]
impl CallHandler for Responder {
    async fn on_message(&self, from: SessionProxy, msg: Message) {
        let outcome = {
            let mut st = lock(&self.state);
            match &mut *st {
                ResponderPhase::AwaitReq(reassembly) => match msg {
                    Message::ReqData {
                        total_len, chunk, ..
                    } => reassembly.head(total_len, chunk),
                    Message::ReqDataCont { chunk, .. } => reassembly.cont(chunk),
                    other => Err(Error::Violation(
                        format!("unexpected {:?} while awaiting request data", other.kind())
                            .into(),
                    )),
                },
                ResponderPhase::Done => return,
            }
        };

        match outcome {
            Ok(None) => {}
            Ok(Some(request)) => {
                *lock(&self.state) = ResponderPhase::Done;
                self.serve(request).await;
            }
            Err(err) => {
                // The peer broke the exchange protocol; its connection is
                // suspect. Report and withdraw.
                if let Some(node) = self.node.upgrade() {
                    if let Some(session) = node.resolve_session(&from) {
                        session.report(err);
                    } else {
                        node.emit_error(err);
                    }
                }
                self.cleanup();
            }
        }
    }
}
