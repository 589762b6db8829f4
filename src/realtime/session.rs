//! # DDP Session
//!
//! Protocol state machine for one connection. Inbound frames are handed to
//! `DdpSession::handle_frame`; outbound messages leave through an unbounded
//! channel of batches that a single writer drains.
//!
//! Subscriptions and presented collections share one mutex per connection.
//! Messages produced while it is held are queued before it is released, so
//! the order on the wire is the order in which state changed. The lock is
//! never held across an await.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::ddp::{
    Baggage, ClientMessage, DocumentFields, EJson, Encapsulation, ErrorPayload, Random,
    RandomStream, ServerMessage, SUPPORTED_VERSIONS,
};
use crate::signal::StopController;

use super::errors::{HandlerError, HandlerResult, RealtimeError, RealtimeResult};
use super::interface::{DdpInterface, MethodContext};
use super::presented::PresentedCollection;
use super::subscription::SubscriptionHandle;

/// Receiving end of a session's outbound batches
pub type OutboundReceiver = mpsc::UnboundedReceiver<Vec<ServerMessage>>;

struct SubscriptionEntry {
    token: u64,
    name: String,
    controller: StopController,
    ready: bool,
}

#[derive(Default)]
struct SessionState {
    connected: bool,
    closed: bool,
    subscriptions: HashMap<String, SubscriptionEntry>,
    collections: HashMap<String, PresentedCollection>,
}

impl SessionState {
    fn is_active(&self, sub_id: &str, token: u64) -> bool {
        !self.closed
            && self
                .subscriptions
                .get(sub_id)
                .map(|entry| entry.token == token)
                .unwrap_or(false)
    }
}

/// State shared by a session and its subscription handles
pub(crate) struct SessionCore {
    id: String,
    state: Mutex<SessionState>,
    outbound: mpsc::UnboundedSender<Vec<ServerMessage>>,
    next_token: AtomicU64,
}

impl SessionCore {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> RealtimeResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".to_string()))
    }

    /// Queue a batch. Must be called with the state lock held.
    fn send_locked(&self, state: &SessionState, messages: Vec<ServerMessage>) {
        if state.closed || messages.is_empty() {
            return;
        }
        if self.outbound.send(messages).is_err() {
            debug!(session = %self.id, "outbound channel closed");
        }
    }

    fn send(&self, messages: Vec<ServerMessage>) {
        match self.lock() {
            Ok(state) => self.send_locked(&state, messages),
            Err(e) => error!(session = %self.id, error = %e, "failed to send"),
        }
    }

    pub(crate) fn is_active(&self, sub_id: &str, token: u64) -> bool {
        self.lock()
            .map(|state| state.is_active(sub_id, token))
            .unwrap_or(false)
    }

    /// Apply a reconciliation step on behalf of a live subscription
    pub(crate) fn emit<F>(&self, sub_id: &str, token: u64, collection: &str, op: F) -> RealtimeResult<()>
    where
        F: FnOnce(&mut PresentedCollection) -> RealtimeResult<Vec<ServerMessage>>,
    {
        let mut state = self.lock()?;
        if !state.is_active(sub_id, token) {
            return Ok(());
        }
        let presented = state
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| PresentedCollection::new(collection));
        let messages = op(presented)?;
        self.send_locked(&state, messages);
        Ok(())
    }

    /// Send `ready` once per subscription
    pub(crate) fn mark_ready(&self, sub_id: &str, token: u64) -> RealtimeResult<()> {
        let mut state = self.lock()?;
        if !state.is_active(sub_id, token) {
            return Ok(());
        }
        let Some(entry) = state.subscriptions.get_mut(sub_id) else {
            return Ok(());
        };
        if entry.ready {
            return Ok(());
        }
        entry.ready = true;
        self.send_locked(
            &state,
            vec![ServerMessage::Ready {
                subs: vec![sub_id.to_string()],
            }],
        );
        Ok(())
    }

    /// Stop a subscription: retract its documents, send `nosub`, fire its
    /// stop signal. `token` pins a specific incarnation of a reused id.
    /// Returns whether anything was stopped.
    pub(crate) fn stop_subscription(
        &self,
        sub_id: &str,
        token: Option<u64>,
        error: Option<ErrorPayload>,
    ) -> bool {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(e) => {
                error!(session = %self.id, error = %e, "failed to stop subscription");
                return false;
            }
        };

        let matches = state
            .subscriptions
            .get(sub_id)
            .map(|entry| token.map(|t| t == entry.token).unwrap_or(true))
            .unwrap_or(false);
        if !matches || state.closed {
            return false;
        }
        let Some(entry) = state.subscriptions.remove(sub_id) else {
            return false;
        };

        let mut messages = Vec::new();
        for presented in state.collections.values_mut() {
            match presented.drop_sub(sub_id) {
                Ok(retracted) => messages.extend(retracted),
                Err(e) => error!(session = %self.id, sub_id, error = %e, "failed to retract"),
            }
        }
        state.collections.retain(|_, presented| !presented.is_empty());
        messages.push(ServerMessage::Nosub {
            id: sub_id.to_string(),
            error,
        });
        self.send_locked(&state, messages);

        debug!(session = %self.id, sub_id, name = %entry.name, "subscription stopped");
        entry.controller.abort();
        true
    }

    fn close(&self) -> bool {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        if state.closed {
            return false;
        }
        state.closed = true;
        for (_, entry) in state.subscriptions.drain() {
            entry.controller.abort();
        }
        state.collections.clear();
        true
    }
}

/// One client connection
pub struct DdpSession {
    core: Arc<SessionCore>,
    interface: Arc<DdpInterface>,
    encapsulation: Encapsulation,
}

impl DdpSession {
    /// Create a session and the receiver its writer should drain
    pub fn new(interface: Arc<DdpInterface>, encapsulation: Encapsulation) -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let core = Arc::new(SessionCore {
            id: Random::new().id(),
            state: Mutex::new(SessionState::default()),
            outbound,
            next_token: AtomicU64::new(1),
        });
        interface.register_session(&core.id);

        (
            Self {
                core,
                interface,
                encapsulation,
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn encapsulation(&self) -> Encapsulation {
        self.encapsulation
    }

    pub fn is_connected(&self) -> bool {
        self.core
            .lock()
            .map(|state| state.connected && !state.closed)
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.core.lock().map(|state| state.closed).unwrap_or(true)
    }

    /// Ids of the live subscriptions, sorted
    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .core
            .lock()
            .map(|state| state.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Current client view of one document
    pub fn client_view(&self, collection: &str, id: &str) -> Option<DocumentFields> {
        let state = self.core.lock().ok()?;
        state.collections.get(collection)?.client_view(id).cloned()
    }

    /// Queue messages outside of any subscription, e.g. a heartbeat `ping`
    pub fn send(&self, messages: Vec<ServerMessage>) {
        self.core.send(messages);
    }

    /// Handle one inbound transport frame
    pub fn handle_frame(&self, frame: &str) {
        let payloads = match self.encapsulation.client_payloads(frame) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(session = %self.id(), error = %e, "malformed frame");
                self.send_bad_request(None);
                return;
            }
        };

        for payload in payloads {
            let value: Value = match serde_json::from_str(&payload) {
                Ok(value) => value,
                Err(e) => {
                    warn!(session = %self.id(), error = %e, "unparseable message");
                    self.send_bad_request(None);
                    continue;
                }
            };
            match serde_json::from_value::<ClientMessage>(value.clone()) {
                Ok(message) => self.handle_message(message),
                Err(e) => {
                    warn!(session = %self.id(), error = %e, "invalid message");
                    self.send_bad_request(Some(value));
                }
            }
        }
    }

    fn send_bad_request(&self, offending_message: Option<Value>) {
        self.core.send(vec![ServerMessage::Error {
            reason: "Bad request".to_string(),
            offending_message,
        }]);
    }

    fn send_error(&self, reason: &str, message: &ClientMessage) {
        self.core.send(vec![ServerMessage::Error {
            reason: reason.to_string(),
            offending_message: serde_json::to_value(message).ok(),
        }]);
    }

    /// Handle one decoded client message
    pub fn handle_message(&self, message: ClientMessage) {
        match &message {
            ClientMessage::Ping { id } => {
                self.core.send(vec![ServerMessage::Pong { id: id.clone() }]);
                return;
            }
            ClientMessage::Pong { .. } => return,
            _ => {}
        }

        if let ClientMessage::Connect { version, support, .. } = &message {
            self.handle_connect(version, support, &message);
            return;
        }

        if !self.is_connected() {
            self.send_error(&RealtimeError::NotConnected.to_string(), &message);
            return;
        }

        match message {
            ClientMessage::Method {
                id,
                method,
                params,
                random_seed,
                baggage,
            } => self.handle_method(id, method, params, random_seed, baggage.unwrap_or_default()),
            ClientMessage::Sub {
                id,
                name,
                params,
                baggage,
            } => self.handle_sub(id, name, params, baggage.unwrap_or_default()),
            ClientMessage::Unsub { id } => {
                if !self.core.stop_subscription(&id, None, None) {
                    debug!(session = %self.id(), sub_id = %id, "unsub for unknown subscription");
                }
            }
            ClientMessage::Connect { .. } | ClientMessage::Ping { .. } | ClientMessage::Pong { .. } => {}
        }
    }

    fn handle_connect(&self, version: &str, support: &[String], message: &ClientMessage) {
        let mut state = match self.core.lock() {
            Ok(state) => state,
            Err(e) => {
                error!(session = %self.id(), error = %e, "failed to connect");
                return;
            }
        };

        if state.connected {
            drop(state);
            self.send_error("Already connected", message);
            return;
        }

        if !SUPPORTED_VERSIONS.contains(&version) {
            let proposal = support
                .iter()
                .find(|v| SUPPORTED_VERSIONS.contains(&v.as_str()))
                .cloned()
                .unwrap_or_else(|| SUPPORTED_VERSIONS[0].to_string());
            debug!(session = %self.id(), version, %proposal, "unsupported protocol version");
            self.core
                .send_locked(&state, vec![ServerMessage::Failed { version: proposal }]);
            return;
        }

        state.connected = true;
        self.core.send_locked(
            &state,
            vec![ServerMessage::Connected {
                session: self.id().to_string(),
            }],
        );
        debug!(session = %self.id(), version, "client connected");
    }

    fn handle_method(
        &self,
        id: String,
        method: String,
        params: Vec<EJson>,
        random_seed: Option<String>,
        baggage: Baggage,
    ) {
        let span = info_span!(
            "ddp.method",
            rpc.system = "ddp",
            rpc.method = %method,
            rpc.ddp.method_id = %id,
            session = %self.id(),
            baggage = ?baggage,
        );
        let ctx = MethodContext {
            session_id: self.id().to_string(),
            method_id: id.clone(),
            random: random_seed.map(RandomStream::new),
            baggage,
        };
        let core = Arc::clone(&self.core);
        let interface = Arc::clone(&self.interface);

        tokio::spawn(
            async move {
                let reply = match guard_panics(interface.call_method(ctx, &method, params)).await {
                    Ok(result) => ServerMessage::Result {
                        id: id.clone(),
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => {
                        warn!(error = %e, "method failed");
                        ServerMessage::Result {
                            id: id.clone(),
                            result: None,
                            error: Some(e.to_payload()),
                        }
                    }
                };
                core.send(vec![reply, ServerMessage::Updated { methods: vec![id] }]);
            }
            .instrument(span),
        );
    }

    fn handle_sub(&self, id: String, name: String, params: Vec<EJson>, baggage: Baggage) {
        let token = self.core.next_token.fetch_add(1, Ordering::Relaxed);
        let controller = StopController::new();
        {
            let mut state = match self.core.lock() {
                Ok(state) => state,
                Err(e) => {
                    error!(session = %self.id(), error = %e, "failed to subscribe");
                    return;
                }
            };
            if state.subscriptions.contains_key(&id) {
                warn!(session = %self.id(), sub_id = %id, "duplicate subscription id ignored");
                return;
            }
            state.subscriptions.insert(
                id.clone(),
                SubscriptionEntry {
                    token,
                    name: name.clone(),
                    controller: controller.clone(),
                    ready: false,
                },
            );
        }

        let span = info_span!(
            "ddp.subscription",
            rpc.system = "ddp-subscribe",
            rpc.method = %name,
            rpc.ddp.sub_id = %id,
            session = %self.id(),
            baggage = ?baggage,
        );
        let handle = SubscriptionHandle::new(
            Arc::clone(&self.core),
            id,
            name,
            token,
            controller.signal(),
            baggage,
        );

        let interface = Arc::clone(&self.interface);

        tokio::spawn(
            async move {
                let signal = handle.signal();
                let name = handle.name().to_string();
                let running = guard_panics(interface.call_subscribe(handle.clone(), &name, params));
                tokio::select! {
                    result = running => {
                        if let Err(e) = result {
                            warn!(error = %e, "publication failed");
                            handle.error(e);
                        }
                    }
                    _ = signal.cancelled() => {}
                }
            }
            .instrument(span),
        );
    }

    /// Tear the session down: every subscription's stop signal fires once,
    /// reconciliation state is released and nothing more is sent
    pub fn close(&self) {
        if self.core.close() {
            self.interface.unregister_session(self.id());
            debug!(session = %self.id(), "session closed");
        }
    }
}

/// Await a handler, turning a panic into an internal error
async fn guard_panics<T>(handler: impl Future<Output = HandlerResult<T>>) -> HandlerResult<T> {
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            error!(panic = %panic_message(&*panic), "handler panicked");
            Err(HandlerError::internal("Internal server error"))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic"
    }
}

impl Drop for DdpSession {
    fn drop(&mut self) {
        self.close();
    }
}
