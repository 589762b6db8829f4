//! # DDP Client
//!
//! Calls methods, holds subscriptions and mirrors published documents into
//! local collections.
//!
//! The client is transport-agnostic: it writes `ClientMessage`s to a channel
//! and consumes batches of `ServerMessage`s from a stream. `connect_to_url`
//! wires both to a WebSocket; tests wire them straight to a server session.
//!
//! A single inbound loop consumes server traffic in order. Any protocol
//! violation ends the loop, after which every pending call fails with
//! `ConnectionClosed`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::SinkExt;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ddp::{ClientMessage, EJson, Encapsulation, ServerFrame, ServerMessage, SUPPORTED_VERSIONS};
use crate::signal::{StopController, StopSignal};

use super::collection::{CollectionHandle, CollectionTable, LocalCollection};
use super::errors::{ClientError, ClientResult};

/// Inbound server traffic, one batch per transport frame
pub type InboundStream = BoxStream<'static, ClientResult<Vec<ServerMessage>>>;

const NOSUB_WITHOUT_ERROR: &str = "Server refused the subscription without providing an error";

#[derive(Default)]
struct ClientState {
    closed: bool,
    pending_methods: HashMap<String, oneshot::Sender<ClientResult<EJson>>>,
    pending_subs: HashMap<String, oneshot::Sender<ClientResult<()>>>,
    ready_subs: HashSet<String>,
}

struct ClientInner {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state: Mutex<ClientState>,
    collections: CollectionTable,
    session: String,
}

impl ClientInner {
    fn lock(&self) -> ClientResult<MutexGuard<'_, ClientState>> {
        self.state
            .lock()
            .map_err(|_| ClientError::Protocol("Lock poisoned".to_string()))
    }

    fn send(&self, message: ClientMessage) -> ClientResult<()> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Handle one server message. An error ends the inbound loop.
    fn handle_message(&self, message: ServerMessage) -> ClientResult<()> {
        match message {
            ServerMessage::Ping { id } => self.send(ClientMessage::Pong { id }),
            ServerMessage::Pong { .. } | ServerMessage::Updated { .. } => Ok(()),
            ServerMessage::Connected { .. } | ServerMessage::Failed { .. } => Err(
                ClientError::Protocol(format!("unexpected {} after handshake", message.kind())),
            ),
            ServerMessage::Error { reason, .. } => Err(ClientError::Server(reason)),

            ServerMessage::Ready { subs } => {
                let mut state = self.lock()?;
                for sub_id in subs {
                    let pending = state.pending_subs.remove(&sub_id).ok_or_else(|| {
                        ClientError::Protocol(format!(
                            "received \"ready\" for unknown subscription {:?}",
                            sub_id
                        ))
                    })?;
                    state.ready_subs.insert(sub_id);
                    let _ = pending.send(Ok(()));
                }
                Ok(())
            }
            ServerMessage::Nosub { id, error } => {
                let mut state = self.lock()?;
                if let Some(pending) = state.pending_subs.remove(&id) {
                    let message = error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| NOSUB_WITHOUT_ERROR.to_string());
                    let _ = pending.send(Err(ClientError::Subscription(message)));
                    return Ok(());
                }
                if state.ready_subs.remove(&id) {
                    match error {
                        Some(e) => warn!(sub_id = %id, error = %e.describe(), "subscription stopped"),
                        None => debug!(sub_id = %id, "subscription stopped"),
                    }
                    return Ok(());
                }
                Err(ClientError::Protocol(format!(
                    "received \"nosub\" for unknown subscription {:?}",
                    id
                )))
            }
            ServerMessage::Result { id, result, error } => {
                let pending = self.lock()?.pending_methods.remove(&id).ok_or_else(|| {
                    ClientError::Protocol(format!("received \"result\" for unknown method call {:?}", id))
                })?;
                let outcome = match error {
                    Some(e) => Err(ClientError::Method(e.describe())),
                    None => Ok(result.unwrap_or_default()),
                };
                let _ = pending.send(outcome);
                Ok(())
            }

            ServerMessage::Added { ref collection, .. }
            | ServerMessage::AddedBefore { ref collection, .. }
            | ServerMessage::Changed { ref collection, .. }
            | ServerMessage::Removed { ref collection, .. }
            | ServerMessage::MovedBefore { ref collection, .. } => {
                let mut collections = self
                    .collections
                    .lock()
                    .map_err(|_| ClientError::Protocol("Lock poisoned".to_string()))?;
                collections
                    .entry(collection.clone())
                    .or_insert_with(LocalCollection::new)
                    .apply(&message);
                Ok(())
            }
        }
    }

    /// Mark the client closed and fail everything still pending
    fn shut_down(&self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        state.closed = true;
        for (_, pending) in state.pending_methods.drain() {
            let _ = pending.send(Err(ClientError::ConnectionClosed));
        }
        for (_, pending) in state.pending_subs.drain() {
            let _ = pending.send(Err(ClientError::ConnectionClosed));
        }
        state.ready_subs.clear();
    }
}

/// A connected DDP client
pub struct DdpClient {
    inner: Arc<ClientInner>,
    stop: StopController,
}

impl DdpClient {
    /// Perform the handshake over an existing transport and start the
    /// inbound loop
    pub async fn connect(
        mut inbound: InboundStream,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> ClientResult<Self> {
        outbound
            .send(ClientMessage::Connect {
                version: SUPPORTED_VERSIONS[0].to_string(),
                support: vec![SUPPORTED_VERSIONS[0].to_string()],
                session: None,
            })
            .map_err(|_| ClientError::ConnectionClosed)?;

        let (session, leftover) = loop {
            let batch = inbound
                .next()
                .await
                .ok_or_else(|| ClientError::Handshake("connection closed during handshake".into()))??;
            let mut messages = batch.into_iter();
            match messages.next() {
                Some(ServerMessage::Connected { session }) => break (session, messages.collect::<Vec<_>>()),
                Some(ServerMessage::Ping { id }) => {
                    let _ = outbound.send(ClientMessage::Pong { id });
                }
                Some(ServerMessage::Failed { version }) => {
                    return Err(ClientError::Handshake(format!(
                        "server requires protocol version {}",
                        version
                    )))
                }
                Some(other) => {
                    return Err(ClientError::Handshake(format!(
                        "unexpected connect response: {}",
                        other.kind()
                    )))
                }
                None => {}
            }
        };
        debug!(%session, "ddp client connected");

        let inner = Arc::new(ClientInner {
            outbound,
            state: Mutex::new(ClientState::default()),
            collections: CollectionTable::default(),
            session,
        });
        for message in leftover {
            inner.handle_message(message)?;
        }

        let stop = StopController::new();
        tokio::spawn(run_inbound_loop(Arc::clone(&inner), inbound, stop.signal()));
        Ok(Self { inner, stop })
    }

    /// Connect to a WebSocket endpoint
    ///
    /// `base_url` is the server root, e.g. `ws://localhost:3000`. The array
    /// framing connects under a random `/sockjs/<shard>/<session>/websocket`
    /// path and expects the `o` banner first.
    pub async fn connect_to_url(base_url: &str, encapsulation: Encapsulation) -> ClientResult<Self> {
        let base = base_url.trim_end_matches('/');
        let url = match encapsulation {
            Encapsulation::Raw => format!("{}/websocket", base),
            Encapsulation::SockJs => {
                let shard = rand::random::<u16>() % 1000;
                let session = Uuid::new_v4().simple().to_string();
                format!("{}/sockjs/{}/{}/websocket", base, shard, &session[..8])
            }
        };

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        if encapsulation == Encapsulation::SockJs {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(banner))) if banner == "o" => {}
                Some(Ok(other)) => {
                    return Err(ClientError::Handshake(format!("unexpected banner: {:?}", other)))
                }
                Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
                None => return Err(ClientError::ConnectionClosed),
            }
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frames = match encapsulation.encode_client(std::slice::from_ref(&message)) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(error = %e, "failed to encode client message");
                        continue;
                    }
                };
                for frame in frames {
                    if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                        debug!(error = %e, "client writer stopped");
                        return;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        let inbound = ws_receiver
            .filter_map(move |frame| async move {
                match frame {
                    Ok(Message::Text(text)) => match encapsulation.decode_server(&text) {
                        Ok(ServerFrame::Messages(messages)) => Some(Ok(messages)),
                        Ok(ServerFrame::Heartbeat) => None,
                        Ok(ServerFrame::Open) => {
                            Some(Err(ClientError::Protocol("got second open".to_string())))
                        }
                        Ok(ServerFrame::Close { code, reason }) => {
                            Some(Err(ClientError::ClosedByServer { code, reason }))
                        }
                        Err(e) => Some(Err(e.into())),
                    },
                    Ok(Message::Close(_)) => Some(Err(ClientError::ConnectionClosed)),
                    Ok(_) => None,
                    Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
                }
            })
            .boxed();

        Self::connect(inbound, outbound).await
    }

    /// Session id assigned by the server
    pub fn session(&self) -> &str {
        &self.inner.session
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|state| state.closed).unwrap_or(true)
    }

    /// Call a method and wait for its result
    pub async fn call_method(&self, name: &str, params: Vec<EJson>) -> ClientResult<EJson> {
        let id = Uuid::new_v4().simple().to_string();
        let span = info_span!(
            "ddp.method",
            rpc.system = "ddp",
            rpc.method = %name,
            rpc.ddp.method_id = %id,
        );

        self.send_method(id, name, params).instrument(span).await
    }

    async fn send_method(&self, id: String, name: &str, params: Vec<EJson>) -> ClientResult<EJson> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock()?;
            if state.closed {
                return Err(ClientError::ConnectionClosed);
            }
            if state.pending_methods.contains_key(&id) {
                return Err(ClientError::Protocol(format!("method id {} already pending", id)));
            }
            state.pending_methods.insert(id.clone(), tx);
        }

        debug!("--> call");
        self.inner.send(ClientMessage::Method {
            id,
            method: name.to_string(),
            params,
            random_seed: None,
            baggage: None,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Subscribe and wait until the initial snapshot is ready. Returns the
    /// subscription id for `unsubscribe`.
    pub async fn subscribe(&self, name: &str, params: Vec<EJson>) -> ClientResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        let span = info_span!(
            "ddp.subscription",
            rpc.system = "ddp-subscribe",
            rpc.method = %name,
            rpc.ddp.sub_id = %id,
        );

        self.send_sub(id, name, params).instrument(span).await
    }

    async fn send_sub(&self, id: String, name: &str, params: Vec<EJson>) -> ClientResult<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock()?;
            if state.closed {
                return Err(ClientError::ConnectionClosed);
            }
            if state.pending_subs.contains_key(&id) || state.ready_subs.contains(&id) {
                return Err(ClientError::Protocol(format!("subscription id {} already in use", id)));
            }
            state.pending_subs.insert(id.clone(), tx);
        }

        debug!("--> sub");
        self.inner.send(ClientMessage::Sub {
            id: id.clone(),
            name: name.to_string(),
            params,
            baggage: None,
        })?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)??;
        Ok(id)
    }

    /// Ask the server to stop a subscription. Its documents disappear from
    /// the local collections once the server retracts them.
    pub fn unsubscribe(&self, sub_id: &str) -> ClientResult<()> {
        self.inner.send(ClientMessage::Unsub {
            id: sub_id.to_string(),
        })
    }

    /// Ids of subscriptions that are ready and not yet stopped
    pub fn ready_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .map(|state| state.ready_subs.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Query handle for a local collection
    pub fn collection(&self, name: &str) -> CollectionHandle {
        CollectionHandle::new(name, Arc::clone(&self.inner.collections))
    }

    /// Copy of every local collection
    pub fn collections(&self) -> ClientResult<BTreeMap<String, LocalCollection>> {
        self.inner
            .collections
            .lock()
            .map(|collections| collections.clone())
            .map_err(|_| ClientError::Protocol("Lock poisoned".to_string()))
    }

    /// Stop the inbound loop; pending calls fail with `ConnectionClosed`
    pub fn close(&self) {
        if self.stop.abort() {
            self.inner.shut_down();
        }
    }
}

impl Drop for DdpClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_inbound_loop(inner: Arc<ClientInner>, mut inbound: InboundStream, stop: StopSignal) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = inbound.next() => next,
        };
        let batch = match next {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => {
                warn!(error = %e, "ddp client connection failed");
                break;
            }
            None => {
                debug!("ddp client connection ended");
                break;
            }
        };

        let mut failed = false;
        for message in batch {
            if let Err(e) = inner.handle_message(message) {
                warn!(error = %e, "ddp client protocol error");
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
    }
    inner.shut_down();
}

/// Inbound stream over an in-process channel of batches, such as a server
/// session's outbound receiver
pub fn channel_inbound(mut batches: mpsc::UnboundedReceiver<Vec<ServerMessage>>) -> InboundStream {
    stream::poll_fn(move |cx| batches.poll_recv(cx)).map(Ok).boxed()
}
