//! # Real-Time Server
//!
//! Serves DDP over WebSocket: methods, publications and per-connection
//! reconciliation of what every subscription asserts.
//!
//! ## Architecture
//!
//! - **Interface**: registry of methods, publications and open sessions
//! - **Session**: protocol state machine for one connection
//! - **Presented**: merge box turning per-subscription assertions into the
//!   client's view
//! - **Subscription**: handle a publication publishes through
//! - **Livedata**: bridge from entity change streams to subscriptions
//! - **WebSocket**: network layer for connections

pub mod errors;
pub mod interface;
pub mod livedata;
pub mod presented;
pub mod session;
pub mod subscription;
pub mod websocket;

pub use errors::{HandlerError, HandlerResult, RealtimeError, RealtimeResult};
pub use interface::{
    method_fn, publication_fn, DdpInterface, MethodContext, MethodHandler, PublicationHandler,
};
pub use livedata::{
    emit_to_sub, filter_event_stream, render_entities, render_event_stream, SubscriptionEvent,
    SubscriptionSource,
};
pub use presented::PresentedCollection;
pub use session::{DdpSession, OutboundReceiver};
pub use subscription::SubscriptionHandle;
pub use websocket::{WebSocketConfig, WebSocketServer};
