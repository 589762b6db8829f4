//! # Subscription Handles
//!
//! What a publication handler holds while it publishes. Every operation goes
//! through the owning session's lock; once the subscription has stopped,
//! further emits are ignored.

use std::sync::Arc;

use tracing::warn;

use crate::ddp::{Baggage, DocumentFields};
use crate::signal::StopSignal;

use super::errors::{HandlerError, RealtimeResult};
use super::session::SessionCore;

/// A live subscription as seen by its publication handler
#[derive(Clone)]
pub struct SubscriptionHandle {
    core: Arc<SessionCore>,
    sub_id: String,
    name: String,
    token: u64,
    signal: StopSignal,
    baggage: Baggage,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("session", &self.core.id())
            .field("sub_id", &self.sub_id)
            .field("name", &self.name)
            .finish()
    }
}

impl SubscriptionHandle {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        sub_id: String,
        name: String,
        token: u64,
        signal: StopSignal,
        baggage: Baggage,
    ) -> Self {
        Self {
            core,
            sub_id,
            name,
            token,
            signal,
            baggage,
        }
    }

    /// Client-chosen subscription id
    pub fn id(&self) -> &str {
        &self.sub_id
    }

    /// Publication name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> &str {
        self.core.id()
    }

    pub fn baggage(&self) -> &Baggage {
        &self.baggage
    }

    /// Fires when the subscription stops for any reason
    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.signal.is_stopped() && self.core.is_active(&self.sub_id, self.token)
    }

    pub fn added(&self, collection: &str, id: &str, fields: DocumentFields) -> RealtimeResult<()> {
        self.core
            .emit(&self.sub_id, self.token, collection, |presented| {
                presented.added(&self.sub_id, id, fields)
            })
    }

    /// `Undefined` values clear the field
    pub fn changed(&self, collection: &str, id: &str, fields: DocumentFields) -> RealtimeResult<()> {
        self.core
            .emit(&self.sub_id, self.token, collection, |presented| {
                presented.changed(&self.sub_id, id, fields)
            })
    }

    pub fn removed(&self, collection: &str, id: &str) -> RealtimeResult<()> {
        self.core
            .emit(&self.sub_id, self.token, collection, |presented| {
                presented.removed(&self.sub_id, id)
            })
    }

    /// Tell the client the initial snapshot is complete. Only the first call
    /// sends anything.
    pub fn ready(&self) -> RealtimeResult<()> {
        self.core.mark_ready(&self.sub_id, self.token)
    }

    /// Stop from the server side; the client gets a plain `nosub`
    pub fn stop(&self) {
        self.core.stop_subscription(&self.sub_id, Some(self.token), None);
    }

    /// Stop with an error carried in the `nosub`
    pub fn error(&self, error: HandlerError) {
        if !self.core.stop_subscription(
            &self.sub_id,
            Some(self.token),
            Some(error.to_nosub_payload()),
        ) {
            warn!(sub_id = %self.sub_id, error = %error, "error on inactive subscription");
        }
    }
}
