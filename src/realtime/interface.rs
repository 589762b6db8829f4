//! # Method and Publication Registry
//!
//! `DdpInterface` maps names to handlers and tracks open sessions. It is
//! shared by every connection of a server.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::ddp::{Baggage, EJson, RandomStream};

use super::errors::{HandlerError, HandlerResult, RealtimeError, RealtimeResult};
use super::subscription::SubscriptionHandle;

/// Everything a method handler knows about its call
#[derive(Debug)]
pub struct MethodContext {
    /// Connection the call arrived on
    pub session_id: String,
    /// Client-chosen method call id
    pub method_id: String,
    /// Seeded id streams, when the client sent a `randomSeed`
    pub random: Option<RandomStream>,
    /// Opaque tracing context from the client
    pub baggage: Baggage,
}

/// Handler for a remote method
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, ctx: MethodContext, params: Vec<EJson>) -> HandlerResult<EJson>;
}

/// Handler for a publication
///
/// Returning `Ok` does not end the subscription; it stays live until the
/// client unsubscribes, the connection closes, or the handle is stopped.
/// Returning `Err` stops it with that error.
#[async_trait]
pub trait PublicationHandler: Send + Sync {
    async fn subscribe(&self, sub: SubscriptionHandle, params: Vec<EJson>) -> HandlerResult<()>;
}

/// Method handler backed by an async closure
pub struct MethodFn<F>(F);

/// Publication handler backed by an async closure
pub struct PublicationFn<F>(F);

/// Adapt `|ctx, params| async { .. }` into a `MethodHandler`
pub fn method_fn<F, Fut>(f: F) -> MethodFn<F>
where
    F: Fn(MethodContext, Vec<EJson>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<EJson>> + Send + 'static,
{
    MethodFn(f)
}

/// Adapt `|sub, params| async { .. }` into a `PublicationHandler`
pub fn publication_fn<F, Fut>(f: F) -> PublicationFn<F>
where
    F: Fn(SubscriptionHandle, Vec<EJson>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    PublicationFn(f)
}

#[async_trait]
impl<F, Fut> MethodHandler for MethodFn<F>
where
    F: Fn(MethodContext, Vec<EJson>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<EJson>> + Send + 'static,
{
    async fn call(&self, ctx: MethodContext, params: Vec<EJson>) -> HandlerResult<EJson> {
        (self.0)(ctx, params).await
    }
}

#[async_trait]
impl<F, Fut> PublicationHandler for PublicationFn<F>
where
    F: Fn(SubscriptionHandle, Vec<EJson>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn subscribe(&self, sub: SubscriptionHandle, params: Vec<EJson>) -> HandlerResult<()> {
        (self.0)(sub, params).await
    }
}

/// Registry of methods, publications and open sessions
#[derive(Default)]
pub struct DdpInterface {
    methods: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    publications: RwLock<HashMap<String, Arc<dyn PublicationHandler>>>,
    sessions: RwLock<HashSet<String>>,
}

impl DdpInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any previous handler of that name
    pub fn add_method<H: MethodHandler + 'static>(&self, name: &str, handler: H) -> RealtimeResult<()> {
        let mut methods = self
            .methods
            .write()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;
        methods.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Register a publication, replacing any previous handler of that name
    pub fn add_publication<H: PublicationHandler + 'static>(
        &self,
        name: &str,
        handler: H,
    ) -> RealtimeResult<()> {
        let mut publications = self
            .publications
            .write()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;
        publications.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn method(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.read().ok()?.get(name).cloned()
    }

    pub fn publication(&self, name: &str) -> Option<Arc<dyn PublicationHandler>> {
        self.publications.read().ok()?.get(name).cloned()
    }

    /// Run a method by name; unknown names fail with a 404
    pub async fn call_method(
        &self,
        ctx: MethodContext,
        name: &str,
        params: Vec<EJson>,
    ) -> HandlerResult<EJson> {
        let handler = self
            .method(name)
            .ok_or_else(|| HandlerError::not_found(format!("Method '{}' not found", name)))?;
        handler.call(ctx, params).await
    }

    /// Run a publication by name; unknown names fail with a 404
    pub async fn call_subscribe(
        &self,
        sub: SubscriptionHandle,
        name: &str,
        params: Vec<EJson>,
    ) -> HandlerResult<()> {
        let handler = self
            .publication(name)
            .ok_or_else(|| HandlerError::not_found(format!("Subscription '{}' not found", name)))?;
        handler.subscribe(sub, params).await
    }

    pub fn register_session(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session_id.to_string());
        }
    }

    pub fn unregister_session(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MethodContext {
        MethodContext {
            session_id: "s".into(),
            method_id: "1".into(),
            random: None,
            baggage: Baggage::new(),
        }
    }

    #[tokio::test]
    async fn test_call_registered_method() {
        let interface = DdpInterface::new();
        interface
            .add_method(
                "sum",
                method_fn(|_ctx, params: Vec<EJson>| async move {
                    let total: i64 = params.iter().filter_map(EJson::as_i64).sum();
                    Ok(EJson::from(total))
                }),
            )
            .unwrap();

        let result = interface
            .call_method(ctx(), "sum", vec![1.into(), 2.into()])
            .await
            .unwrap();
        assert_eq!(result, EJson::from(3));
    }

    #[tokio::test]
    async fn test_unknown_method_is_404() {
        let interface = DdpInterface::new();
        let err = interface.call_method(ctx(), "nope", vec![]).await.unwrap_err();
        assert_eq!(err, HandlerError::not_found("Method 'nope' not found"));
    }

    #[tokio::test]
    async fn test_random_stream_reaches_handler() {
        let interface = DdpInterface::new();
        interface
            .add_method(
                "new-id",
                method_fn(|mut ctx: MethodContext, _| async move {
                    let Some(random) = ctx.random.as_mut() else {
                        return Err(HandlerError::bad_request("randomSeed required"));
                    };
                    Ok(EJson::from(random.get_stream("/collection/Tasks").id()))
                }),
            )
            .unwrap();

        let mut seeded = ctx();
        seeded.random = Some(RandomStream::new("abc"));
        let id = interface.call_method(seeded, "new-id", vec![]).await.unwrap();
        let expected = RandomStream::new("abc").get_stream("/collection/Tasks").id();
        assert_eq!(id.as_str(), Some(expected.as_str()));

        assert!(interface.call_method(ctx(), "new-id", vec![]).await.is_err());
    }

    #[test]
    fn test_session_tracking() {
        let interface = DdpInterface::new();
        interface.register_session("a");
        interface.register_session("b");
        interface.unregister_session("a");
        assert_eq!(interface.session_count(), 1);
    }
}
