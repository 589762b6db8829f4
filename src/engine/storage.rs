//! # Entity Storage Contract
//!
//! Backends implement `EntityStorage`; the engine routes to one backend per
//! API group.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::errors::EngineResult;
use super::types::{Entity, StreamEvent};
use crate::signal::StopSignal;

/// Change stream returned by `observe_entities`
pub type EventStream<T = Entity> = BoxStream<'static, StreamEvent<T>>;

/// Storage backend for one or more API groups
#[async_trait]
pub trait EntityStorage: Send + Sync {
    /// Insert a new entity. Sets generation 1, a uid and the creation
    /// timestamp. Fails with `AlreadyExists` for a taken name.
    async fn insert_entity(&self, entity: Entity) -> EngineResult<Entity>;

    async fn list_entities(&self, api_version: &str, kind: &str) -> EngineResult<Vec<Entity>>;

    async fn get_entity(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> EngineResult<Option<Entity>>;

    /// Compare-and-set on `metadata.generation`: applies only when the stored
    /// generation equals the one on `entity`, then bumps it. A mismatch is
    /// `Conflict`, an absent entity `NotFound`.
    async fn update_entity(&self, entity: Entity) -> EngineResult<Entity>;

    /// Returns false when nothing was deleted
    async fn delete_entity(&self, api_version: &str, kind: &str, name: &str) -> EngineResult<bool>;

    /// One `Creation` per existing entity, `InSync`, then live events until
    /// `stop` fires
    fn observe_entities(
        &self,
        api_version: &str,
        kind: &str,
        stop: StopSignal,
    ) -> EngineResult<EventStream>;
}
