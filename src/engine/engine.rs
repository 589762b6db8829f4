//! # Entity Engine
//!
//! Routes entity operations to the storage registered for the entity's API
//! group, and layers optimistic mutation on top of the storage's
//! compare-and-set update.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::errors::{EngineError, EngineResult};
use super::storage::{EntityStorage, EventStream};
use super::types::{api_group, ApiDefinition, Entity, EntityKey, KindDefinition};
use crate::signal::StopSignal;

/// Total attempts of read, mutate, conditional update
pub const MUTATION_ATTEMPTS: usize = 4;

/// What a mutation callback decided
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Write this version of the entity
    Apply(Entity),
    /// Leave the entity alone
    NoOp,
}

struct ApiRegistration {
    storage: Arc<dyn EntityStorage>,
    definition: ApiDefinition,
}

/// Entity engine
pub struct EntityEngine {
    apis: RwLock<HashMap<String, ApiRegistration>>,
}

impl EntityEngine {
    pub fn new() -> Self {
        Self {
            apis: RwLock::new(HashMap::new()),
        }
    }

    /// Register the storage serving an API group
    pub fn add_api(
        &self,
        name: &str,
        storage: Arc<dyn EntityStorage>,
        definition: ApiDefinition,
    ) -> EngineResult<()> {
        let mut apis = self
            .apis
            .write()
            .map_err(|_| EngineError::Internal("Lock poisoned".to_string()))?;

        if apis.contains_key(name) {
            return Err(EngineError::ApiAlreadyExists(name.to_string()));
        }

        debug!(api = name, kinds = definition.kinds.len(), "registered API");
        apis.insert(name.to_string(), ApiRegistration { storage, definition });
        Ok(())
    }

    /// Registered API group names, sorted
    pub fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .apis
            .read()
            .map(|apis| apis.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Definition of a kind, if its API declared one
    pub fn kind_definition(&self, api_version: &str, kind: &str) -> Option<KindDefinition> {
        let apis = self.apis.read().ok()?;
        apis.get(api_group(api_version))?
            .definition
            .kinds
            .get(kind)
            .cloned()
    }

    fn route(&self, api_version: &str, kind: &str) -> EngineResult<Arc<dyn EntityStorage>> {
        let apis = self
            .apis
            .read()
            .map_err(|_| EngineError::Internal("Lock poisoned".to_string()))?;

        let group = api_group(api_version);
        let registration = apis
            .get(group)
            .ok_or_else(|| EngineError::NoSuchApi(group.to_string()))?;

        if !registration.definition.kinds.contains_key(kind) {
            warn!(api_version, kind, "lacking definition for kind");
        }
        Ok(Arc::clone(&registration.storage))
    }

    pub async fn insert_entity(self: &Arc<Self>, entity: Entity) -> EngineResult<EntityHandle> {
        let storage = self.route(&entity.api_version, &entity.kind)?;
        let stored = storage.insert_entity(entity).await?;
        let mut handle = self.get_entity_handle(&stored.api_version, &stored.kind, stored.name());
        handle.snapshot = Some(stored);
        Ok(handle)
    }

    pub async fn list_entities(&self, api_version: &str, kind: &str) -> EngineResult<Vec<Entity>> {
        self.route(api_version, kind)?
            .list_entities(api_version, kind)
            .await
    }

    /// Handles for every entity of a kind, each carrying its snapshot
    pub async fn list_entity_handles(
        self: &Arc<Self>,
        api_version: &str,
        kind: &str,
    ) -> EngineResult<Vec<EntityHandle>> {
        let entities = self.list_entities(api_version, kind).await?;
        Ok(entities
            .into_iter()
            .map(|snapshot| {
                let mut handle = self.get_entity_handle(api_version, kind, snapshot.name());
                handle.snapshot = Some(snapshot);
                handle
            })
            .collect())
    }

    pub async fn get_entity(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> EngineResult<Option<Entity>> {
        self.route(api_version, kind)?
            .get_entity(api_version, kind, name)
            .await
    }

    pub fn get_entity_handle(self: &Arc<Self>, api_version: &str, kind: &str, name: &str) -> EntityHandle {
        EntityHandle {
            engine: Arc::clone(self),
            key: EntityKey::new(api_version, kind, name),
            snapshot: None,
        }
    }

    /// Conditional update; `Conflict` when the generation moved on
    pub async fn update_entity(&self, entity: Entity) -> EngineResult<Entity> {
        self.route(&entity.api_version, &entity.kind)?
            .update_entity(entity)
            .await
    }

    pub async fn delete_entity(&self, api_version: &str, kind: &str, name: &str) -> EngineResult<bool> {
        self.route(api_version, kind)?
            .delete_entity(api_version, kind, name)
            .await
    }

    pub fn observe_entities(
        &self,
        api_version: &str,
        kind: &str,
        stop: StopSignal,
    ) -> EngineResult<EventStream> {
        self.route(api_version, kind)?
            .observe_entities(api_version, kind, stop)
    }

    /// Read, mutate and conditionally write an entity, retrying on conflict
    ///
    /// Returns the written entity, or `None` when the callback chose `NoOp`.
    pub async fn mutate_entity<M>(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        mutation: M,
    ) -> EngineResult<Option<Entity>>
    where
        M: FnMut(Entity) -> MutationOutcome + Send,
    {
        self.run_mutation(api_version, kind, name, mutation, None::<fn() -> Entity>)
            .await
    }

    /// Like `mutate_entity`, but inserts `creation()` when the entity is absent
    pub async fn mutate_or_create_entity<M, C>(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        mutation: M,
        creation: C,
    ) -> EngineResult<Option<Entity>>
    where
        M: FnMut(Entity) -> MutationOutcome + Send,
        C: FnOnce() -> Entity + Send,
    {
        self.run_mutation(api_version, kind, name, mutation, Some(creation))
            .await
    }

    async fn run_mutation<M, C>(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        mut mutation: M,
        creation: Option<C>,
    ) -> EngineResult<Option<Entity>>
    where
        M: FnMut(Entity) -> MutationOutcome + Send,
        C: FnOnce() -> Entity + Send,
    {
        let storage = self.route(api_version, kind)?;
        let key = EntityKey::new(api_version, kind, name);

        let Some(mut current) = storage.get_entity(api_version, kind, name).await? else {
            return match creation {
                Some(create) => storage.insert_entity(create()).await.map(Some),
                None => Err(EngineError::NotFound(key.to_string())),
            };
        };

        for attempt in 0..MUTATION_ATTEMPTS {
            if attempt > 0 {
                warn!(entity = %key, attempt, "retrying mutation");
                current = storage
                    .get_entity(api_version, kind, name)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
            }

            let generation = current.metadata.generation;
            let mut next = match mutation(current.clone()) {
                MutationOutcome::NoOp => return Ok(None),
                MutationOutcome::Apply(next) => next,
            };
            if next.key() != key {
                return Err(EngineError::Internal(format!(
                    "mutation of {} changed its identity to {}",
                    key,
                    next.key()
                )));
            }
            next.metadata.generation = generation;

            match storage.update_entity(next).await {
                Ok(written) => return Ok(Some(written)),
                Err(EngineError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::RetriesExhausted(key.to_string()))
    }
}

impl Default for EntityEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinates of one entity bound to an engine
#[derive(Clone)]
pub struct EntityHandle {
    engine: Arc<EntityEngine>,
    key: EntityKey,
    /// Last known version, when the handle came from a read
    pub snapshot: Option<Entity>,
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("key", &self.key)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl EntityHandle {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn api_version(&self) -> &str {
        &self.key.api_version
    }

    pub fn kind(&self) -> &str {
        &self.key.kind
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub async fn get(&self) -> EngineResult<Option<Entity>> {
        self.engine
            .get_entity(&self.key.api_version, &self.key.kind, &self.key.name)
            .await
    }

    /// Insert `entity` at these coordinates, overriding its identity
    pub async fn insert(&self, mut entity: Entity) -> EngineResult<Entity> {
        entity.api_version = self.key.api_version.clone();
        entity.kind = self.key.kind.clone();
        entity.metadata.name = self.key.name.clone();
        let handle = self.engine.insert_entity(entity).await?;
        handle
            .snapshot
            .ok_or_else(|| EngineError::Internal("insert returned no snapshot".to_string()))
    }

    pub async fn mutate<M>(&self, mutation: M) -> EngineResult<Option<Entity>>
    where
        M: FnMut(Entity) -> MutationOutcome + Send,
    {
        self.engine
            .mutate_entity(&self.key.api_version, &self.key.kind, &self.key.name, mutation)
            .await
    }

    pub async fn delete(&self) -> EngineResult<bool> {
        self.engine
            .delete_entity(&self.key.api_version, &self.key.kind, &self.key.name)
            .await
    }

    /// Handle to another entity in the same engine
    pub fn neighbor(&self, api_version: &str, kind: &str, name: &str) -> EntityHandle {
        self.engine.get_entity_handle(api_version, kind, name)
    }

    pub async fn insert_neighbor(&self, entity: Entity) -> EngineResult<EntityHandle> {
        self.engine.insert_entity(entity).await
    }

    /// Handle to the owner of the given API version and kind, if referenced
    pub async fn follow_owner_reference(
        &self,
        api_version: &str,
        kind: &str,
    ) -> EngineResult<Option<EntityHandle>> {
        let Some(snapshot) = self.get().await? else {
            return Ok(None);
        };
        Ok(snapshot
            .owner_reference(api_version, kind)
            .map(|owner| self.neighbor(api_version, kind, &owner.name)))
    }
}
