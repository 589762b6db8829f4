//! # In-Memory Entity Storage
//!
//! Reference backend. Entities live in a `BTreeMap` keyed by identity;
//! observers are unbounded channels notified under the same lock that applies
//! the write, so an observer never misses or reorders an event.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::errors::{EngineError, EngineResult};
use super::storage::{EntityStorage, EventStream};
use super::types::{Entity, EntityKey, StreamEvent};
use crate::signal::StopSignal;

struct Observer {
    api_version: String,
    kind: String,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

#[derive(Default)]
struct MemoryState {
    entities: BTreeMap<EntityKey, Entity>,
    observers: Vec<Observer>,
}

impl MemoryState {
    fn notify(&mut self, event: StreamEvent) {
        let Some(snapshot) = event.snapshot() else {
            return;
        };
        let (api_version, kind) = (snapshot.api_version.clone(), snapshot.kind.clone());
        self.observers.retain(|o| {
            if o.api_version != api_version || o.kind != kind {
                return !o.tx.is_closed();
            }
            o.tx.send(event.clone()).is_ok()
        });
    }
}

/// Entity storage held entirely in memory
#[derive(Default)]
pub struct InMemoryEntityStorage {
    state: RwLock<MemoryState>,
}

impl InMemoryEntityStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live observers
    pub fn observer_count(&self) -> usize {
        self.state
            .read()
            .map(|s| s.observers.iter().filter(|o| !o.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

fn lock_poisoned() -> EngineError {
    EngineError::Storage("Lock poisoned".to_string())
}

#[async_trait]
impl EntityStorage for InMemoryEntityStorage {
    async fn insert_entity(&self, mut entity: Entity) -> EngineResult<Entity> {
        let mut state = self.state.write().map_err(|_| lock_poisoned())?;

        let key = entity.key();
        if state.entities.contains_key(&key) {
            return Err(EngineError::AlreadyExists(key.to_string()));
        }

        entity.metadata.generation = Some(1);
        entity.metadata.uid = Some(Uuid::new_v4().to_string());
        entity.metadata.creation_timestamp = Some(Utc::now());
        entity.metadata.update_timestamp = None;

        debug!(entity = %key, "inserted entity");
        state.entities.insert(key, entity.clone());
        state.notify(StreamEvent::Creation(entity.clone()));
        Ok(entity)
    }

    async fn list_entities(&self, api_version: &str, kind: &str) -> EngineResult<Vec<Entity>> {
        let state = self.state.read().map_err(|_| lock_poisoned())?;
        Ok(state
            .entities
            .values()
            .filter(|e| e.api_version == api_version && e.kind == kind)
            .cloned()
            .collect())
    }

    async fn get_entity(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> EngineResult<Option<Entity>> {
        let state = self.state.read().map_err(|_| lock_poisoned())?;
        Ok(state
            .entities
            .get(&EntityKey::new(api_version, kind, name))
            .cloned())
    }

    async fn update_entity(&self, mut entity: Entity) -> EngineResult<Entity> {
        let mut state = self.state.write().map_err(|_| lock_poisoned())?;

        let key = entity.key();
        let stored = state
            .entities
            .get(&key)
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;

        if stored.metadata.generation != entity.metadata.generation {
            return Err(EngineError::Conflict(key.to_string()));
        }

        entity.metadata.generation = Some(stored.generation() + 1);
        entity.metadata.uid = stored.metadata.uid.clone();
        entity.metadata.creation_timestamp = stored.metadata.creation_timestamp;
        entity.metadata.update_timestamp = Some(Utc::now());

        state.entities.insert(key, entity.clone());
        state.notify(StreamEvent::Mutation(entity.clone()));
        Ok(entity)
    }

    async fn delete_entity(&self, api_version: &str, kind: &str, name: &str) -> EngineResult<bool> {
        let mut state = self.state.write().map_err(|_| lock_poisoned())?;

        match state
            .entities
            .remove(&EntityKey::new(api_version, kind, name))
        {
            Some(removed) => {
                state.notify(StreamEvent::Deletion(removed));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn observe_entities(
        &self,
        api_version: &str,
        kind: &str,
        stop: StopSignal,
    ) -> EngineResult<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        let initial: Vec<StreamEvent> = {
            let mut state = self.state.write().map_err(|_| lock_poisoned())?;
            let mut initial: Vec<StreamEvent> = state
                .entities
                .values()
                .filter(|e| e.api_version == api_version && e.kind == kind)
                .cloned()
                .map(StreamEvent::Creation)
                .collect();
            initial.push(StreamEvent::InSync);

            state.observers.push(Observer {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                tx,
            });
            initial
        };

        let live = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(stream::iter(initial)
            .chain(live)
            .take_until(async move { stop.cancelled().await })
            .boxed())
    }
}
