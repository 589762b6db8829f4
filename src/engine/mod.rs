//! # Entity Engine
//!
//! Kubernetes-style entities routed by API group to pluggable storage, with
//! optimistic read-mutate-write on top of a compare-and-set update.
//!
//! ## Architecture
//!
//! - **Types**: entity envelope, metadata, change stream events
//! - **Storage**: the backend contract, plus an in-memory backend
//! - **Engine**: API routing, handles, retrying mutation

pub mod engine;
pub mod errors;
pub mod memory;
pub mod storage;
pub mod types;

pub use engine::{EntityEngine, EntityHandle, MutationOutcome, MUTATION_ATTEMPTS};
pub use errors::{EngineError, EngineResult};
pub use memory::InMemoryEntityStorage;
pub use storage::{EntityStorage, EventStream};
pub use types::{
    api_group, ApiDefinition, Entity, EntityKey, EntityMetadata, KindDefinition, OwnerReference,
    StreamEvent,
};
