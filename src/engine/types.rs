//! # Entity Types
//!
//! Entities are Kubernetes-style objects: `apiVersion`, `kind`, a `metadata`
//! block, and an arbitrary body. They are identified by
//! `(apiVersion, kind, metadata.name)`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ddp::{DocumentFields, EJson};

/// Reference from an entity to the entity that owns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// Entity metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub name: String,

    /// Optimistic-concurrency counter, set to 1 on insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A stored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub api_version: String,
    pub kind: String,
    pub metadata: EntityMetadata,

    /// Everything besides the envelope (`spec`, `status`, ...)
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Entity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: EntityMetadata {
                name: name.into(),
                ..Default::default()
            },
            body: Map::new(),
        }
    }

    /// Set a top-level body field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn generation(&self) -> u64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// API group part of `apiVersion` (`group/version`)
    pub fn api_group(&self) -> &str {
        api_group(&self.api_version)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.api_version, &self.kind, &self.metadata.name)
    }

    /// Owner reference matching an API version and kind
    pub fn owner_reference(&self, api_version: &str, kind: &str) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .iter()
            .find(|r| r.api_version == api_version && r.kind == kind)
    }

    /// Entity as JSON
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Entity as document fields, without interpreting extended JSON tags
    pub fn to_fields(&self) -> DocumentFields {
        match EJson::from_plain_json(self.to_json()) {
            EJson::Object(map) => map,
            _ => DocumentFields::new(),
        }
    }
}

/// Split the group from `group/version`
pub fn api_group(api_version: &str) -> &str {
    api_version.split('/').next().unwrap_or(api_version)
}

/// Identity of an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl EntityKey {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
    }
}

/// Change stream event for observed entities
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T = Entity> {
    Creation(T),
    Mutation(T),
    Deletion(T),
    InSync,
    LostSync,
    Bookmark,
    Error(String),
}

impl<T> StreamEvent<T> {
    pub fn snapshot(&self) -> Option<&T> {
        match self {
            StreamEvent::Creation(s) | StreamEvent::Mutation(s) | StreamEvent::Deletion(s) => Some(s),
            _ => None,
        }
    }
}

/// Schema-level description of one kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindDefinition {
    pub kind: String,
    pub plural: String,
    pub singular: String,
    #[serde(default)]
    pub short_names: Vec<String>,
    /// Served version names
    #[serde(default)]
    pub versions: Vec<String>,
}

impl KindDefinition {
    pub fn new(kind: &str) -> Self {
        let singular = kind.to_lowercase();
        Self {
            kind: kind.to_string(),
            plural: format!("{}s", singular),
            singular,
            short_names: Vec::new(),
            versions: Vec::new(),
        }
    }
}

/// Kinds served by one API group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub name: String,
    #[serde(default)]
    pub kinds: BTreeMap<String, KindDefinition>,
}

impl ApiDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kinds: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, definition: KindDefinition) -> Self {
        self.kinds.insert(definition.kind.clone(), definition);
        self
    }
}
