//! # Local Collections
//!
//! Client-side copies of server collections, built only from the document
//! messages the server sends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::ddp::{DocumentFields, ServerMessage};

use super::errors::{ClientError, ClientResult};
use super::selector::{FindOptions, Selector};

/// Documents of one collection, keyed by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalCollection {
    documents: BTreeMap<String, DocumentFields>,
}

impl LocalCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a document message. Returns false for messages that carry no
    /// document change.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::Added { id, fields, .. }
            | ServerMessage::AddedBefore { id, fields, .. } => {
                let fields = fields
                    .as_ref()
                    .map(|fields| {
                        fields
                            .iter()
                            .filter(|(_, value)| !value.is_undefined())
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                self.documents.insert(id.clone(), fields);
                true
            }
            ServerMessage::Changed {
                id, fields, cleared, ..
            } => {
                let document = self.documents.entry(id.clone()).or_default();
                for (key, value) in fields.iter().flatten() {
                    if value.is_undefined() {
                        document.remove(key);
                    } else {
                        document.insert(key.clone(), value.clone());
                    }
                }
                for key in cleared.iter().flatten() {
                    document.remove(key);
                }
                true
            }
            ServerMessage::Removed { id, .. } => {
                self.documents.remove(id);
                true
            }
            // No ordered cursors, so ordering hints carry nothing
            ServerMessage::MovedBefore { .. } => false,
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&DocumentFields> {
        self.documents.get(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// All documents in id order
    pub fn documents(&self) -> &BTreeMap<String, DocumentFields> {
        &self.documents
    }

    /// Matching documents with `_id` and projection applied
    pub fn find(&self, selector: &Selector, options: &FindOptions) -> Vec<DocumentFields> {
        self.documents
            .iter()
            .filter(|(id, fields)| selector.matches(id, fields))
            .map(|(id, fields)| options.project(id, fields))
            .collect()
    }
}

/// Shared table of local collections owned by a client
pub(crate) type CollectionTable = Arc<Mutex<BTreeMap<String, LocalCollection>>>;

/// Query handle for one named collection of a client
#[derive(Clone)]
pub struct CollectionHandle {
    name: String,
    table: CollectionTable,
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle").field("name", &self.name).finish()
    }
}

impl CollectionHandle {
    pub(crate) fn new(name: &str, table: CollectionTable) -> Self {
        Self {
            name: name.to_string(),
            table,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn with<R>(&self, f: impl FnOnce(Option<&LocalCollection>) -> R) -> ClientResult<R> {
        let table = self
            .table
            .lock()
            .map_err(|_| ClientError::Protocol("Lock poisoned".to_string()))?;
        Ok(f(table.get(&self.name)))
    }

    /// Fields of one document, without `_id`
    pub fn get(&self, id: &str) -> ClientResult<Option<DocumentFields>> {
        self.with(|collection| collection.and_then(|c| c.get(id).cloned()))
    }

    /// Copy of every document, keyed by id
    pub fn snapshot(&self) -> ClientResult<BTreeMap<String, DocumentFields>> {
        self.with(|collection| collection.map(|c| c.documents().clone()).unwrap_or_default())
    }

    pub fn len(&self) -> ClientResult<usize> {
        self.with(|collection| collection.map(LocalCollection::len).unwrap_or(0))
    }

    pub fn find(&self, selector: &Selector, options: &FindOptions) -> ClientResult<Vec<DocumentFields>> {
        self.with(|collection| {
            collection
                .map(|c| c.find(selector, options))
                .unwrap_or_default()
        })
    }

    pub fn find_one(&self, selector: &Selector, options: &FindOptions) -> ClientResult<Option<DocumentFields>> {
        Ok(self.find(selector, options)?.into_iter().next())
    }
}
