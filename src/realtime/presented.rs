//! # Presented Collection
//!
//! Per-connection reconciliation of documents published by several
//! subscriptions. For every document we remember which fields each
//! subscription asserted, and derive the client view as their union. When
//! two subscriptions assert the same field, the most recent assertion wins.
//!
//! Every operation returns the messages the client needs to move from the old
//! client view to the new one; nothing is sent from here directly.

use std::collections::{BTreeMap, HashMap};

use crate::ddp::{DocumentFields, EJson, ServerMessage};

use super::errors::{RealtimeError, RealtimeResult};

#[derive(Debug, Clone)]
struct Assertion {
    value: EJson,
    seq: u64,
}

#[derive(Debug, Default)]
struct PresentedDocument {
    /// Subscription id → asserted fields
    presented_fields: HashMap<String, BTreeMap<String, Assertion>>,
    client_view: DocumentFields,
}

impl PresentedDocument {
    /// Most recent remaining assertion for a key
    fn winner(&self, key: &str) -> Option<&EJson> {
        self.presented_fields
            .values()
            .filter_map(|fields| fields.get(key))
            .max_by_key(|assertion| assertion.seq)
            .map(|assertion| &assertion.value)
    }

    /// Bring the client view of `key` in line with the remaining assertions,
    /// recording the difference
    fn reconcile_key(&mut self, key: &str, changed: &mut DocumentFields, cleared: &mut Vec<String>) {
        match self.winner(key).cloned() {
            Some(value) => {
                if self.client_view.get(key) != Some(&value) {
                    self.client_view.insert(key.to_string(), value.clone());
                    changed.insert(key.to_string(), value);
                }
            }
            None => {
                if self.client_view.remove(key).is_some() {
                    cleared.push(key.to_string());
                }
            }
        }
    }
}

/// Documents of one collection as presented to one connection
#[derive(Debug)]
pub struct PresentedCollection {
    name: String,
    documents: BTreeMap<String, PresentedDocument>,
    next_seq: u64,
}

impl PresentedCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Current client view of a document
    pub fn client_view(&self, id: &str) -> Option<&DocumentFields> {
        self.documents.get(id).map(|doc| &doc.client_view)
    }

    /// Whether a subscription contributes to a document
    pub fn is_presented_by(&self, sub_id: &str, id: &str) -> bool {
        self.documents
            .get(id)
            .map(|doc| doc.presented_fields.contains_key(sub_id))
            .unwrap_or(false)
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn changed_message(&self, id: &str, fields: DocumentFields, cleared: Vec<String>) -> Vec<ServerMessage> {
        if fields.is_empty() && cleared.is_empty() {
            return Vec::new();
        }
        vec![ServerMessage::changed(&self.name, id, fields, cleared)]
    }

    /// A subscription starts presenting a document
    pub fn added(
        &mut self,
        sub_id: &str,
        id: &str,
        fields: DocumentFields,
    ) -> RealtimeResult<Vec<ServerMessage>> {
        if self.is_presented_by(sub_id, id) {
            return Err(RealtimeError::DuplicateAdded {
                collection: self.name.clone(),
                id: id.to_string(),
                sub_id: sub_id.to_string(),
            });
        }

        let fields: DocumentFields = fields
            .into_iter()
            .filter(|(_, value)| !value.is_undefined())
            .collect();
        let seq = self.bump();
        let asserted: BTreeMap<String, Assertion> = fields
            .iter()
            .map(|(k, v)| (k.clone(), Assertion { value: v.clone(), seq }))
            .collect();

        let Some(doc) = self.documents.get_mut(id) else {
            let mut doc = PresentedDocument::default();
            doc.presented_fields.insert(sub_id.to_string(), asserted);
            doc.client_view = fields.clone();
            self.documents.insert(id.to_string(), doc);
            return Ok(vec![ServerMessage::Added {
                collection: self.name.clone(),
                id: id.to_string(),
                fields: (!fields.is_empty()).then_some(fields),
            }]);
        };

        doc.presented_fields.insert(sub_id.to_string(), asserted);
        let mut changed = DocumentFields::new();
        for (key, value) in fields {
            if doc.client_view.get(&key) != Some(&value) {
                doc.client_view.insert(key.clone(), value.clone());
                changed.insert(key, value);
            }
        }
        Ok(self.changed_message(id, changed, Vec::new()))
    }

    /// A subscription changes (or clears, via `Undefined`) fields it presents
    pub fn changed(
        &mut self,
        sub_id: &str,
        id: &str,
        fields: DocumentFields,
    ) -> RealtimeResult<Vec<ServerMessage>> {
        let seq = self.bump();
        let doc = self.presented_doc_mut(sub_id, id)?;

        let mut changed = DocumentFields::new();
        let mut cleared = Vec::new();
        for (key, value) in fields {
            let own = doc.presented_fields.entry(sub_id.to_string()).or_default();
            if value.is_undefined() {
                if own.remove(&key).is_none() {
                    continue;
                }
                doc.reconcile_key(&key, &mut changed, &mut cleared);
            } else {
                own.insert(key.clone(), Assertion { value: value.clone(), seq });
                if doc.client_view.get(&key) != Some(&value) {
                    doc.client_view.insert(key.clone(), value.clone());
                    changed.insert(key, value);
                }
            }
        }

        Ok(self.changed_message(id, changed, cleared))
    }

    /// A subscription stops presenting a document
    pub fn removed(&mut self, sub_id: &str, id: &str) -> RealtimeResult<Vec<ServerMessage>> {
        let doc = self.presented_doc_mut(sub_id, id)?;
        let retracted = doc.presented_fields.remove(sub_id).unwrap_or_default();

        if doc.presented_fields.is_empty() {
            self.documents.remove(id);
            return Ok(vec![ServerMessage::Removed {
                collection: self.name.clone(),
                id: id.to_string(),
            }]);
        }

        let mut changed = DocumentFields::new();
        let mut cleared = Vec::new();
        for key in retracted.keys() {
            doc.reconcile_key(key, &mut changed, &mut cleared);
        }
        Ok(self.changed_message(id, changed, cleared))
    }

    /// Retract everything a subscription presents in this collection
    pub fn drop_sub(&mut self, sub_id: &str) -> RealtimeResult<Vec<ServerMessage>> {
        let ids: Vec<String> = self
            .documents
            .iter()
            .filter(|(_, doc)| doc.presented_fields.contains_key(sub_id))
            .map(|(id, _)| id.clone())
            .collect();

        let mut messages = Vec::new();
        for id in ids {
            messages.extend(self.removed(sub_id, &id)?);
        }
        Ok(messages)
    }

    fn presented_doc_mut(&mut self, sub_id: &str, id: &str) -> RealtimeResult<&mut PresentedDocument> {
        let doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| RealtimeError::UnknownDocument {
                collection: self.name.clone(),
                id: id.to_string(),
            })?;
        if !doc.presented_fields.contains_key(sub_id) {
            return Err(RealtimeError::NotPresented {
                collection: self.name.clone(),
                id: id.to_string(),
                sub_id: sub_id.to_string(),
            });
        }
        Ok(doc)
    }
}
