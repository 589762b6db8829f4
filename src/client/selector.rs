//! # Selectors and Projections
//!
//! The subset of Mongo-style queries the local cache evaluates: equality on
//! top-level and dot-path fields, and include/exclude field projections.
//! Anything else is rejected when the query is built, never silently
//! mismatched.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::ddp::{DocumentFields, EJson};

use super::errors::{ClientError, ClientResult};

const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    path: Vec<String>,
    expected: EJson,
}

/// Conjunction of equality clauses
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    clauses: Vec<Clause>,
}

impl Selector {
    /// Matches every document
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches the document with this id
    pub fn by_id(id: &str) -> Self {
        Self {
            clauses: vec![Clause {
                path: vec![ID_FIELD.to_string()],
                expected: EJson::String(id.to_string()),
            }],
        }
    }

    /// Build from a JSON selector such as `{"status": "open", "spec.owner": "x"}`
    pub fn from_json(selector: &Value) -> ClientResult<Self> {
        let map = selector.as_object().ok_or_else(|| {
            ClientError::UnsupportedSelector(format!("selector must be an object, got {}", selector))
        })?;

        let mut clauses = Vec::with_capacity(map.len());
        for (field, expected) in map {
            if field.starts_with('$') {
                return Err(ClientError::UnsupportedSelector(format!(
                    "operator {} is not supported",
                    field
                )));
            }
            match expected {
                Value::Object(inner) if inner.keys().any(|k| k.starts_with('$')) => {
                    return Err(ClientError::UnsupportedSelector(format!(
                        "operators on field {} are not supported",
                        field
                    )));
                }
                Value::Object(_) | Value::Array(_) => {
                    return Err(ClientError::UnsupportedSelector(format!(
                        "field {} compares against an object or array",
                        field
                    )));
                }
                _ => {}
            }
            clauses.push(Clause {
                path: field.split('.').map(str::to_string).collect(),
                expected: EJson::from_plain_json(expected.clone()),
            });
        }
        Ok(Self { clauses })
    }

    /// Whether the document `id` with `fields` satisfies every clause
    pub fn matches(&self, id: &str, fields: &DocumentFields) -> bool {
        self.clauses.iter().all(|clause| {
            if clause.path.len() == 1 && clause.path[0] == ID_FIELD {
                return clause.expected.as_str() == Some(id);
            }
            let actual = lookup(fields, &clause.path);
            match (&clause.expected, actual) {
                (EJson::Null, None) | (EJson::Null, Some(EJson::Null)) => true,
                (expected, Some(actual)) => scalar_eq(expected, actual),
                (_, None) => false,
            }
        })
    }
}

fn lookup<'a>(fields: &'a DocumentFields, path: &[String]) -> Option<&'a EJson> {
    let (first, rest) = path.split_first()?;
    let mut current = fields.get(first)?;
    for part in rest {
        current = current.get(part)?;
    }
    Some(current)
}

fn scalar_eq(expected: &EJson, actual: &EJson) -> bool {
    match (expected, actual) {
        (EJson::Number(a), EJson::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => expected == actual,
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
enum ProjectionMode {
    #[default]
    All,
    Include(BTreeSet<String>),
    Exclude(BTreeSet<String>),
}

/// Which fields a query returns
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    mode: ProjectionMode,
    include_id: bool,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            mode: ProjectionMode::All,
            include_id: true,
        }
    }
}

impl Projection {
    /// Build from `{"field": 1, ...}` or `{"field": 0, ...}`
    ///
    /// `_id` is returned unless explicitly excluded, and may be excluded in
    /// either mode. Mixing modes or projecting dotted paths is rejected.
    pub fn from_json(spec: &Value) -> ClientResult<Self> {
        let map = spec.as_object().ok_or_else(|| {
            ClientError::UnsupportedSelector(format!("projection must be an object, got {}", spec))
        })?;

        let mut include_id = true;
        let mut included = BTreeSet::new();
        let mut excluded = BTreeSet::new();
        for (field, flag) in map {
            let keep = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                other => {
                    return Err(ClientError::UnsupportedSelector(format!(
                        "projection value for {} must be 0/1, got {}",
                        field, other
                    )))
                }
            };
            if field == ID_FIELD {
                include_id = keep;
                continue;
            }
            if field.contains('.') || field.starts_with('$') {
                return Err(ClientError::UnsupportedSelector(format!(
                    "projection path {} is not supported",
                    field
                )));
            }
            if keep {
                included.insert(field.clone());
            } else {
                excluded.insert(field.clone());
            }
        }

        let mode = match (included.is_empty(), excluded.is_empty()) {
            (true, true) => ProjectionMode::All,
            (false, true) => ProjectionMode::Include(included),
            (true, false) => ProjectionMode::Exclude(excluded),
            (false, false) => {
                return Err(ClientError::UnsupportedSelector(
                    "projection mixes inclusion and exclusion".to_string(),
                ))
            }
        };
        Ok(Self { mode, include_id })
    }

    /// Project one document, adding `_id` when requested
    pub fn apply(&self, id: &str, fields: &DocumentFields) -> DocumentFields {
        let mut out: DocumentFields = match &self.mode {
            ProjectionMode::All => fields.clone(),
            ProjectionMode::Include(keys) => fields
                .iter()
                .filter(|(key, _)| keys.contains(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            ProjectionMode::Exclude(keys) => fields
                .iter()
                .filter(|(key, _)| !keys.contains(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        if self.include_id {
            out.insert(ID_FIELD.to_string(), EJson::String(id.to_string()));
        }
        out
    }
}

/// Options for `find` and `find_one`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOptions {
    pub fields: Projection,
}

impl FindOptions {
    /// Options with a projection built from JSON
    pub fn with_fields(spec: &Value) -> ClientResult<Self> {
        Ok(Self {
            fields: Projection::from_json(spec)?,
        })
    }

    pub(crate) fn project(&self, id: &str, fields: &DocumentFields) -> DocumentFields {
        self.fields.apply(id, fields)
    }
}
