//! # Extended JSON
//!
//! JSON with a few extra value types layered on top, so that dates, binary
//! blobs and the field-deletion marker survive a round trip.
//!
//! | Type      | Encoding                        |
//! |-----------|---------------------------------|
//! | Date      | `{"$date": <ms since epoch>}`   |
//! | Binary    | `{"$binary": "<base64>"}`       |
//! | Undefined | `{"$undefined": true}`          |
//!
//! A plain object whose shape collides with one of those tags is wrapped as
//! `{"$escape": {...}}` when encoded.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use super::errors::{DdpError, DdpResult};

/// Top-level fields of a document, keyed by field name
pub type DocumentFields = BTreeMap<String, EJson>;

const TAG_DATE: &str = "$date";
const TAG_BINARY: &str = "$binary";
const TAG_UNDEFINED: &str = "$undefined";
const TAG_ESCAPE: &str = "$escape";

const RESERVED_TAGS: [&str; 4] = [TAG_DATE, TAG_BINARY, TAG_UNDEFINED, TAG_ESCAPE];

/// An extended JSON value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EJson {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<EJson>),
    Object(BTreeMap<String, EJson>),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
    /// Field-deletion marker. Inside `changed` fields it means "clear this key".
    Undefined,
}

impl EJson {
    /// Encode into its JSON wire form
    pub fn to_json(&self) -> Value {
        match self {
            EJson::Null => Value::Null,
            EJson::Bool(b) => Value::Bool(*b),
            EJson::Number(n) => Value::Number(n.clone()),
            EJson::String(s) => Value::String(s.clone()),
            EJson::Array(items) => Value::Array(items.iter().map(EJson::to_json).collect()),
            EJson::Object(map) => {
                let inner: Map<String, Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                if collides_with_tag(map) {
                    tagged(TAG_ESCAPE, Value::Object(inner))
                } else {
                    Value::Object(inner)
                }
            }
            EJson::Date(date) => tagged(TAG_DATE, Value::from(date.timestamp_millis())),
            EJson::Binary(bytes) => tagged(TAG_BINARY, Value::String(STANDARD.encode(bytes))),
            EJson::Undefined => tagged(TAG_UNDEFINED, Value::Bool(true)),
        }
    }

    /// Decode from the JSON wire form, interpreting the reserved tags
    pub fn from_json(value: Value) -> DdpResult<Self> {
        Ok(match value {
            Value::Null => EJson::Null,
            Value::Bool(b) => EJson::Bool(b),
            Value::Number(n) => EJson::Number(n),
            Value::String(s) => EJson::String(s),
            Value::Array(items) => EJson::Array(
                items
                    .into_iter()
                    .map(EJson::from_json)
                    .collect::<DdpResult<Vec<_>>>()?,
            ),
            Value::Object(map) => Self::object_from_json(map)?,
        })
    }

    /// Convert plain JSON without interpreting any tags
    pub fn from_plain_json(value: Value) -> Self {
        match value {
            Value::Null => EJson::Null,
            Value::Bool(b) => EJson::Bool(b),
            Value::Number(n) => EJson::Number(n),
            Value::String(s) => EJson::String(s),
            Value::Array(items) => {
                EJson::Array(items.into_iter().map(EJson::from_plain_json).collect())
            }
            Value::Object(map) => EJson::Object(
                map.into_iter()
                    .map(|(k, v)| (k, EJson::from_plain_json(v)))
                    .collect(),
            ),
        }
    }

    fn object_from_json(map: Map<String, Value>) -> DdpResult<Self> {
        if map.len() == 1 {
            if let Some((key, inner)) = map.iter().next() {
                match key.as_str() {
                    TAG_DATE => return Self::date_from_json(inner),
                    TAG_BINARY => {
                        let encoded = inner.as_str().ok_or_else(|| {
                            DdpError::InvalidEJson("$binary must be a string".into())
                        })?;
                        let bytes = STANDARD
                            .decode(encoded)
                            .map_err(|e| DdpError::InvalidEJson(format!("bad $binary: {}", e)))?;
                        return Ok(EJson::Binary(bytes));
                    }
                    TAG_UNDEFINED => return Ok(EJson::Undefined),
                    TAG_ESCAPE => {
                        let Value::Object(escaped) = inner.clone() else {
                            return Err(DdpError::InvalidEJson("$escape must wrap an object".into()));
                        };
                        let mut out = BTreeMap::new();
                        for (k, v) in escaped {
                            out.insert(k, EJson::from_json(v)?);
                        }
                        return Ok(EJson::Object(out));
                    }
                    _ => {}
                }
            }
        }

        let mut out = BTreeMap::new();
        for (k, v) in map {
            out.insert(k, EJson::from_json(v)?);
        }
        Ok(EJson::Object(out))
    }

    fn date_from_json(inner: &Value) -> DdpResult<Self> {
        let millis = inner
            .as_i64()
            .or_else(|| inner.as_f64().map(|f| f as i64))
            .ok_or_else(|| DdpError::InvalidEJson("$date must be a number".into()))?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(EJson::Date)
            .ok_or_else(|| DdpError::InvalidEJson(format!("$date out of range: {}", millis)))
    }

    /// Whether this is the field-deletion marker
    pub fn is_undefined(&self) -> bool {
        matches!(self, EJson::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EJson::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EJson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EJson::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EJson::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EJson::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, EJson>> {
        match self {
            EJson::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key if this is an object
    pub fn get(&self, key: &str) -> Option<&EJson> {
        self.as_object().and_then(|map| map.get(key))
    }
}

fn tagged(tag: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(tag.to_string(), value);
    Value::Object(map)
}

fn collides_with_tag(map: &BTreeMap<String, EJson>) -> bool {
    map.len() == 1
        && map
            .keys()
            .next()
            .map(|k| RESERVED_TAGS.contains(&k.as_str()))
            .unwrap_or(false)
}

/// Decode a JSON object into document fields
pub fn fields_from_json(value: Value) -> DdpResult<DocumentFields> {
    match EJson::from_json(value)? {
        EJson::Object(map) => Ok(map),
        other => Err(DdpError::InvalidEJson(format!(
            "document fields must be an object, got {}",
            other
        ))),
    }
}

impl Serialize for EJson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EJson {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        EJson::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for EJson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for EJson {
    fn from(b: bool) -> Self {
        EJson::Bool(b)
    }
}

impl From<i64> for EJson {
    fn from(n: i64) -> Self {
        EJson::Number(n.into())
    }
}

impl From<i32> for EJson {
    fn from(n: i32) -> Self {
        EJson::Number(n.into())
    }
}

impl From<u64> for EJson {
    fn from(n: u64) -> Self {
        EJson::Number(n.into())
    }
}

impl From<f64> for EJson {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(EJson::Number).unwrap_or(EJson::Null)
    }
}

impl From<&str> for EJson {
    fn from(s: &str) -> Self {
        EJson::String(s.to_string())
    }
}

impl From<String> for EJson {
    fn from(s: String) -> Self {
        EJson::String(s)
    }
}

impl From<DateTime<Utc>> for EJson {
    fn from(date: DateTime<Utc>) -> Self {
        EJson::Date(date)
    }
}

impl From<Vec<EJson>> for EJson {
    fn from(items: Vec<EJson>) -> Self {
        EJson::Array(items)
    }
}

impl From<DocumentFields> for EJson {
    fn from(map: DocumentFields) -> Self {
        EJson::Object(map)
    }
}
