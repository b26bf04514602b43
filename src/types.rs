use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Document identifier — the value of the schema's unique-key field.
pub type DocumentId = String;

/// Reserved field holding the signed 64-bit document version. The absolute
/// value is the monotonically increasing version; a negative value at the
/// log level marks a delete tombstone.
pub const VERSION_FIELD: &str = "_version_";

/// Reserved field addressing the root of a parent/child block.
pub const ROOT_FIELD: &str = "_root_";

/// A document with a unique key and a set of named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub fields: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<FieldValue>),
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Document {
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    /// Parse a [`Document`] from a JSON object, taking the unique key from
    /// `key_field`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::GriddleError::BadRequest`] if the value is not an
    /// object or the key field is missing.
    pub fn from_json(json: &serde_json::Value, key_field: &str) -> crate::Result<Self> {
        use crate::GriddleError;

        let obj = json
            .as_object()
            .ok_or_else(|| GriddleError::BadRequest("expected a JSON object".to_string()))?;

        let id = obj
            .get(key_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                GriddleError::BadRequest(format!("missing unique key field '{}'", key_field))
            })?
            .to_string();

        let mut fields = HashMap::new();
        for (key, val) in obj {
            if key == key_field {
                continue;
            }
            if let Some(fv) = json_value_to_field_value(val) {
                fields.insert(key.clone(), fv);
            }
        }

        Ok(Document { id, fields })
    }

    /// Flat JSON form: `{"<key_field>": id, "field": value, ...}`.
    pub fn to_json(&self, key_field: &str) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            key_field.to_string(),
            serde_json::Value::String(self.id.clone()),
        );
        for (key, fv) in &self.fields {
            map.insert(key.clone(), field_value_to_json_value(fv));
        }
        serde_json::Value::Object(map)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.set_field(name, value);
        self
    }

    /// The signed version carried in `_version_`, if any.
    pub fn version(&self) -> Option<i64> {
        match self.fields.get(VERSION_FIELD) {
            Some(FieldValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_version(&mut self, version: i64) {
        self.fields
            .insert(VERSION_FIELD.to_string(), FieldValue::Integer(version));
    }
}

impl FieldValue {
    /// Textual rendering used by term matching.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Array(_) => String::new(),
        }
    }
}

pub fn json_value_to_field_value(val: &serde_json::Value) -> Option<FieldValue> {
    match val {
        serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else {
                n.as_f64().map(FieldValue::Float)
            }
        }
        serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
        serde_json::Value::Array(arr) => {
            let items: Vec<FieldValue> = arr.iter().filter_map(json_value_to_field_value).collect();
            if items.is_empty() {
                None
            } else {
                Some(FieldValue::Array(items))
            }
        }
        serde_json::Value::Null | serde_json::Value::Object(_) => None,
    }
}

pub fn field_value_to_json_value(fv: &FieldValue) -> serde_json::Value {
    match fv {
        FieldValue::Text(s) => serde_json::Value::String(s.clone()),
        FieldValue::Integer(i) => serde_json::json!(i),
        FieldValue::Float(f) => serde_json::json!(f),
        FieldValue::Bool(b) => serde_json::Value::Bool(*b),
        FieldValue::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(field_value_to_json_value).collect())
        }
    }
}
