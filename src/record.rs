use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entity instance in one batch: a bag of attribute values keyed by
/// attribute name. The natural key lives among the attributes; which one it
/// is comes from the entity-type configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(attributes: BTreeMap<String, Value>) -> Self {
        Self { attributes }
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// The natural key rendered as text, or None when it is null/absent.
    pub fn natural_key(&self, key_attribute: &str) -> Option<String> {
        self.get(key_attribute).and_then(value_text)
    }

    /// Missing means absent, JSON null, or an empty/whitespace string.
    pub fn is_missing(&self, attribute: &str) -> bool {
        match self.attributes.get(attribute) {
            None | Some(Value::Null) => true,
            Some(Value::String(text)) => text.trim().is_empty(),
            Some(_) => false,
        }
    }

    pub fn set(&mut self, attribute: &str, value: Value) {
        self.attributes.insert(attribute.to_string(), value);
    }
}

/// Renders scalar values as text for key lookups. Objects and arrays have no
/// key rendering.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Attribute equality for change detection. Absent and null compare equal so
/// a column that was never delivered does not register as a change.
pub fn values_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    let left = left.filter(|value| !value.is_null());
    let right = right.filter(|value| !value.is_null());
    match (left, right) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
