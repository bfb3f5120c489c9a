//! Concrete typed values.
//!
//! A [`PropValue`] is the parsed, validated form of a JSON value. Values
//! are plain data: cloning is deep and equality is by content.

use serde_json::{Map, Number, Value};

// =============================================================================
// PropValue
// =============================================================================

/// A concrete value of one of the six schema types.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Object(ObjectValue),
    Array(Vec<PropValue>),
}

impl PropValue {
    /// The JSON-facing name of this value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropValue::Boolean(_) => "boolean",
            PropValue::Integer(_) => "integer",
            PropValue::Number(_) => "number",
            PropValue::String(_) => "string",
            PropValue::Object(_) => "object",
            PropValue::Array(_) => "array",
        }
    }

    /// Serializes the value back to JSON. Object fields are emitted in
    /// schema declaration order, which [`ObjectValue`] preserves.
    pub fn to_json(&self) -> Value {
        match self {
            PropValue::Boolean(b) => Value::Bool(*b),
            PropValue::Integer(i) => Value::Number(Number::from(*i)),
            PropValue::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
            PropValue::String(s) => Value::String(s.clone()),
            PropValue::Object(obj) => obj.to_json(),
            PropValue::Array(items) => Value::Array(items.iter().map(PropValue::to_json).collect()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropValue::Number(n) => Some(*n),
            PropValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            PropValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PropValue]> {
        match self {
            PropValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

// =============================================================================
// ObjectValue
// =============================================================================

/// An object value: field name to [`PropValue`], ordered by the schema
/// that produced it.
///
/// Equality is set equality over the key/value pairs. The insertion
/// order only matters for serialization, where it reproduces the schema
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct ObjectValue {
    entries: Vec<(String, PropValue)>,
}

impl ObjectValue {
    pub fn new() -> Self {
        ObjectValue::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Inserts a field, replacing any existing value under the same name
    /// without disturbing its position.
    pub fn insert(&mut self, name: impl Into<String>, value: PropValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.entries {
            map.insert(key.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl FromIterator<(String, PropValue)> for ObjectValue {
    fn from_iter<T: IntoIterator<Item = (String, PropValue)>>(iter: T) -> Self {
        let mut object = ObjectValue::new();
        for (key, value) in iter {
            object.insert(key, value);
        }
        object
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_equality_ignores_order() {
        let mut a = ObjectValue::new();
        a.insert("x", PropValue::Integer(1));
        a.insert("y", PropValue::Boolean(true));

        let mut b = ObjectValue::new();
        b.insert("y", PropValue::Boolean(true));
        b.insert("x", PropValue::Integer(1));

        assert_eq!(a, b);

        b.insert("x", PropValue::Integer(2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_object_serializes_in_insertion_order() {
        let mut obj = ObjectValue::new();
        obj.insert("zeta", PropValue::Integer(1));
        obj.insert("alpha", PropValue::Integer(2));

        let json = obj.to_json();
        let keys: Vec<&str> = match &json {
            Value::Object(map) => map.keys().map(String::as_str).collect::<Vec<_>>(),
            other => panic!("expected object, got {other}"),
        };
        assert_eq!(keys, ["zeta", "alpha"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut obj = ObjectValue::new();
        obj.insert("a", PropValue::Integer(1));
        obj.insert("b", PropValue::Integer(2));
        obj.insert("a", PropValue::Integer(3));

        assert_eq!(obj.len(), 2);
        assert_eq!(obj.get("a"), Some(&PropValue::Integer(3)));
        assert_eq!(obj.iter().next().map(|(k, _)| k), Some("a"));
    }

    #[test]
    fn test_to_json_round_trips_primitives() {
        assert_eq!(PropValue::Boolean(true).to_json(), json!(true));
        assert_eq!(PropValue::Integer(-7).to_json(), json!(-7));
        assert_eq!(PropValue::Number(2.5).to_json(), json!(2.5));
        assert_eq!(
            PropValue::String("on".to_string()).to_json(),
            json!("on")
        );
        assert_eq!(
            PropValue::Array(vec![PropValue::Integer(1), PropValue::Integer(2)]).to_json(),
            json!([1, 2])
        );
    }
}
