//! Ordered field-name-to-type mappings.

use serde_json::Value;

use crate::error::{errors, Error, Result};
use crate::schema::prop_type::{type_mismatch, PropType};
use crate::schema::ObjectValue;

// =============================================================================
// ObjectSchema
// =============================================================================

/// The schema of an object: an ordered mapping from field name to
/// [`PropType`], plus whether fields outside the mapping are tolerated.
///
/// Created once when a command or state definition is loaded and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectSchema {
    props: Vec<(String, PropType)>,
    extra_properties_allowed: bool,
}

impl ObjectSchema {
    pub fn new() -> Self {
        ObjectSchema::default()
    }

    /// Parses `{"<field>": <type-spec>, ...}` in declaration order.
    pub fn from_json(json: &Value, extra_properties_allowed: bool) -> Result<ObjectSchema> {
        let map = json
            .as_object()
            .ok_or_else(|| type_mismatch(json, "object"))?;
        let mut props = Vec::with_capacity(map.len());
        for (name, spec) in map {
            let prop_type = PropType::from_json(spec).map_err(|e| {
                e.wrap(
                    errors::commands::DOMAIN,
                    errors::commands::INVALID_PARAMETER_VALUE,
                    format!("error in definition of property '{name}'"),
                )
            })?;
            props.push((name.clone(), prop_type));
        }
        Ok(ObjectSchema {
            props,
            extra_properties_allowed,
        })
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PropType> {
        self.props
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, prop_type)| prop_type)
    }

    /// Iterates fields in declaration order.
    pub fn props(&self) -> impl Iterator<Item = (&str, &PropType)> {
        self.props
            .iter()
            .map(|(name, prop_type)| (name.as_str(), prop_type))
    }

    pub fn extra_properties_allowed(&self) -> bool {
        self.extra_properties_allowed
    }

    // =========================================================================
    // Parsing and Validation
    // =========================================================================

    /// Structurally parses a JSON object against this schema:
    /// - declared field present in JSON: parsed recursively
    /// - declared field absent with a default: the default is cloned in
    /// - declared field absent without a default: `parameter_missing`
    /// - JSON field not declared: `unknown_property` unless extras are
    ///   allowed, in which case it is dropped
    pub(crate) fn parse_object(&self, map: &serde_json::Map<String, Value>) -> Result<ObjectValue> {
        let mut object = ObjectValue::new();
        for (name, prop_type) in self.props() {
            if let Some(field) = map.get(name) {
                object.insert(name, prop_type.parse_json(field)?);
            } else if let Some(default) = prop_type.default_value() {
                object.insert(name, default);
            } else {
                return Err(Error::new(
                    errors::commands::DOMAIN,
                    errors::commands::PARAMETER_MISSING,
                    format!("required parameter missing: {name}"),
                ));
            }
        }

        if !self.extra_properties_allowed {
            for key in map.keys() {
                if self.get(key).is_none() {
                    return Err(Error::new(
                        errors::commands::DOMAIN,
                        errors::commands::UNKNOWN_PROPERTY,
                        format!("unrecognized parameter '{key}'"),
                    ));
                }
            }
        }
        Ok(object)
    }

    /// Runs the constraint pass over every field of a parsed object.
    /// Failures are wrapped in `commands/invalid_parameter_value` naming
    /// the offending field.
    pub(crate) fn validate_object(&self, object: &ObjectValue) -> Result<()> {
        for (name, value) in object.iter() {
            if let Some(prop_type) = self.get(name) {
                prop_type.validate(value).map_err(|e| {
                    e.wrap(
                        errors::commands::DOMAIN,
                        errors::commands::INVALID_PARAMETER_VALUE,
                        format!("Invalid value for parameter '{name}'"),
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Parses and validates a JSON object value in one call.
    pub fn object_from_json(&self, json: &Value) -> Result<ObjectValue> {
        let map = json
            .as_object()
            .ok_or_else(|| type_mismatch(json, "object"))?;
        let object = self.parse_object(map)?;
        self.validate_object(&object)?;
        Ok(object)
    }

    /// Serializes an object value in schema declaration order. Fields
    /// not covered by the schema keep their own order at the end.
    pub fn object_to_json(&self, object: &ObjectValue) -> Value {
        let mut map = serde_json::Map::new();
        for (name, _) in self.props() {
            if let Some(value) = object.get(name) {
                map.insert(name.to_string(), value.to_json());
            }
        }
        for (name, value) in object.iter() {
            if !map.contains_key(name) {
                map.insert(name.to_string(), value.to_json());
            }
        }
        Value::Object(map)
    }

    /// True if every field this schema shares with `base` is a
    /// narrower-or-equal refinement, and no relaxation of the extra
    /// property policy sneaks in.
    pub fn is_refinement_of(&self, base: &ObjectSchema) -> bool {
        if self.extra_properties_allowed && !base.extra_properties_allowed {
            return false;
        }
        base.props().all(|(name, base_type)| match self.get(name) {
            Some(derived_type) => derived_type.is_refinement_of(base_type),
            // Absent in the derived schema means the base field is
            // inherited unchanged.
            None => true,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errors;
    use crate::schema::PropValue;
    use serde_json::json;

    fn led_schema() -> ObjectSchema {
        ObjectSchema::from_json(
            &json!({
                "_led": {"minimum": 1, "maximum": 3},
                "_on": "boolean"
            }),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_valid_object() {
        let object = led_schema()
            .object_from_json(&json!({"_led": 2, "_on": true}))
            .unwrap();
        assert_eq!(object.get("_led"), Some(&PropValue::Integer(2)));
        assert_eq!(object.get("_on"), Some(&PropValue::Boolean(true)));
    }

    #[test]
    fn test_missing_parameter() {
        let err = led_schema()
            .object_from_json(&json!({"_led": 2}))
            .unwrap_err();
        assert_eq!(err.code(), errors::commands::PARAMETER_MISSING);
        assert!(err.message().contains("_on"));
    }

    #[test]
    fn test_missing_parameter_with_default_is_filled() {
        let schema = ObjectSchema::from_json(
            &json!({"_led": {"minimum": 1, "maximum": 3, "default": 1}, "_on": "boolean"}),
            false,
        )
        .unwrap();
        let object = schema.object_from_json(&json!({"_on": false})).unwrap();
        assert_eq!(object.get("_led"), Some(&PropValue::Integer(1)));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let err = led_schema()
            .object_from_json(&json!({"_led": 2, "_on": true, "_color": "red"}))
            .unwrap_err();
        assert_eq!(err.code(), errors::commands::UNKNOWN_PROPERTY);
        assert!(err.message().contains("_color"));
    }

    #[test]
    fn test_unknown_property_tolerated_when_extras_allowed() {
        let schema = ObjectSchema::from_json(&json!({"_on": "boolean"}), true).unwrap();
        let object = schema
            .object_from_json(&json!({"_on": true, "note": "ignored"}))
            .unwrap();
        assert_eq!(object.len(), 1);
    }

    #[test]
    fn test_constraint_violation_wraps_out_of_range() {
        let err = led_schema()
            .object_from_json(&json!({"_led": 5, "_on": true}))
            .unwrap_err();
        assert_eq!(err.code(), errors::commands::INVALID_PARAMETER_VALUE);
        assert!(err.message().contains("_led"));
        assert_eq!(
            err.inner().map(|e| e.code()),
            Some(errors::commands::OUT_OF_RANGE)
        );
    }

    #[test]
    fn test_serialization_uses_declaration_order() {
        let schema = ObjectSchema::from_json(
            &json!({"zeta": "integer", "alpha": "integer"}),
            false,
        )
        .unwrap();
        let object = schema
            .object_from_json(&json!({"alpha": 2, "zeta": 1}))
            .unwrap();
        let emitted = schema.object_to_json(&object);
        assert_eq!(emitted, json!({"zeta": 1, "alpha": 2}));
        let keys: Vec<&str> = emitted
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }

    #[test]
    fn test_object_refinement_checks_shared_fields() {
        let base = led_schema();
        let narrower = ObjectSchema::from_json(
            &json!({"_led": {"minimum": 2, "maximum": 3}, "_on": "boolean"}),
            false,
        )
        .unwrap();
        let wider = ObjectSchema::from_json(
            &json!({"_led": {"minimum": 0, "maximum": 9}, "_on": "boolean"}),
            false,
        )
        .unwrap();

        assert!(narrower.is_refinement_of(&base));
        assert!(!wider.is_refinement_of(&base));
    }
}
