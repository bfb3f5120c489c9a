//! Immutable type descriptors.
//!
//! A [`PropType`] is parsed once from schema JSON and never mutated. It
//! knows how to parse a JSON value into a [`PropValue`], validate the
//! result against its constraints, and report whether another type is a
//! narrower-or-equal refinement of itself.
//!
//! ## Accepted Schema Forms
//! ```text
//! "integer"                                  short form, no constraints
//! {"items": <type-spec>}                     homogeneous array
//! {"properties": {...},
//!  "additionalProperties": bool}             object
//! {"minimum": 1, "maximum": 3}               shorthand: inferred primitive
//! {"minLength": 1, "maxLength": 8}           shorthand: string
//! {"enum": [1, 2, 3]}                        shorthand: inferred from items
//! [1, 2, 3]                                  bare enum list
//! ```

use serde_json::Value;

use crate::error::{errors, Error, Result};
use crate::schema::{ObjectSchema, ObjectValue, PropValue};

// =============================================================================
// PropType
// =============================================================================

/// The tagged sum of all schema types.
#[derive(Debug, Clone, PartialEq)]
pub enum PropType {
    Boolean(BooleanType),
    Integer(IntegerType),
    Number(NumberType),
    String(StringType),
    Object(ObjectType),
    Array(ArrayType),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BooleanType {
    pub default: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntegerType {
    pub minimum: Option<i64>,
    pub maximum: Option<i64>,
    pub one_of: Option<Vec<i64>>,
    pub default: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NumberType {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub one_of: Option<Vec<f64>>,
    pub default: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StringType {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub one_of: Option<Vec<String>>,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectType {
    pub schema: ObjectSchema,
    pub default: Option<ObjectValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    pub items: Box<PropType>,
    pub default: Option<Vec<PropValue>>,
}

impl PropType {
    /// The JSON-facing name of this type.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropType::Boolean(_) => "boolean",
            PropType::Integer(_) => "integer",
            PropType::Number(_) => "number",
            PropType::String(_) => "string",
            PropType::Object(_) => "object",
            PropType::Array(_) => "array",
        }
    }

    // =========================================================================
    // Schema Parsing
    // =========================================================================

    /// Parses a type specification from schema JSON.
    pub fn from_json(spec: &Value) -> Result<PropType> {
        match spec {
            Value::String(name) => PropType::from_type_name(name),
            Value::Array(_) => {
                // Bare list is shorthand for an enum constraint.
                let mut map = serde_json::Map::new();
                map.insert("enum".to_string(), spec.clone());
                PropType::from_spec_object(&map)
            }
            Value::Object(map) => PropType::from_spec_object(map),
            other => Err(type_mismatch(other, "type specification")),
        }
    }

    fn from_type_name(name: &str) -> Result<PropType> {
        match name {
            "boolean" => Ok(PropType::Boolean(BooleanType::default())),
            "integer" => Ok(PropType::Integer(IntegerType::default())),
            "number" => Ok(PropType::Number(NumberType::default())),
            "string" => Ok(PropType::String(StringType::default())),
            other => Err(Error::new(
                errors::commands::DOMAIN,
                errors::commands::UNKNOWN_TYPE,
                format!("unknown type name '{other}'"),
            )),
        }
    }

    fn from_spec_object(map: &serde_json::Map<String, Value>) -> Result<PropType> {
        let mut prop_type = if let Some(props) = map.get("properties") {
            let schema = ObjectSchema::from_json(
                props,
                map.get("additionalProperties")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            )?;
            PropType::Object(ObjectType { schema, default: None })
        } else if let Some(items) = map.get("items") {
            PropType::Array(ArrayType {
                items: Box::new(PropType::from_json(items)?),
                default: None,
            })
        } else {
            PropType::infer_primitive(map)?
        };

        prop_type.parse_constraints(map)?;
        prop_type.parse_default(map)?;
        Ok(prop_type)
    }

    /// Infers the primitive type of a constraint-only specification from
    /// the types of the constraint values themselves.
    fn infer_primitive(map: &serde_json::Map<String, Value>) -> Result<PropType> {
        if let Some(bound) = map.get("minimum").or_else(|| map.get("maximum")) {
            let fractional = map
                .get("minimum")
                .into_iter()
                .chain(map.get("maximum"))
                .any(|v| v.is_f64());
            return if fractional {
                Ok(PropType::Number(NumberType::default()))
            } else if bound.is_i64() {
                Ok(PropType::Integer(IntegerType::default()))
            } else {
                Err(type_mismatch(bound, "number"))
            };
        }
        if map.contains_key("minLength") || map.contains_key("maxLength") {
            return Ok(PropType::String(StringType::default()));
        }
        if let Some(list) = enum_spec(map) {
            let first = list.first().ok_or_else(|| {
                Error::new(
                    errors::commands::DOMAIN,
                    errors::commands::UNKNOWN_TYPE,
                    "enum list must not be empty",
                )
            })?;
            return PropType::from_json_value_kind(first);
        }
        if let Some(default) = map.get("default") {
            return PropType::from_json_value_kind(default);
        }
        Err(Error::new(
            errors::commands::DOMAIN,
            errors::commands::UNKNOWN_TYPE,
            format!(
                "unable to infer type from schema object {}",
                Value::Object(map.clone())
            ),
        ))
    }

    fn from_json_value_kind(value: &Value) -> Result<PropType> {
        match value {
            Value::Bool(_) => Ok(PropType::Boolean(BooleanType::default())),
            Value::Number(n) if n.is_i64() => Ok(PropType::Integer(IntegerType::default())),
            Value::Number(_) => Ok(PropType::Number(NumberType::default())),
            Value::String(_) => Ok(PropType::String(StringType::default())),
            other => Err(type_mismatch(other, "primitive")),
        }
    }

    fn parse_constraints(&mut self, map: &serde_json::Map<String, Value>) -> Result<()> {
        match self {
            PropType::Integer(t) => {
                t.minimum = get_i64(map, "minimum")?;
                t.maximum = get_i64(map, "maximum")?;
                if let Some(list) = enum_spec(map) {
                    t.one_of = Some(
                        list.iter()
                            .map(|v| v.as_i64().ok_or_else(|| type_mismatch(v, "integer")))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
            }
            PropType::Number(t) => {
                t.minimum = get_f64(map, "minimum")?;
                t.maximum = get_f64(map, "maximum")?;
                if let Some(list) = enum_spec(map) {
                    t.one_of = Some(
                        list.iter()
                            .map(|v| v.as_f64().ok_or_else(|| type_mismatch(v, "number")))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
            }
            PropType::String(t) => {
                t.min_length = get_usize(map, "minLength")?;
                t.max_length = get_usize(map, "maxLength")?;
                if let Some(list) = enum_spec(map) {
                    t.one_of = Some(
                        list.iter()
                            .map(|v| {
                                v.as_str()
                                    .map(str::to_string)
                                    .ok_or_else(|| type_mismatch(v, "string"))
                            })
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
            }
            PropType::Boolean(_) | PropType::Object(_) | PropType::Array(_) => {}
        }
        Ok(())
    }

    /// Parses the `default` key, if present, and checks it against the
    /// constraints parsed just before it.
    fn parse_default(&mut self, map: &serde_json::Map<String, Value>) -> Result<()> {
        let Some(spec) = map.get("default") else {
            return Ok(());
        };
        let value = self.value_from_json(spec).map_err(|e| {
            e.wrap(
                errors::commands::DOMAIN,
                errors::commands::INVALID_PARAMETER_VALUE,
                "default value violates the declared constraints",
            )
        })?;
        match self {
            PropType::Boolean(t) => t.default = value.as_bool(),
            PropType::Integer(t) => t.default = value.as_integer(),
            PropType::Number(t) => t.default = value.as_number(),
            PropType::String(t) => t.default = value.as_str().map(str::to_string),
            PropType::Object(t) => t.default = value.as_object().cloned(),
            PropType::Array(t) => t.default = value.as_array().map(<[PropValue]>::to_vec),
        }
        Ok(())
    }

    /// Returns a clone of the declared default, if any.
    pub fn default_value(&self) -> Option<PropValue> {
        match self {
            PropType::Boolean(t) => t.default.map(PropValue::Boolean),
            PropType::Integer(t) => t.default.map(PropValue::Integer),
            PropType::Number(t) => t.default.map(PropValue::Number),
            PropType::String(t) => t.default.clone().map(PropValue::String),
            PropType::Object(t) => t.default.clone().map(PropValue::Object),
            PropType::Array(t) => t.default.clone().map(PropValue::Array),
        }
    }

    // =========================================================================
    // Value Parsing and Validation
    // =========================================================================

    /// Parses and validates a JSON value against this type. This is the
    /// main entry point: a structural pass first, then the constraint
    /// pass over everything that parsed.
    pub fn value_from_json(&self, json: &Value) -> Result<PropValue> {
        let value = self.parse_json(json)?;
        self.validate(&value)?;
        Ok(value)
    }

    /// Structural parse only. Object fields are filled from declared
    /// defaults when missing; unknown fields are rejected unless the
    /// schema allows extra properties. Constraints are not checked here.
    pub(crate) fn parse_json(&self, json: &Value) -> Result<PropValue> {
        match self {
            PropType::Boolean(_) => json
                .as_bool()
                .map(PropValue::Boolean)
                .ok_or_else(|| type_mismatch(json, self.type_name())),
            PropType::Integer(_) => json
                .as_i64()
                .map(PropValue::Integer)
                .ok_or_else(|| type_mismatch(json, self.type_name())),
            PropType::Number(_) => json
                .as_f64()
                .map(PropValue::Number)
                .ok_or_else(|| type_mismatch(json, self.type_name())),
            PropType::String(_) => json
                .as_str()
                .map(|s| PropValue::String(s.to_string()))
                .ok_or_else(|| type_mismatch(json, self.type_name())),
            PropType::Object(t) => {
                let map = json
                    .as_object()
                    .ok_or_else(|| type_mismatch(json, self.type_name()))?;
                Ok(PropValue::Object(t.schema.parse_object(map)?))
            }
            PropType::Array(t) => {
                let items = json
                    .as_array()
                    .ok_or_else(|| type_mismatch(json, self.type_name()))?;
                Ok(PropValue::Array(
                    items
                        .iter()
                        .map(|item| t.items.parse_json(item))
                        .collect::<Result<Vec<_>>>()?,
                ))
            }
        }
    }

    /// Checks a parsed value against this type's constraints. Object
    /// fields that fail report `commands/invalid_parameter_value` naming
    /// the field, wrapping the underlying constraint error.
    pub fn validate(&self, value: &PropValue) -> Result<()> {
        match (self, value) {
            (PropType::Boolean(_), PropValue::Boolean(_)) => Ok(()),
            (PropType::Integer(t), PropValue::Integer(v)) => {
                check_range(*v, t.minimum, t.maximum)?;
                check_one_of(v, t.one_of.as_deref(), |v| Value::from(*v))
            }
            (PropType::Number(t), PropValue::Number(v)) => {
                check_range(*v, t.minimum, t.maximum)?;
                check_one_of(v, t.one_of.as_deref(), |v| {
                    serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number)
                })
            }
            (PropType::String(t), PropValue::String(v)) => {
                check_length(v, t.min_length, t.max_length)?;
                check_one_of(v, t.one_of.as_deref(), |v| Value::from(v.as_str()))
            }
            (PropType::Object(t), PropValue::Object(v)) => t.schema.validate_object(v),
            (PropType::Array(t), PropValue::Array(items)) => {
                items.iter().try_for_each(|item| t.items.validate(item))
            }
            (_, value) => Err(type_mismatch(&value.to_json(), self.type_name())),
        }
    }

    // =========================================================================
    // Refinement
    // =========================================================================

    /// Returns true if this type narrows `base` or leaves it unchanged.
    /// A constraint absent here is inherited from `base`, so it never
    /// widens; a constraint present here must be at least as tight.
    pub fn is_refinement_of(&self, base: &PropType) -> bool {
        match (self, base) {
            (PropType::Boolean(_), PropType::Boolean(_)) => true,
            (PropType::Integer(derived), PropType::Integer(base)) => {
                bound_narrows(derived.minimum, base.minimum, |d, b| d >= b)
                    && bound_narrows(derived.maximum, base.maximum, |d, b| d <= b)
                    && set_narrows(derived.one_of.as_deref(), base.one_of.as_deref())
            }
            (PropType::Number(derived), PropType::Number(base)) => {
                bound_narrows(derived.minimum, base.minimum, |d, b| d >= b)
                    && bound_narrows(derived.maximum, base.maximum, |d, b| d <= b)
                    && set_narrows(derived.one_of.as_deref(), base.one_of.as_deref())
            }
            (PropType::String(derived), PropType::String(base)) => {
                bound_narrows(derived.min_length, base.min_length, |d, b| d >= b)
                    && bound_narrows(derived.max_length, base.max_length, |d, b| d <= b)
                    && set_narrows(derived.one_of.as_deref(), base.one_of.as_deref())
            }
            (PropType::Object(derived), PropType::Object(base)) => {
                derived.schema.is_refinement_of(&base.schema)
            }
            (PropType::Array(derived), PropType::Array(base)) => {
                derived.items.is_refinement_of(&base.items)
            }
            _ => false,
        }
    }
}

// =============================================================================
// Constraint Helpers
// =============================================================================

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(
    value: T,
    minimum: Option<T>,
    maximum: Option<T>,
) -> Result<()> {
    let in_range = minimum.map_or(true, |min| value >= min)
        && maximum.map_or(true, |max| value <= max);
    if in_range {
        return Ok(());
    }
    let mut bounds = Vec::new();
    if let Some(min) = minimum {
        bounds.push(format!("minimum {min}"));
    }
    if let Some(max) = maximum {
        bounds.push(format!("maximum {max}"));
    }
    Err(Error::new(
        errors::commands::DOMAIN,
        errors::commands::OUT_OF_RANGE,
        format!("value {value} is out of range ({})", bounds.join(", ")),
    ))
}

fn check_length(value: &str, min_length: Option<usize>, max_length: Option<usize>) -> Result<()> {
    let length = value.chars().count();
    let in_range = min_length.map_or(true, |min| length >= min)
        && max_length.map_or(true, |max| length <= max);
    if in_range {
        return Ok(());
    }
    let mut bounds = Vec::new();
    if let Some(min) = min_length {
        bounds.push(format!("minLength {min}"));
    }
    if let Some(max) = max_length {
        bounds.push(format!("maxLength {max}"));
    }
    Err(Error::new(
        errors::commands::DOMAIN,
        errors::commands::OUT_OF_RANGE,
        format!(
            "string length {length} is out of range ({})",
            bounds.join(", ")
        ),
    ))
}

fn check_one_of<T: PartialEq>(
    value: &T,
    allowed: Option<&[T]>,
    to_json: impl Fn(&T) -> Value,
) -> Result<()> {
    match allowed {
        Some(list) if !list.contains(value) => Err(Error::new(
            errors::commands::DOMAIN,
            errors::commands::OUT_OF_RANGE,
            format!("value {} is not one of the allowed values", to_json(value)),
        )),
        _ => Ok(()),
    }
}

fn bound_narrows<T: PartialOrd>(
    derived: Option<T>,
    base: Option<T>,
    tighter: impl Fn(&T, &T) -> bool,
) -> bool {
    match (derived, base) {
        (Some(d), Some(b)) => tighter(&d, &b),
        // Absent in the derived type means the base bound is inherited.
        (None, _) => true,
        (Some(_), None) => true,
    }
}

fn set_narrows<T: PartialEq>(derived: Option<&[T]>, base: Option<&[T]>) -> bool {
    match (derived, base) {
        (Some(d), Some(b)) => d.iter().all(|v| b.contains(v)),
        (None, _) => true,
        (Some(_), None) => true,
    }
}

// =============================================================================
// Schema Parsing Helpers
// =============================================================================

fn enum_spec(map: &serde_json::Map<String, Value>) -> Option<&Vec<Value>> {
    map.get("enum")
        .or_else(|| map.get("oneOf"))
        .and_then(Value::as_array)
}

fn get_i64(map: &serde_json::Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| type_mismatch(v, "integer")),
    }
}

fn get_f64(map: &serde_json::Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| type_mismatch(v, "number")),
    }
}

fn get_usize(map: &serde_json::Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| type_mismatch(v, "unsigned integer")),
    }
}

pub(crate) fn type_mismatch(value: &Value, expected: &str) -> Error {
    Error::new(
        errors::commands::DOMAIN,
        errors::commands::TYPE_MISMATCH,
        format!("unable to convert value {value} into {expected}"),
    )
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errors;
    use serde_json::json;

    #[test]
    fn test_short_form_primitives() {
        for name in ["boolean", "integer", "number", "string"] {
            let prop_type = PropType::from_json(&json!(name)).unwrap();
            assert_eq!(prop_type.type_name(), name);
        }
        let err = PropType::from_json(&json!("quaternion")).unwrap_err();
        assert_eq!(err.code(), errors::commands::UNKNOWN_TYPE);
    }

    #[test]
    fn test_constraint_shorthand_infers_integer() {
        let prop_type = PropType::from_json(&json!({"minimum": 1, "maximum": 3})).unwrap();
        assert_eq!(prop_type.type_name(), "integer");
        assert!(prop_type.value_from_json(&json!(2)).is_ok());

        let err = prop_type.value_from_json(&json!(5)).unwrap_err();
        assert_eq!(err.code(), errors::commands::OUT_OF_RANGE);
    }

    #[test]
    fn test_fractional_bound_infers_number() {
        let prop_type = PropType::from_json(&json!({"minimum": 0.5, "maximum": 2})).unwrap();
        assert_eq!(prop_type.type_name(), "number");
        assert!(prop_type.value_from_json(&json!(1)).is_ok());
        assert!(prop_type.value_from_json(&json!(0.25)).is_err());
    }

    #[test]
    fn test_length_shorthand_infers_string() {
        let prop_type =
            PropType::from_json(&json!({"minLength": 2, "maxLength": 4})).unwrap();
        assert_eq!(prop_type.type_name(), "string");
        assert!(prop_type.value_from_json(&json!("abc")).is_ok());
        assert_eq!(
            prop_type.value_from_json(&json!("a")).unwrap_err().code(),
            errors::commands::OUT_OF_RANGE
        );
        assert_eq!(
            prop_type
                .value_from_json(&json!("abcde"))
                .unwrap_err()
                .code(),
            errors::commands::OUT_OF_RANGE
        );
    }

    #[test]
    fn test_bare_list_is_enum_shorthand() {
        let prop_type = PropType::from_json(&json!(["idle", "busy"])).unwrap();
        assert_eq!(prop_type.type_name(), "string");
        assert!(prop_type.value_from_json(&json!("idle")).is_ok());
        assert_eq!(
            prop_type
                .value_from_json(&json!("offline"))
                .unwrap_err()
                .code(),
            errors::commands::OUT_OF_RANGE
        );
    }

    #[test]
    fn test_array_form() {
        let prop_type = PropType::from_json(&json!({"items": "boolean"})).unwrap();
        let value = prop_type
            .value_from_json(&json!([true, false, true]))
            .unwrap();
        assert_eq!(value.to_json(), json!([true, false, true]));

        let err = prop_type.value_from_json(&json!([true, 1])).unwrap_err();
        assert_eq!(err.code(), errors::commands::TYPE_MISMATCH);
    }

    #[test]
    fn test_type_mismatch_reports_value_and_type() {
        let prop_type = PropType::from_json(&json!("integer")).unwrap();
        let err = prop_type.value_from_json(&json!("nope")).unwrap_err();
        assert_eq!(err.code(), errors::commands::TYPE_MISMATCH);
        assert!(err.message().contains("\"nope\""));
        assert!(err.message().contains("integer"));
    }

    #[test]
    fn test_default_must_satisfy_constraints() {
        let err = PropType::from_json(&json!({"minimum": 1, "maximum": 3, "default": 7}))
            .unwrap_err();
        assert_eq!(err.code(), errors::commands::INVALID_PARAMETER_VALUE);
        assert_eq!(
            err.first_error().code(),
            errors::commands::OUT_OF_RANGE
        );

        let prop_type =
            PropType::from_json(&json!({"minimum": 1, "maximum": 3, "default": 2})).unwrap();
        assert_eq!(prop_type.default_value(), Some(PropValue::Integer(2)));
    }

    #[test]
    fn test_integer_refinement() {
        let base = PropType::from_json(&json!({"minimum": 0, "maximum": 10})).unwrap();
        let narrower = PropType::from_json(&json!({"minimum": 2, "maximum": 8})).unwrap();
        let inherited = PropType::from_json(&json!({"minimum": 0, "maximum": 10})).unwrap();
        let wider = PropType::from_json(&json!({"minimum": -5, "maximum": 10})).unwrap();

        assert!(narrower.is_refinement_of(&base));
        assert!(inherited.is_refinement_of(&base));
        assert!(!wider.is_refinement_of(&base));
        assert!(!PropType::from_json(&json!("string"))
            .unwrap()
            .is_refinement_of(&base));
    }

    #[test]
    fn test_enum_refinement_is_subset() {
        let base = PropType::from_json(&json!(["red", "green", "blue"])).unwrap();
        let subset = PropType::from_json(&json!(["red", "blue"])).unwrap();
        let disjoint = PropType::from_json(&json!(["red", "purple"])).unwrap();

        assert!(subset.is_refinement_of(&base));
        assert!(!disjoint.is_refinement_of(&base));
    }
}
