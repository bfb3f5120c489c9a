//! Named, category-tagged command definitions.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::commands::CommandDefinition;
use crate::error::{errors, Error, Result};

/// Mapping from qualified command name (`"<namespace>.<verb>"`, e.g.
/// `"_ledflasher._set"`) to its definition.
///
/// A dictionary can be loaded on top of a read-only *base* dictionary.
/// Redefining a command the base already has is allowed only when the
/// new parameter schema is a narrower-or-equal refinement of the base
/// one, so a device can tighten the standard commands but never widen
/// them.
#[derive(Debug, Clone, Default)]
pub struct CommandDictionary {
    definitions: BTreeMap<String, CommandDefinition>,
}

impl CommandDictionary {
    pub fn new() -> Self {
        CommandDictionary::default()
    }

    /// Loads definitions from `{"<namespace>": {"<verb>": {...}, ...}}`
    /// into this dictionary, tagging each with `category`.
    pub fn load_commands(
        &mut self,
        json: &Value,
        category: &str,
        base: Option<&CommandDictionary>,
    ) -> Result<()> {
        let root = json.as_object().ok_or_else(|| {
            Error::new(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                format!("command dictionary must be a JSON object, got {json}"),
            )
        })?;

        // Parse everything into a staging map first so a failing
        // definition leaves the dictionary untouched.
        let mut staged = BTreeMap::new();
        for (namespace, verbs) in root {
            let verbs = verbs.as_object().ok_or_else(|| {
                Error::new(
                    errors::json::DOMAIN,
                    errors::json::OBJECT_EXPECTED,
                    format!("namespace '{namespace}' must map verbs to definitions"),
                )
            })?;
            for (verb, spec) in verbs {
                let full_name = format!("{namespace}.{verb}");
                let definition = CommandDefinition::from_json(spec, category).map_err(|e| {
                    e.wrap(
                        errors::commands::DOMAIN,
                        errors::commands::INVALID_COMMAND_DEFINITION,
                        format!("error in definition of command '{full_name}'"),
                    )
                })?;
                if let Some(base_def) = base.and_then(|b| b.find(&full_name)) {
                    if !definition
                        .parameters()
                        .is_refinement_of(base_def.parameters())
                    {
                        return Err(Error::new(
                            errors::commands::DOMAIN,
                            errors::commands::INVALID_COMMAND_DEFINITION,
                            format!(
                                "command '{full_name}' must narrow the base definition, \
                                 not widen it"
                            ),
                        ));
                    }
                }
                staged.insert(full_name, definition);
            }
        }

        self.definitions.extend(staged);
        Ok(())
    }

    pub fn find(&self, full_name: &str) -> Option<&CommandDefinition> {
        self.definitions.get(full_name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Iterates `(qualified name, definition)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CommandDefinition)> {
        self.definitions
            .iter()
            .map(|(name, def)| (name.as_str(), def))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errors;
    use serde_json::json;

    fn base_dictionary() -> CommandDictionary {
        let mut base = CommandDictionary::new();
        base.load_commands(
            &json!({
                "base": {
                    "reboot": {},
                    "identify": {"parameters": {"duration": {"minimum": 1, "maximum": 60}}}
                }
            }),
            "",
            None,
        )
        .unwrap();
        base
    }

    #[test]
    fn test_load_and_find() {
        let dictionary = base_dictionary();
        assert_eq!(dictionary.len(), 2);
        assert!(dictionary.find("base.reboot").is_some());
        assert!(dictionary.find("base.missing").is_none());
    }

    #[test]
    fn test_category_tagging() {
        let mut dictionary = CommandDictionary::new();
        dictionary
            .load_commands(
                &json!({"_ledflasher": {"_toggle": {"parameters": {"_led": {"minimum": 1, "maximum": 3}}}}}),
                "ledflasher",
                None,
            )
            .unwrap();
        assert_eq!(
            dictionary.find("_ledflasher._toggle").map(|d| d.category()),
            Some("ledflasher")
        );
    }

    #[test]
    fn test_refinement_of_base_accepted() {
        let base = base_dictionary();
        let mut device = CommandDictionary::new();
        device
            .load_commands(
                &json!({"base": {"identify": {"parameters": {"duration": {"minimum": 5, "maximum": 30}}}}}),
                "device",
                Some(&base),
            )
            .unwrap();
        assert!(device.find("base.identify").is_some());
    }

    #[test]
    fn test_widening_base_rejected() {
        let base = base_dictionary();
        let mut device = CommandDictionary::new();
        let err = device
            .load_commands(
                &json!({"base": {"identify": {"parameters": {"duration": {"minimum": 0, "maximum": 600}}}}}),
                "device",
                Some(&base),
            )
            .unwrap_err();
        assert_eq!(err.code(), errors::commands::INVALID_COMMAND_DEFINITION);
        // The failing load must not leave partial definitions behind.
        assert!(device.is_empty());
    }

    #[test]
    fn test_bad_definition_wraps_cause() {
        let mut dictionary = CommandDictionary::new();
        let err = dictionary
            .load_commands(
                &json!({"pkg": {"cmd": {"parameters": {"p": "quaternion"}}}}),
                "pkg",
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), errors::commands::INVALID_COMMAND_DEFINITION);
        assert_eq!(
            err.first_error().code(),
            errors::commands::UNKNOWN_TYPE
        );
    }
}
