//! Static command descriptions.

use serde_json::Value;

use crate::error::{errors, Error, Result};
use crate::schema::ObjectSchema;

/// The schema of one command: its parameters, results, and progress
/// objects, plus the category it was loaded under (the stem of the
/// definition file, or "" for the base dictionary).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDefinition {
    category: String,
    parameters: ObjectSchema,
    results: ObjectSchema,
    progress: ObjectSchema,
}

impl CommandDefinition {
    /// Parses `{"parameters": {...}, "results": {...}, "progress": {...}}`.
    /// Each section is optional and defaults to an empty schema. Keys the
    /// agent does not model (display hints and the like) are ignored.
    pub fn from_json(json: &Value, category: &str) -> Result<CommandDefinition> {
        let map = json.as_object().ok_or_else(|| {
            Error::new(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                format!("command definition must be a JSON object, got {json}"),
            )
        })?;

        let section = |key: &str| -> Result<ObjectSchema> {
            match map.get(key) {
                Some(spec) => ObjectSchema::from_json(spec, false),
                None => Ok(ObjectSchema::new()),
            }
        };

        Ok(CommandDefinition {
            category: category.to_string(),
            parameters: section("parameters")?,
            results: section("results")?,
            progress: section("progress")?,
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn parameters(&self) -> &ObjectSchema {
        &self.parameters
    }

    pub fn results(&self) -> &ObjectSchema {
        &self.results
    }

    pub fn progress(&self) -> &ObjectSchema {
        &self.progress
    }
}
