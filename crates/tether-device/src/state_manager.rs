//! # State Registry
//!
//! A versioned registry of named device state properties. Every property
//! is declared with a type before it can be set; every successful
//! mutation lands in the change journal for the cloud push loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use tether_core::error::{errors, Error, Result};
use tether_core::{PropType, PropValue};

use crate::change_queue::{StateChange, StateChangeQueue, StateUpdatedCallback};

/// Observer fired after any successful state mutation.
pub type StateChangedCallback = Arc<dyn Fn() + Send + Sync>;

// =============================================================================
// StateManager
// =============================================================================

/// Owns the state property definitions, their current values, and the
/// bounded change journal. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    definitions: BTreeMap<String, PropType>,
    values: BTreeMap<String, PropValue>,
    queue: StateChangeQueue,
    on_changed: Vec<StateChangedCallback>,
}

impl StateManager {
    /// Creates a manager whose change journal holds at most
    /// `queue_capacity` entries before folding the oldest together.
    pub fn new(queue_capacity: usize) -> Self {
        StateManager {
            inner: Arc::new(Mutex::new(Inner {
                definitions: BTreeMap::new(),
                values: BTreeMap::new(),
                queue: StateChangeQueue::new(queue_capacity),
                on_changed: Vec::new(),
            })),
        }
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Registers state properties from
    /// `{"<package>": {"<prop>": <type-spec>, ...}, ...}` under their
    /// qualified names. The whole document is validated before anything
    /// is registered.
    pub fn add_state_definitions(&self, json: &Value) -> Result<()> {
        let root = json.as_object().ok_or_else(|| {
            Error::new(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                format!("state definitions must be a JSON object, got {json}"),
            )
        })?;

        let mut inner = self.lock();
        let mut staged = BTreeMap::new();
        for (package, props) in root {
            let props = props.as_object().ok_or_else(|| {
                Error::new(
                    errors::json::DOMAIN,
                    errors::json::OBJECT_EXPECTED,
                    format!("state package '{package}' must map properties to types"),
                )
            })?;
            for (prop, spec) in props {
                let name = format!("{package}.{prop}");
                if inner.definitions.contains_key(&name) || staged.contains_key(&name) {
                    return Err(Error::new(
                        errors::state::DOMAIN,
                        errors::state::PROPERTY_REDEFINED,
                        format!("state property '{name}' is already defined"),
                    ));
                }
                let prop_type = PropType::from_json(spec).map_err(|e| {
                    e.wrap(
                        errors::state::DOMAIN,
                        errors::state::INVALID_VALUE,
                        format!("error in definition of state property '{name}'"),
                    )
                })?;
                staged.insert(name, prop_type);
            }
        }
        inner.definitions.extend(staged);
        Ok(())
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Validates and sets a single property by qualified name.
    pub fn set_property(&self, name: &str, value: &Value) -> Result<()> {
        let callbacks = {
            let mut inner = self.lock();
            let parsed = inner.validate(name, value)?;
            inner.commit(vec![(name.to_string(), parsed)]);
            inner.on_changed.clone()
        };
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    /// Batch form of [`set_property`], atomic: takes
    /// `{"<package>": {"<prop>": <value>, ...}, ...}`, validates every
    /// entry first, and commits nothing if any of them fails.
    ///
    /// [`set_property`]: StateManager::set_property
    pub fn set_properties(&self, json: &Value) -> Result<()> {
        let root = json.as_object().ok_or_else(|| {
            Error::new(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                format!("state property set must be a JSON object, got {json}"),
            )
        })?;

        let callbacks = {
            let mut inner = self.lock();
            let mut staged = Vec::new();
            for (package, props) in root {
                let props = props.as_object().ok_or_else(|| {
                    Error::new(
                        errors::json::DOMAIN,
                        errors::json::OBJECT_EXPECTED,
                        format!("state package '{package}' must map properties to values"),
                    )
                })?;
                for (prop, value) in props {
                    let name = format!("{package}.{prop}");
                    let parsed = inner.validate(&name, value)?;
                    staged.push((name, parsed));
                }
            }
            if staged.is_empty() {
                return Ok(());
            }
            inner.commit(staged);
            inner.on_changed.clone()
        };
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn get_property(&self, name: &str) -> Option<PropValue> {
        self.lock().values.get(name).cloned()
    }

    /// The full state as nested JSON, grouped by package.
    pub fn get_state(&self) -> Value {
        let inner = self.lock();
        let mut root = serde_json::Map::new();
        for (name, value) in &inner.values {
            let (package, prop) = split_name(name);
            if let Some(map) = root
                .entry(package.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
            {
                map.insert(prop.to_string(), value.to_json());
            }
        }
        Value::Object(root)
    }

    pub fn add_changed_callback(&self, callback: StateChangedCallback) {
        self.lock().on_changed.push(callback);
    }

    // =========================================================================
    // Change Journal Access
    // =========================================================================

    /// Atomically drains the change journal. See
    /// [`StateChangeQueue::get_and_clear_recorded_state_changes`].
    pub fn get_and_clear_recorded_state_changes(&self) -> Vec<StateChange> {
        self.lock().queue.get_and_clear_recorded_state_changes()
    }

    pub fn last_state_change_id(&self) -> u64 {
        self.lock().queue.last_state_change_id()
    }

    pub fn add_on_state_updated_callback(&self, callback: StateUpdatedCallback) {
        self.lock().queue.add_on_state_updated_callback(callback);
    }

    /// Puts drained changes back after a failed upload.
    pub fn restore_changes(&self, changes: Vec<StateChange>) {
        self.lock().queue.restore(changes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Inner {
    fn validate(&self, name: &str, value: &Value) -> Result<PropValue> {
        let prop_type = self.definitions.get(name).ok_or_else(|| {
            Error::new(
                errors::state::DOMAIN,
                errors::state::UNKNOWN_PROPERTY,
                format!("state property '{name}' is not defined"),
            )
        })?;
        prop_type.value_from_json(value).map_err(|e| {
            e.wrap(
                errors::state::DOMAIN,
                errors::state::INVALID_VALUE,
                format!("invalid value for state property '{name}'"),
            )
        })
    }

    fn commit(&mut self, entries: Vec<(String, PropValue)>) {
        let timestamp = Utc::now();
        let mut changed = BTreeMap::new();
        for (name, value) in entries {
            debug!(property = %name, "state property updated");
            self.values.insert(name.clone(), value.clone());
            changed.insert(name, value);
        }
        self.queue.notify_properties_updated(timestamp, changed);
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((package, prop)) => (package, prop),
        None => ("", name),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn led_manager() -> StateManager {
        let manager = StateManager::new(100);
        manager
            .add_state_definitions(&json!({
                "_ledflasher": {
                    "_leds": {"items": "boolean"},
                    "_brightness": {"minimum": 0, "maximum": 100}
                }
            }))
            .unwrap();
        manager
    }

    #[test]
    fn test_set_and_get_property() {
        let manager = led_manager();
        manager
            .set_property("_ledflasher._leds", &json!([false, true, false]))
            .unwrap();
        let value = manager.get_property("_ledflasher._leds").unwrap();
        assert_eq!(value.to_json(), json!([false, true, false]));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let manager = led_manager();
        let err = manager
            .set_property("_ledflasher._color", &json!("red"))
            .unwrap_err();
        assert_eq!(err.domain(), "state");
        assert_eq!(err.code(), "unknown_property");
    }

    #[test]
    fn test_invalid_value_wraps_cause() {
        let manager = led_manager();
        let err = manager
            .set_property("_ledflasher._brightness", &json!(150))
            .unwrap_err();
        assert_eq!(err.domain(), "state");
        assert_eq!(err.code(), "invalid_value");
        assert_eq!(err.first_error().code(), "out_of_range");
        assert!(manager.get_property("_ledflasher._brightness").is_none());
    }

    #[test]
    fn test_redefinition_rejected() {
        let manager = led_manager();
        let err = manager
            .add_state_definitions(&json!({"_ledflasher": {"_leds": "string"}}))
            .unwrap_err();
        assert_eq!(err.code(), "property_redefined");
    }

    #[test]
    fn test_batch_set_is_atomic() {
        let manager = led_manager();
        let err = manager
            .set_properties(&json!({
                "_ledflasher": {"_brightness": 50, "_bogus": 1}
            }))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_property");

        // The valid half of the failed batch must not be committed.
        assert!(manager.get_property("_ledflasher._brightness").is_none());
        assert!(manager.get_and_clear_recorded_state_changes().is_empty());

        manager
            .set_properties(&json!({"_ledflasher": {"_brightness": 50, "_leds": [true]}}))
            .unwrap();
        let changes = manager.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changed.len(), 2);
    }

    #[test]
    fn test_snapshot_is_nested_by_package() {
        let manager = led_manager();
        manager
            .set_properties(&json!({"_ledflasher": {"_brightness": 25, "_leds": [false]}}))
            .unwrap();
        assert_eq!(
            manager.get_state(),
            json!({"_ledflasher": {"_brightness": 25, "_leds": [false]}})
        );
    }

    #[test]
    fn test_changed_callback_fires_per_mutation() {
        let manager = led_manager();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        manager.add_changed_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager
            .set_property("_ledflasher._brightness", &json!(10))
            .unwrap();
        manager
            .set_properties(&json!({"_ledflasher": {"_brightness": 20, "_leds": [true]}}))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mutations_land_in_change_journal() {
        let manager = led_manager();
        manager
            .set_property("_ledflasher._brightness", &json!(10))
            .unwrap();
        assert_eq!(manager.last_state_change_id(), 1);
        let changes = manager.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].changed.get("_ledflasher._brightness"),
            Some(&PropValue::Integer(10))
        );
    }
}
