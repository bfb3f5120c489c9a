//! # Command Manager
//!
//! Owns the command dictionary and every live [`CommandInstance`].
//! Inbound command JSON is validated against the dictionary, queued, and
//! dispatched cooperatively to the registered handler for its name.
//!
//! ## Dispatch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Command Dispatch                                 │
//! │                                                                         │
//! │  AddCommand(json) ──► validate ──► Queued ──► on_added observers        │
//! │                                       │                                 │
//! │                         handler registered for name?                    │
//! │                          │ yes                  │ no                    │
//! │                          ▼                      ▼                       │
//! │                 task posted to the       stays Queued until a           │
//! │                 TaskRunner               handler shows up or the        │
//! │                          │               command is cancelled           │
//! │                          ▼                                              │
//! │                 Queued → InProgress, handler(CommandHandle)             │
//! │                          │                                              │
//! │              handler drives the instance through the handle:            │
//! │              set_progress / complete / abort / pause / cancel           │
//! │                          │                                              │
//! │                          ▼ terminal                                     │
//! │              on_removed observers, instance dropped                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers never hold the command itself. They hold a [`CommandHandle`]
//! carrying the id; every mutation goes through the manager's owning
//! table, and a handle whose command is gone reports
//! `commands/command_destroyed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use tether_core::commands::{CommandDictionary, CommandInstance, CommandOrigin};
use tether_core::error::{errors, Error, Result};

use crate::provider::TaskRunner;

/// Callback invoked with a [`CommandHandle`] when a command of the
/// registered name is dispatched.
pub type CommandHandler = Arc<dyn Fn(CommandHandle) + Send + Sync>;

/// Observer invoked with a command id on queue membership changes.
pub type CommandObserver = Arc<dyn Fn(&str) + Send + Sync>;

// =============================================================================
// CommandManager
// =============================================================================

/// The owning table of live commands. Cheap to clone; clones share the
/// queue.
#[derive(Clone)]
pub struct CommandManager {
    inner: Arc<Mutex<Inner>>,
    task_runner: Arc<dyn TaskRunner>,
}

struct Inner {
    base_dictionary: CommandDictionary,
    dictionary: CommandDictionary,
    commands: Vec<CommandInstance>,
    handlers: HashMap<String, CommandHandler>,
    on_added: Vec<CommandObserver>,
    on_removed: Vec<CommandObserver>,
}

impl CommandManager {
    pub fn new(task_runner: Arc<dyn TaskRunner>) -> Self {
        CommandManager {
            inner: Arc::new(Mutex::new(Inner {
                base_dictionary: CommandDictionary::new(),
                dictionary: CommandDictionary::new(),
                commands: Vec::new(),
                handlers: HashMap::new(),
                on_added: Vec::new(),
                on_removed: Vec::new(),
            })),
            task_runner,
        }
    }

    // =========================================================================
    // Dictionary Loading
    // =========================================================================

    /// Loads the read-only base dictionary. Call before any device
    /// dictionary load so refinement checks have something to check
    /// against.
    pub fn load_base_commands(&self, json: &Value) -> Result<()> {
        self.lock().base_dictionary.load_commands(json, "", None)
    }

    /// Loads or overrides device command definitions under `category`,
    /// validating redefinitions of base commands as refinements.
    pub fn load_commands(&self, json: &Value, category: &str) -> Result<()> {
        let mut inner = self.lock();
        let Inner {
            base_dictionary,
            dictionary,
            ..
        } = &mut *inner;
        dictionary.load_commands(json, category, Some(base_dictionary))
    }

    /// A point-in-time copy of the device dictionary, used to describe
    /// the device's vendor commands during registration.
    pub fn dictionary(&self) -> CommandDictionary {
        self.lock().dictionary.clone()
    }

    // =========================================================================
    // Handlers and Observers
    // =========================================================================

    /// Registers the handler for a command name, replacing any previous
    /// one. Commands of that name already sitting in the queue are
    /// delivered to the new handler before this returns.
    pub fn add_command_handler(&self, name: &str, handler: CommandHandler) {
        let backlog: Vec<String> = {
            let mut inner = self.lock();
            inner.handlers.insert(name.to_string(), handler.clone());
            inner
                .commands
                .iter()
                .filter(|c| c.name() == name && !c.status().is_terminal())
                .map(|c| c.id().to_string())
                .collect()
        };

        for id in backlog {
            // Queued commands start now; anything already running keeps
            // its state and the new handler simply takes over.
            {
                let mut inner = self.lock();
                if let Some(command) = inner.find_mut(&id) {
                    if command.status() == tether_core::commands::CommandStatus::Queued {
                        let _ = command.start();
                    }
                }
            }
            handler(self.handle(&id));
        }
    }

    pub fn add_on_command_added_callback(&self, callback: CommandObserver) {
        self.lock().on_added.push(callback);
    }

    pub fn add_on_command_removed_callback(&self, callback: CommandObserver) {
        self.lock().on_removed.push(callback);
    }

    // =========================================================================
    // Command Intake
    // =========================================================================

    /// Validates command JSON (`{id?, name, parameters?, ...}`) against
    /// the dictionary and queues a new instance. Returns the command id.
    pub fn add_command(&self, json: &Value, origin: CommandOrigin) -> Result<String> {
        let map = json.as_object().ok_or_else(|| {
            Error::new(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                format!("command must be a JSON object, got {json}"),
            )
        })?;
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    errors::commands::DOMAIN,
                    errors::commands::INVALID_COMMAND_NAME,
                    "command has no 'name'",
                )
            })?
            .to_string();

        let (id, observers, has_handler) = {
            let mut inner = self.lock();
            let definition = inner
                .dictionary
                .find(&name)
                .or_else(|| inner.base_dictionary.find(&name))
                .cloned()
                .ok_or_else(|| {
                    Error::new(
                        errors::commands::DOMAIN,
                        errors::commands::INVALID_COMMAND_NAME,
                        format!("unknown command '{name}'"),
                    )
                })?;

            let no_parameters = Value::Object(serde_json::Map::new());
            let parameters = definition
                .parameters()
                .object_from_json(map.get("parameters").unwrap_or(&no_parameters))?;

            let id = match map.get("id").and_then(Value::as_str) {
                Some(id) => {
                    if inner.find(id).is_some() {
                        return Err(Error::new(
                            errors::commands::DOMAIN,
                            errors::commands::DUPLICATE_COMMAND_ID,
                            format!("command '{id}' already exists"),
                        ));
                    }
                    id.to_string()
                }
                None => Uuid::new_v4().to_string(),
            };

            inner.commands.push(CommandInstance::new(
                id.clone(),
                name.clone(),
                origin,
                Arc::new(definition),
                parameters,
            ));
            debug!(command = %name, id = %id, origin = origin.as_str(), "command queued");
            (id, inner.on_added.clone(), inner.handlers.contains_key(&name))
        };

        for callback in observers {
            callback(&id);
        }
        if has_handler {
            self.schedule_dispatch(&id);
        }
        Ok(id)
    }

    /// Snapshot of a live command, if it still exists.
    pub fn find_command(&self, id: &str) -> Option<CommandInstance> {
        self.lock().find(id).cloned()
    }

    /// Ids of live commands in enqueue order.
    pub fn command_ids(&self) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    /// A weak handle to a command. The handle stays valid to hold but
    /// every operation fails once the command is gone.
    pub fn handle(&self, id: &str) -> CommandHandle {
        CommandHandle {
            id: id.to_string(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Moves every non-terminal command older than `ttl` to Expired and
    /// drops it. Returns how many expired.
    pub fn expire_overdue(&self, ttl: chrono::Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let (expired, observers) = {
            let mut inner = self.lock();
            let mut expired = Vec::new();
            for command in &mut inner.commands {
                if !command.status().is_terminal() && command.created_at() < cutoff {
                    if command.expire().is_ok() {
                        expired.push(command.id().to_string());
                    }
                }
            }
            inner.commands.retain(|c| !expired.contains(&c.id().to_string()));
            (expired, inner.on_removed.clone())
        };
        for id in &expired {
            warn!(id = %id, "command expired before completion");
            for callback in &observers {
                callback(id);
            }
        }
        expired.len()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn schedule_dispatch(&self, id: &str) {
        let id = id.to_string();
        let weak = Arc::downgrade(&self.inner);
        self.task_runner.post(Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let dispatch = {
                let mut guard = lock(&inner);
                // Only a still-Queued command dispatches here; a handler
                // registered in the meantime may have taken it already.
                let queued_as = guard.find(&id).and_then(|command| {
                    (command.status() == tether_core::commands::CommandStatus::Queued)
                        .then(|| command.name().to_string())
                });
                match queued_as {
                    Some(name) => {
                        let handler = guard.handlers.get(&name).cloned();
                        if handler.is_some() {
                            if let Some(command) = guard.find_mut(&id) {
                                let _ = command.start();
                            }
                        }
                        handler
                    }
                    None => None,
                }
            };
            if let Some(handler) = dispatch {
                handler(CommandHandle {
                    id,
                    inner: Arc::downgrade(&inner),
                });
            }
        }));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn find(&self, id: &str) -> Option<&CommandInstance> {
        self.commands.iter().find(|c| c.id() == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut CommandInstance> {
        self.commands.iter_mut().find(|c| c.id() == id)
    }
}

// =============================================================================
// CommandHandle
// =============================================================================

/// A non-owning reference to a queued command. Cloneable and safe to
/// stash in handlers; operations report `commands/command_destroyed`
/// once the command or its manager is gone.
#[derive(Clone)]
pub struct CommandHandle {
    id: String,
    inner: Weak<Mutex<Inner>>,
}

impl CommandHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the command behind this handle.
    pub fn command(&self) -> Result<CommandInstance> {
        let inner = self.upgrade()?;
        let guard = lock(&inner);
        guard.find(&self.id).cloned().ok_or_else(|| self.gone())
    }

    pub fn set_progress(&self, progress: &Value) -> Result<()> {
        self.mutate(|command| command.set_progress(progress))
    }

    pub fn complete(&self, results: &Value) -> Result<()> {
        self.mutate(|command| command.complete(results))
    }

    pub fn abort(&self, error: Error) -> Result<()> {
        self.mutate(|command| command.abort(error))
    }

    pub fn fail(&self, error: Error) -> Result<()> {
        self.mutate(|command| command.fail(error))
    }

    pub fn cancel(&self) -> Result<()> {
        self.mutate(|command| command.cancel())
    }

    pub fn pause(&self) -> Result<()> {
        self.mutate(|command| command.pause())
    }

    pub fn resume(&self) -> Result<()> {
        self.mutate(|command| command.resume())
    }

    /// Applies `op` to the live command. A terminal transition fires the
    /// removed observers and drops the instance from the queue.
    fn mutate(&self, op: impl FnOnce(&mut CommandInstance) -> Result<()>) -> Result<()> {
        let inner = self.upgrade()?;
        let removed = {
            let mut guard = lock(&inner);
            let command = guard.find_mut(&self.id).ok_or_else(|| self.gone())?;
            op(command)?;
            if command.status().is_terminal() {
                debug!(id = %self.id, state = %command.status(), "command finished");
                guard.commands.retain(|c| c.id() != self.id);
                Some(guard.on_removed.clone())
            } else {
                None
            }
        };
        if let Some(observers) = removed {
            for callback in observers {
                callback(&self.id);
            }
        }
        Ok(())
    }

    fn upgrade(&self) -> Result<Arc<Mutex<Inner>>> {
        self.inner.upgrade().ok_or_else(|| self.gone())
    }

    fn gone(&self) -> Error {
        Error::new(
            errors::commands::DOMAIN,
            errors::commands::COMMAND_DESTROYED,
            format!("command '{}' is no longer available", self.id),
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
