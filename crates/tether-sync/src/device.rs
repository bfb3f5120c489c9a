//! # Device Facade
//!
//! The one object the embedder constructs. It wires the command manager,
//! the state manager, and the cloud agent together, loads the factory
//! defaults, and re-exports the operations device code actually calls.
//!
//! There is exactly one `Device` per process and it is passed down
//! explicitly; nothing in the agent reaches for process-wide state.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use tether_core::commands::{CommandInstance, CommandOrigin};
use tether_core::error::{errors, Error, Result};
use tether_core::PropValue;
use tether_device::command_manager::{CommandHandler, CommandObserver};
use tether_device::state_manager::StateChangedCallback;
use tether_device::{
    CommandHandle, CommandManager, ConfigStore, HttpClient, Network, StateManager, TaskRunner,
};

use crate::agent::{CloudAgent, GcdState, GcdStateChangedCallback, RegistrationTicket};
use crate::settings::SyncSettings;

// =============================================================================
// Device
// =============================================================================

/// The assembled agent.
///
/// ## Construction
/// ```rust,ignore
/// let device = Device::new(config_store, task_runner, http_client, None)?;
/// device.add_command_handler("_ledflasher._set", Arc::new(handle_set));
/// device.start().await?;
/// ```
pub struct Device {
    commands: CommandManager,
    state: StateManager,
    agent: Arc<CloudAgent>,
}

impl Device {
    /// Builds the device from its providers and the factory defaults in
    /// the config store. The defaults document may carry
    /// `base_commands`, `commands` (a map of category to dictionary),
    /// `state_definitions`, `state_defaults`, and `settings` sections;
    /// each is optional.
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        task_runner: Arc<dyn TaskRunner>,
        http: Arc<dyn HttpClient>,
        network: Option<Arc<dyn Network>>,
    ) -> Result<Device> {
        let defaults = config_store.load_defaults()?;
        let settings = SyncSettings::from_defaults(defaults.as_ref());

        let commands = CommandManager::new(task_runner.clone());
        let state = StateManager::new(settings.state_change_queue_capacity);

        if let Some(defaults) = &defaults {
            if let Some(base) = defaults.get("base_commands") {
                info!("loading base command definitions");
                commands.load_base_commands(base)?;
            }
            if let Some(dictionaries) = defaults.get("commands").and_then(Value::as_object) {
                for (category, dictionary) in dictionaries {
                    info!(category = %category, "loading command definitions");
                    commands.load_commands(dictionary, category)?;
                }
            }
            if let Some(definitions) = defaults.get("state_definitions") {
                state.add_state_definitions(definitions)?;
            }
            if let Some(state_defaults) = defaults.get("state_defaults") {
                state.set_properties(state_defaults)?;
            }
        }

        let agent = CloudAgent::new(
            settings,
            config_store,
            http,
            task_runner,
            network,
            commands.clone(),
            state.clone(),
        );
        Ok(Device {
            commands,
            state,
            agent,
        })
    }

    /// Loads the persisted registration and begins connecting when the
    /// device is already registered.
    pub async fn start(&self) -> Result<()> {
        self.agent.start().await
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn add_command_definitions_from_json(&self, json: &str, category: &str) -> Result<()> {
        self.commands.load_commands(&parse_json(json)?, category)
    }

    /// Loads command definitions from a directory of `*.json` files.
    /// A well-known `gcd.json` seeds the base dictionary; every other
    /// file becomes a category named after its stem.
    pub fn load_command_definitions_from_dir(&self, dir: &Path) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::new(
                errors::file_system::DOMAIN,
                errors::file_system::FILE_READ_ERROR,
                format!("cannot read definition directory '{}': {e}", dir.display()),
            )
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        // The base dictionary loads first so device files can refine it.
        if let Some(base) = paths
            .iter()
            .find(|path| path.file_name().is_some_and(|name| name == "gcd.json"))
        {
            info!(path = %base.display(), "loading base command definitions");
            self.commands.load_base_commands(&read_json_file(base)?)?;
        }
        for path in &paths {
            if path.file_name().is_some_and(|name| name == "gcd.json") {
                continue;
            }
            let category = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            info!(category = %category, path = %path.display(), "loading command definitions");
            self.commands
                .load_commands(&read_json_file(path)?, category)?;
        }
        Ok(())
    }

    pub fn add_base_commands_from_json(&self, json: &str) -> Result<()> {
        self.commands.load_base_commands(&parse_json(json)?)
    }

    pub fn add_command_handler(&self, name: &str, handler: CommandHandler) {
        self.commands.add_command_handler(name, handler);
    }

    pub fn add_command_from_json(&self, json: &str, origin: CommandOrigin) -> Result<String> {
        self.commands.add_command(&parse_json(json)?, origin)
    }

    pub fn find_command(&self, id: &str) -> Option<CommandInstance> {
        self.commands.find_command(id)
    }

    pub fn command_handle(&self, id: &str) -> CommandHandle {
        self.commands.handle(id)
    }

    pub fn add_on_command_added_callback(&self, callback: CommandObserver) {
        self.commands.add_on_command_added_callback(callback);
    }

    pub fn add_on_command_removed_callback(&self, callback: CommandObserver) {
        self.commands.add_on_command_removed_callback(callback);
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn add_state_definitions_from_json(&self, json: &str) -> Result<()> {
        self.state.add_state_definitions(&parse_json(json)?)
    }

    pub fn set_state_property(&self, name: &str, value: &Value) -> Result<()> {
        self.state.set_property(name, value)
    }

    pub fn set_state_properties_from_json(&self, json: &str) -> Result<()> {
        self.state.set_properties(&parse_json(json)?)
    }

    pub fn get_state_property(&self, name: &str) -> Option<PropValue> {
        self.state.get_property(name)
    }

    pub fn get_state(&self) -> Value {
        self.state.get_state()
    }

    pub fn add_state_changed_callback(&self, callback: StateChangedCallback) {
        self.state.add_changed_callback(callback);
    }

    // =========================================================================
    // Cloud
    // =========================================================================

    pub async fn start_registration(&self, params: &Value) -> Result<RegistrationTicket> {
        self.agent.start_registration(params).await
    }

    pub async fn finish_registration(&self, user_auth_code: Option<&str>) -> Result<()> {
        self.agent.finish_registration(user_auth_code).await
    }

    pub fn gcd_state(&self) -> GcdState {
        self.agent.gcd_state()
    }

    pub fn add_gcd_state_changed_callback(&self, callback: GcdStateChangedCallback) {
        self.agent.add_gcd_state_changed_callback(callback);
    }

    /// Direct access for embedders with needs beyond the facade.
    pub fn command_manager(&self) -> &CommandManager {
        &self.commands
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    pub fn cloud_agent(&self) -> &Arc<CloudAgent> {
        &self.agent
    }
}

fn parse_json(json: &str) -> Result<Value> {
    serde_json::from_str(json).map_err(Error::from)
}

fn read_json_file(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::new(
            errors::file_system::DOMAIN,
            errors::file_system::FILE_READ_ERROR,
            format!("cannot read '{}': {e}", path.display()),
        )
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        Error::from(e).wrap(
            errors::json::DOMAIN,
            errors::json::PARSE_ERROR,
            format!("error parsing '{}'", path.display()),
        )
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
