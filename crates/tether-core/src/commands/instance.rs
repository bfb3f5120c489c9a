//! Live command invocations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::commands::CommandDefinition;
use crate::error::{errors, Error, Result};
use crate::schema::ObjectValue;

// =============================================================================
// Origin and Status
// =============================================================================

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    /// Received over the local HTTP surface.
    Local,
    /// Fetched from the cloud command queue.
    Cloud,
}

impl CommandOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOrigin::Local => "local",
            CommandOrigin::Cloud => "cloud",
        }
    }
}

/// Lifecycle state of a command instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Queued,
    InProgress,
    Paused,
    Error,
    Done,
    Cancelled,
    Aborted,
    Expired,
}

impl CommandStatus {
    /// The wire spelling used by the cloud service.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::InProgress => "inProgress",
            CommandStatus::Paused => "paused",
            CommandStatus::Error => "error",
            CommandStatus::Done => "done",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Aborted => "aborted",
            CommandStatus::Expired => "expired",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Done
                | CommandStatus::Cancelled
                | CommandStatus::Aborted
                | CommandStatus::Expired
        )
    }

    fn can_transition(&self, to: CommandStatus) -> bool {
        use CommandStatus::*;
        match (self, to) {
            // Cancel, abort, and expiry reach every non-terminal state.
            (from, Cancelled | Aborted | Expired) => !from.is_terminal(),
            (Queued, InProgress) => true,
            (InProgress, Paused | Done | Error) => true,
            (Paused | Error, InProgress) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CommandInstance
// =============================================================================

/// One queued or running command. Owned by the command manager; everyone
/// else refers to it by id.
#[derive(Debug, Clone)]
pub struct CommandInstance {
    id: String,
    name: String,
    origin: CommandOrigin,
    definition: Arc<CommandDefinition>,
    parameters: ObjectValue,
    progress: ObjectValue,
    results: ObjectValue,
    status: CommandStatus,
    error: Option<Error>,
    created_at: DateTime<Utc>,
}

impl CommandInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        origin: CommandOrigin,
        definition: Arc<CommandDefinition>,
        parameters: ObjectValue,
    ) -> Self {
        CommandInstance {
            id: id.into(),
            name: name.into(),
            origin,
            definition,
            parameters,
            progress: ObjectValue::new(),
            results: ObjectValue::new(),
            status: CommandStatus::Queued,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        self.definition.category()
    }

    pub fn origin(&self) -> CommandOrigin {
        self.origin
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn parameters(&self) -> &ObjectValue {
        &self.parameters
    }

    pub fn progress(&self) -> &ObjectValue {
        &self.progress
    }

    pub fn results(&self) -> &ObjectValue {
        &self.results
    }

    /// The error attached by `abort` or `fail`, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // =========================================================================
    // Lifecycle Transitions
    // =========================================================================

    /// Queued to InProgress, performed by the manager at dispatch.
    pub fn start(&mut self) -> Result<()> {
        self.transition(CommandStatus::InProgress)
    }

    pub fn pause(&mut self) -> Result<()> {
        self.transition(CommandStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.transition(CommandStatus::InProgress)
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(CommandStatus::Cancelled)
    }

    pub fn expire(&mut self) -> Result<()> {
        self.transition(CommandStatus::Expired)
    }

    /// Validates `progress` against the progress schema and stores it.
    /// A validation failure leaves the command untouched.
    pub fn set_progress(&mut self, progress: &Value) -> Result<()> {
        if self.status != CommandStatus::InProgress {
            return Err(Error::new(
                errors::commands::DOMAIN,
                errors::commands::INVALID_STATE_TRANSITION,
                format!(
                    "command '{}' is {}, progress can only be reported while inProgress",
                    self.id, self.status
                ),
            ));
        }
        self.progress = self.definition.progress().object_from_json(progress)?;
        Ok(())
    }

    /// Validates `results` against the results schema, stores it, and
    /// moves the command to Done. A validation failure leaves the
    /// command untouched.
    pub fn complete(&mut self, results: &Value) -> Result<()> {
        let results = self.definition.results().object_from_json(results)?;
        self.transition(CommandStatus::Done)?;
        self.results = results;
        Ok(())
    }

    /// Moves the command to Aborted with the handler's error attached.
    pub fn abort(&mut self, error: Error) -> Result<()> {
        self.transition(CommandStatus::Aborted)?;
        self.error = Some(error);
        Ok(())
    }

    /// Marks a recoverable failure: the command enters the Error state
    /// but stays alive and can be resumed, cancelled, or aborted.
    pub fn fail(&mut self, error: Error) -> Result<()> {
        self.transition(CommandStatus::Error)?;
        self.error = Some(error);
        Ok(())
    }

    fn transition(&mut self, to: CommandStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(self.transition_error(to));
        }
        self.status = to;
        Ok(())
    }

    fn transition_error(&self, to: CommandStatus) -> Error {
        Error::new(
            errors::commands::DOMAIN,
            errors::commands::INVALID_STATE_TRANSITION,
            format!(
                "command '{}' cannot transition from {} to {}",
                self.id, self.status, to
            ),
        )
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// The JSON rendition used by observers and the local surface.
    /// Objects are emitted in schema declaration order.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "state": self.status.as_str(),
            "parameters": self.definition.parameters().object_to_json(&self.parameters),
            "progress": self.definition.progress().object_to_json(&self.progress),
            "results": self.definition.results().object_to_json(&self.results),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn countdown_command() -> CommandInstance {
        let definition = Arc::new(
            CommandDefinition::from_json(
                &json!({
                    "parameters": {"seconds": {"minimum": 1, "maximum": 60}},
                    "progress": {"remaining": {"minimum": 0, "maximum": 60}},
                    "results": {"elapsed": "integer"}
                }),
                "timer",
            )
            .unwrap(),
        );
        let parameters = definition
            .parameters()
            .object_from_json(&json!({"seconds": 10}))
            .unwrap();
        CommandInstance::new("1", "timer.countdown", CommandOrigin::Local, definition, parameters)
    }

    #[test]
    fn test_happy_path_to_done() {
        let mut cmd = countdown_command();
        assert_eq!(cmd.status(), CommandStatus::Queued);

        cmd.start().unwrap();
        cmd.set_progress(&json!({"remaining": 5})).unwrap();
        cmd.complete(&json!({"elapsed": 10})).unwrap();

        assert_eq!(cmd.status(), CommandStatus::Done);
        assert!(cmd.status().is_terminal());
        assert_eq!(
            cmd.to_json()["results"],
            json!({"elapsed": 10})
        );
    }

    #[test]
    fn test_pause_and_resume() {
        let mut cmd = countdown_command();
        cmd.start().unwrap();
        cmd.pause().unwrap();
        assert_eq!(cmd.status(), CommandStatus::Paused);
        cmd.resume().unwrap();
        assert_eq!(cmd.status(), CommandStatus::InProgress);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut cmd = countdown_command();
        cmd.cancel().unwrap();
        let err = cmd.start().unwrap_err();
        assert_eq!(err.code(), "invalid_state_transition");
        assert!(cmd.expire().is_err());
    }

    #[test]
    fn test_invalid_progress_leaves_command_unchanged() {
        let mut cmd = countdown_command();
        cmd.start().unwrap();
        cmd.set_progress(&json!({"remaining": 7})).unwrap();

        let err = cmd.set_progress(&json!({"remaining": 99})).unwrap_err();
        assert_eq!(err.code(), "invalid_parameter_value");
        assert_eq!(cmd.progress().get("remaining").unwrap().as_integer(), Some(7));
        assert_eq!(cmd.status(), CommandStatus::InProgress);
    }

    #[test]
    fn test_invalid_results_do_not_complete() {
        let mut cmd = countdown_command();
        cmd.start().unwrap();
        let err = cmd.complete(&json!({"elapsed": "ten"})).unwrap_err();
        assert_eq!(err.code(), "invalid_parameter_value");
        assert_eq!(cmd.status(), CommandStatus::InProgress);
    }

    #[test]
    fn test_abort_attaches_error_chain() {
        let mut cmd = countdown_command();
        cmd.start().unwrap();
        cmd.abort(Error::new("example", "hardware_fault", "led driver offline"))
            .unwrap();
        assert_eq!(cmd.status(), CommandStatus::Aborted);
        assert_eq!(cmd.error().map(|e| e.code()), Some("hardware_fault"));
    }

    #[test]
    fn test_fail_is_recoverable() {
        let mut cmd = countdown_command();
        cmd.start().unwrap();
        cmd.fail(Error::new("example", "busy", "retry later")).unwrap();
        assert_eq!(cmd.status(), CommandStatus::Error);
        assert!(!cmd.status().is_terminal());
        cmd.resume().unwrap();
        assert_eq!(cmd.status(), CommandStatus::InProgress);
    }

    #[test]
    fn test_progress_requires_in_progress() {
        let mut cmd = countdown_command();
        let err = cmd.set_progress(&json!({"remaining": 5})).unwrap_err();
        assert_eq!(err.code(), "invalid_state_transition");
    }
}
