//! # Agent Tuning Settings
//!
//! Knobs for the cloud loops, deserialized from the `settings` section
//! of the factory defaults document when the image ships one.
//!
//! ## Settings Document
//! ```json
//! {
//!   "settings": {
//!     "cloud_enabled": true,
//!     "poll_interval_secs": 7,
//!     "state_push_interval_secs": 7,
//!     "token_expiry_skew_secs": 60,
//!     "finalize_max_attempts": 60,
//!     "finalize_retry_interval_secs": 1,
//!     "initial_backoff_ms": 500,
//!     "max_backoff_secs": 60,
//!     "state_change_queue_capacity": 100,
//!     "command_ttl_secs": null
//!   }
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// How many finalize attempts a registration must survive before the
/// agent reports the ticket as unapproved.
const MIN_FINALIZE_ATTEMPTS: u32 = 30;

/// Cloud-loop tuning for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Master switch. When off the agent parks in the Disabled state and
    /// never touches the network.
    #[serde(default = "default_true")]
    pub cloud_enabled: bool,

    /// Command queue poll period. A `pollingIntervalMs` reported by the
    /// cloud overrides it at runtime.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// State delta upload period.
    #[serde(default = "default_push_interval")]
    pub state_push_interval_secs: u64,

    /// Margin subtracted from the access token expiry before a refresh
    /// is considered due.
    #[serde(default = "default_token_skew")]
    pub token_expiry_skew_secs: u64,

    /// Finalize attempts before giving up on a registration ticket.
    /// Values below 30 are raised to 30.
    #[serde(default = "default_finalize_attempts")]
    pub finalize_max_attempts: u32,

    /// Spacing between finalize attempts.
    #[serde(default = "default_finalize_interval")]
    pub finalize_retry_interval_secs: u64,

    /// First retry delay after a transient cloud failure.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Entries the state change journal holds before folding the oldest.
    #[serde(default = "default_queue_capacity")]
    pub state_change_queue_capacity: usize,

    /// Lifetime of a queued command. `None` means commands never expire.
    #[serde(default)]
    pub command_ttl_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    7
}
fn default_push_interval() -> u64 {
    7
}
fn default_token_skew() -> u64 {
    60
}
fn default_finalize_attempts() -> u32 {
    60
}
fn default_finalize_interval() -> u64 {
    1
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_queue_capacity() -> usize {
    100
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            cloud_enabled: default_true(),
            poll_interval_secs: default_poll_interval(),
            state_push_interval_secs: default_push_interval(),
            token_expiry_skew_secs: default_token_skew(),
            finalize_max_attempts: default_finalize_attempts(),
            finalize_retry_interval_secs: default_finalize_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            state_change_queue_capacity: default_queue_capacity(),
            command_ttl_secs: None,
        }
    }
}

impl SyncSettings {
    /// Reads the `settings` section of the factory defaults document,
    /// falling back to defaults for anything missing or malformed.
    pub fn from_defaults(defaults: Option<&Value>) -> SyncSettings {
        let settings = defaults
            .and_then(|d| d.get("settings"))
            .cloned()
            .and_then(|section| match serde_json::from_value(section) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    warn!(%err, "malformed settings section, using defaults");
                    None
                }
            })
            .unwrap_or_default();
        SyncSettings::normalized(settings)
    }

    /// Clamps out-of-range values instead of refusing to start.
    fn normalized(mut self) -> SyncSettings {
        if self.finalize_max_attempts < MIN_FINALIZE_ATTEMPTS {
            warn!(
                requested = self.finalize_max_attempts,
                floor = MIN_FINALIZE_ATTEMPTS,
                "finalize_max_attempts raised to the floor"
            );
            self.finalize_max_attempts = MIN_FINALIZE_ATTEMPTS;
        }
        self.poll_interval_secs = self.poll_interval_secs.max(1);
        self.state_push_interval_secs = self.state_push_interval_secs.max(1);
        self.state_change_queue_capacity = self.state_change_queue_capacity.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.state_push_interval_secs)
    }

    pub fn token_expiry_skew(&self) -> Duration {
        Duration::from_secs(self.token_expiry_skew_secs)
    }

    pub fn finalize_retry_interval(&self) -> Duration {
        Duration::from_secs(self.finalize_retry_interval_secs)
    }

    pub fn command_ttl(&self) -> Option<chrono::Duration> {
        self.command_ttl_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::from_defaults(None);
        assert!(settings.cloud_enabled);
        assert_eq!(settings.poll_interval_secs, 7);
        assert_eq!(settings.state_change_queue_capacity, 100);
        assert!(settings.command_ttl().is_none());
    }

    #[test]
    fn test_settings_section_overrides() {
        let defaults = json!({
            "settings": {"poll_interval_secs": 30, "command_ttl_secs": 120}
        });
        let settings = SyncSettings::from_defaults(Some(&defaults));
        assert_eq!(settings.poll_interval_secs, 30);
        assert_eq!(settings.command_ttl(), Some(chrono::Duration::seconds(120)));
        // Untouched knobs keep their defaults.
        assert_eq!(settings.state_push_interval_secs, 7);
    }

    #[test]
    fn test_finalize_attempts_floor() {
        let defaults = json!({"settings": {"finalize_max_attempts": 3}});
        let settings = SyncSettings::from_defaults(Some(&defaults));
        assert_eq!(settings.finalize_max_attempts, 30);
    }

    #[test]
    fn test_malformed_section_falls_back() {
        let defaults = json!({"settings": {"poll_interval_secs": "fast"}});
        let settings = SyncSettings::from_defaults(Some(&defaults));
        assert_eq!(settings.poll_interval_secs, 7);
    }
}
