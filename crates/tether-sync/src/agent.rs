//! # Cloud Agent
//!
//! The orchestrator of the device's cloud life: it owns the registration
//! record, the access token, and the connection state, performs the
//! registration handshake, and runs the command poll / state push loops.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CloudAgent Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                          CloudAgent                              │  │
//! │  │                                                                  │  │
//! │  │  • GcdState machine + observers                                  │  │
//! │  │  • RegistrationData (persisted via ConfigStore)                  │  │
//! │  │  • AccessToken cache (singleflight refresh)                      │  │
//! │  │  • Re-arming poll / push / expiry tasks on the TaskRunner        │  │
//! │  └────────────┬──────────────────┬──────────────────┬───────────────┘  │
//! │               ▼                  ▼                  ▼                   │
//! │  ┌────────────────┐   ┌────────────────┐   ┌────────────────────────┐  │
//! │  │  PollCommands  │   │   PushState    │   │  Registration          │  │
//! │  │                │   │                │   │  handshake             │  │
//! │  │ GET command    │   │ drain change   │   │  ticket → auth URL →   │  │
//! │  │ queue, feed    │   │ journal, PATCH │   │  finalize retries →    │  │
//! │  │ CommandManager │   │ patchState     │   │  robot token exchange  │  │
//! │  └────────────────┘   └────────────────┘   └────────────────────────┘  │
//! │                                                                         │
//! │  STATE TRANSITIONS                                                      │
//! │  ─────────────────                                                      │
//! │  no record on disk           → Unconfigured                             │
//! │  cloud_enabled = false       → Disabled                                 │
//! │  record loaded, connecting   → Connecting (backoff on transient)        │
//! │  token refreshed / finalized → Connected                                │
//! │  oauth invalid_grant         → Invalid (cloud calls fail fast)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use tether_core::commands::CommandOrigin;
use tether_core::error::{errors, Error, Result};
use tether_core::PropValue;
use tether_device::change_queue::StateChange;
use tether_device::{
    CommandManager, ConfigStore, HttpClient, Network, NetworkState, StateManager, TaskRunner,
};

use crate::auth::{self, AccessToken, AUTH_SCHEME, CLOUD_DEVICES_SCOPE};
use crate::http;
use crate::registration::RegistrationData;
use crate::settings::SyncSettings;

/// Out-of-band redirect URI used during the registration code exchange.
pub const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

// =============================================================================
// GcdState
// =============================================================================

/// The agent's cloud-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcdState {
    /// No usable registration record on disk.
    Unconfigured,
    /// Trying to reach the cloud, retrying transients with backoff.
    Connecting,
    /// Registered, token valid, loops running.
    Connected,
    /// Cloud access switched off in settings.
    Disabled,
    /// Credentials revoked; every cloud call fails fast.
    Invalid,
}

impl std::fmt::Display for GcdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GcdState::Unconfigured => "unconfigured",
            GcdState::Connecting => "connecting",
            GcdState::Connected => "connected",
            GcdState::Disabled => "disabled",
            GcdState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Observer invoked with the new state after every transition.
pub type GcdStateChangedCallback = Arc<dyn Fn(GcdState) + Send + Sync>;

/// What the registration handshake hands back to the pairing flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTicket {
    pub ticket_id: String,
    pub auth_url: String,
}

// =============================================================================
// Failure Classification
// =============================================================================

/// What a failed cloud call means for the loop that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// Transient; retry with backoff.
    Retry,
    /// Permanent for this request, but the connection is fine.
    Abort,
    /// Credentials are bad; stop talking to the cloud.
    Invalidate,
}

impl FailureAction {
    fn classify(err: &Error) -> FailureAction {
        if err.has_error(errors::oauth::DOMAIN, errors::oauth::INVALID_GRANT) {
            return FailureAction::Invalidate;
        }
        let retryable = [
            errors::http::CONNECTION_ERROR,
            errors::http::TIMEOUT,
            errors::http::STATUS_5XX,
            errors::http::TOO_MANY_REQUESTS,
        ];
        if retryable
            .iter()
            .any(|code| err.has_error(errors::http::DOMAIN, code))
        {
            return FailureAction::Retry;
        }
        // Any other definitive answer from the OAuth endpoint means the
        // client configuration is bad, not the network.
        if err.domain() == errors::oauth::DOMAIN
            && err.code() != errors::oauth::UNEXPECTED_RESPONSE
        {
            return FailureAction::Invalidate;
        }
        FailureAction::Abort
    }
}

// =============================================================================
// CloudAgent
// =============================================================================

struct GcdStateCell {
    state: GcdState,
    observers: Vec<GcdStateChangedCallback>,
}

/// See the module documentation.
pub struct CloudAgent {
    settings: SyncSettings,
    config_store: Arc<dyn ConfigStore>,
    http: Arc<dyn HttpClient>,
    task_runner: Arc<dyn TaskRunner>,
    network: Option<Arc<dyn Network>>,
    commands: CommandManager,
    state: StateManager,

    registration: RwLock<RegistrationData>,
    token: RwLock<Option<AccessToken>>,
    gcd: Mutex<GcdStateCell>,
    poll_interval: Mutex<Duration>,

    connect_backoff: Mutex<ExponentialBackoff>,
    poll_backoff: Mutex<ExponentialBackoff>,
    push_backoff: Mutex<ExponentialBackoff>,
}

impl CloudAgent {
    pub fn new(
        settings: SyncSettings,
        config_store: Arc<dyn ConfigStore>,
        http: Arc<dyn HttpClient>,
        task_runner: Arc<dyn TaskRunner>,
        network: Option<Arc<dyn Network>>,
        commands: CommandManager,
        state: StateManager,
    ) -> Arc<Self> {
        let poll_interval = settings.poll_interval();
        let make_backoff = || ExponentialBackoff {
            initial_interval: Duration::from_millis(settings.initial_backoff_ms),
            max_interval: Duration::from_secs(settings.max_backoff_secs),
            // Full randomization so a fleet recovering from an outage
            // does not stampede the service in lockstep.
            randomization_factor: 1.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        Arc::new(CloudAgent {
            connect_backoff: Mutex::new(make_backoff()),
            poll_backoff: Mutex::new(make_backoff()),
            push_backoff: Mutex::new(make_backoff()),
            settings,
            config_store,
            http,
            task_runner,
            network,
            commands,
            state,
            registration: RwLock::new(RegistrationData::default()),
            token: RwLock::new(None),
            gcd: Mutex::new(GcdStateCell {
                state: GcdState::Unconfigured,
                observers: Vec::new(),
            }),
            poll_interval: Mutex::new(poll_interval),
        })
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Loads the persisted registration record and begins connecting if
    /// it is complete. Safe to call exactly once, right after
    /// construction.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.settings.cloud_enabled {
            info!("cloud access disabled by settings");
            self.set_gcd_state(GcdState::Disabled);
            return Ok(());
        }

        match RegistrationData::load(self.config_store.as_ref())? {
            None => {
                info!("no registration record, waiting for registration");
                self.set_gcd_state(GcdState::Unconfigured);
            }
            Some(registration) => {
                let complete = registration.is_complete();
                *self.registration.write().await = registration;
                if complete {
                    info!("registration record found, connecting");
                    self.set_gcd_state(GcdState::Connecting);
                    self.watch_network();
                    self.schedule_connect(Duration::ZERO);
                } else {
                    info!("registration record is incomplete, waiting for registration");
                    self.set_gcd_state(GcdState::Unconfigured);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // GcdState
    // =========================================================================

    pub fn gcd_state(&self) -> GcdState {
        self.gcd.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn add_gcd_state_changed_callback(&self, callback: GcdStateChangedCallback) {
        let state = {
            let mut cell = self.gcd.lock().unwrap_or_else(PoisonError::into_inner);
            cell.observers.push(callback.clone());
            cell.state
        };
        // New observers hear the current state right away.
        callback(state);
    }

    fn set_gcd_state(&self, state: GcdState) {
        let observers = {
            let mut cell = self.gcd.lock().unwrap_or_else(PoisonError::into_inner);
            if cell.state == state {
                return;
            }
            info!(from = %cell.state, to = %state, "connection state changed");
            cell.state = state;
            cell.observers.clone()
        };
        for observer in observers {
            observer(state);
        }
    }

    fn network_online(&self) -> bool {
        self.network
            .as_ref()
            .map_or(true, |n| n.connection_state() == NetworkState::Online)
    }

    fn watch_network(self: &Arc<Self>) {
        let Some(network) = &self.network else {
            return;
        };
        let weak = Arc::downgrade(self);
        network.add_connection_changed_callback(Arc::new(move || {
            if let Some(agent) = weak.upgrade() {
                if agent.gcd_state() == GcdState::Connecting && agent.network_online() {
                    debug!("network is back, reconnecting");
                    agent.schedule_connect(Duration::ZERO);
                }
            }
        }));
    }

    // =========================================================================
    // Access Token
    // =========================================================================

    /// Returns a valid access token, refreshing it when it is within
    /// the expiry skew. Concurrent callers share one in-flight refresh:
    /// the write lock is held across the request, and late arrivals
    /// find the fresh token on the double-check.
    pub async fn access_token(&self) -> Result<String> {
        let skew = self.settings.token_expiry_skew();
        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref() {
                if token.is_fresh(skew) {
                    return Ok(token.secret().to_string());
                }
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh(skew) {
                return Ok(token.secret().to_string());
            }
        }

        if self.gcd_state() == GcdState::Invalid {
            return Err(Error::new(
                errors::oauth::DOMAIN,
                errors::oauth::INVALID_GRANT,
                "cloud credentials are revoked",
            ));
        }

        let registration = self.registration.read().await.clone();
        if registration.refresh_token.is_empty() {
            return Err(Error::new(
                errors::registration::DOMAIN,
                errors::registration::PARAMETER_MISSING,
                "device holds no refresh token, register it first",
            ));
        }

        match auth::refresh_access_token(self.http.as_ref(), &registration).await {
            Ok(token) => {
                let secret = token.secret().to_string();
                *guard = Some(token);
                Ok(secret)
            }
            Err(err) => {
                if err.has_error(errors::oauth::DOMAIN, errors::oauth::INVALID_GRANT) {
                    error!("refresh token revoked by the cloud");
                    self.set_gcd_state(GcdState::Invalid);
                }
                Err(err)
            }
        }
    }

    // =========================================================================
    // Registration Handshake
    // =========================================================================

    /// Creates a registration ticket for this device and returns the
    /// URL the user must visit to approve it.
    pub async fn start_registration(&self, params: &Value) -> Result<RegistrationTicket> {
        let mut registration = self.registration.write().await;
        if registration.is_complete() {
            return Err(Error::new(
                errors::registration::DOMAIN,
                errors::registration::ALREADY_REGISTERED,
                "device is already registered",
            ));
        }
        registration.apply_params(params)?;

        let vendor_commands: Vec<Value> = self
            .commands
            .dictionary()
            .iter()
            .map(|(name, definition)| {
                json!({
                    "name": name,
                    "parameter": definition
                        .parameters()
                        .props()
                        .map(|(param, _)| json!({"name": param}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        let draft = json!({
            "oauthClientId": registration.client_id,
            "deviceDraft": {
                "deviceKind": registration.device_kind,
                "systemName": registration.system_name,
                "displayName": registration.display_name,
                "channel": {"supportedType": "xmpp"},
                "commands": {"base": {"vendorCommands": vendor_commands}},
            },
        });

        let url = http::build_url(
            &registration.service_url,
            "registrationTickets",
            &[("key", &registration.api_key)],
        );
        info!(system_name = %registration.system_name, "requesting registration ticket");
        let (status, response) = http::post_json(self.http.as_ref(), &url, &[], &draft).await?;
        if !(200..300).contains(&status) {
            return Err(http::status_error(status));
        }

        let ticket_id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    errors::registration::DOMAIN,
                    errors::registration::TICKET_NOT_FOUND,
                    "registration ticket response carries no id",
                )
            })?
            .to_string();
        registration.ticket_id = ticket_id.clone();

        let auth_url = http::build_url(
            &registration.oauth_url,
            "auth",
            &[
                ("scope", CLOUD_DEVICES_SCOPE),
                ("redirect_uri", OOB_REDIRECT_URI),
                ("response_type", "code"),
                ("client_id", &registration.client_id),
            ],
        );
        Ok(RegistrationTicket { ticket_id, auth_url })
    }

    /// Completes the handshake: binds the approving user when a code is
    /// supplied, finalizes the ticket (the cloud answers 400 until the
    /// user approves), exchanges the robot account code for tokens, and
    /// persists the finished record.
    pub async fn finish_registration(
        self: &Arc<Self>,
        user_auth_code: Option<&str>,
    ) -> Result<()> {
        let registration = self.registration.read().await.clone();
        if registration.ticket_id.is_empty() {
            return Err(Error::new(
                errors::registration::DOMAIN,
                errors::registration::TICKET_NOT_FOUND,
                "no registration in progress",
            ));
        }

        let ticket_path = format!("registrationTickets/{}", registration.ticket_id);
        if let Some(code) = user_auth_code {
            let grant = auth::exchange_authorization_code(
                self.http.as_ref(),
                &registration,
                code,
                OOB_REDIRECT_URI,
                None,
            )
            .await?;
            let url = http::build_url(&registration.service_url, &ticket_path, &[]);
            let (status, _) = http::patch_json(
                self.http.as_ref(),
                &url,
                &[(
                    "Authorization".to_string(),
                    format!("Bearer {}", grant.access_token),
                )],
                &json!({"userEmail": "me"}),
            )
            .await?;
            if !(200..300).contains(&status) {
                return Err(http::status_error(status));
            }
        }

        let finalize_url = http::build_url(
            &registration.service_url,
            &format!("{ticket_path}/finalize"),
            &[("key", &registration.api_key)],
        );
        let response = self.finalize_ticket(&finalize_url).await?;

        let robot_account = response
            .get("robotAccountEmail")
            .and_then(Value::as_str)
            .map(str::to_string);
        let robot_auth_code = response
            .get("robotAccountAuthorizationCode")
            .and_then(Value::as_str)
            .map(str::to_string);
        let device_id = response
            .pointer("/deviceDraft/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(robot_account), Some(robot_auth_code), Some(device_id)) =
            (robot_account, robot_auth_code, device_id)
        else {
            return Err(Error::new(
                errors::registration::DOMAIN,
                errors::registration::TICKET_NOT_FOUND,
                "finalized ticket is missing the robot account or device id",
            ));
        };

        let grant = auth::exchange_authorization_code(
            self.http.as_ref(),
            &registration,
            &robot_auth_code,
            "oob",
            Some(CLOUD_DEVICES_SCOPE),
        )
        .await?;
        let refresh_token = grant.refresh_token.ok_or_else(|| {
            Error::new(
                errors::oauth::DOMAIN,
                errors::oauth::UNEXPECTED_RESPONSE,
                "robot account exchange returned no refresh token",
            )
        })?;

        {
            let mut stored = self.registration.write().await;
            stored.refresh_token = refresh_token;
            stored.device_id = device_id.clone();
            stored.robot_account = robot_account;
            stored.ticket_id.clear();
            stored.save(self.config_store.as_ref())?;
        }
        *self.token.write().await =
            Some(AccessToken::new(grant.access_token, grant.expires_in));

        info!(device_id = %device_id, "device registered");
        self.set_gcd_state(GcdState::Connected);
        self.start_cloud_loops();
        Ok(())
    }

    /// Polls the finalize endpoint until the user approves the ticket.
    async fn finalize_ticket(&self, url: &str) -> Result<Value> {
        for attempt in 1..=self.settings.finalize_max_attempts {
            let (status, response) = http::post_empty(self.http.as_ref(), url, &[]).await?;
            match status {
                400 => {
                    debug!(attempt, "ticket not approved yet");
                    self.task_runner
                        .sleep(self.settings.finalize_retry_interval())
                        .await;
                }
                status if (200..300).contains(&status) => return Ok(response),
                status => return Err(http::status_error(status)),
            }
        }
        Err(Error::new(
            errors::registration::DOMAIN,
            errors::registration::TICKET_NOT_APPROVED,
            format!(
                "registration ticket was not approved after {} attempts",
                self.settings.finalize_max_attempts
            ),
        ))
    }

    // =========================================================================
    // URL Composition
    // =========================================================================

    pub async fn get_service_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        http::build_url(&self.registration.read().await.service_url, subpath, params)
    }

    pub async fn get_oauth_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        http::build_url(&self.registration.read().await.oauth_url, subpath, params)
    }

    /// `${service}/devices/${deviceId}[/subpath][?params]`.
    pub async fn get_device_url(&self, subpath: &str, params: &[(&str, &str)]) -> Result<String> {
        let registration = self.registration.read().await;
        device_url(&registration, subpath, params)
    }

    // =========================================================================
    // Cloud Calls
    // =========================================================================

    /// Fetches the cloud's view of this device.
    pub async fn get_device_info(&self) -> Result<Value> {
        let token = self.access_token().await?;
        let registration = self.registration.read().await.clone();
        let url = device_url(&registration, "", &[])?;
        let (status, json) =
            http::get_json(self.http.as_ref(), &url, &[authorization_header(&token)]).await?;
        if !(200..300).contains(&status) {
            return Err(http::status_error(status));
        }
        Ok(json)
    }

    /// One command-queue poll: fetches pending commands and feeds them
    /// to the command manager with cloud origin.
    pub async fn poll_commands(&self) -> Result<()> {
        let token = self.access_token().await?;
        let registration = self.registration.read().await.clone();
        let url = device_url(
            &registration,
            "commandQueue",
            &[("deviceId", registration.device_id.as_str())],
        )?;
        let (status, response) =
            http::get_json(self.http.as_ref(), &url, &[authorization_header(&token)]).await?;
        if !(200..300).contains(&status) {
            return Err(http::status_error(status));
        }

        if let Some(interval_ms) = response.get("pollingIntervalMs").and_then(Value::as_u64) {
            *self
                .poll_interval
                .lock()
                .unwrap_or_else(PoisonError::into_inner) =
                Duration::from_millis(interval_ms.max(1000));
        }

        let commands = response
            .get("commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(count = commands.len(), "command queue polled");
        for command in &commands {
            match self.commands.add_command(command, CommandOrigin::Cloud) {
                Ok(id) => debug!(id = %id, "cloud command queued"),
                Err(err)
                    if err.code() == errors::commands::DUPLICATE_COMMAND_ID =>
                {
                    // Still pending from an earlier poll.
                    debug!(%err, "skipping command already in the queue");
                }
                Err(err) => warn!(%err, "dropping malformed cloud command"),
            }
        }
        Ok(())
    }

    /// One state push: drains the change journal and PATCHes the deltas
    /// to the cloud. On failure the drained changes go back into the
    /// journal for the next attempt.
    pub async fn push_state(&self) -> Result<()> {
        let changes = self.state.get_and_clear_recorded_state_changes();
        if changes.is_empty() {
            return Ok(());
        }
        debug!(count = changes.len(), "pushing state changes");
        match self.push_changes(&changes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.restore_changes(changes);
                Err(err)
            }
        }
    }

    async fn push_changes(&self, changes: &[StateChange]) -> Result<()> {
        let token = self.access_token().await?;
        let registration = self.registration.read().await.clone();
        let url = device_url(&registration, "patchState", &[])?;

        let patches: Vec<Value> = changes
            .iter()
            .map(|change| {
                json!({
                    "timeMs": change.timestamp.timestamp_millis(),
                    "patch": nest_by_package(&change.changed),
                })
            })
            .collect();
        let body = json!({
            "requestTimeMs": Utc::now().timestamp_millis(),
            "patches": patches,
        });

        let (status, _) = http::patch_json(
            self.http.as_ref(),
            &url,
            &[authorization_header(&token)],
            &body,
        )
        .await?;
        if !(200..300).contains(&status) {
            return Err(http::status_error(status));
        }
        Ok(())
    }

    // =========================================================================
    // Connection and Loops
    // =========================================================================

    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.task_runner.post_delayed(
            delay,
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.connect_cycle().await;
                }
            }),
        );
    }

    async fn connect_cycle(self: &Arc<Self>) {
        if self.gcd_state() != GcdState::Connecting {
            return;
        }
        if !self.network_online() {
            let delay = next_delay(&self.connect_backoff, &self.settings);
            debug!(?delay, "network offline, deferring connect");
            self.schedule_connect(delay);
            return;
        }
        match self.access_token().await {
            Ok(_) => {
                info!("connected to the cloud");
                reset(&self.connect_backoff);
                self.set_gcd_state(GcdState::Connected);
                self.start_cloud_loops();
            }
            Err(err) => match FailureAction::classify(&err) {
                FailureAction::Invalidate => {
                    error!(%err, "cloud rejected our credentials");
                    self.set_gcd_state(GcdState::Invalid);
                }
                FailureAction::Retry | FailureAction::Abort => {
                    let delay = next_delay(&self.connect_backoff, &self.settings);
                    warn!(%err, ?delay, "connect failed, will retry");
                    self.schedule_connect(delay);
                }
            },
        }
    }

    fn start_cloud_loops(self: &Arc<Self>) {
        self.schedule_poll(Duration::ZERO);
        self.schedule_push(self.settings.push_interval());
        if let Some(ttl) = self.settings.command_ttl() {
            self.schedule_command_expiry(ttl);
        }
    }

    fn schedule_poll(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.task_runner.post_delayed(
            delay,
            Box::pin(async move {
                let Some(agent) = weak.upgrade() else {
                    return;
                };
                if let Some(next) = agent.poll_cycle().await {
                    agent.schedule_poll(next);
                }
            }),
        );
    }

    async fn poll_cycle(self: &Arc<Self>) -> Option<Duration> {
        if self.gcd_state() != GcdState::Connected {
            return None;
        }
        if !self.network_online() {
            return Some(self.current_poll_interval());
        }
        match self.poll_commands().await {
            Ok(()) => {
                reset(&self.poll_backoff);
                Some(self.current_poll_interval())
            }
            Err(err) => self.handle_loop_failure(err, &self.poll_backoff, "command poll"),
        }
    }

    fn schedule_push(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.task_runner.post_delayed(
            delay,
            Box::pin(async move {
                let Some(agent) = weak.upgrade() else {
                    return;
                };
                if let Some(next) = agent.push_cycle().await {
                    agent.schedule_push(next);
                }
            }),
        );
    }

    async fn push_cycle(self: &Arc<Self>) -> Option<Duration> {
        if self.gcd_state() != GcdState::Connected {
            return None;
        }
        if !self.network_online() {
            return Some(self.settings.push_interval());
        }
        match self.push_state().await {
            Ok(()) => {
                reset(&self.push_backoff);
                Some(self.settings.push_interval())
            }
            Err(err) => self.handle_loop_failure(err, &self.push_backoff, "state push"),
        }
    }

    fn handle_loop_failure(
        &self,
        err: Error,
        backoff: &Mutex<ExponentialBackoff>,
        what: &str,
    ) -> Option<Duration> {
        match FailureAction::classify(&err) {
            FailureAction::Retry => {
                let delay = next_delay(backoff, &self.settings);
                warn!(%err, ?delay, "{what} failed, backing off");
                Some(delay)
            }
            FailureAction::Invalidate => {
                error!(%err, "{what} failed, credentials are invalid");
                self.set_gcd_state(GcdState::Invalid);
                None
            }
            FailureAction::Abort => {
                warn!(%err, "{what} failed");
                Some(self.current_poll_interval())
            }
        }
    }

    fn schedule_command_expiry(self: &Arc<Self>, ttl: chrono::Duration) {
        let period = Duration::from_secs((ttl.num_seconds().max(2) as u64) / 2);
        let weak = Arc::downgrade(self);
        self.task_runner.post_delayed(
            period,
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.commands.expire_overdue(ttl);
                    agent.schedule_command_expiry(ttl);
                }
            }),
        );
    }

    fn current_poll_interval(&self) -> Duration {
        *self
            .poll_interval
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn authorization_header(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("{AUTH_SCHEME} {token}"))
}

fn device_url(
    registration: &RegistrationData,
    subpath: &str,
    params: &[(&str, &str)],
) -> Result<String> {
    if registration.device_id.is_empty() {
        return Err(Error::new(
            errors::registration::DOMAIN,
            errors::registration::PARAMETER_MISSING,
            "device has no cloud id yet",
        ));
    }
    let mut path = format!("devices/{}", registration.device_id);
    if !subpath.is_empty() {
        path.push('/');
        path.push_str(subpath);
    }
    Ok(http::build_url(&registration.service_url, &path, params))
}

/// `{"pkg.prop": v}` pairs nested into `{"pkg": {"prop": v}}`.
fn nest_by_package(changed: &BTreeMap<String, PropValue>) -> Value {
    let mut root = Map::new();
    for (name, value) in changed {
        let (package, prop) = match name.split_once('.') {
            Some((package, prop)) => (package, prop),
            None => ("", name.as_str()),
        };
        if let Some(map) = root
            .entry(package.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            map.insert(prop.to_string(), value.to_json());
        }
    }
    Value::Object(root)
}

fn next_delay(backoff: &Mutex<ExponentialBackoff>, settings: &SyncSettings) -> Duration {
    backoff
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next_backoff()
        .unwrap_or(Duration::from_secs(settings.max_backoff_secs))
}

fn reset(backoff: &Mutex<ExponentialBackoff>) {
    backoff
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .reset();
}

// =============================================================================
// Unit Tests
// =============================================================================
