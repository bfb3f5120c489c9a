//! # tether-sync: Cloud Layer for the Tether Agent
//!
//! Everything that talks to the devices service lives here: the
//! registration handshake, the OAuth token lifecycle, the command poll
//! and state push loops, and the [`Device`] facade the embedder
//! constructs.
//!
//! ## Cloud Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Cloud Data Flow                                 │
//! │                                                                         │
//! │            ┌──────────────────────────────────────────┐                 │
//! │            │              devices service             │                 │
//! │            └──────┬──────────────▲──────────────▲─────┘                 │
//! │      commandQueue │   patchState │   tickets /  │                       │
//! │      (poll, GET)  │   (PATCH)    │   token      │                       │
//! │                   ▼              │   endpoints  │                       │
//! │            ┌────────────────────────────────────┴─────┐                 │
//! │            │               CloudAgent                 │                 │
//! │            │   GcdState · tokens · backoff · loops    │                 │
//! │            └──────┬───────────────────▲───────────────┘                 │
//! │                   ▼                   │                                 │
//! │          CommandManager        StateManager                             │
//! │          (new commands)        (drained change journal)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`agent`] - the orchestrator: state machine, handshake, loops
//! - [`auth`] - OAuth token plumbing (the service speaks `OAuth`, not
//!   `Bearer`)
//! - [`device`] - the composition facade
//! - [`http`] - request helpers over the `HttpClient` provider
//! - [`registration`] - the persisted registration record
//! - [`settings`] - loop tuning knobs

pub mod agent;
pub mod auth;
pub mod device;
pub mod http;
pub mod registration;
pub mod settings;

pub use agent::{CloudAgent, GcdState, GcdStateChangedCallback, RegistrationTicket};
pub use device::Device;
pub use registration::RegistrationData;
pub use settings::SyncSettings;
