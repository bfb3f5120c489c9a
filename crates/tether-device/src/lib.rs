//! # tether-device: Device Runtime for the Tether Agent
//!
//! The runtime layer between the pure object model (`tether-core`) and the
//! cloud layer (`tether-sync`). It owns the live command queue, the state
//! registry with its bounded change journal, and the provider traits the
//! embedder implements for the target platform.
//!
//! ## Runtime Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Device Runtime Layer                              │
//! │                                                                         │
//! │   inbound command JSON          state mutations                         │
//! │   (cloud poll / local)          (handlers, embedder)                    │
//! │          │                            │                                 │
//! │          ▼                            ▼                                 │
//! │  ┌────────────────┐          ┌────────────────┐                         │
//! │  │ CommandManager │          │  StateManager  │                         │
//! │  │                │          │                │                         │
//! │  │ dictionary     │          │ definitions    │                         │
//! │  │ live queue     │          │ value registry │                         │
//! │  │ handlers       │          │ change journal │──► drained by the       │
//! │  │ dispatch       │          └────────────────┘    cloud push loop      │
//! │  └───────┬────────┘                                                     │
//! │          │ posts dispatch tasks                                         │
//! │          ▼                                                              │
//! │  ┌────────────────────────────────────────────────────────────────┐    │
//! │  │            Providers (implemented by the embedder)             │    │
//! │  │   TaskRunner · HttpClient · ConfigStore · Network              │    │
//! │  └────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All shared state mutates under short-lived locks on the scheduler the
//! embedder provides; the only suspension points are the async provider
//! calls.

pub mod change_queue;
pub mod command_manager;
pub mod provider;
pub mod state_manager;
pub mod testing;

pub use change_queue::{StateChange, StateChangeQueue};
pub use command_manager::{CommandHandle, CommandManager};
pub use provider::{
    ConfigStore, HttpClient, HttpMethod, HttpResponse, Network, NetworkState, TaskRunner,
    TokioTaskRunner,
};
pub use state_manager::StateManager;
