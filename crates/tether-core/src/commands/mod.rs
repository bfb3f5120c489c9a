//! # Command Object Model
//!
//! Definitions describe what a command looks like; the dictionary indexes
//! definitions by qualified name; an instance is one live invocation
//! moving through its lifecycle.
//!
//! ## Command Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Command State Machine                              │
//! │                                                                         │
//! │                ┌────────┐  dispatch   ┌────────────┐                    │
//! │   AddCommand ─►│ Queued │────────────►│ InProgress │◄────────┐          │
//! │                └───┬────┘             └──┬───┬───┬─┘  resume │          │
//! │                    │                     │   │   │       ┌───┴────┐     │
//! │                    │              pause  │   │   └──────►│ Paused │     │
//! │                    │                     │   │           └───┬────┘     │
//! │                    │            complete │   │ error         │          │
//! │                    │                     ▼   ▼               │          │
//! │                    │   ┌──────┐ ┌───────┐ ┌───────┐          │          │
//! │                    └──►│ Done │ │ Error │ │Aborted│◄─────────┤          │
//! │     cancel / expire    └──────┘ └───┬───┘ └───────┘          │          │
//! │     reach every        ┌─────────┐  │    ┌─────────┐         │          │
//! │     non-terminal state │Cancelled│◄─┴───►│ Expired │◄────────┘          │
//! │                        └─────────┘       └─────────┘                    │
//! │                                                                         │
//! │   Terminal: Done, Cancelled, Aborted, Expired                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod definition;
mod dictionary;
mod instance;

pub use definition::CommandDefinition;
pub use dictionary::CommandDictionary;
pub use instance::{CommandInstance, CommandOrigin, CommandStatus};
