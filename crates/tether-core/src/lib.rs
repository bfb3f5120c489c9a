//! # tether-core: Pure Object Model for the Tether Agent
//!
//! This crate is the I/O-free heart of the tether device agent. It defines
//! the typed schema and value engine, the command object model, and the
//! chained error type shared by every other crate in the workspace.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tether Agent Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  tether-sync (Cloud Layer)                      │   │
//! │  │     registration · OAuth tokens · command poll · state push    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 tether-device (Runtime Layer)                   │   │
//! │  │     command queue · state registry · change journal · traits   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tether-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────────┐  ┌──────────────────────┐   │   │
//! │  │   │   error   │  │    schema     │  │      commands        │   │   │
//! │  │   │  chained  │  │   PropType    │  │  CommandDefinition   │   │   │
//! │  │   │  domain/  │  │   PropValue   │  │  CommandDictionary   │   │   │
//! │  │   │  code     │  │  ObjectSchema │  │  CommandInstance     │   │   │
//! │  │   └───────────┘  └───────────────┘  └──────────────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO CLOCK READS BEYOND TIMESTAMPING     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`error`] - The chained `(domain, code, message, inner)` error type
//! - [`schema`] - Typed schema and value engine with constraint validation
//! - [`commands`] - Command definitions, dictionaries, and live instances
//!
//! ## Design Principles
//!
//! 1. Values are data: a [`schema::PropValue`] is immutable once built and
//!    compares by content, never by identity.
//! 2. Errors wrap, they never flatten: each layer adds a link to the chain
//!    so the outermost error is user-facing and the innermost is the cause.
//! 3. Everything entering the system through JSON is validated against a
//!    schema before it can touch any state.

pub mod commands;
pub mod error;
pub mod schema;

pub use error::{Error, Result};
pub use schema::{ObjectSchema, ObjectValue, PropType, PropValue};
