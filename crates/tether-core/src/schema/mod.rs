//! # Typed Schema and Value Engine
//!
//! Parses schema JSON into immutable [`PropType`] trees, parses value JSON
//! into [`PropValue`]s validated against those trees, and serializes values
//! back out in schema declaration order.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Schema Engine Flow                               │
//! │                                                                         │
//! │  schema JSON ──► PropType::from_json ──► PropType tree (immutable)      │
//! │                                              │                           │
//! │  value JSON ──► PropType::value_from_json ───┤                           │
//! │                    │                         │                           │
//! │                    ├── structural parse (defaults filled,               │
//! │                    │   missing/unknown fields rejected)                 │
//! │                    └── constraint validation (range, length, enum)      │
//! │                                              │                           │
//! │                                              ▼                           │
//! │                                         PropValue ──► to_json()          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod object_schema;
mod prop_type;
mod prop_value;

pub use object_schema::ObjectSchema;
pub use prop_type::{ArrayType, BooleanType, IntegerType, NumberType, ObjectType, PropType, StringType};
pub use prop_value::{ObjectValue, PropValue};
