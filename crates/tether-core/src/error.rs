//! # Chained Error Type
//!
//! Every failure in the agent is an [`Error`]: an immutable record of
//! `(domain, code, message)` with an optional inner error forming a
//! singly-linked chain.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Chain Shape                               │
//! │                                                                         │
//! │  commands/invalid_parameter_value  "Invalid value for parameter '_led'" │
//! │        │ inner                                                          │
//! │        ▼                                                                 │
//! │  commands/out_of_range  "value 5 is out of range (minimum 1, max 3)"   │
//! │                                                                         │
//! │  The head describes what the caller asked for; the tail narrates       │
//! │  the path down to the first failure. Layers wrap, they never           │
//! │  collapse the chain into a single string.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Domain and code constants live in the [`errors`] module, one submodule
//! per domain, so call sites read as
//! `Error::new(errors::commands::DOMAIN, errors::commands::TYPE_MISMATCH, ..)`.

use thiserror::Error as ThisError;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Error
// =============================================================================

/// A single link in an error chain.
///
/// Two errors with the same code but different domains are different
/// errors. The chain is immutable once constructed; wrapping creates a
/// new head rather than mutating an existing link.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{domain}/{code}: {message}")]
pub struct Error {
    domain: String,
    code: String,
    message: String,
    #[source]
    inner: Option<Box<Error>>,
}

impl Error {
    /// Creates a chain of length one.
    pub fn new(
        domain: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error {
            domain: domain.into(),
            code: code.into(),
            message: message.into(),
            inner: None,
        }
    }

    /// Creates an error with `inner` attached as its cause.
    pub fn with_inner(
        domain: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        inner: Error,
    ) -> Self {
        Error {
            inner: Some(Box::new(inner)),
            ..Error::new(domain, code, message)
        }
    }

    /// Consumes `self` and returns a new chain head with `self` as the cause.
    pub fn wrap(
        self,
        domain: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::with_inner(domain, code, message, self)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The direct cause of this error, if any.
    pub fn inner(&self) -> Option<&Error> {
        self.inner.as_deref()
    }

    /// Walks the chain and returns the innermost error. Returns `self`
    /// when there is no inner error.
    pub fn first_error(&self) -> &Error {
        let mut current = self;
        while let Some(inner) = current.inner() {
            current = inner;
        }
        current
    }

    /// Returns true if this or any inner error belongs to `domain`.
    pub fn has_domain(&self, domain: &str) -> bool {
        self.chain().any(|e| e.domain == domain)
    }

    /// Returns true if this or any inner error matches `domain` and `code`.
    pub fn has_error(&self, domain: &str, code: &str) -> bool {
        self.find_error(domain, code).is_some()
    }

    /// Finds the first link in the chain matching `domain` and `code`.
    pub fn find_error(&self, domain: &str, code: &str) -> Option<&Error> {
        self.chain().find(|e| e.domain == domain && e.code == code)
    }

    /// Iterates the chain from the head down to the first failure.
    pub fn chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |e| e.inner())
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(
            errors::json::DOMAIN,
            errors::json::PARSE_ERROR,
            err.to_string(),
        )
    }
}

// =============================================================================
// Domain and Code Constants
// =============================================================================

/// Error domain and code constants used by the agent.
///
/// Codes are stable strings: they cross the local HTTP surface and show
/// up in logs, so renaming one is a behavior change.
pub mod errors {
    /// Command schema and instance failures.
    pub mod commands {
        pub const DOMAIN: &str = "commands";

        pub const TYPE_MISMATCH: &str = "type_mismatch";
        pub const PARAMETER_MISSING: &str = "parameter_missing";
        pub const UNKNOWN_PROPERTY: &str = "unknown_property";
        pub const INVALID_PARAMETER_VALUE: &str = "invalid_parameter_value";
        pub const INVALID_COMMAND_DEFINITION: &str = "invalid_command_definition";
        pub const INVALID_STATE_TRANSITION: &str = "invalid_state_transition";
        pub const OUT_OF_RANGE: &str = "out_of_range";
        pub const UNKNOWN_TYPE: &str = "unknown_type";
        pub const INVALID_COMMAND_NAME: &str = "invalid_command_name";
        pub const DUPLICATE_COMMAND_ID: &str = "duplicate_command_id";
        pub const COMMAND_DESTROYED: &str = "command_destroyed";
    }

    /// Device state registry failures.
    pub mod state {
        pub const DOMAIN: &str = "state";

        pub const UNKNOWN_PROPERTY: &str = "unknown_property";
        pub const INVALID_VALUE: &str = "invalid_value";
        pub const PROPERTY_REDEFINED: &str = "property_redefined";
    }

    /// OAuth failures. Codes echo the server's `error` field
    /// (`invalid_grant`, `invalid_client`, ...), so only the ones the
    /// agent special-cases are named here.
    pub mod oauth {
        pub const DOMAIN: &str = "oauth";

        pub const INVALID_GRANT: &str = "invalid_grant";
        pub const UNEXPECTED_RESPONSE: &str = "unexpected_response";
    }

    /// Device registration failures.
    pub mod registration {
        pub const DOMAIN: &str = "registration";

        pub const PARAMETER_MISSING: &str = "parameter_missing";
        pub const ALREADY_REGISTERED: &str = "already_registered";
        pub const TICKET_NOT_FOUND: &str = "ticket_not_found";
        pub const TICKET_NOT_APPROVED: &str = "ticket_not_approved";
    }

    /// JSON parsing failures.
    pub mod json {
        pub const DOMAIN: &str = "json";

        pub const PARSE_ERROR: &str = "parse_error";
        pub const OBJECT_EXPECTED: &str = "object_expected";
    }

    /// Persistent storage failures.
    pub mod file_system {
        pub const DOMAIN: &str = "file_system";

        pub const FILE_READ_ERROR: &str = "file_read_error";
        pub const FILE_WRITE_ERROR: &str = "file_write_error";
    }

    /// HTTP transport failures.
    pub mod http {
        pub const DOMAIN: &str = "http";

        pub const CONNECTION_ERROR: &str = "connection_error";
        pub const TIMEOUT: &str = "timeout";
        pub const STATUS_4XX: &str = "status_4xx";
        pub const STATUS_5XX: &str = "status_5xx";
        pub const TOO_MANY_REQUESTS: &str = "too_many_requests";
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn range_error() -> Error {
        Error::new(
            errors::commands::DOMAIN,
            errors::commands::OUT_OF_RANGE,
            "value 5 is out of range (minimum 1, maximum 3)",
        )
        .wrap(
            errors::commands::DOMAIN,
            errors::commands::INVALID_PARAMETER_VALUE,
            "Invalid value for parameter '_led'",
        )
    }

    #[test]
    fn test_display_is_domain_code_message() {
        let err = Error::new("oauth", "invalid_grant", "Token has been revoked");
        assert_eq!(err.to_string(), "oauth/invalid_grant: Token has been revoked");
    }

    #[test]
    fn test_wrap_builds_chain() {
        let err = range_error();
        assert_eq!(err.code(), errors::commands::INVALID_PARAMETER_VALUE);
        assert_eq!(
            err.inner().map(Error::code),
            Some(errors::commands::OUT_OF_RANGE)
        );
        assert_eq!(err.first_error().code(), errors::commands::OUT_OF_RANGE);
    }

    #[test]
    fn test_find_error_walks_the_chain() {
        let err = range_error();
        assert!(err.has_error(
            errors::commands::DOMAIN,
            errors::commands::OUT_OF_RANGE
        ));
        assert!(err.has_domain(errors::commands::DOMAIN));
        assert!(!err.has_domain(errors::oauth::DOMAIN));
        assert!(err
            .find_error(errors::commands::DOMAIN, errors::commands::OUT_OF_RANGE)
            .is_some());
        assert!(err.find_error("oauth", "invalid_grant").is_none());
    }

    #[test]
    fn test_source_exposes_inner() {
        use std::error::Error as StdError;
        let err = range_error();
        let source = err.source().expect("chain has a cause");
        assert!(source.to_string().contains("out_of_range"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: Error = parse_err.into();
        assert_eq!(err.domain(), errors::json::DOMAIN);
        assert_eq!(err.code(), errors::json::PARSE_ERROR);
    }
}
