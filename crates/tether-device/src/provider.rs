//! # Provider Interfaces
//!
//! The seams between the portable agent core and the target platform.
//! The embedder hands the agent one implementation of each trait at
//! construction time; the core never reaches for a global.
//!
//! ## The Providers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ConfigStore   persisted settings blob + factory defaults               │
//! │  TaskRunner    single-threaded cooperative scheduler                    │
//! │  HttpClient    async HTTP request/response                              │
//! │  Network       connectivity state + change notification                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tether_core::Result;

// =============================================================================
// ConfigStore
// =============================================================================

/// Persistent key-value blob storage plus factory defaults.
///
/// `load_settings`/`save_settings` move one opaque string; the agent
/// keeps it as a JSON document and always rewrites it whole, never
/// partially.
pub trait ConfigStore: Send + Sync {
    /// Factory defaults shipped with the device image: command and state
    /// definitions, default state values, and tuning settings. `None`
    /// when the image ships none.
    fn load_defaults(&self) -> Result<Option<serde_json::Value>>;

    /// The persisted settings blob, or `None` on first boot.
    fn load_settings(&self) -> Result<Option<String>>;

    /// Replaces the persisted settings blob atomically.
    fn save_settings(&self, settings: &str) -> Result<()>;
}

// =============================================================================
// TaskRunner
// =============================================================================

/// The agent's cooperative scheduler.
///
/// Implementations run posted tasks on a single thread in FIFO order for
/// equal delays. The agent re-arms its periodic work by posting the next
/// iteration from inside the current one; it never spawns threads of its
/// own.
pub trait TaskRunner: Send + Sync {
    /// Schedules `task` to run after `delay`.
    fn post_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>);

    /// Schedules `task` to run as soon as the scheduler is idle.
    fn post(&self, task: BoxFuture<'static, ()>) {
        self.post_delayed(Duration::ZERO, task);
    }

    /// A future resolving after `delay`, driven by this scheduler. The
    /// default goes through `post_delayed` so fake runners control time.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.post_delayed(
            delay,
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}

/// Stock [`TaskRunner`] backed by the ambient tokio runtime.
///
/// Intended to be used with a current-thread runtime so tasks stay
/// serialized the way the agent expects.
#[derive(Debug, Default, Clone)]
pub struct TokioTaskRunner;

impl TokioTaskRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(TokioTaskRunner)
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

// =============================================================================
// HttpClient
// =============================================================================

/// HTTP methods the agent issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Put => "PUT",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Asynchronous HTTP transport.
///
/// Implementations may block a worker thread or use a native async
/// stack; the agent only sees the future. Transport-level failures
/// (refused connection, timeout) come back as `http` domain errors,
/// while any response the server produced, success or not, resolves
/// the future with an [`HttpResponse`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send_request(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse>;
}

// =============================================================================
// Network
// =============================================================================

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Offline,
    Connecting,
    Online,
}

/// Platform network status provider.
pub trait Network: Send + Sync {
    fn connection_state(&self) -> NetworkState;

    /// Registers a callback fired whenever `connection_state` changes.
    fn add_connection_changed_callback(&self, callback: Arc<dyn Fn() + Send + Sync>);
}

