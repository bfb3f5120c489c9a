//! Test doubles for the provider interfaces.
//!
//! Published from the library so downstream crates can exercise the
//! agent against scripted providers without standing up real transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use tether_core::error::{errors, Error, Result};

use crate::provider::{ConfigStore, HttpClient, HttpMethod, HttpResponse, Network, NetworkState};

// =============================================================================
// MemoryConfigStore
// =============================================================================

/// In-memory [`ConfigStore`] holding factory defaults and the settings
/// blob.
#[derive(Default)]
pub struct MemoryConfigStore {
    defaults: Option<Value>,
    settings: Mutex<Option<String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryConfigStore::default())
    }

    pub fn with_defaults(defaults: Value) -> Arc<Self> {
        Arc::new(MemoryConfigStore {
            defaults: Some(defaults),
            settings: Mutex::new(None),
        })
    }

    pub fn with_settings(settings: &str) -> Arc<Self> {
        Arc::new(MemoryConfigStore {
            defaults: None,
            settings: Mutex::new(Some(settings.to_string())),
        })
    }

    /// The currently persisted settings blob, for assertions.
    pub fn settings(&self) -> Option<String> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_settings(&self, settings: &str) {
        *self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(settings.to_string());
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_defaults(&self) -> Result<Option<Value>> {
        Ok(self.defaults.clone())
    }

    fn load_settings(&self) -> Result<Option<String>> {
        Ok(self.settings())
    }

    fn save_settings(&self, settings: &str) -> Result<()> {
        self.set_settings(settings);
        Ok(())
    }
}

// =============================================================================
// FakeHttpClient
// =============================================================================

/// One request as the fake transport saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_string(&self) -> String {
        self.body
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(self.body.as_deref()?).ok()
    }
}

/// Scripted [`HttpClient`]: responses are served in FIFO order and every
/// request is recorded. Running out of script is a loud failure so tests
/// never silently absorb an unexpected request.
#[derive(Default)]
pub struct FakeHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeHttpClient::default())
    }

    pub fn push_response(&self, status: u16, content_type: &str, body: Vec<u8>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(HttpResponse {
                status,
                content_type: content_type.to_string(),
                body,
            }));
    }

    pub fn push_json_response(&self, status: u16, body: &Value) {
        self.push_response(
            status,
            "application/json; charset=utf-8",
            body.to_string().into_bytes(),
        );
    }

    pub fn push_error(&self, error: Error) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Requests whose URL contains `fragment`.
    pub fn requests_to(&self, fragment: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn send_request(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                method,
                url: url.to_string(),
                headers: headers.to_vec(),
                body,
            });
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(Error::new(
                    errors::http::DOMAIN,
                    errors::http::CONNECTION_ERROR,
                    format!("no scripted response for {method} {url}"),
                ))
            })
    }
}

// =============================================================================
// FakeNetwork
// =============================================================================

/// Scripted [`Network`] provider. `set_state` fires the registered
/// connectivity callbacks, the way a platform notifier would.
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
    callbacks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl FakeNetwork {
    pub fn new(state: NetworkState) -> Arc<Self> {
        Arc::new(FakeNetwork {
            state: Mutex::new(state),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: NetworkState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback();
        }
    }
}

impl Network for FakeNetwork {
    fn connection_state(&self) -> NetworkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_connection_changed_callback(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}
