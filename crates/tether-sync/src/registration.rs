//! # Device Registration Record
//!
//! The persisted identity of a registered device: OAuth client
//! credentials, the refresh token, the cloud device id, and the endpoint
//! URLs. Stored as one JSON document behind [`ConfigStore`] and always
//! rewritten whole.
//!
//! ## Persisted Keys
//! ```text
//! client_id, client_secret, api_key, refresh_token,
//! device_id, oauth_url, service_url, robot_account
//! ```
//! Keys the agent does not know are carried through a rewrite untouched.
//! The registration draft fields (device kind, system name, display
//! name) and the in-flight ticket id live only in memory.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use tether_core::error::{errors, Error, Result};
use tether_device::ConfigStore;

/// Required `start_registration` parameters, in reporting order.
const REQUIRED_PARAMS: &[&str] = &[
    "client_id",
    "client_secret",
    "api_key",
    "device_kind",
    "system_name",
    "oauth_url",
    "service_url",
];

// =============================================================================
// RegistrationData
// =============================================================================

/// The registration record. Serialization covers exactly the persisted
/// keys plus whatever unknown keys the stored document already carried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationData {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub oauth_url: String,
    #[serde(default)]
    pub service_url: String,
    #[serde(default)]
    pub robot_account: String,

    /// Unknown keys from the stored document, preserved on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,

    // Transient registration draft, never persisted.
    #[serde(skip)]
    pub device_kind: String,
    #[serde(skip)]
    pub system_name: String,
    #[serde(skip)]
    pub display_name: String,
    #[serde(skip)]
    pub ticket_id: String,
}

impl RegistrationData {
    /// Loads the stored record. `Ok(None)` on first boot; a document
    /// that is not valid JSON is an error rather than silent data loss.
    pub fn load(store: &dyn ConfigStore) -> Result<Option<RegistrationData>> {
        let Some(settings) = store.load_settings()? else {
            return Ok(None);
        };
        let registration: RegistrationData = serde_json::from_str(&settings).map_err(|e| {
            Error::from(e).wrap(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                "stored registration record is not a JSON object",
            )
        })?;
        Ok(Some(registration))
    }

    /// Rewrites the whole record.
    pub fn save(&self, store: &dyn ConfigStore) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        store.save_settings(&json)?;
        info!(device_id = %self.device_id, "registration record saved");
        Ok(())
    }

    /// True once the device holds everything needed to talk to the
    /// cloud on its own.
    pub fn is_complete(&self) -> bool {
        !self.refresh_token.is_empty()
            && !self.device_id.is_empty()
            && !self.robot_account.is_empty()
    }

    /// Merges `start_registration` parameters into the record and
    /// checks the required set is present.
    pub fn apply_params(&mut self, params: &Value) -> Result<()> {
        let map = params.as_object().ok_or_else(|| {
            Error::new(
                errors::json::DOMAIN,
                errors::json::OBJECT_EXPECTED,
                format!("registration parameters must be a JSON object, got {params}"),
            )
        })?;

        let mut set = |key: &str, field: &mut String| {
            if let Some(value) = map.get(key).and_then(Value::as_str) {
                *field = value.to_string();
            }
        };
        set("client_id", &mut self.client_id);
        set("client_secret", &mut self.client_secret);
        set("api_key", &mut self.api_key);
        set("device_id", &mut self.device_id);
        set("device_kind", &mut self.device_kind);
        set("system_name", &mut self.system_name);
        set("display_name", &mut self.display_name);
        set("oauth_url", &mut self.oauth_url);
        set("service_url", &mut self.service_url);

        for param in REQUIRED_PARAMS {
            if self.param(param).is_empty() {
                return Err(Error::new(
                    errors::registration::DOMAIN,
                    errors::registration::PARAMETER_MISSING,
                    format!("parameter {param} not specified"),
                ));
            }
        }
        Ok(())
    }

    fn param(&self, name: &str) -> &str {
        match name {
            "client_id" => &self.client_id,
            "client_secret" => &self.client_secret,
            "api_key" => &self.api_key,
            "device_kind" => &self.device_kind,
            "system_name" => &self.system_name,
            "oauth_url" => &self.oauth_url,
            "service_url" => &self.service_url,
            _ => "",
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_device::testing::MemoryConfigStore;

    fn full_record() -> Value {
        json!({
            "client_id": "client-1",
            "client_secret": "secret-1",
            "api_key": "key-1",
            "refresh_token": "refresh-1",
            "device_id": "device-1",
            "oauth_url": "https://accounts.example.com/o/oauth2/",
            "service_url": "https://www.example.com/clouddevices/v1/",
            "robot_account": "robot@clouddevices.example.com"
        })
    }

    #[test]
    fn test_first_boot_has_no_record() {
        let store = MemoryConfigStore::new();
        assert!(RegistrationData::load(store.as_ref()).unwrap().is_none());
    }

    #[test]
    fn test_load_complete_record() {
        let store = MemoryConfigStore::with_settings(&full_record().to_string());
        let registration = RegistrationData::load(store.as_ref()).unwrap().unwrap();
        assert!(registration.is_complete());
        assert_eq!(registration.device_id, "device-1");
    }

    #[test]
    fn test_missing_key_is_incomplete() {
        let mut record = full_record();
        record.as_object_mut().unwrap().remove("refresh_token");
        let store = MemoryConfigStore::with_settings(&record.to_string());
        let registration = RegistrationData::load(store.as_ref()).unwrap().unwrap();
        assert!(!registration.is_complete());
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let mut record = full_record();
        record
            .as_object_mut()
            .unwrap()
            .insert("vendor_note".to_string(), json!("keep me"));
        let store = MemoryConfigStore::with_settings(&record.to_string());

        let registration = RegistrationData::load(store.as_ref()).unwrap().unwrap();
        registration.save(store.as_ref()).unwrap();

        let rewritten: Value = serde_json::from_str(&store.settings().unwrap()).unwrap();
        assert_eq!(rewritten["vendor_note"], json!("keep me"));
        assert_eq!(rewritten["device_id"], json!("device-1"));
    }

    #[test]
    fn test_apply_params_requires_full_set() {
        let mut registration = RegistrationData::default();
        let err = registration
            .apply_params(&json!({"client_id": "client-1"}))
            .unwrap_err();
        assert_eq!(err.domain(), "registration");
        assert_eq!(err.code(), "parameter_missing");
        assert!(err.message().contains("client_secret"));
    }

    #[test]
    fn test_apply_params_merges_draft_fields() {
        let mut registration = RegistrationData::default();
        registration
            .apply_params(&json!({
                "client_id": "client-1",
                "client_secret": "secret-1",
                "api_key": "key-1",
                "device_kind": "vendor",
                "system_name": "ledflasher",
                "display_name": "LED Flasher",
                "oauth_url": "https://accounts.example.com/o/oauth2/",
                "service_url": "https://www.example.com/clouddevices/v1/"
            }))
            .unwrap();
        assert_eq!(registration.device_kind, "vendor");
        assert_eq!(registration.display_name, "LED Flasher");
        assert!(!registration.is_complete());
    }

    #[test]
    fn test_draft_fields_not_persisted() {
        let store = MemoryConfigStore::new();
        let mut registration = RegistrationData::default();
        registration.device_kind = "vendor".to_string();
        registration.ticket_id = "ticket-9".to_string();
        registration.save(store.as_ref()).unwrap();

        let stored: Value = serde_json::from_str(&store.settings().unwrap()).unwrap();
        assert!(stored.get("device_kind").is_none());
        assert!(stored.get("ticket_id").is_none());
    }
}
