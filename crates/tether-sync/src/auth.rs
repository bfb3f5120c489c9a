//! # OAuth Token Plumbing
//!
//! Token-endpoint calls and the in-memory access token. The cloud
//! service authenticates with the literal `OAuth` scheme rather than
//! the standard `Bearer`; changing it breaks every device in the field.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use tether_core::error::{errors, Error, Result};
use tether_device::HttpClient;

use crate::http::{build_url, post_form};
use crate::registration::RegistrationData;

/// Authorization scheme expected by the existing devices service.
pub const AUTH_SCHEME: &str = "OAuth";

/// OAuth scope for the devices service.
pub const CLOUD_DEVICES_SCOPE: &str = "https://www.googleapis.com/auth/clouddevices";

// =============================================================================
// AccessToken
// =============================================================================

/// A bearer access token and its local expiry. Never logged, never
/// persisted.
#[derive(Debug, Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(secret: String, expires_in: Duration) -> Self {
        AccessToken {
            secret,
            expires_at: Instant::now() + expires_in,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// True while the token has more than `skew` of life left.
    pub fn is_fresh(&self, skew: Duration) -> bool {
        Instant::now() + skew < self.expires_at
    }

    /// The `Authorization` header for a cloud call.
    pub fn authorization_header(&self) -> (String, String) {
        (
            "Authorization".to_string(),
            format!("{AUTH_SCHEME} {}", self.secret),
        )
    }
}

/// Tokens minted by an authorization-code exchange.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

// =============================================================================
// Token Endpoint Calls
// =============================================================================

/// Trades the stored refresh token for a fresh access token.
pub async fn refresh_access_token(
    http: &dyn HttpClient,
    registration: &RegistrationData,
) -> Result<AccessToken> {
    debug!("refreshing access token");
    let (status, json) = post_form(
        http,
        &build_url(&registration.oauth_url, "token", &[]),
        &[],
        &[
            ("refresh_token", &registration.refresh_token),
            ("client_id", &registration.client_id),
            ("client_secret", &registration.client_secret),
            ("grant_type", "refresh_token"),
        ],
    )
    .await?;
    let json = check_oauth_response(status, json)?;

    let (access_token, expires_in) = extract_access_token(&json)?;
    info!(expires_in_secs = expires_in.as_secs(), "access token refreshed");
    Ok(AccessToken::new(access_token, expires_in))
}

/// Exchanges an authorization code for tokens (the user-approval code
/// during registration, and the robot account code at finalize).
pub async fn exchange_authorization_code(
    http: &dyn HttpClient,
    registration: &RegistrationData,
    code: &str,
    redirect_uri: &str,
    scope: Option<&str>,
) -> Result<TokenGrant> {
    let mut fields = vec![
        ("code", code),
        ("client_id", registration.client_id.as_str()),
        ("client_secret", registration.client_secret.as_str()),
        ("redirect_uri", redirect_uri),
        ("grant_type", "authorization_code"),
    ];
    if let Some(scope) = scope {
        fields.push(("scope", scope));
    }

    let (status, json) = post_form(
        http,
        &build_url(&registration.oauth_url, "token", &[]),
        &[],
        &fields,
    )
    .await?;
    let json = check_oauth_response(status, json)?;

    let (access_token, expires_in) = extract_access_token(&json)?;
    Ok(TokenGrant {
        access_token,
        refresh_token: json
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        expires_in,
    })
}

/// A 4xx from the token endpoint carries `{error, error_description}`;
/// that error code becomes the `oauth` domain error code so callers can
/// tell a revoked grant from a transient failure.
fn check_oauth_response(status: u16, json: Value) -> Result<Value> {
    if status < 400 {
        return Ok(json);
    }
    match json.get("error").and_then(Value::as_str) {
        Some(code) => {
            let description = json
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("no description provided");
            Err(Error::new(
                errors::oauth::DOMAIN,
                code,
                description.to_string(),
            ))
        }
        None => Err(crate::http::status_error(status).wrap(
            errors::oauth::DOMAIN,
            errors::oauth::UNEXPECTED_RESPONSE,
            "token endpoint returned an error without an OAuth error body",
        )),
    }
}

fn extract_access_token(json: &Value) -> Result<(String, Duration)> {
    let access_token = json
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty());
    let expires_in = json.get("expires_in").and_then(Value::as_u64).filter(|s| *s > 0);
    match (access_token, expires_in) {
        (Some(token), Some(secs)) => Ok((token.to_string(), Duration::from_secs(secs))),
        _ => Err(Error::new(
            errors::oauth::DOMAIN,
            errors::oauth::UNEXPECTED_RESPONSE,
            "token endpoint response has no usable access_token/expires_in",
        )),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_device::testing::FakeHttpClient;

    fn registration() -> RegistrationData {
        RegistrationData {
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            oauth_url: "https://accounts.example.com/o/oauth2/".to_string(),
            ..RegistrationData::default()
        }
    }

    #[test]
    fn test_authorization_header_uses_oauth_scheme() {
        let token = AccessToken::new("abc123".to_string(), Duration::from_secs(3600));
        assert_eq!(
            token.authorization_header(),
            ("Authorization".to_string(), "OAuth abc123".to_string())
        );
    }

    #[test]
    fn test_token_freshness_respects_skew() {
        let token = AccessToken::new("abc".to_string(), Duration::from_secs(30));
        assert!(token.is_fresh(Duration::from_secs(0)));
        assert!(!token.is_fresh(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_refresh_posts_the_grant_form() {
        let http = FakeHttpClient::new();
        http.push_json_response(200, &json!({"access_token": "at-1", "expires_in": 3600}));

        let token = refresh_access_token(http.as_ref(), &registration())
            .await
            .unwrap();
        assert_eq!(token.secret(), "at-1");

        let request = &http.requests()[0];
        assert_eq!(request.url, "https://accounts.example.com/o/oauth2/token");
        let body = request.body_string();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=refresh-1"));
        assert!(body.contains("client_id=client-1"));
        assert!(body.contains("client_secret=secret-1"));
    }

    #[tokio::test]
    async fn test_oauth_error_body_becomes_oauth_error() {
        let http = FakeHttpClient::new();
        http.push_json_response(
            400,
            &json!({"error": "invalid_grant", "error_description": "Token has been revoked"}),
        );

        let err = refresh_access_token(http.as_ref(), &registration())
            .await
            .unwrap_err();
        assert_eq!(err.domain(), errors::oauth::DOMAIN);
        assert_eq!(err.code(), errors::oauth::INVALID_GRANT);
        assert_eq!(err.message(), "Token has been revoked");
    }

    #[tokio::test]
    async fn test_non_oauth_error_is_wrapped() {
        let http = FakeHttpClient::new();
        http.push_json_response(500, &json!({"oops": true}));
        let err = refresh_access_token(http.as_ref(), &registration())
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::oauth::UNEXPECTED_RESPONSE);
        assert_eq!(err.first_error().domain(), errors::http::DOMAIN);
    }

    #[tokio::test]
    async fn test_exchange_includes_scope_when_asked() {
        let http = FakeHttpClient::new();
        http.push_json_response(
            200,
            &json!({"access_token": "at-2", "refresh_token": "rt-2", "expires_in": 3600}),
        );

        let grant = exchange_authorization_code(
            http.as_ref(),
            &registration(),
            "auth-code-1",
            "oob",
            Some(CLOUD_DEVICES_SCOPE),
        )
        .await
        .unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("rt-2"));

        let body = http.requests()[0].body_string();
        assert!(body.contains("grant_type=authorization_code"));
        assert!(body.contains("code=auth-code-1"));
        assert!(body.contains("redirect_uri=oob"));
        assert!(body.contains("scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fclouddevices"));
    }

    #[tokio::test]
    async fn test_missing_access_token_rejected() {
        let http = FakeHttpClient::new();
        http.push_json_response(200, &json!({"expires_in": 3600}));
        let err = refresh_access_token(http.as_ref(), &registration())
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::oauth::UNEXPECTED_RESPONSE);
    }
}
