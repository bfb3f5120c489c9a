//! Thin request helpers over the [`HttpClient`] provider.
//!
//! Everything the agent sends is either JSON, an OAuth form body, or
//! empty; everything it reads back is JSON. These helpers keep the
//! encode/decode and status plumbing in one place.

use serde_json::Value;
use url::form_urlencoded;

use tether_core::error::{errors, Error, Result};
use tether_device::{HttpClient, HttpMethod};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const CONTENT_TYPE_HEADER: &str = "Content-Type";

// =============================================================================
// URL Composition
// =============================================================================

/// Joins `base` and `subpath` with exactly one `/` between non-empty
/// sides and appends `params` form-encoded.
pub fn build_url(base: &str, subpath: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    if !subpath.is_empty() {
        if !url.is_empty() && !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(subpath);
    }
    if !params.is_empty() {
        url.push('?');
        url.push_str(&encode_form(params));
    }
    url
}

/// Form-encodes key/value pairs for a query string or an
/// `application/x-www-form-urlencoded` body.
pub fn encode_form(fields: &[(&str, &str)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

// =============================================================================
// Requests
// =============================================================================

/// GET and parse the JSON response body.
pub async fn get_json(
    http: &dyn HttpClient,
    url: &str,
    headers: &[(String, String)],
) -> Result<(u16, Value)> {
    let response = http
        .send_request(HttpMethod::Get, url, headers, None)
        .await?;
    parse_json_response(response.status, &response.body)
}

/// POST a JSON document.
pub async fn post_json(
    http: &dyn HttpClient,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
) -> Result<(u16, Value)> {
    send_body(http, HttpMethod::Post, url, headers, JSON_CONTENT_TYPE, body.to_string()).await
}

/// PATCH a JSON document.
pub async fn patch_json(
    http: &dyn HttpClient,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
) -> Result<(u16, Value)> {
    send_body(http, HttpMethod::Patch, url, headers, JSON_CONTENT_TYPE, body.to_string()).await
}

/// POST an OAuth-style form body.
pub async fn post_form(
    http: &dyn HttpClient,
    url: &str,
    headers: &[(String, String)],
    fields: &[(&str, &str)],
) -> Result<(u16, Value)> {
    send_body(http, HttpMethod::Post, url, headers, FORM_CONTENT_TYPE, encode_form(fields)).await
}

/// POST with no body at all (the finalize call).
pub async fn post_empty(
    http: &dyn HttpClient,
    url: &str,
    headers: &[(String, String)],
) -> Result<(u16, Value)> {
    let response = http
        .send_request(HttpMethod::Post, url, headers, None)
        .await?;
    parse_json_response(response.status, &response.body)
}

async fn send_body(
    http: &dyn HttpClient,
    method: HttpMethod,
    url: &str,
    headers: &[(String, String)],
    content_type: &str,
    body: String,
) -> Result<(u16, Value)> {
    let mut all_headers = headers.to_vec();
    all_headers.push((CONTENT_TYPE_HEADER.to_string(), content_type.to_string()));
    let response = http
        .send_request(method, url, &all_headers, Some(body.into_bytes()))
        .await?;
    parse_json_response(response.status, &response.body)
}

// =============================================================================
// Responses
// =============================================================================

/// Parses a response body as JSON. An empty body becomes `null` so
/// status-only responses stay representable.
pub fn parse_json_response(status: u16, body: &[u8]) -> Result<(u16, Value)> {
    if body.is_empty() {
        return Ok((status, Value::Null));
    }
    let json = serde_json::from_slice(body).map_err(|e: serde_json::Error| {
        Error::from(e).wrap(
            errors::json::DOMAIN,
            errors::json::PARSE_ERROR,
            format!("response body is not valid JSON (HTTP {status})"),
        )
    })?;
    Ok((status, json))
}

/// Maps a non-success status onto the `http` error domain. Rate
/// limiting gets its own code so the retry classifier can see it
/// without parsing messages.
pub fn status_error(status: u16) -> Error {
    let code = match status {
        429 => errors::http::TOO_MANY_REQUESTS,
        400..=499 => errors::http::STATUS_4XX,
        _ => errors::http::STATUS_5XX,
    };
    Error::new(
        errors::http::DOMAIN,
        code,
        format!("request failed with HTTP status {status}"),
    )
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_device::testing::FakeHttpClient;

    #[test]
    fn test_build_url_separator_rules() {
        assert_eq!(
            build_url("https://svc/v1", "devices/d1", &[]),
            "https://svc/v1/devices/d1"
        );
        assert_eq!(
            build_url("https://svc/v1/", "devices/d1", &[]),
            "https://svc/v1/devices/d1"
        );
        assert_eq!(build_url("https://svc/v1", "", &[]), "https://svc/v1");
        assert_eq!(
            build_url("https://svc/v1", "", &[("key", "k")]),
            "https://svc/v1?key=k"
        );
    }

    #[test]
    fn test_build_url_encodes_params() {
        let url = build_url(
            "https://oauth/",
            "auth",
            &[("redirect_uri", "urn:ietf:wg:oauth:2.0:oob"), ("client_id", "a b")],
        );
        assert_eq!(
            url,
            "https://oauth/auth?redirect_uri=urn%3Aietf%3Awg%3Aoauth%3A2.0%3Aoob&client_id=a+b"
        );
    }

    #[test]
    fn test_parse_json_response_tolerates_empty_body() {
        assert_eq!(parse_json_response(204, b"").unwrap(), (204, Value::Null));
        let err = parse_json_response(200, b"not json").unwrap_err();
        assert_eq!(err.code(), errors::json::PARSE_ERROR);
    }

    #[test]
    fn test_status_error_codes() {
        assert_eq!(status_error(404).code(), errors::http::STATUS_4XX);
        assert_eq!(status_error(429).code(), errors::http::TOO_MANY_REQUESTS);
        assert_eq!(status_error(503).code(), errors::http::STATUS_5XX);
    }

    #[tokio::test]
    async fn test_post_form_encodes_body_and_content_type() {
        let http = FakeHttpClient::new();
        http.push_json_response(200, &json!({"ok": true}));

        post_form(
            http.as_ref(),
            "https://oauth/token",
            &[],
            &[("grant_type", "refresh_token"), ("refresh_token", "r1")],
        )
        .await
        .unwrap();

        let request = &http.requests()[0];
        assert_eq!(request.header("Content-Type"), Some(FORM_CONTENT_TYPE));
        assert_eq!(
            request.body_string(),
            "grant_type=refresh_token&refresh_token=r1"
        );
    }

    #[tokio::test]
    async fn test_patch_json_sets_content_type() {
        let http = FakeHttpClient::new();
        http.push_json_response(200, &json!({}));
        patch_json(http.as_ref(), "https://svc/x", &[], &json!({"userEmail": "me"}))
            .await
            .unwrap();
        let request = &http.requests()[0];
        assert_eq!(request.method, HttpMethod::Patch);
        assert_eq!(request.header("content-type"), Some(JSON_CONTENT_TYPE));
        assert_eq!(request.body_json(), Some(json!({"userEmail": "me"})));
    }
}
