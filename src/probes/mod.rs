//! Outbound network calls made on behalf of tests.
//!
//! A [`Transport`] performs one call described by an [`OutboundRequest`];
//! [`build_request`] turns a test's request template into that description,
//! merging the identifying header and applying the configured auth.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::NetworkError;
use crate::model::{CapturedResponse, HttpMethod, RequestTemplate};

pub mod auth;
pub mod http;

pub use self::http::HttpTransport;

/// A fully resolved outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
    pub follow_redirects: bool,
}

/// Trait for the network transport used by test executions and health checks.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform the call under `request.timeout`.
    ///
    /// Any HTTP status is a completed round trip here; only transport
    /// failures return `Err`. Callers decide what an error status means.
    async fn send(&self, request: &OutboundRequest) -> Result<CapturedResponse, NetworkError>;
}

/// Build the outbound call for a template.
///
/// `user_agent` is set first so templates can override it.
pub fn build_request(template: &RequestTemplate, user_agent: &str) -> OutboundRequest {
    let mut headers = BTreeMap::new();
    headers.insert("User-Agent".to_string(), user_agent.to_string());
    for (name, value) in &template.headers {
        // Header names are case-insensitive; drop a differently-cased default.
        headers.retain(|existing: &String, _| !existing.eq_ignore_ascii_case(name));
        headers.insert(name.clone(), value.clone());
    }

    let mut request = OutboundRequest {
        method: template.method,
        url: template.url.clone(),
        headers,
        query: Vec::new(),
        body: None,
        timeout: template.timeout(),
        follow_redirects: template.follow_redirects,
    };

    auth::apply(&mut request, &template.auth);

    if template.method.carries_body() {
        request.body = template.body.clone();
    }

    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthConfig;

    #[test]
    fn test_default_header_merged_with_custom_headers() {
        let mut template = RequestTemplate::get("http://localhost/ping");
        template.headers.insert("X-Env".into(), "staging".into());
        let request = build_request(&template, "TestFlow/1.0");
        assert_eq!(request.headers.get("User-Agent").map(String::as_str), Some("TestFlow/1.0"));
        assert_eq!(request.headers.get("X-Env").map(String::as_str), Some("staging"));
        assert!(request.query.is_empty());
    }

    #[test]
    fn test_template_overrides_user_agent() {
        let mut template = RequestTemplate::get("http://localhost/ping");
        template.headers.insert("user-agent".into(), "custom/2.0".into());
        let request = build_request(&template, "TestFlow/1.0");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers.get("user-agent").map(String::as_str), Some("custom/2.0"));
    }

    #[test]
    fn test_body_only_for_body_bearing_verbs() {
        let mut template = RequestTemplate::get("http://localhost/items");
        template.body = Some(serde_json::json!({"name": "widget"}));
        assert!(build_request(&template, "ua").body.is_none());

        template.method = HttpMethod::Patch;
        assert_eq!(
            build_request(&template, "ua").body,
            Some(serde_json::json!({"name": "widget"}))
        );
    }

    #[test]
    fn test_timeout_and_redirect_flags_carried() {
        let mut template = RequestTemplate::get("http://localhost/");
        template.timeout_ms = 1500;
        template.follow_redirects = false;
        template.auth = AuthConfig::None;
        let request = build_request(&template, "ua");
        assert_eq!(request.timeout, Duration::from_millis(1500));
        assert!(!request.follow_redirects);
    }
}
