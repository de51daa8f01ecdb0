use super::{OutboundRequest, Transport};
use crate::error::NetworkError;
use crate::model::{CapturedResponse, HttpMethod};
use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Instant;

/// reqwest-backed transport.
///
/// Redirect handling is a client-level setting in reqwest, so one client
/// follows redirects and a second one never does.
pub struct HttpTransport {
    following: Client,
    direct: Client,
}

impl HttpTransport {
    pub fn new(max_redirects: usize) -> Result<Self> {
        let following = Client::builder()
            .redirect(Policy::limited(max_redirects))
            .build()
            .context("Failed to build HTTP client")?;
        let direct = Client::builder()
            .redirect(Policy::none())
            .build()
            .context("Failed to build non-redirecting HTTP client")?;
        Ok(Self { following, direct })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<CapturedResponse, NetworkError> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.direct
        };
        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);

        let mut builder = client
            .request(to_reqwest_method(request.method), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = match body {
                serde_json::Value::String(text) => builder.body(text.clone()),
                other => builder.json(other),
            };
        }

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, timeout_ms, None))?;

        let status_code = response.status().as_u16();
        let headers = collect_headers(response.headers());

        match response.bytes().await {
            Ok(bytes) => {
                let elapsed = start.elapsed();
                Ok(CapturedResponse {
                    status_code,
                    headers,
                    body: parse_body(&bytes),
                    size: bytes.len() as u64,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(e) => {
                let partial = CapturedResponse {
                    status_code,
                    headers,
                    body: serde_json::Value::Null,
                    size: 0,
                    response_time_ms: u64::try_from(start.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                };
                Err(classify(e, timeout_ms, Some(partial)))
            }
        }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

fn collect_headers(map: &HeaderMap) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

/// JSON bodies are kept structured; everything else is kept as text.
fn parse_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::String(String::new());
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Deadline overruns become `Timeout`; everything else is a transport error
/// with a short machine-readable code.
fn classify(
    err: reqwest::Error,
    timeout_ms: u64,
    partial: Option<CapturedResponse>,
) -> NetworkError {
    if err.is_timeout() {
        return NetworkError::Timeout { timeout_ms };
    }
    let code = if err.is_builder() {
        "INVALID_REQUEST"
    } else if err.is_connect() {
        "CONNECT"
    } else if err.is_redirect() {
        "REDIRECT"
    } else if err.is_body() || err.is_decode() {
        "BODY"
    } else if err.is_request() {
        "REQUEST"
    } else {
        "TRANSPORT"
    };
    NetworkError::Transport {
        message: error_chain(&err),
        code: code.to_string(),
        partial: partial.map(Box::new),
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
