use crate::resilience::{CircuitBreaker, BREAKER_HEADER};
use crate::resilience::retry_after::RETRY_AFTER_HEADER;
use crate::{Error, Result};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const REDACTED: &str = "******";

static DEFAULT_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

// Minimal production-friendly defaults (env-overridable).
fn default_client() -> std::result::Result<reqwest::Client, TransportError> {
    DEFAULT_CLIENT
        .get_or_try_init(|| {
            let timeout_secs = env::var("HTTP_BREAKER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(30);
            reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .pool_idle_timeout(Some(Duration::from_secs(90)))
                .build()
        })
        .cloned()
        .map_err(TransportError::Http)
}

/// Start building a request, e.g. `request("https://api.example.com/v1", "GET")`.
pub fn request(url: impl Into<String>, method: &str) -> HttpRequest {
    HttpRequest::new(url).method(method)
}

/// Decoded response body: JSON when it parses, text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(serde_json::Value),
    Text(String),
}

impl ResponseBody {
    fn decode(raw: &[u8]) -> Self {
        if raw.is_empty() {
            return ResponseBody::Empty;
        }
        match serde_json::from_slice(raw) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(raw).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl HttpResponse {
    /// The response a transport hands back instead of calling an upstream
    /// whose breaker is open.
    pub fn circuit_open(breaker: &str, retry_after: Duration) -> Self {
        // Whole seconds, rounded up, never zero.
        let secs = retry_after.as_millis().div_ceil(1000).max(1);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from(secs as u64));
        if let Ok(name) = HeaderValue::from_str(breaker) {
            headers.insert(BREAKER_HEADER, name);
        }
        Self {
            status: 429,
            headers,
            body: ResponseBody::Empty,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Deserialize a JSON body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.body {
            ResponseBody::Json(v) => v.clone(),
            ResponseBody::Text(t) => serde_json::Value::String(t.clone()),
            ResponseBody::Empty => serde_json::Value::Null,
        };
        Ok(serde_json::from_value(value)?)
    }
}

/// Fluent HTTP request that consults a [`CircuitBreaker`] before dispatch and
/// reports every completed exchange back to it.
pub struct HttpRequest {
    client: Option<reqwest::Client>,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    log_header: bool,
    log_body: bool,
    breaker: Option<Arc<CircuitBreaker>>,
    invalid: Option<TransportError>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: None,
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            log_header: false,
            log_body: true,
            breaker: None,
            invalid: None,
        }
    }

    /// Use a specific client instead of the shared default one.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        match Method::from_bytes(method.to_uppercase().as_bytes()) {
            Ok(m) => self.method = m,
            Err(_) => self.reject(TransportError::InvalidMethod(method.to_string())),
        }
        self
    }

    pub fn get(self) -> Self {
        self.method("GET")
    }

    pub fn post(self) -> Self {
        self.method("POST")
    }

    pub fn put(self) -> Self {
        self.method("PUT")
    }

    pub fn delete(self) -> Self {
        self.method("DELETE")
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(k), Ok(v)) => {
                self.headers.insert(k, v);
            }
            _ => self.reject(TransportError::InvalidHeader(name.to_string())),
        }
        self
    }

    /// Merge `headers` over the ones already set.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Set the payload; `content-length` follows it.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = Some(body);
        self
    }

    /// Enable request/response logging details. Headers are redacted unless
    /// `log_header`, bodies unless `log_body`.
    pub fn logger(mut self, log_header: bool, log_body: bool) -> Self {
        self.log_header = log_header;
        self.log_body = log_body;
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Send `value` as a JSON body.
    pub async fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<HttpResponse> {
        let payload = serde_json::to_vec(value)?;
        self.header(CONTENT_TYPE.as_str(), "application/json")
            .body(payload)
            .send()
            .await
    }

    pub async fn send(mut self) -> Result<HttpResponse> {
        if let Some(err) = self.invalid.take() {
            return Err(err.into());
        }
        let url = parse_http_url(&self.url)?;

        let header_log = self.header_log();
        let body_log = self.body_log();
        info!(
            method = %self.method,
            url = %self.url,
            headers = %header_log,
            body = %body_log,
            "[HTTP Request]"
        );

        if let Some(breaker) = &self.breaker {
            if breaker.is_open() {
                let response = HttpResponse::circuit_open(breaker.name(), breaker.retry_after());
                error!(
                    method = %self.method,
                    url = %self.url,
                    http_status = response.status,
                    circuit = breaker.name(),
                    headers = %header_log,
                    "[HTTP Response] Circuit is open"
                );
                return Err(Error::CircuitOpen {
                    name: breaker.name().to_string(),
                    response: Box::new(response),
                });
            }
        }

        let client = match self.client {
            Some(c) => c,
            None => default_client()?,
        };
        let mut req = client.request(self.method.clone(), url).headers(self.headers);
        if let Some(body) = self.body {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(TransportError::Http)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        if let Some(breaker) = &self.breaker {
            breaker.on_request(status, &headers);
        }
        let raw = resp.bytes().await.map_err(TransportError::Http)?;

        let response = HttpResponse {
            status,
            headers,
            body: ResponseBody::decode(&raw),
        };
        if response.is_success() {
            info!(
                method = %self.method,
                url = %self.url,
                http_status = status,
                "[HTTP Response]"
            );
            Ok(response)
        } else {
            let body_log = if self.log_body {
                String::from_utf8_lossy(&raw).into_owned()
            } else {
                REDACTED.to_string()
            };
            error!(
                method = %self.method,
                url = %self.url,
                http_status = status,
                body = %body_log,
                "[HTTP Response]"
            );
            Err(Error::Remote(Box::new(response)))
        }
    }

    fn header_log(&self) -> String {
        if !self.log_header {
            return REDACTED.to_string();
        }
        let pairs: Vec<String> = self
            .headers
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.to_str().unwrap_or("<binary>")))
            .collect();
        format!("{{{}}}", pairs.join(", "))
    }

    fn body_log(&self) -> String {
        match (&self.body, self.log_body) {
            (Some(b), true) => String::from_utf8_lossy(b).into_owned(),
            (None, true) => String::new(),
            (_, false) => REDACTED.to_string(),
        }
    }

    fn reject(&mut self, err: TransportError) {
        if self.invalid.is_none() {
            self.invalid = Some(err);
        }
    }
}

fn parse_http_url(raw: &str) -> std::result::Result<url::Url, TransportError> {
    let url = url::Url::parse(raw).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransportError::UnsupportedProtocol(other.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported Protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}
