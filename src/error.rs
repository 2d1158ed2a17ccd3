use crate::transport::{HttpResponse, TransportError};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Option name or field that caused the error (e.g., "openThreshold", "request.url")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "breaker_options", "http_request")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type.
///
/// The breaker itself never fails; these errors come from the transport and
/// from loading breaker options.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    /// The call was never sent: the named breaker is open. `response` is the
    /// synthetic 429 handed back in place of the upstream's answer.
    #[error("Circuit breaker '{name}' is open, retry after {}s", retry_hint(.response))]
    CircuitOpen {
        name: String,
        response: Box<HttpResponse>,
    },

    #[error("Remote error: HTTP {}", .0.status)]
    Remote(Box<HttpResponse>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn retry_hint(response: &HttpResponse) -> &str {
    response.header("retry-after").unwrap_or("?")
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The HTTP response behind this error, real or synthesized by a breaker.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Error::CircuitOpen { response, .. } | Error::Remote(response) => Some(response),
            _ => None,
        }
    }

    /// HTTP status of the response behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}
