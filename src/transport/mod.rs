//! Breaker-aware HTTP transport.

pub mod http;

pub use http::{request, HttpRequest, HttpResponse, ResponseBody, TransportError};
