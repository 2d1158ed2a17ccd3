//! # http-breaker
//!
//! Circuit breaking for HTTP clients: stop calling an upstream that is failing
//! or rate limiting you, and probe for its recovery automatically.
//!
//! ## Overview
//!
//! Each logical upstream gets its own [`CircuitBreaker`], looked up by name in
//! a [`BreakerRegistry`]. Before a call the transport asks the breaker whether
//! it is open; after the call it reports the status code and headers. The
//! breaker counts failures over a window, trips open when the failure ratio
//! crosses its threshold, and opens immediately when the upstream answers
//! `429` or sends a `Retry-After` hint.
//!
//! - **Closed**: calls pass, failures are counted per window
//! - **Open**: calls are shed with a synthetic `429` until the open period ends
//! - **Half-Open**: roughly half the calls are admitted on probation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use http_breaker::{BreakerRegistry, Error};
//!
//! #[tokio::main]
//! async fn main() -> http_breaker::Result<()> {
//!     let breakers = BreakerRegistry::new();
//!
//!     let result = http_breaker::request("https://api.example.com/v1/items", "GET")
//!         .circuit_breaker(breakers.get("items-api"))
//!         .send()
//!         .await;
//!
//!     match result {
//!         Ok(resp) => println!("status {}", resp.status),
//!         Err(Error::CircuitOpen { name, response }) => {
//!             println!("{name} is open, retry after {:?}", response.header("retry-after"));
//!         }
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Breaker state machine, configuration, registry, `Retry-After` parsing |
//! | [`transport`] | Breaker-aware HTTP request builder on top of `reqwest` |
//!
//! Logging goes through `tracing`; every breaker event carries a `circuit`
//! field with the breaker's name. Installing a subscriber is left to the
//! application.

pub mod resilience;
pub mod transport;

pub use resilience::{
    BreakerConfig, BreakerOptions, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use transport::{request, HttpRequest, HttpResponse, ResponseBody};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
