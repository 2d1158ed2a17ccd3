//! Circuit breaking for HTTP upstreams.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`retry_after`] | `Retry-After` parsing (delta-seconds or HTTP-date) |
//! | [`config`] | Thresholds and durations, from code, JSON or env |
//! | [`policy`] | Closed / open / half-open behaviour and the transition function |
//! | [`circuit_breaker`] | Per-upstream breaker driving the policies |
//! | [`registry`] | Get-or-create map from upstream name to breaker |
//!
//! ## Usage
//!
//! ```rust
//! use http_breaker::resilience::{BreakerConfig, BreakerRegistry, BreakerState};
//! use reqwest::header::HeaderMap;
//!
//! let registry = BreakerRegistry::with_config(BreakerConfig::default());
//! let breaker = registry.get("billing");
//!
//! if !breaker.is_open() {
//!     // ... perform the call, then report what came back:
//!     breaker.on_request(429, &HeaderMap::new());
//! }
//! assert_eq!(breaker.state(), BreakerState::Open);
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod policy;
pub mod registry;
pub mod retry_after;

pub use circuit_breaker::{BreakerSnapshot, CallOutcome, CircuitBreaker, BREAKER_HEADER};
pub use config::{BreakerConfig, BreakerOptions};
pub use policy::{BreakerState, Transition};
pub use registry::BreakerRegistry;
pub use retry_after::{parse_retry_after, retry_after_from_headers, RetryHint};
