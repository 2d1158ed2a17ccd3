use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_BREAKER_WINDOW: Duration = Duration::from_millis(60_000);
pub const DEFAULT_OPEN_THRESHOLD: f64 = 0.8;
pub const DEFAULT_OPEN_COUNT_THRESHOLD: u32 = 60;
pub const DEFAULT_OPEN_DURATION: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MAX_OPEN_DURATION: Duration = Duration::from_millis(60_000);
pub const DEFAULT_HALF_OPEN_DURATION: Duration = Duration::from_millis(10_000);
pub const DEFAULT_HALF_OPEN_THRESHOLD: f64 = 0.8;
pub const DEFAULT_HALF_OPEN_COUNT_THRESHOLD: u32 = 10;

/// Raw breaker options as they appear in a JSON options document.
///
/// Durations are milliseconds. Missing or zero values fall back to the
/// defaults when resolved into a [`BreakerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerOptions {
    pub breaker_window: Option<u64>,
    pub open_threshold: Option<f64>,
    pub open_count_threshold: Option<u32>,
    pub open_duration: Option<u64>,
    pub max_open_duration: Option<u64>,
    pub half_open_duration: Option<u64>,
    pub half_open_threshold: Option<f64>,
    pub half_open_count_threshold: Option<u32>,
}

impl BreakerOptions {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            Error::configuration_with_context(
                "invalid breaker options document",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("breaker_options"),
            )
        })
    }
}

/// Resolved breaker configuration shared by every policy of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Length of the closed-state counting window; counters hard-reset after it.
    pub breaker_window: Duration,
    /// Failure ratio that must be exceeded to trip from closed.
    pub open_threshold: f64,
    /// Failed calls required before the closed-state ratio is evaluated.
    pub open_count_threshold: u32,
    pub open_duration: Duration,
    /// Upper bound for upstream-supplied (forced) open durations.
    pub max_open_duration: Duration,
    pub half_open_duration: Duration,
    pub half_open_threshold: f64,
    pub half_open_count_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            breaker_window: DEFAULT_BREAKER_WINDOW,
            open_threshold: DEFAULT_OPEN_THRESHOLD,
            open_count_threshold: DEFAULT_OPEN_COUNT_THRESHOLD,
            open_duration: DEFAULT_OPEN_DURATION,
            max_open_duration: DEFAULT_MAX_OPEN_DURATION,
            half_open_duration: DEFAULT_HALF_OPEN_DURATION,
            half_open_threshold: DEFAULT_HALF_OPEN_THRESHOLD,
            half_open_count_threshold: DEFAULT_HALF_OPEN_COUNT_THRESHOLD,
        }
    }
}

impl From<BreakerOptions> for BreakerConfig {
    fn from(opts: BreakerOptions) -> Self {
        let d = Self::default();
        Self {
            breaker_window: millis_or(opts.breaker_window, d.breaker_window),
            open_threshold: ratio_or(opts.open_threshold, d.open_threshold),
            open_count_threshold: count_or(opts.open_count_threshold, d.open_count_threshold),
            open_duration: millis_or(opts.open_duration, d.open_duration),
            max_open_duration: millis_or(opts.max_open_duration, d.max_open_duration),
            half_open_duration: millis_or(opts.half_open_duration, d.half_open_duration),
            half_open_threshold: ratio_or(opts.half_open_threshold, d.half_open_threshold),
            half_open_count_threshold: count_or(
                opts.half_open_count_threshold,
                d.half_open_count_threshold,
            ),
        }
    }
}

fn millis_or(v: Option<u64>, default: Duration) -> Duration {
    v.filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn ratio_or(v: Option<f64>, default: f64) -> f64 {
    v.filter(|r| r.is_finite() && *r > 0.0).unwrap_or(default)
}

fn count_or(v: Option<u32>, default: u32) -> u32 {
    v.filter(|n| *n > 0).unwrap_or(default)
}

impl BreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables:
    /// - `HTTP_BREAKER_WINDOW_MS`
    /// - `HTTP_BREAKER_OPEN_THRESHOLD`
    /// - `HTTP_BREAKER_OPEN_COUNT_THRESHOLD`
    /// - `HTTP_BREAKER_OPEN_DURATION_MS`
    /// - `HTTP_BREAKER_MAX_OPEN_DURATION_MS`
    /// - `HTTP_BREAKER_HALF_OPEN_DURATION_MS`
    /// - `HTTP_BREAKER_HALF_OPEN_THRESHOLD`
    /// - `HTTP_BREAKER_HALF_OPEN_COUNT_THRESHOLD`
    ///
    /// Values that do not parse are ignored.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
        }

        BreakerOptions {
            breaker_window: var("HTTP_BREAKER_WINDOW_MS"),
            open_threshold: var("HTTP_BREAKER_OPEN_THRESHOLD"),
            open_count_threshold: var("HTTP_BREAKER_OPEN_COUNT_THRESHOLD"),
            open_duration: var("HTTP_BREAKER_OPEN_DURATION_MS"),
            max_open_duration: var("HTTP_BREAKER_MAX_OPEN_DURATION_MS"),
            half_open_duration: var("HTTP_BREAKER_HALF_OPEN_DURATION_MS"),
            half_open_threshold: var("HTTP_BREAKER_HALF_OPEN_THRESHOLD"),
            half_open_count_threshold: var("HTTP_BREAKER_HALF_OPEN_COUNT_THRESHOLD"),
        }
        .into()
    }

    pub fn with_breaker_window(mut self, window: Duration) -> Self {
        self.breaker_window = window;
        self
    }

    pub fn with_open_threshold(mut self, ratio: f64) -> Self {
        self.open_threshold = ratio;
        self
    }

    pub fn with_open_count_threshold(mut self, count: u32) -> Self {
        self.open_count_threshold = count;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_max_open_duration(mut self, duration: Duration) -> Self {
        self.max_open_duration = duration;
        self
    }

    pub fn with_half_open_duration(mut self, duration: Duration) -> Self {
        self.half_open_duration = duration;
        self
    }

    pub fn with_half_open_threshold(mut self, ratio: f64) -> Self {
        self.half_open_threshold = ratio;
        self
    }

    pub fn with_half_open_count_threshold(mut self, count: u32) -> Self {
        self.half_open_count_threshold = count;
        self
    }

    /// Clamp an upstream-supplied open duration to `max_open_duration`.
    pub fn bounded_open_duration(&self, requested: Duration) -> Duration {
        requested.min(self.max_open_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.breaker_window, Duration::from_secs(60));
        assert_eq!(config.open_threshold, 0.8);
        assert_eq!(config.open_count_threshold, 60);
        assert_eq!(config.open_duration, Duration::from_secs(10));
        assert_eq!(config.max_open_duration, Duration::from_secs(60));
        assert_eq!(config.half_open_duration, Duration::from_secs(10));
        assert_eq!(config.half_open_threshold, 0.8);
        assert_eq!(config.half_open_count_threshold, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = BreakerConfig::new()
            .with_open_count_threshold(3)
            .with_open_duration(Duration::from_millis(100))
            .with_half_open_duration(Duration::from_millis(300));
        assert_eq!(config.open_count_threshold, 3);
        assert_eq!(config.open_duration, Duration::from_millis(100));
        assert_eq!(config.half_open_duration, Duration::from_millis(300));
        assert_eq!(config.breaker_window, DEFAULT_BREAKER_WINDOW);
    }

    #[test]
    fn test_options_fall_back_to_defaults() {
        let config: BreakerConfig = BreakerOptions {
            half_open_duration: Some(300),
            open_threshold: Some(0.0),
            open_count_threshold: Some(0),
            ..Default::default()
        }
        .into();
        assert_eq!(config.half_open_duration, Duration::from_millis(300));
        assert_eq!(config.open_threshold, DEFAULT_OPEN_THRESHOLD);
        assert_eq!(config.open_count_threshold, DEFAULT_OPEN_COUNT_THRESHOLD);
        assert_eq!(config.open_duration, DEFAULT_OPEN_DURATION);
    }

    #[test]
    fn test_options_from_json() {
        let opts =
            BreakerOptions::from_json(r#"{"breakerWindow": 5000, "halfOpenCountThreshold": 4}"#)
                .unwrap();
        assert_eq!(opts.breaker_window, Some(5000));
        assert_eq!(opts.half_open_count_threshold, Some(4));
        assert_eq!(opts.open_duration, None);

        let config = BreakerConfig::from(opts);
        assert_eq!(config.breaker_window, Duration::from_secs(5));
        assert_eq!(config.half_open_count_threshold, 4);
    }

    #[test]
    fn test_options_from_invalid_json() {
        let err = BreakerOptions::from_json(r#"{"openThreshold": "high"}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("HTTP_BREAKER_OPEN_COUNT_THRESHOLD", "7");
        std::env::set_var("HTTP_BREAKER_HALF_OPEN_DURATION_MS", "not-a-number");
        let config = BreakerConfig::from_env();
        std::env::remove_var("HTTP_BREAKER_OPEN_COUNT_THRESHOLD");
        std::env::remove_var("HTTP_BREAKER_HALF_OPEN_DURATION_MS");

        assert_eq!(config.open_count_threshold, 7);
        assert_eq!(config.half_open_duration, DEFAULT_HALF_OPEN_DURATION);
    }

    #[test]
    fn test_bounded_open_duration() {
        let config = BreakerConfig::default();
        assert_eq!(
            config.bounded_open_duration(Duration::from_secs(70)),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.bounded_open_duration(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }
}
