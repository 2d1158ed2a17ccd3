//! Circuit breaker walkthrough
//!
//! Drives a breaker through closed → open → half-open → closed with short
//! durations, then (optionally) sends a few real requests through it.
//!
//! Usage:
//!   cargo run --example breaker_demo
//!   BREAKER_DEMO_URL=https://httpbin.org/status/503 cargo run --example breaker_demo

use http_breaker::resilience::{BreakerOptions, BreakerRegistry};
use http_breaker::{request, BreakerConfig, Error};
use reqwest::header::HeaderMap;
use std::env;
use std::time::Duration;

const OPTIONS: &str = r#"{
    "openCountThreshold": 5,
    "openDuration": 1000,
    "halfOpenDuration": 1500,
    "halfOpenCountThreshold": 3
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .with_target(false)
        .try_init();

    let cfg = BreakerConfig::from(BreakerOptions::from_json(OPTIONS)?);
    println!("=== http-breaker demo ===\n");
    println!("config: {cfg:?}\n");

    let registry = BreakerRegistry::with_config(cfg);
    let breaker = registry.get("demo-upstream");
    let none = HeaderMap::new();

    println!("--- 5 server errors ---");
    for i in 1..=5 {
        breaker.on_request(503, &none);
        println!("  after failure {i}: {}", breaker.state());
    }

    println!("\n--- waiting out the open period ---");
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let admitted = (0..20).filter(|_| !breaker.is_open()).count();
    println!("  state: {}, admitted {admitted}/20 probes", breaker.state());

    println!("\n--- surviving probation ---");
    tokio::time::sleep(Duration::from_millis(1_600)).await;
    println!("  state: {}", breaker.state());

    println!("\n--- a 429 opens it at once ---");
    breaker.on_request(429, &none);
    println!(
        "  state: {}, retry after {:?}",
        breaker.state(),
        breaker.retry_after()
    );

    if let Ok(url) = env::var("BREAKER_DEMO_URL") {
        println!("\n--- live requests to {url} ---");
        let live = registry.get("live");
        for i in 1..=8 {
            let result = request(&url, "GET")
                .circuit_breaker(live.clone())
                .send()
                .await;
            match result {
                Ok(resp) => println!("  #{i}: HTTP {}", resp.status),
                Err(Error::CircuitOpen { name, response }) => println!(
                    "  #{i}: shed by '{name}', retry-after {}",
                    response.header("retry-after").unwrap_or("?")
                ),
                Err(e) => println!("  #{i}: {e}"),
            }
        }
        println!("  snapshot: {:?}", live.snapshot());
    }

    Ok(())
}
