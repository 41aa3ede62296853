//! DNS-01 provider against pebble-challtestsrv
//!
//! challtestsrv speaks the same `/set-txt` and `/clear-txt` management API
//! and answers DNS queries for the records it holds.
//!
//! To run these tests:
//! ```text
//! docker run -d -p 8055:8055 -p 8053:8053/udp ghcr.io/letsencrypt/pebble-challtestsrv
//! cargo test -p certwarden --test challtestsrv -- --ignored
//! ```
//!
//! `CHALLTESTSRV_API` and `CHALLTESTSRV_DNS` override the endpoints.

use std::time::Duration;

use certwarden::acme::{challenge_record_name, ChallengeProvider};
use certwarden::HttpDnsProvider;

fn endpoint(variable: &str, default: &str) -> String {
    std::env::var(variable).unwrap_or_else(|_| default.to_string())
}

fn provider() -> HttpDnsProvider {
    HttpDnsProvider::new(
        endpoint("CHALLTESTSRV_API", "http://localhost:8055"),
        "example.test",
        Some(&endpoint("CHALLTESTSRV_DNS", "localhost:8053")),
    )
    .expect("Failed to create DNS provider")
    .with_propagation_timeout(Duration::from_secs(30))
}

#[tokio::test]
#[ignore = "Requires pebble-challtestsrv"]
async fn test_challenge_record_round_trip() {
    let provider = provider();
    let record = challenge_record_name("www.example.test");

    provider
        .create_challenge(&record, "certwarden-round-trip")
        .await
        .expect("record should become visible");

    provider
        .remove_challenge(&record, "certwarden-round-trip")
        .await
        .expect("record should disappear");
}

#[tokio::test]
#[ignore = "Requires pebble-challtestsrv"]
async fn test_replaced_value_is_confirmed() {
    let provider = provider();
    let record = challenge_record_name("api.example.test");

    provider.create_challenge(&record, "first").await.unwrap();
    provider.remove_challenge(&record, "first").await.unwrap();
    provider.create_challenge(&record, "second").await.unwrap();
    provider.remove_challenge(&record, "second").await.unwrap();
}
