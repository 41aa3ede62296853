//! DNS challenge provider
//!
//! [`HttpDnsProvider`] publishes DNS-01 records through a small HTTP
//! management API (`POST /set-txt`, `POST /clear-txt`, as spoken by the ACME
//! test DNS server) and then polls a resolver until the change is visible.
//! Propagation checks go through [`TxtLookup`]; the default is an uncached
//! hickory resolver.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use crate::acme::{ChallengeError, ChallengeProvider, CHALLENGE_TTL};

/// Default bound on waiting for a record change to become visible
const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// First delay between propagation checks
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Longest delay between propagation checks
const MAX_BACKOFF: Duration = Duration::from_secs(16);

/// Timeout for a single management API request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct SetTxt<'a> {
    host: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct ClearTxt<'a> {
    host: &'a str,
}

/// Whether a record is expected to hold a value or to have lost it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Present,
    Absent,
}

/// Source of TXT answers for propagation checks
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// Values of the TXT records at `name`, empty when there are none
    async fn txt_values(&self, name: &str) -> Result<Vec<String>, ChallengeError>;
}

#[async_trait]
impl TxtLookup for TokioAsyncResolver {
    async fn txt_values(&self, name: &str) -> Result<Vec<String>, ChallengeError> {
        match self.txt_lookup(name).await {
            Ok(records) => Ok(records.iter().map(|txt| txt.to_string()).collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(ChallengeError::Lookup {
                    record: name.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// ChallengeProvider backed by an HTTP DNS management API
pub struct HttpDnsProvider {
    http: reqwest::Client,
    api_url: String,
    zone: String,
    lookup: Box<dyn TxtLookup>,
    propagation_timeout: Duration,
}

impl HttpDnsProvider {
    /// Create a provider for `zone`.
    ///
    /// Propagation is confirmed through `nameserver` (`host:port`) when
    /// given, otherwise through the system resolver. Neither caches answers.
    pub fn new(
        api_url: impl Into<String>,
        zone: impl Into<String>,
        nameserver: Option<&str>,
    ) -> Result<Self, ChallengeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChallengeError::Provider(e.to_string()))?;

        let resolver = match nameserver {
            Some(addr) => resolver_for(addr)?,
            None => system_resolver()?,
        };

        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            zone: normalize(&zone.into()),
            lookup: Box::new(resolver),
            propagation_timeout: DEFAULT_PROPAGATION_TIMEOUT,
        })
    }

    /// Confirm propagation through `lookup` instead of the resolver
    pub fn with_lookup(mut self, lookup: impl TxtLookup + 'static) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    pub fn with_propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout = timeout;
        self
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn check_zone(&self, record_name: &str) -> Result<(), ChallengeError> {
        if in_zone(record_name, &self.zone) {
            Ok(())
        } else {
            Err(ChallengeError::OutsideZone {
                record: record_name.to_string(),
                zone: self.zone.clone(),
            })
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ChallengeError> {
        let url = format!("{}/{}", self.api_url, path);
        trace!(url = %url, "DNS management request");

        self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ChallengeError::Provider(format!("{} failed: {}", path, e)))?;
        Ok(())
    }

    /// Poll until `record_name` holds (or no longer holds) `value`.
    async fn wait_for(
        &self,
        record_name: &str,
        value: &str,
        expect: Expect,
    ) -> Result<(), ChallengeError> {
        let start = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let present = self
                .lookup
                .txt_values(record_name)
                .await?
                .iter()
                .any(|txt| txt == value);
            if present == (expect == Expect::Present) {
                debug!(
                    record = %record_name,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "DNS change visible"
                );
                return Ok(());
            }

            if start.elapsed() + delay > self.propagation_timeout {
                return Err(ChallengeError::Propagation {
                    record: record_name.to_string(),
                    after: start.elapsed(),
                });
            }

            trace!(record = %record_name, attempts, delay_ms = delay.as_millis() as u64, "DNS change not visible yet");
            sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
}

#[async_trait]
impl ChallengeProvider for HttpDnsProvider {
    async fn create_challenge(&self, record_name: &str, value: &str) -> Result<(), ChallengeError> {
        self.check_zone(record_name)?;

        self.post(
            "set-txt",
            &SetTxt {
                host: record_name,
                value,
            },
        )
        .await?;
        info!(record = %record_name, ttl = CHALLENGE_TTL, "Published challenge record");

        self.wait_for(record_name, value, Expect::Present).await
    }

    async fn remove_challenge(&self, record_name: &str, value: &str) -> Result<(), ChallengeError> {
        self.check_zone(record_name)?;

        self.post("clear-txt", &ClearTxt { host: record_name }).await?;
        info!(record = %record_name, "Removed challenge record");

        self.wait_for(record_name, value, Expect::Absent).await
    }
}

impl std::fmt::Debug for HttpDnsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDnsProvider")
            .field("api_url", &self.api_url)
            .field("zone", &self.zone)
            .field("propagation_timeout", &self.propagation_timeout)
            .finish()
    }
}

/// Resolver that asks only `addr` (`host:port`)
fn resolver_for(addr: &str) -> Result<TokioAsyncResolver, ChallengeError> {
    let addrs = nameserver_addrs(addr)?;
    let ips: Vec<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();

    let nameservers = NameServerConfigGroup::from_ips_clear(&ips, addrs[0].port(), true);
    let config = ResolverConfig::from_parts(None, vec![], nameservers);

    Ok(TokioAsyncResolver::tokio(config, uncached(ResolverOpts::default())))
}

/// Resolver from the system configuration
fn system_resolver() -> Result<TokioAsyncResolver, ChallengeError> {
    let (config, opts) = read_system_conf().map_err(|e| {
        ChallengeError::Provider(format!("failed to read system resolver configuration: {}", e))
    })?;
    Ok(TokioAsyncResolver::tokio(config, uncached(opts)))
}

/// Propagation checks must see every change, so nothing is cached.
fn uncached(mut opts: ResolverOpts) -> ResolverOpts {
    opts.cache_size = 0;
    opts
}

/// Socket addresses of a `host:port` or `ip:port` nameserver
fn nameserver_addrs(addr: &str) -> Result<Vec<SocketAddr>, ChallengeError> {
    let invalid = |reason: String| {
        ChallengeError::Provider(format!(
            "invalid resolver address {:?}, expected host:port: {}",
            addr, reason
        ))
    };

    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(invalid("no addresses".to_string()));
    }
    Ok(addrs)
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `record_name` is `zone` itself or a name below it.
fn in_zone(record_name: &str, zone: &str) -> bool {
    let name = normalize(record_name);
    let zone = normalize(zone);
    if zone.is_empty() {
        return false;
    }
    name == zone || name.ends_with(&format!(".{}", zone))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_in_zone() {
        assert!(in_zone("_acme-challenge.example.com.", "example.com"));
        assert!(in_zone("_acme-challenge.www.example.com.", "example.com."));
        assert!(in_zone("_acme-challenge.Example.COM", "example.com"));
        assert!(in_zone("example.com.", "example.com"));
    }

    #[test]
    fn test_outside_zone() {
        assert!(!in_zone("_acme-challenge.example.org.", "example.com"));
        assert!(!in_zone("_acme-challenge.notexample.com.", "example.com"));
        assert!(!in_zone("_acme-challenge.example.com.", ""));
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_record() {
        let provider =
            HttpDnsProvider::new("http://127.0.0.1:1", "example.com.", Some("127.0.0.1:8053"))
                .unwrap();
        assert_eq!(provider.zone(), "example.com");

        let err = provider
            .create_challenge("_acme-challenge.example.org.", "value")
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::OutsideZone { .. }));

        let err = provider
            .remove_challenge("_acme-challenge.example.org.", "value")
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::OutsideZone { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_provider_error() {
        let provider =
            HttpDnsProvider::new("http://127.0.0.1:1/", "example.com", Some("127.0.0.1:8053"))
                .unwrap();

        let err = provider
            .create_challenge("_acme-challenge.example.com.", "value")
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Provider(_)));
    }

    #[test]
    fn test_invalid_resolver_address() {
        let err = resolver_for("not-an-address").unwrap_err();
        assert!(matches!(err, ChallengeError::Provider(_)));
    }

    #[tokio::test]
    async fn test_nameserver_by_ip_or_host() {
        assert_eq!(
            nameserver_addrs("127.0.0.1:8053").unwrap(),
            vec!["127.0.0.1:8053".parse::<SocketAddr>().unwrap()]
        );

        let addrs = nameserver_addrs("localhost:8053").unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 8053 && a.ip().is_loopback()));

        assert!(resolver_for("localhost:8053").is_ok());
    }

    #[test]
    fn test_resolver_options_disable_cache() {
        let mut opts = ResolverOpts::default();
        opts.cache_size = 64;
        assert_eq!(uncached(opts).cache_size, 0);
    }

    /// Answers from a script, one per lookup; the last answer repeats.
    struct ScriptedLookup {
        answers: Vec<Vec<&'static str>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedLookup {
        fn new(answers: Vec<Vec<&'static str>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    answers,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl TxtLookup for ScriptedLookup {
        async fn txt_values(&self, _name: &str) -> Result<Vec<String>, ChallengeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = &self.answers[call.min(self.answers.len() - 1)];
            Ok(answer.iter().map(|v| v.to_string()).collect())
        }
    }

    struct BrokenLookup;

    #[async_trait]
    impl TxtLookup for BrokenLookup {
        async fn txt_values(&self, name: &str) -> Result<Vec<String>, ChallengeError> {
            Err(ChallengeError::Lookup {
                record: name.to_string(),
                reason: "SERVFAIL".to_string(),
            })
        }
    }

    fn provider(lookup: impl TxtLookup + 'static) -> HttpDnsProvider {
        HttpDnsProvider::new("http://127.0.0.1:1", "example.com", Some("127.0.0.1:8053"))
            .unwrap()
            .with_lookup(lookup)
    }

    const RECORD: &str = "_acme-challenge.example.com.";

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_value_to_appear() {
        let (lookup, calls) = ScriptedLookup::new(vec![
            vec![],
            vec![],
            vec!["stale"],
            vec!["stale", "token"],
        ]);
        let provider = provider(lookup);

        provider.wait_for(RECORD, "token", Expect::Present).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_value_to_disappear() {
        let (lookup, calls) =
            ScriptedLookup::new(vec![vec!["token"], vec!["token"], vec!["other"]]);
        let provider = provider(lookup);

        provider.wait_for(RECORD, "token", Expect::Absent).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_gives_up_after_timeout() {
        let (lookup, calls) = ScriptedLookup::new(vec![vec![]]);
        let provider = provider(lookup).with_propagation_timeout(Duration::from_secs(10));
        let start = Instant::now();

        let err = provider
            .wait_for(RECORD, "token", Expect::Present)
            .await
            .unwrap_err();

        match err {
            ChallengeError::Propagation { record, after } => {
                assert_eq!(record, RECORD);
                assert!(after <= Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(start.elapsed() <= Duration::from_secs(10));
        // 250 ms doubling: checks at 0, 0.25, 0.75, 1.75, 3.75 and 7.75 s
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reported() {
        let provider = provider(BrokenLookup);

        let err = provider
            .wait_for(RECORD, "token", Expect::Present)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Lookup { .. }));
    }

    #[test]
    fn test_request_bodies() {
        let body = serde_json::to_value(SetTxt {
            host: "_acme-challenge.example.com.",
            value: "abc",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"host": "_acme-challenge.example.com.", "value": "abc"})
        );

        let body = serde_json::to_value(ClearTxt {
            host: "_acme-challenge.example.com.",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"host": "_acme-challenge.example.com."}));
    }
}
