//! In-process CA and DNS doubles for tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    IsCa, KeyPair, SanType,
};
use rustls_pki_types::CertificateSigningRequestDer;

use super::challenge::ChallengeProvider;
use super::client::{
    AccountInfo, AcmeClient, AcmeSession, Authorization, AuthorizationStatus, Challenge,
    ChallengeKind, OrderHandle, OrderStatus,
};
use super::error::{AcmeError, ChallengeError};
use super::keys::KeyMaterial;

/// Every call the doubles observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Register,
    Bind,
    NewOrder,
    Authorization(String),
    Accept(String),
    WaitAuthorization(String),
    WaitOrder,
    Finalize,
    Deactivate(String),
    CreateChallenge(String),
    RemoveChallenge(String),
}

pub type Journal = Arc<Mutex<Vec<FakeCall>>>;

fn to_time(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).unwrap()
}

/// DER certificate for `key` covering `domains`
pub fn self_signed(
    key: &KeyMaterial,
    domains: &[String],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Vec<u8> {
    let key_pair = key.to_rcgen().unwrap();
    let mut params = CertificateParams::new(domains.to_vec()).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, domains[0].as_str());
    params.not_before = to_time(not_before);
    params.not_after = to_time(not_after);
    params.self_signed(&key_pair).unwrap().der().to_vec()
}

/// DER certificate with an Ed25519 key
pub fn self_signed_ed25519(
    domains: &[String],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Vec<u8> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
    let mut params = CertificateParams::new(domains.to_vec()).unwrap();
    params.not_before = to_time(not_before);
    params.not_after = to_time(not_after);
    params.self_signed(&key_pair).unwrap().der().to_vec()
}

struct FakeAuthz {
    url: String,
    challenge_url: String,
    domain: String,
    token: String,
    status: AuthorizationStatus,
    accepted: bool,
}

struct FakeState {
    initial_status: OrderStatus,
    authz_overrides: HashMap<String, AuthorizationStatus>,
    no_dns01: HashSet<String>,
    fail_authz: HashSet<String>,
    stall_authz: HashSet<String>,
    stall_accept: HashSet<String>,
    fail_deactivation: bool,
    fail_register: bool,
    issue_for_other_key: bool,
    now: DateTime<Utc>,
    validity: Duration,
    orders: usize,
    order_domains: Vec<String>,
    authorizations: Vec<FakeAuthz>,
}

struct FakeInner {
    state: Mutex<FakeState>,
    journal: Journal,
    ca_key: KeyPair,
    ca_cert: Certificate,
}

impl FakeInner {
    fn record(&self, call: FakeCall) {
        self.journal.lock().unwrap().push(call);
    }
}

/// A fake certificate authority
///
/// Orders start `pending` with one pending authorization per domain unless
/// told otherwise; accepted challenges resolve to `valid` on the next wait.
/// Finalization signs the CSR's key for every order domain with a throwaway
/// root, valid from the fake's clock for `validity`.
#[derive(Clone)]
pub struct FakeAcme {
    inner: Arc<FakeInner>,
}

impl FakeAcme {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Fake ACME Root");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self {
            inner: Arc::new(FakeInner {
                state: Mutex::new(FakeState {
                    initial_status: OrderStatus::Pending,
                    authz_overrides: HashMap::new(),
                    no_dns01: HashSet::new(),
                    fail_authz: HashSet::new(),
                    stall_authz: HashSet::new(),
                    stall_accept: HashSet::new(),
                    fail_deactivation: false,
                    fail_register: false,
                    issue_for_other_key: false,
                    now: Utc::now(),
                    validity: Duration::days(90),
                    orders: 0,
                    order_domains: Vec::new(),
                    authorizations: Vec::new(),
                }),
                journal: Arc::new(Mutex::new(Vec::new())),
                ca_key,
                ca_cert,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.inner.state.lock().unwrap())
    }

    pub fn session(&self) -> Arc<dyn AcmeSession> {
        Arc::new(FakeSession {
            inner: self.inner.clone(),
        })
    }

    pub fn journal(&self) -> Journal {
        self.inner.journal.clone()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.inner.journal.lock().unwrap().clone()
    }

    pub fn count(&self, call: &FakeCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn set_initial_status(&self, status: OrderStatus) {
        self.with_state(|s| s.initial_status = status);
    }

    pub fn set_authorization_status(&self, domain: &str, status: AuthorizationStatus) {
        self.with_state(|s| s.authz_overrides.insert(domain.to_string(), status));
    }

    pub fn without_dns01(&self, domain: &str) {
        self.with_state(|s| s.no_dns01.insert(domain.to_string()));
    }

    pub fn fail_authorization(&self, domain: &str) {
        self.with_state(|s| s.fail_authz.insert(domain.to_string()));
    }

    pub fn stall_authorization(&self, domain: &str) {
        self.with_state(|s| s.stall_authz.insert(domain.to_string()));
    }

    /// Never answer the challenge-ready request for `domain`
    pub fn stall_accept(&self, domain: &str) {
        self.with_state(|s| s.stall_accept.insert(domain.to_string()));
    }

    pub fn fail_deactivation(&self) {
        self.with_state(|s| s.fail_deactivation = true);
    }

    pub fn fail_registration(&self) {
        self.with_state(|s| s.fail_register = true);
    }

    pub fn issue_for_other_key(&self) {
        self.with_state(|s| s.issue_for_other_key = true);
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.with_state(|s| s.now = now);
    }

    pub fn token_for(&self, domain: &str) -> String {
        self.with_state(|s| {
            s.authorizations
                .iter()
                .find(|a| a.domain == domain)
                .map(|a| a.token.clone())
                .unwrap()
        })
    }
}

#[async_trait]
impl AcmeClient for FakeAcme {
    async fn register(&self, contact: &[String]) -> Result<(KeyMaterial, AccountInfo), AcmeError> {
        self.inner.record(FakeCall::Register);
        if self.with_state(|s| s.fail_register) {
            return Err(AcmeError::Protocol(
                "urn:ietf:params:acme:error:invalidContact".to_string(),
            ));
        }

        let key = KeyMaterial::generate()?;
        Ok((
            key,
            AccountInfo {
                status: "valid".to_string(),
                contact: contact.to_vec(),
                account_uri: "https://ca.test/acme/acct/1".to_string(),
                orders_url: Some("https://ca.test/acme/acct/1/orders".to_string()),
            },
        ))
    }

    async fn bind(
        &self,
        _account_key: &KeyMaterial,
        _account_uri: &str,
    ) -> Result<Arc<dyn AcmeSession>, AcmeError> {
        self.inner.record(FakeCall::Bind);
        Ok(self.session())
    }
}

struct FakeSession {
    inner: Arc<FakeInner>,
}

impl FakeSession {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.inner.state.lock().unwrap()
    }
}

#[async_trait]
impl AcmeSession for FakeSession {
    async fn new_order(&self, domains: &[String]) -> Result<OrderHandle, AcmeError> {
        self.inner.record(FakeCall::NewOrder);
        let mut state = self.state();
        state.orders += 1;
        let order = state.orders;

        let default_status = if state.initial_status == OrderStatus::Pending {
            AuthorizationStatus::Pending
        } else {
            AuthorizationStatus::Valid
        };

        let authorizations: Vec<FakeAuthz> = domains
            .iter()
            .enumerate()
            .map(|(i, domain)| FakeAuthz {
                url: format!("https://ca.test/acme/authz/{}/{}", order, i),
                challenge_url: format!("https://ca.test/acme/chall/{}/{}", order, i),
                domain: domain.clone(),
                token: format!("token-{}-{}", order, i),
                status: state
                    .authz_overrides
                    .get(domain)
                    .copied()
                    .unwrap_or(default_status),
                accepted: false,
            })
            .collect();

        let handle = OrderHandle {
            url: format!("https://ca.test/acme/order/{}", order),
            status: state.initial_status,
            authorization_urls: authorizations.iter().map(|a| a.url.clone()).collect(),
            finalize_url: format!("https://ca.test/acme/order/{}/finalize", order),
        };

        state.order_domains = domains.to_vec();
        state.authorizations = authorizations;
        Ok(handle)
    }

    async fn authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        let state = self.state();
        let authz = state
            .authorizations
            .iter()
            .find(|a| a.url == url)
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))?;

        let mut challenges = vec![Challenge {
            kind: ChallengeKind::Http01,
            url: format!("{}/http", authz.challenge_url),
            token: authz.token.clone(),
        }];
        if !state.no_dns01.contains(&authz.domain) {
            challenges.push(Challenge {
                kind: ChallengeKind::Dns01,
                url: authz.challenge_url.clone(),
                token: authz.token.clone(),
            });
        }

        self.inner
            .record(FakeCall::Authorization(authz.domain.clone()));
        Ok(Authorization {
            url: authz.url.clone(),
            domain: authz.domain.clone(),
            status: authz.status,
            challenges,
        })
    }

    async fn accept_challenge(&self, challenge_url: &str) -> Result<(), AcmeError> {
        let stalled = {
            let state = self.state();
            state
                .authorizations
                .iter()
                .find(|a| a.challenge_url == challenge_url)
                .map(|a| state.stall_accept.contains(&a.domain))
                .unwrap_or(false)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        let authz = state
            .authorizations
            .iter_mut()
            .find(|a| a.challenge_url == challenge_url)
            .ok_or_else(|| AcmeError::Protocol(format!("unknown challenge {}", challenge_url)))?;
        authz.accepted = true;
        self.inner.record(FakeCall::Accept(authz.domain.clone()));
        Ok(())
    }

    async fn wait_authorization(&self, url: &str) -> Result<AuthorizationStatus, AcmeError> {
        let stalled = {
            let state = self.state();
            state
                .authorizations
                .iter()
                .find(|a| a.url == url)
                .map(|a| state.stall_authz.contains(&a.domain))
                .unwrap_or(false)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        let fail = state.fail_authz.clone();
        let authz = state
            .authorizations
            .iter_mut()
            .find(|a| a.url == url)
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))?;

        if authz.status == AuthorizationStatus::Pending && authz.accepted {
            authz.status = if fail.contains(&authz.domain) {
                AuthorizationStatus::Invalid
            } else {
                AuthorizationStatus::Valid
            };
        }
        self.inner
            .record(FakeCall::WaitAuthorization(authz.domain.clone()));
        Ok(authz.status)
    }

    async fn wait_order(&self, _order_url: &str) -> Result<OrderStatus, AcmeError> {
        self.inner.record(FakeCall::WaitOrder);
        let state = self.state();
        if state
            .authorizations
            .iter()
            .all(|a| a.status == AuthorizationStatus::Valid)
        {
            Ok(OrderStatus::Ready)
        } else {
            Ok(OrderStatus::Invalid)
        }
    }

    async fn finalize(&self, _order_url: &str, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AcmeError> {
        self.inner.record(FakeCall::Finalize);
        let state = self.state();

        let csr = CertificateSigningRequestParams::from_der(&CertificateSigningRequestDer::from(
            csr_der.to_vec(),
        ))
        .map_err(|e| AcmeError::Protocol(format!("badCSR: {}", e)))?;

        let mut params = csr.params;
        params.subject_alt_names = state
            .order_domains
            .iter()
            .map(|d| SanType::DnsName(d.clone().try_into().unwrap()))
            .collect();
        params.not_before = to_time(state.now);
        params.not_after = to_time(state.now + state.validity);

        let leaf = if state.issue_for_other_key {
            let other = KeyPair::generate().unwrap();
            params.signed_by(&other, &self.inner.ca_cert, &self.inner.ca_key)
        } else {
            params.signed_by(&csr.public_key, &self.inner.ca_cert, &self.inner.ca_key)
        }
        .map_err(|e| AcmeError::Protocol(e.to_string()))?;

        Ok(vec![
            leaf.der().to_vec(),
            self.inner.ca_cert.der().to_vec(),
        ])
    }

    async fn deactivate_authorization(&self, url: &str) -> Result<(), AcmeError> {
        let mut state = self.state();
        let refuse = state.fail_deactivation;
        let authz = state
            .authorizations
            .iter_mut()
            .find(|a| a.url == url)
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))?;

        self.inner.record(FakeCall::Deactivate(authz.domain.clone()));
        if refuse {
            return Err(AcmeError::Protocol("deactivation refused".to_string()));
        }
        authz.status = AuthorizationStatus::Deactivated;
        Ok(())
    }
}

/// Challenge provider that records every record it is asked to manage
#[derive(Default)]
pub struct RecordingChallenges {
    journal: Option<Journal>,
    created: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<(String, String)>>,
    fail_create: bool,
}

impl RecordingChallenges {
    /// Also append calls to a CA journal, to observe interleaving
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn values(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn record(&self, call: FakeCall) {
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push(call);
        }
    }
}

#[async_trait]
impl ChallengeProvider for RecordingChallenges {
    async fn create_challenge(&self, record_name: &str, value: &str) -> Result<(), ChallengeError> {
        if self.fail_create {
            return Err(ChallengeError::Provider("zone is read-only".to_string()));
        }
        self.record(FakeCall::CreateChallenge(record_name.to_string()));
        self.created
            .lock()
            .unwrap()
            .push((record_name.to_string(), value.to_string()));
        Ok(())
    }

    async fn remove_challenge(&self, record_name: &str, value: &str) -> Result<(), ChallengeError> {
        self.record(FakeCall::RemoveChallenge(record_name.to_string()));
        self.removed
            .lock()
            .unwrap()
            .push((record_name.to_string(), value.to_string()));
        Ok(())
    }
}
