//! Certificate authority client
//!
//! The lifecycle code talks to the CA through [`AcmeClient`] and
//! [`AcmeSession`]. [`InstantAcmeClient`] implements both on top of the
//! `instant-acme` crate; tests substitute an in-process fake CA. The few
//! RFC 8555 requests `instant-acme` 0.7 has no call for (reading the account
//! object back, deactivating an authorization) go through `SignedRequests`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use instant_acme::{
    Account, AccountCredentials, BytesResponse, HttpClient, Identifier, NewAccount, NewOrder,
    Order,
};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, trace, warn};

use super::error::AcmeError;
use super::keys::KeyMaterial;

const POLL_INITIAL: Duration = Duration::from_millis(500);
const POLL_MAX: Duration = Duration::from_secs(8);

/// Timeout for a single signed request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const JOSE_JSON: &str = "application/jose+json";
const REPLAY_NONCE: &str = "replay-nonce";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// Attempts per signed request when the CA keeps rejecting the nonce
const NONCE_ATTEMPTS: u32 = 3;

/// Order status as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Authorization status as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other,
}

/// One challenge offered by an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
}

/// A domain authorization and the challenges it offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub url: String,
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

/// A freshly created order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub url: String,
    pub status: OrderStatus,
    pub authorization_urls: Vec<String>,
    pub finalize_url: String,
}

/// CA-assigned account metadata returned at registration.
///
/// `status` is empty and `orders_url` is `None` when the CA did not report
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub status: String,
    pub contact: Vec<String>,
    pub account_uri: String,
    pub orders_url: Option<String>,
}

/// Account-level CA operations
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Register a new account, agreeing to the CA terms of service.
    ///
    /// The client generates the P-256 account key and hands it back with the
    /// account metadata.
    async fn register(&self, contact: &[String]) -> Result<(KeyMaterial, AccountInfo), AcmeError>;

    /// Open a session for an existing account
    async fn bind(
        &self,
        account_key: &KeyMaterial,
        account_uri: &str,
    ) -> Result<Arc<dyn AcmeSession>, AcmeError>;
}

/// Order-level CA operations for one account
#[async_trait]
pub trait AcmeSession: Send + Sync {
    async fn new_order(&self, domains: &[String]) -> Result<OrderHandle, AcmeError>;

    /// Fetch the current state of an authorization
    async fn authorization(&self, url: &str) -> Result<Authorization, AcmeError>;

    /// Tell the CA a challenge is ready to be checked
    async fn accept_challenge(&self, challenge_url: &str) -> Result<(), AcmeError>;

    /// Poll until the authorization leaves `pending`, returning its final status
    async fn wait_authorization(&self, url: &str) -> Result<AuthorizationStatus, AcmeError>;

    /// Poll until the order leaves `pending`/`processing`
    async fn wait_order(&self, order_url: &str) -> Result<OrderStatus, AcmeError>;

    /// Submit the CSR and return the issued chain, leaf first, as DER
    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AcmeError>;

    async fn deactivate_authorization(&self, url: &str) -> Result<(), AcmeError>;
}

/// [`AcmeClient`] backed by `instant-acme`
#[derive(Debug, Clone)]
pub struct InstantAcmeClient {
    directory_url: String,
    http: reqwest::Client,
}

impl InstantAcmeClient {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }
}

/// Fields of the serialized `AccountCredentials` the registration keeps
#[derive(Deserialize)]
struct CredentialFields {
    id: String,
    key_pkcs8: String,
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn register(&self, contact: &[String]) -> Result<(KeyMaterial, AccountInfo), AcmeError> {
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (_account, credentials) = Account::create_with_http(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
            Box::new(ReqwestHttp(self.http.clone())),
        )
        .await?;

        let value = serde_json::to_value(&credentials)
            .map_err(|e| AcmeError::Protocol(format!("unreadable account credentials: {}", e)))?;
        let fields: CredentialFields = serde_json::from_value(value)
            .map_err(|e| AcmeError::Protocol(format!("unreadable account credentials: {}", e)))?;

        let der = URL_SAFE_NO_PAD
            .decode(fields.key_pkcs8.as_bytes())
            .map_err(|e| AcmeError::Protocol(format!("unreadable account key: {}", e)))?;
        let account_key = KeyMaterial::from_pkcs8_der(&der)?;

        // Account::create keeps the account object to itself; read it back.
        let requests = SignedRequests::new(
            self.http.clone(),
            &self.directory_url,
            account_key.clone(),
            &fields.id,
        );
        let info = match requests.account().await {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    account_uri = %fields.id,
                    error = %e,
                    "Could not read back the new account, status and orders URL unknown"
                );
                AccountInfo {
                    status: String::new(),
                    contact: contact.to_vec(),
                    account_uri: fields.id.clone(),
                    orders_url: None,
                }
            }
        };

        info!(
            account_uri = %info.account_uri,
            status = %info.status,
            directory = %self.directory_url,
            "Registered ACME account"
        );

        Ok((account_key, info))
    }

    async fn bind(
        &self,
        account_key: &KeyMaterial,
        account_uri: &str,
    ) -> Result<Arc<dyn AcmeSession>, AcmeError> {
        let credentials: AccountCredentials = serde_json::from_value(serde_json::json!({
            "id": account_uri,
            "key_pkcs8": URL_SAFE_NO_PAD.encode(account_key.pkcs8_der()),
            "directory": self.directory_url,
        }))
        .map_err(|e| AcmeError::Protocol(format!("invalid account credentials: {}", e)))?;

        let account =
            Account::from_credentials_and_http(credentials, Box::new(ReqwestHttp(self.http.clone())))
                .await?;
        debug!(account_uri = %account_uri, "Bound ACME account");

        Ok(Arc::new(InstantAcmeSession {
            account,
            order: Mutex::new(None),
            requests: SignedRequests::new(
                self.http.clone(),
                &self.directory_url,
                account_key.clone(),
                account_uri,
            ),
        }))
    }
}

/// `instant-acme` transport over the shared reqwest client
struct ReqwestHttp(reqwest::Client);

impl HttpClient for ReqwestHttp {
    fn request(
        &self,
        req: http::Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        let client = self.0.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(never) => match never {},
            };

            let response = client
                .request(parts.method, parts.uri.to_string())
                .headers(parts.headers)
                .timeout(REQUEST_TIMEOUT)
                .body(body)
                .send()
                .await
                .map_err(|e| instant_acme::Error::Other(Box::new(e)))?;

            let mut head = http::Response::new(());
            *head.status_mut() = response.status();
            *head.headers_mut() = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| instant_acme::Error::Other(Box::new(e)))?;

            Ok(BytesResponse {
                parts: head.into_parts().0,
                body: Box::new(body),
            })
        })
    }
}

/// One account's session; tracks the order currently being worked on.
struct InstantAcmeSession {
    account: Account,
    order: Mutex<Option<Order>>,
    requests: SignedRequests,
}

impl InstantAcmeSession {
    async fn fetch_authorization(order: &mut Order, url: &str) -> Result<Authorization, AcmeError> {
        let urls = order.state().authorizations.clone();
        let authorizations = order.authorizations().await?;

        urls.into_iter()
            .zip(authorizations)
            .find(|(candidate, _)| candidate == url)
            .map(|(url, authz)| convert_authorization(url, &authz))
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))
    }
}

#[async_trait]
impl AcmeSession for InstantAcmeSession {
    async fn new_order(&self, domains: &[String]) -> Result<OrderHandle, AcmeError> {
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let url = order.url().to_string();
        let state = order.state();
        let handle = OrderHandle {
            url,
            status: convert_order_status(&state.status),
            authorization_urls: state.authorizations.clone(),
            finalize_url: state.finalize.clone(),
        };

        *self.order.lock().await = Some(order);
        Ok(handle)
    }

    async fn authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        let mut guard = self.order.lock().await;
        let order = guard
            .as_mut()
            .ok_or_else(|| AcmeError::Protocol("no active order".to_string()))?;
        Self::fetch_authorization(order, url).await
    }

    async fn accept_challenge(&self, challenge_url: &str) -> Result<(), AcmeError> {
        let mut guard = self.order.lock().await;
        let order = guard
            .as_mut()
            .ok_or_else(|| AcmeError::Protocol("no active order".to_string()))?;
        order.set_challenge_ready(challenge_url).await?;
        Ok(())
    }

    async fn wait_authorization(&self, url: &str) -> Result<AuthorizationStatus, AcmeError> {
        let mut delay = POLL_INITIAL;
        loop {
            let authz = self.authorization(url).await?;
            if authz.status != AuthorizationStatus::Pending {
                return Ok(authz.status);
            }
            trace!(authorization = %url, delay_ms = delay.as_millis() as u64, "Authorization still pending");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    async fn wait_order(&self, order_url: &str) -> Result<OrderStatus, AcmeError> {
        let mut delay = POLL_INITIAL;
        loop {
            let status = {
                let mut guard = self.order.lock().await;
                let order = guard
                    .as_mut()
                    .ok_or_else(|| AcmeError::Protocol("no active order".to_string()))?;
                let state = order.refresh().await?;
                convert_order_status(&state.status)
            };

            match status {
                OrderStatus::Pending | OrderStatus::Processing => {
                    trace!(order = %order_url, status = %status, "Order not settled yet");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(POLL_MAX);
                }
                settled => return Ok(settled),
            }
        }
    }

    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AcmeError> {
        let mut guard = self.order.lock().await;
        let order = guard
            .as_mut()
            .ok_or_else(|| AcmeError::Protocol("no active order".to_string()))?;

        order.finalize(csr_der).await?;
        debug!(order = %order_url, "Submitted certificate signing request");

        let mut delay = POLL_INITIAL;
        let chain_pem = loop {
            match order.certificate().await? {
                Some(pem) => break pem,
                None => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(POLL_MAX);
                }
            }
        };

        let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .map(|cert| cert.map(|der| der.as_ref().to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AcmeError::Protocol(format!("unreadable certificate chain: {}", e)))?;

        Ok(chain)
    }

    async fn deactivate_authorization(&self, url: &str) -> Result<(), AcmeError> {
        self.requests.deactivate_authorization(url).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryUrls {
    new_nonce: String,
}

/// RFC 7807 problem document
#[derive(Debug, Default, Deserialize)]
struct Problem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    detail: String,
}

#[derive(Deserialize)]
struct AccountDocument {
    #[serde(default)]
    status: String,
    #[serde(default)]
    contact: Vec<String>,
    orders: Option<String>,
}

/// Account-signed (`kid`) JWS requests against the CA.
///
/// Fetches a fresh nonce per request and retries on `badNonce` with the
/// nonce the rejection carried.
struct SignedRequests {
    http: reqwest::Client,
    directory_url: String,
    new_nonce_url: OnceCell<String>,
    account_key: KeyMaterial,
    account_uri: String,
}

impl SignedRequests {
    fn new(
        http: reqwest::Client,
        directory_url: &str,
        account_key: KeyMaterial,
        account_uri: &str,
    ) -> Self {
        Self {
            http,
            directory_url: directory_url.to_string(),
            new_nonce_url: OnceCell::new(),
            account_key,
            account_uri: account_uri.to_string(),
        }
    }

    async fn nonce(&self) -> Result<String, AcmeError> {
        let new_nonce = self
            .new_nonce_url
            .get_or_try_init(|| async {
                let directory: DirectoryUrls = self
                    .http
                    .get(&self.directory_url)
                    .timeout(REQUEST_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok::<_, AcmeError>(directory.new_nonce)
            })
            .await?;

        let response = self
            .http
            .head(new_nonce)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AcmeError::Protocol(format!(
                "newNonce returned {}",
                response.status()
            )));
        }
        replay_nonce(response.headers())
            .ok_or_else(|| AcmeError::Protocol("newNonce returned no Replay-Nonce".to_string()))
    }

    /// POST `payload` to `url`, returning the response document
    async fn post(&self, url: &str, payload: &Value) -> Result<Value, AcmeError> {
        let mut nonce = self.nonce().await?;
        let mut attempt = 1;

        loop {
            let body = signed_body(&self.account_key, &self.account_uri, &nonce, url, payload)?;
            let response = self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .timeout(REQUEST_TIMEOUT)
                .body(body)
                .send()
                .await?;

            let status = response.status();
            let fresh = replay_nonce(response.headers());

            if status.is_success() {
                let bytes = response.bytes().await?;
                if bytes.is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_slice(&bytes).map_err(|e| {
                    AcmeError::Protocol(format!("unreadable response from {}: {}", url, e))
                });
            }

            let problem: Problem = response.json().await.unwrap_or_default();
            match fresh {
                Some(fresh) if problem.kind == BAD_NONCE && attempt < NONCE_ATTEMPTS => {
                    trace!(url = %url, attempt, "Nonce rejected, retrying");
                    nonce = fresh;
                    attempt += 1;
                }
                _ => {
                    return Err(AcmeError::Protocol(format!(
                        "{} returned {}: {} {}",
                        url, status, problem.kind, problem.detail
                    )))
                }
            }
        }
    }

    /// Current account object (an update with no changes)
    async fn account(&self) -> Result<AccountInfo, AcmeError> {
        let document: AccountDocument = serde_json::from_value(
            self.post(&self.account_uri, &json!({})).await?,
        )
        .map_err(|e| AcmeError::Protocol(format!("unreadable account object: {}", e)))?;

        Ok(AccountInfo {
            status: document.status,
            contact: document.contact,
            account_uri: self.account_uri.clone(),
            orders_url: document.orders,
        })
    }

    async fn deactivate_authorization(&self, url: &str) -> Result<(), AcmeError> {
        let authorization = self.post(url, &json!({ "status": "deactivated" })).await?;

        match authorization.get("status").and_then(Value::as_str) {
            Some("deactivated") => {
                debug!(authorization = %url, "Deactivated authorization");
                Ok(())
            }
            other => Err(AcmeError::Protocol(format!(
                "authorization {} is {} after deactivation",
                url,
                other.unwrap_or("unknown")
            ))),
        }
    }
}

/// Flattened JWS JSON serialization signed with ES256 under `kid`
fn signed_body(
    key: &KeyMaterial,
    kid: &str,
    nonce: &str,
    url: &str,
    payload: &Value,
) -> Result<String, AcmeError> {
    let protected = json!({ "alg": "ES256", "kid": kid, "nonce": nonce, "url": url });
    let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    let signature = key.sign(format!("{}.{}", protected, payload).as_bytes())?;

    Ok(json!({
        "protected": protected,
        "payload": payload,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    })
    .to_string())
}

fn replay_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn convert_order_status(status: &instant_acme::OrderStatus) -> OrderStatus {
    match status {
        instant_acme::OrderStatus::Pending => OrderStatus::Pending,
        instant_acme::OrderStatus::Ready => OrderStatus::Ready,
        instant_acme::OrderStatus::Processing => OrderStatus::Processing,
        instant_acme::OrderStatus::Valid => OrderStatus::Valid,
        instant_acme::OrderStatus::Invalid => OrderStatus::Invalid,
    }
}

#[allow(unreachable_patterns)]
fn convert_authorization(url: String, authz: &instant_acme::Authorization) -> Authorization {
    let domain = match &authz.identifier {
        Identifier::Dns(domain) => domain.clone(),
        other => format!("{:?}", other),
    };

    let status = match authz.status {
        instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
        instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
        instant_acme::AuthorizationStatus::Invalid => AuthorizationStatus::Invalid,
        instant_acme::AuthorizationStatus::Revoked => AuthorizationStatus::Revoked,
        instant_acme::AuthorizationStatus::Expired => AuthorizationStatus::Expired,
        _ => AuthorizationStatus::Deactivated,
    };

    let challenges = authz
        .challenges
        .iter()
        .map(|challenge| Challenge {
            kind: match challenge.r#type {
                instant_acme::ChallengeType::Dns01 => ChallengeKind::Dns01,
                instant_acme::ChallengeType::Http01 => ChallengeKind::Http01,
                instant_acme::ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
                _ => ChallengeKind::Other,
            },
            url: challenge.url.clone(),
            token: challenge.token.clone(),
        })
        .collect();

    Authorization {
        url,
        domain,
        status,
        challenges,
    }
}
