//! DNS-01 challenge records
//!
//! The CA proves domain control by looking up a TXT record at
//! `_acme-challenge.<domain>.` holding a digest of the challenge token and the
//! account key. Publishing and removing that record is delegated to a
//! [`ChallengeProvider`].

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::digest::{digest, SHA256};

use super::error::ChallengeError;
use super::keys::KeyMaterial;

/// Label prepended to the validated domain
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// TTL for challenge records, in seconds
pub const CHALLENGE_TTL: u32 = 60;

/// Publishes and removes DNS-01 TXT records.
///
/// Both calls return only once the change is authoritative, so the caller can
/// tell the CA to look right away.
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// Publish `value` as a TXT record at `record_name`
    async fn create_challenge(&self, record_name: &str, value: &str) -> Result<(), ChallengeError>;

    /// Remove the TXT record published for `value`
    async fn remove_challenge(&self, record_name: &str, value: &str) -> Result<(), ChallengeError>;
}

/// Fully-qualified TXT record name for `domain`.
///
/// Wildcard identifiers are validated at their base domain.
pub fn challenge_record_name(domain: &str) -> String {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!(
        "{}.{}.",
        ACME_CHALLENGE_LABEL,
        domain.trim_end_matches('.')
    )
}

/// Key authorization: `token "." thumbprint(account key)`
pub fn key_authorization(token: &str, account_key: &KeyMaterial) -> String {
    format!("{}.{}", token, account_key.jwk_thumbprint())
}

/// TXT record value for a DNS-01 challenge
pub fn dns01_txt_value(token: &str, account_key: &KeyMaterial) -> String {
    let key_authorization = key_authorization(token, account_key);
    URL_SAFE_NO_PAD.encode(digest(&SHA256, key_authorization.as_bytes()))
}
