//! ACME error types

use std::time::Duration;

use certwarden_config::ConfigError;
use thiserror::Error;

/// Errors from key handling and envelope encryption
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Input is not a well-formed encrypted blob (bad encoding, truncated, unknown version)
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// Wrong passphrase or tampered ciphertext
    #[error("authentication failed: wrong passphrase or corrupted ciphertext")]
    Authentication,

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The process cannot continue without entropy
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Decrypted identity belongs to a different email
    #[error("identity record is for {found}, expected {expected}")]
    IdentityMismatch { expected: String, found: String },
}

/// Reasons a returned certificate chain is rejected
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no certificate found in chain")]
    NoCertificate,

    #[error("failed to parse certificate chain: {0}")]
    Parse(String),

    #[error("certificate is not valid yet (not before {not_before})")]
    NotYetValid { not_before: String },

    #[error("expired certificate (not after {not_after})")]
    Expired { not_after: String },

    #[error("certificate is not valid for {hostname}")]
    HostnameMismatch { hostname: String },

    #[error("private key does not match public key")]
    KeyMismatch,

    #[error("unknown public key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid domain list: {0}")]
    InvalidDomains(String),

    #[error("failed to build certificate request: {0}")]
    Request(String),
}

/// DNS challenge provider failures
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("record {record} is outside zone {zone}")]
    OutsideZone { record: String, zone: String },

    #[error("DNS provider request failed: {0}")]
    Provider(String),

    #[error("DNS lookup failed for {record}: {reason}")]
    Lookup { record: String, reason: String },

    #[error("record {record} did not propagate after {after:?}")]
    Propagation { record: String, after: Duration },
}

/// Identity store failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record stored for {expected} belongs to {found}")]
    KeyMismatch { expected: String, found: String },
}

/// Top-level error of the certificate lifecycle
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// CA-side rejection or transport failure
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("invalid new order status {status:?}; order URL: {url:?}")]
    InvalidOrderStatus { status: String, url: String },

    #[error("authorization for {domain} ended in status {status:?}")]
    InvalidAuthorization { domain: String, status: String },

    #[error("no DNS-01 challenge offered for {domain}")]
    Dns01Unavailable { domain: String },

    /// Operation needs a CA registration the identity does not have
    #[error("identity {email} has no usable CA registration")]
    NotRegistered { email: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl AcmeError {
    /// Whether a later scheduled run may succeed without any change.
    ///
    /// Timeouts and protocol errors are transient from the caller's point of
    /// view; configuration, crypto and validation errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcmeError::Timeout { .. }
                | AcmeError::Protocol(_)
                | AcmeError::InvalidOrderStatus { .. }
                | AcmeError::InvalidAuthorization { .. }
                | AcmeError::Challenge(_)
        )
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for AcmeError {
    fn from(e: reqwest::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}
