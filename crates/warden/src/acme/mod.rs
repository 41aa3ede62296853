//! ACME DNS-01 certificate lifecycle
//!
//! Obtains and renews certificates for one identity (an email contact plus a
//! domain list) and keeps everything about it in a single encrypted record.
//!
//! # Architecture
//!
//! - [`AcmeClient`] / [`AcmeSession`] - CA protocol seam, backed by `instant-acme`
//! - [`OrderController`] - Drives one order through its states
//! - [`ChallengeProvider`] - Publishes and removes DNS-01 TXT records
//! - [`IdentityManager`] - Registration plus create-or-renew per domain list
//! - [`IdentityStore`] - Persistent storage for the sealed identity
//! - [`Renewer`] / [`RenewalScheduler`] - Whole-flow runs, once or on an interval
//!
//! # Encryption
//!
//! The CA registration key is sealed with the issuer passphrase inside the
//! identity record, which is in turn sealed with the client passphrase. A
//! holder of only the client passphrase can read certificates but cannot
//! act on the CA account.
//!
//! # Order Flow
//!
//! 1. [`OrderController`] creates a new order for the domain list
//! 2. For each pending authorization, the DNS-01 digest is published under
//!    `_acme-challenge.<domain>`
//! 3. The challenge is accepted and the authorization polled to a final state
//! 4. The TXT record is removed once the authorization is valid
//! 5. The order is finalized with a CSR and the returned chain validated
//! 6. Leftover pending authorizations are deactivated in the background

mod challenge;
mod client;
mod envelope;
mod error;
mod identity;
mod keys;
mod order;
mod scheduler;
mod storage;
mod validator;

#[cfg(test)]
mod testing;

pub use challenge::{
    challenge_record_name, dns01_txt_value, key_authorization, ChallengeProvider,
    ACME_CHALLENGE_LABEL, CHALLENGE_TTL,
};
pub use client::{
    AccountInfo, AcmeClient, AcmeSession, Authorization, AuthorizationStatus, Challenge,
    ChallengeKind, InstantAcmeClient, OrderHandle, OrderStatus,
};
pub use envelope::{decrypt, encrypt};
pub use error::{AcmeError, ChallengeError, CryptoError, StorageError, ValidationError};
pub use identity::{
    fingerprint, Certificate, CertificateOutcome, CertificateRecord, Identity, IdentityManager,
    IdentityRecord, Registration, RegistrationRecord, RENEW_BEFORE_DAYS,
};
pub use keys::KeyMaterial;
pub use order::{CleanupReport, CleanupTask, OrderController, OrderState, Timeouts};
pub use scheduler::{RenewalOutcome, RenewalScheduler, Renewer};
pub use storage::{FileIdentityStore, IdentityStore, MemoryIdentityStore, StoredIdentity};
pub use validator::{render_bundle, request, validate, ValidatedLeaf};
