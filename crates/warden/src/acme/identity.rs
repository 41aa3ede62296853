//! Identities, their persisted form, and the lifecycle orchestrator
//!
//! An [`Identity`] is one email's CA registration plus the certificates
//! issued for it. At rest it is a single envelope-encrypted JSON document
//! (client passphrase) in which the registration is itself an independently
//! encrypted blob (issuer passphrase):
//!
//! ```text
//! encrypt(client, {
//!     "email": "...",
//!     "registration": encrypt(issuer, { "privateKey": ..., "uri": ..., ... }),
//!     "certificates": { "[example.com www.example.com]": { "privateKey": ..., "pem": ... } }
//! })
//! ```
//!
//! Without the issuer passphrase the registration blob is carried verbatim,
//! so a client-only process can renew certificates and re-persist the record
//! without losing or reading the CA binding.

use std::collections::BTreeMap;
use std::sync::Arc;

use certwarden_config::Passphrases;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::challenge::ChallengeProvider;
use super::client::{AccountInfo, AcmeClient};
use super::envelope;
use super::error::{AcmeError, CryptoError};
use super::keys::KeyMaterial;
use super::order::{bounded, CleanupTask, OrderController, Timeouts};
use super::validator;

/// Renewal is skipped while the stored certificate has at least this many
/// days left.
pub const RENEW_BEFORE_DAYS: i64 = 30;

/// Lookup key for the certificate of an ordered domain list.
///
/// Order matters: `[a b]` and `[b a]` are different certificates.
pub fn fingerprint(domains: &[String]) -> String {
    format!("[{}]", domains.join(" "))
}

/// The CA account binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub account_key: KeyMaterial,
    pub status: String,
    pub contact: Vec<String>,
    pub account_uri: String,
    pub orders_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(account_key: KeyMaterial, info: AccountInfo, created_at: DateTime<Utc>) -> Self {
        Self {
            account_key,
            status: info.status,
            contact: info.contact,
            account_uri: info.account_uri,
            orders_url: info.orders_url,
            created_at,
        }
    }
}

/// One issued chain for one ordered domain list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub domains: Vec<String>,
    pub key: KeyMaterial,
    pub key_created_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Private key followed by the chain, PEM
    pub bundle: String,
}

impl Certificate {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.domains)
    }

    /// Whether renewal is due at `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        self.not_after - now < chrono::Duration::days(RENEW_BEFORE_DAYS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistrationSlot {
    Absent,
    /// Issuer-encrypted blob that could not be opened in this process
    Sealed(String),
    Open(Registration),
}

/// In-memory identity
#[derive(Debug, Clone)]
pub struct Identity {
    email: String,
    domains: Vec<String>,
    registration: RegistrationSlot,
    certificates: BTreeMap<String, Certificate>,
    dirty: bool,
}

impl Identity {
    /// A fresh identity with no registration and no certificates.
    pub fn new(email: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            email: email.into(),
            domains,
            registration: RegistrationSlot::Absent,
            certificates: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// The registration, if present and readable
    pub fn registration(&self) -> Option<&Registration> {
        match &self.registration {
            RegistrationSlot::Open(registration) => Some(registration),
            _ => None,
        }
    }

    /// Whether a registration exists, readable or not
    pub fn has_registration(&self) -> bool {
        !matches!(self.registration, RegistrationSlot::Absent)
    }

    pub fn certificate(&self, domains: &[String]) -> Option<&Certificate> {
        self.certificates.get(&fingerprint(domains))
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.values()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record that the in-memory state has been persisted.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn set_registration(&mut self, registration: Registration) {
        self.registration = RegistrationSlot::Open(registration);
        self.dirty = true;
    }

    fn insert_certificate(&mut self, certificate: Certificate) {
        self.certificates
            .insert(certificate.fingerprint(), certificate);
        self.dirty = true;
    }

    /// Plaintext view with the registration sealed under the issuer
    /// passphrase.
    pub fn to_record(&self, passphrases: &Passphrases) -> Result<IdentityRecord, CryptoError> {
        let registration = match &self.registration {
            RegistrationSlot::Absent => None,
            RegistrationSlot::Sealed(blob) => Some(blob.clone()),
            RegistrationSlot::Open(registration) => {
                let issuer = passphrases.issuer.as_ref().ok_or_else(|| {
                    CryptoError::Encryption(
                        "issuer passphrase required to seal the registration".to_string(),
                    )
                })?;
                let plaintext = serde_json::to_vec(&RegistrationRecord::from(registration))
                    .map_err(|e| CryptoError::Encryption(e.to_string()))?;
                Some(envelope::encrypt(&plaintext, issuer)?)
            }
        };

        Ok(IdentityRecord {
            email: self.email.clone(),
            registration,
            certificates: self
                .certificates
                .iter()
                .map(|(fingerprint, cert)| (fingerprint.clone(), CertificateRecord::from(cert)))
                .collect(),
        })
    }

    /// Rebuild from a plaintext view, opening the registration when the
    /// issuer passphrase is available.
    pub fn from_record(
        record: IdentityRecord,
        domains: Vec<String>,
        passphrases: &Passphrases,
    ) -> Result<Self, CryptoError> {
        let registration = match (record.registration, &passphrases.issuer) {
            (None, _) => RegistrationSlot::Absent,
            (Some(blob), None) => {
                debug!(email = %record.email, "Issuer passphrase absent, registration left sealed");
                RegistrationSlot::Sealed(blob)
            }
            (Some(blob), Some(issuer)) => {
                let plaintext = envelope::decrypt(&blob, issuer)?;
                let record: RegistrationRecord = serde_json::from_slice(&plaintext)
                    .map_err(|e| CryptoError::Malformed(format!("registration: {}", e)))?;
                RegistrationSlot::Open(record.into())
            }
        };

        let certificates = record
            .certificates
            .into_values()
            .map(Certificate::from)
            .map(|cert| (cert.fingerprint(), cert))
            .collect();

        Ok(Self {
            email: record.email,
            domains,
            registration,
            certificates,
            dirty: false,
        })
    }

    /// Encrypt the whole identity for the store.
    pub fn seal(&self, passphrases: &Passphrases) -> Result<String, CryptoError> {
        let record = self.to_record(passphrases)?;
        let plaintext =
            serde_json::to_vec(&record).map_err(|e| CryptoError::Encryption(e.to_string()))?;
        envelope::encrypt(&plaintext, &passphrases.client)
    }

    /// Decrypt the stored identity of `email`.
    ///
    /// A record that decrypts but names another email is rejected.
    pub fn open(
        blob: &str,
        email: &str,
        domains: Vec<String>,
        passphrases: &Passphrases,
    ) -> Result<Self, CryptoError> {
        let plaintext = envelope::decrypt(blob, &passphrases.client)?;
        let record: IdentityRecord = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::Malformed(format!("identity: {}", e)))?;
        if record.email != email {
            return Err(CryptoError::IdentityMismatch {
                expected: email.to_string(),
                found: record.email,
            });
        }
        Self::from_record(record, domains, passphrases)
    }
}

/// Plaintext identity as stored inside the outer envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(default)]
    pub certificates: BTreeMap<String, CertificateRecord>,
}

/// Plaintext registration as stored inside the inner envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub private_key: KeyMaterial,
    pub status: String,
    #[serde(default)]
    pub contact: Vec<String>,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Registration> for RegistrationRecord {
    fn from(registration: &Registration) -> Self {
        Self {
            private_key: registration.account_key.clone(),
            status: registration.status.clone(),
            contact: registration.contact.clone(),
            uri: registration.account_uri.clone(),
            orders_url: registration.orders_url.clone(),
            created_at: registration.created_at,
        }
    }
}

impl From<RegistrationRecord> for Registration {
    fn from(record: RegistrationRecord) -> Self {
        Self {
            account_key: record.private_key,
            status: record.status,
            contact: record.contact,
            account_uri: record.uri,
            orders_url: record.orders_url,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub domains: Vec<String>,
    pub private_key: KeyMaterial,
    pub private_key_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub pem: String,
}

impl From<&Certificate> for CertificateRecord {
    fn from(cert: &Certificate) -> Self {
        Self {
            domains: cert.domains.clone(),
            private_key: cert.key.clone(),
            private_key_created_at: cert.key_created_at,
            created_at: cert.issued_at,
            not_after: cert.not_after,
            pem: cert.bundle.clone(),
        }
    }
}

impl From<CertificateRecord> for Certificate {
    fn from(record: CertificateRecord) -> Self {
        Self {
            domains: record.domains,
            key: record.private_key,
            key_created_at: record.private_key_created_at,
            issued_at: record.created_at,
            not_after: record.not_after,
            bundle: record.pem,
        }
    }
}

/// What [`IdentityManager::create_or_renew_certificate`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateOutcome {
    /// The stored certificate has enough validity left
    Skipped { not_after: DateTime<Utc> },
    Issued {
        issued_at: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },
}

impl CertificateOutcome {
    pub fn not_after(&self) -> DateTime<Utc> {
        match self {
            CertificateOutcome::Skipped { not_after } => *not_after,
            CertificateOutcome::Issued { not_after, .. } => *not_after,
        }
    }

    pub fn is_issued(&self) -> bool {
        matches!(self, CertificateOutcome::Issued { .. })
    }
}

/// Owns one identity and drives registration and issuance for it.
pub struct IdentityManager {
    identity: Identity,
    client: Arc<dyn AcmeClient>,
    challenges: Arc<dyn ChallengeProvider>,
    timeouts: Timeouts,
    cleanup: Vec<CleanupTask>,
}

impl IdentityManager {
    pub fn new(
        identity: Identity,
        client: Arc<dyn AcmeClient>,
        challenges: Arc<dyn ChallengeProvider>,
    ) -> Self {
        Self {
            identity,
            client,
            challenges,
            timeouts: Timeouts::default(),
            cleanup: Vec::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut Identity {
        &mut self.identity
    }

    pub fn into_identity(self) -> Identity {
        self.identity
    }

    /// Cleanup tasks spawned by orders so far
    pub fn take_cleanup(&mut self) -> Vec<CleanupTask> {
        std::mem::take(&mut self.cleanup)
    }

    /// Register a new CA account for this identity.
    ///
    /// Does nothing when a registration already exists; the account key is
    /// never replaced.
    pub async fn create_registration(&mut self) -> Result<(), AcmeError> {
        if self.identity.has_registration() {
            debug!(email = %self.identity.email, "Registration already present");
            return Ok(());
        }

        let contact = vec![format!("mailto:{}", self.identity.email)];
        let (account_key, info) = bounded(
            "registration",
            self.timeouts.registration,
            self.client.register(&contact),
        )
        .await?;

        info!(
            email = %self.identity.email,
            account_uri = %info.account_uri,
            "Created CA registration"
        );
        self.identity
            .set_registration(Registration::new(account_key, info, Utc::now()));
        Ok(())
    }

    pub async fn create_or_renew_certificate(
        &mut self,
        domains: &[String],
    ) -> Result<CertificateOutcome, AcmeError> {
        self.create_or_renew_certificate_at(domains, Utc::now()).await
    }

    /// Issue a certificate for `domains` unless the stored one has at least
    /// [`RENEW_BEFORE_DAYS`] left at `now`.
    ///
    /// On failure the identity is left untouched.
    pub async fn create_or_renew_certificate_at(
        &mut self,
        domains: &[String],
        now: DateTime<Utc>,
    ) -> Result<CertificateOutcome, AcmeError> {
        let fingerprint = fingerprint(domains);

        if let Some(existing) = self.identity.certificates.get(&fingerprint) {
            if !existing.needs_renewal(now) {
                info!(
                    fingerprint = %fingerprint,
                    not_after = %existing.not_after,
                    "Certificate valid for more than {} days, skipping renewal",
                    RENEW_BEFORE_DAYS
                );
                return Ok(CertificateOutcome::Skipped {
                    not_after: existing.not_after,
                });
            }
            info!(fingerprint = %fingerprint, not_after = %existing.not_after, "Certificate due for renewal");
        } else {
            info!(fingerprint = %fingerprint, "No certificate for domain set, issuing");
        }

        let registration = self
            .identity
            .registration()
            .ok_or_else(|| AcmeError::NotRegistered {
                email: self.identity.email.clone(),
            })?;
        let account_key = registration.account_key.clone();

        let session = bounded(
            "account binding",
            self.timeouts.registration,
            self.client.bind(&account_key, &registration.account_uri),
        )
        .await?;

        let key = KeyMaterial::generate()?;
        let csr = validator::request(domains, &key)?;

        let mut controller =
            OrderController::new(session, self.challenges.clone(), account_key, self.timeouts);
        let result = controller.obtain(domains, &csr).await;
        if let Some(task) = controller.take_cleanup() {
            self.cleanup.push(task);
        }
        let chain = result?;

        let leaf = validator::validate(&chain, now, domains, &key)?;
        let certificate = Certificate {
            domains: domains.to_vec(),
            bundle: validator::render_bundle(&key, &chain),
            key,
            key_created_at: now,
            issued_at: leaf.not_before,
            not_after: leaf.not_after,
        };

        info!(
            fingerprint = %fingerprint,
            issued_at = %certificate.issued_at,
            not_after = %certificate.not_after,
            "Certificate issued"
        );

        let outcome = CertificateOutcome::Issued {
            issued_at: certificate.issued_at,
            not_after: certificate.not_after,
        };
        self.identity.insert_certificate(certificate);
        Ok(outcome)
    }
}
