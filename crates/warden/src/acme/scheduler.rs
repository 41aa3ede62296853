//! Whole-flow renewal runs and the periodic scheduler
//!
//! A [`Renewer`] run is safe to repeat on every trigger: a missing record
//! means first issuance, a present one means renew-or-skip.

use std::sync::Arc;
use std::time::Duration;

use certwarden_config::{ConfigError, Passphrases};
use chrono::{DateTime, Utc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::challenge::ChallengeProvider;
use super::client::AcmeClient;
use super::error::{AcmeError, StorageError};
use super::identity::{fingerprint, CertificateOutcome, Identity, IdentityManager};
use super::order::Timeouts;
use super::storage::IdentityStore;

/// Default interval between scheduled runs (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum interval between scheduled runs (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// How long a run waits for background authorization cleanup
const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(30);

/// Result of one renewal run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalOutcome {
    pub email: String,
    pub fingerprint: String,
    pub certificate: CertificateOutcome,
    /// Whether the identity was written back to the store
    pub persisted: bool,
}

/// Runs the certificate lifecycle for one identity.
pub struct Renewer {
    store: Arc<dyn IdentityStore>,
    client: Arc<dyn AcmeClient>,
    challenges: Arc<dyn ChallengeProvider>,
    passphrases: Passphrases,
    email: String,
    domains: Vec<String>,
    timeouts: Timeouts,
    cleanup_grace: Duration,
}

impl Renewer {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        client: Arc<dyn AcmeClient>,
        challenges: Arc<dyn ChallengeProvider>,
        passphrases: Passphrases,
        email: impl Into<String>,
        domains: Vec<String>,
    ) -> Self {
        Self {
            store,
            client,
            challenges,
            passphrases,
            email: email.into(),
            domains,
            timeouts: Timeouts::default(),
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub async fn run(&self) -> Result<RenewalOutcome, AcmeError> {
        self.run_at(Utc::now()).await
    }

    /// One whole-flow invocation at `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RenewalOutcome, AcmeError> {
        let start = Instant::now();
        self.store.ensure().await?;

        let mut manager = self.create_or_load().await?;
        let result = self.renew(&mut manager, now).await;

        for task in manager.take_cleanup() {
            if let Some(report) = task.settle(self.cleanup_grace).await {
                debug!(
                    deactivated = report.deactivated,
                    failed = report.failed,
                    timed_out = report.timed_out,
                    "Authorization cleanup finished"
                );
            }
        }

        if let Ok(outcome) = &result {
            info!(
                email = %outcome.email,
                issued = outcome.certificate.is_issued(),
                not_after = %outcome.certificate.not_after(),
                elapsed_secs = start.elapsed().as_secs(),
                "Renewal run completed"
            );
        }

        result
    }

    async fn renew(
        &self,
        manager: &mut IdentityManager,
        now: DateTime<Utc>,
    ) -> Result<RenewalOutcome, AcmeError> {
        let certificate = manager
            .create_or_renew_certificate_at(&self.domains, now)
            .await?;
        let persisted = self.update(manager.identity_mut()).await?;

        Ok(RenewalOutcome {
            email: self.email.clone(),
            fingerprint: fingerprint(&self.domains),
            certificate,
            persisted,
        })
    }

    /// Load the identity, or create and register it when there is no record.
    ///
    /// A new registration is persisted right away so a failed first
    /// issuance does not cost the account.
    async fn create_or_load(&self) -> Result<IdentityManager, AcmeError> {
        match self.store.load(&self.email).await? {
            Some(blob) => {
                let identity =
                    Identity::open(&blob, &self.email, self.domains.clone(), &self.passphrases)?;
                info!(
                    email = %self.email,
                    registered = identity.registration().is_some(),
                    "Loaded identity"
                );
                Ok(self.manager(identity))
            }
            None => {
                if self.passphrases.is_client_only() {
                    return Err(ConfigError::MissingPassphrase {
                        variable: "ISSUER_PASSPHRASE",
                        secret_variable: "ISSUER_PASSPHRASE_SECRET_ARN",
                    }
                    .into());
                }

                info!(email = %self.email, "No stored identity, creating one");
                let mut manager = self.manager(Identity::new(&self.email, self.domains.clone()));
                manager.create_registration().await?;
                self.update(manager.identity_mut()).await?;
                Ok(manager)
            }
        }
    }

    /// Load an existing identity; a missing record is an error.
    pub async fn load(&self) -> Result<Identity, AcmeError> {
        let blob = self
            .store
            .load(&self.email)
            .await?
            .ok_or_else(|| StorageError::NotFound(self.email.clone()))?;
        Ok(Identity::open(
            &blob,
            &self.email,
            self.domains.clone(),
            &self.passphrases,
        )?)
    }

    /// Persist `identity` if it changed, then mark it clean.
    pub async fn update(&self, identity: &mut Identity) -> Result<bool, AcmeError> {
        if !identity.is_dirty() {
            debug!(email = %identity.email(), "Identity unchanged, not persisting");
            return Ok(false);
        }

        let blob = identity.seal(&self.passphrases)?;
        self.store.save(identity.email(), &blob).await?;
        identity.mark_clean();
        Ok(true)
    }

    /// The stored bundle (private key and chain, PEM) for the configured
    /// domains. Needs only the client passphrase.
    pub async fn export(&self) -> Result<String, AcmeError> {
        let identity = self.load().await?;
        let certificate = identity.certificate(&self.domains).ok_or_else(|| {
            StorageError::NotFound(format!(
                "certificate {} for {}",
                fingerprint(&self.domains),
                self.email
            ))
        })?;

        debug!(
            email = %self.email,
            not_after = %certificate.not_after,
            "Exporting certificate bundle"
        );
        Ok(certificate.bundle.clone())
    }

    fn manager(&self, identity: Identity) -> IdentityManager {
        IdentityManager::new(identity, self.client.clone(), self.challenges.clone())
            .with_timeouts(self.timeouts)
    }
}

impl std::fmt::Debug for Renewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renewer")
            .field("email", &self.email)
            .field("domains", &self.domains)
            .field("client_only", &self.passphrases.is_client_only())
            .finish()
    }
}

/// Repeats a [`Renewer`] run on an interval
pub struct RenewalScheduler {
    renewer: Arc<Renewer>,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(renewer: Arc<Renewer>) -> Self {
        Self {
            renewer,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 hour.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run forever. Failed runs are logged; the next tick retries.
    pub async fn run(self) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            email = %self.renewer.email(),
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) -> Option<RenewalOutcome> {
        debug!("Running scheduled renewal check");
        match self.renewer.run().await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Renewal failed, retrying on next tick");
                None
            }
            Err(e) => {
                error!(error = %e, "Renewal failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("renewer", &self.renewer)
            .finish()
    }
}
