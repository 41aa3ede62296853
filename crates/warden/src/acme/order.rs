//! Order state machine
//!
//! Drives one CA order from creation to an issued chain:
//!
//! ```text
//! Created -> Authorizing -> Ready ---------------------> Finalizing -> Valid
//!                        \-> PendingChallenges -> ... -/
//! ```
//!
//! Any unexpected status or failed call moves the order to `Failed` and aborts
//! it. Once the order's authorizations are known, a detached [`CleanupTask`]
//! deactivates any that are still pending when the main flow is done.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::challenge::{challenge_record_name, dns01_txt_value, ChallengeProvider};
use super::client::{AcmeSession, AuthorizationStatus, ChallengeKind, OrderHandle, OrderStatus};
use super::error::AcmeError;
use super::keys::KeyMaterial;

/// Default bound for every class of CA call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-class bounds on CA and DNS waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub registration: Duration,
    /// Order creation and order status polling
    pub order: Duration,
    /// Each authorization, from record publication to resolution
    pub authorization: Duration,
    pub finalize: Duration,
    pub cleanup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            registration: DEFAULT_TIMEOUT,
            order: DEFAULT_TIMEOUT,
            authorization: DEFAULT_TIMEOUT,
            finalize: DEFAULT_TIMEOUT,
            cleanup: DEFAULT_TIMEOUT,
        }
    }
}

/// Run `fut`, mapping an elapsed deadline to [`AcmeError::Timeout`].
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, AcmeError>
where
    F: Future<Output = Result<T, AcmeError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(AcmeError::Timeout { operation, after }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Created,
    Authorizing,
    Ready,
    PendingChallenges,
    Finalizing,
    Valid,
    Failed,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Created => "created",
            OrderState::Authorizing => "authorizing",
            OrderState::Ready => "ready",
            OrderState::PendingChallenges => "pending_challenges",
            OrderState::Finalizing => "finalizing",
            OrderState::Valid => "valid",
            OrderState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Drives a single order. Create one per issuance.
pub struct OrderController {
    session: Arc<dyn AcmeSession>,
    challenges: Arc<dyn ChallengeProvider>,
    account_key: KeyMaterial,
    timeouts: Timeouts,
    state: OrderState,
    cleanup: Option<CleanupTask>,
}

impl OrderController {
    pub fn new(
        session: Arc<dyn AcmeSession>,
        challenges: Arc<dyn ChallengeProvider>,
        account_key: KeyMaterial,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            session,
            challenges,
            account_key,
            timeouts,
            state: OrderState::Created,
            cleanup: None,
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    /// Take the cleanup task spawned by the last [`obtain`](Self::obtain).
    pub fn take_cleanup(&mut self) -> Option<CleanupTask> {
        self.cleanup.take()
    }

    /// Run the order for `domains` and return the issued chain (DER, leaf
    /// first).
    ///
    /// Returns without waiting for the cleanup task.
    pub async fn obtain(
        &mut self,
        domains: &[String],
        csr_der: &[u8],
    ) -> Result<Vec<Vec<u8>>, AcmeError> {
        let mut authorization_urls = Vec::new();
        let result = self.drive(domains, csr_der, &mut authorization_urls).await;

        if !authorization_urls.is_empty() {
            self.cleanup = Some(CleanupTask::spawn(
                self.session.clone(),
                authorization_urls,
                self.timeouts.cleanup,
            ));
        }

        if let Err(e) = &result {
            warn!(
                state = %self.state,
                error = %e,
                "Order failed"
            );
            self.transition(OrderState::Failed);
        }

        result
    }

    async fn drive(
        &mut self,
        domains: &[String],
        csr_der: &[u8],
        authorization_urls: &mut Vec<String>,
    ) -> Result<Vec<Vec<u8>>, AcmeError> {
        self.transition(OrderState::Authorizing);

        let session = self.session.clone();
        let order = bounded("new order", self.timeouts.order, session.new_order(domains)).await?;
        authorization_urls.extend(order.authorization_urls.iter().cloned());

        debug!(
            order = %order.url,
            status = %order.status,
            authorizations = order.authorization_urls.len(),
            "Created order"
        );

        match order.status {
            OrderStatus::Ready => {
                self.transition(OrderState::Ready);
            }
            OrderStatus::Pending => {
                self.transition(OrderState::PendingChallenges);
                self.satisfy_authorizations(&order).await?;

                let status = bounded(
                    "order readiness",
                    self.timeouts.order,
                    session.wait_order(&order.url),
                )
                .await?;
                if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
                    return Err(AcmeError::InvalidOrderStatus {
                        status: status.to_string(),
                        url: order.url.clone(),
                    });
                }
            }
            other => {
                return Err(AcmeError::InvalidOrderStatus {
                    status: other.to_string(),
                    url: order.url.clone(),
                });
            }
        }

        self.transition(OrderState::Finalizing);
        let chain = bounded(
            "finalize",
            self.timeouts.finalize,
            session.finalize(&order.url, csr_der),
        )
        .await?;

        self.transition(OrderState::Valid);
        info!(order = %order.url, certificates = chain.len(), "Order finalized");
        Ok(chain)
    }

    async fn satisfy_authorizations(&self, order: &OrderHandle) -> Result<(), AcmeError> {
        for url in &order.authorization_urls {
            let authz = bounded(
                "authorization lookup",
                self.timeouts.authorization,
                self.session.authorization(url),
            )
            .await?;

            if authz.status != AuthorizationStatus::Pending {
                debug!(domain = %authz.domain, status = %authz.status, "Skipping authorization");
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.kind == ChallengeKind::Dns01)
                .ok_or_else(|| AcmeError::Dns01Unavailable {
                    domain: authz.domain.clone(),
                })?;

            let record = challenge_record_name(&authz.domain);
            let value = dns01_txt_value(&challenge.token, &self.account_key);

            let challenges = self.challenges.clone();
            bounded("challenge publication", self.timeouts.authorization, async {
                challenges
                    .create_challenge(&record, &value)
                    .await
                    .map_err(AcmeError::from)
            })
            .await?;
            debug!(domain = %authz.domain, record = %record, "Published challenge record");

            bounded(
                "challenge acceptance",
                self.timeouts.authorization,
                self.session.accept_challenge(&challenge.url),
            )
            .await?;

            let status = bounded(
                "authorization",
                self.timeouts.authorization,
                self.session.wait_authorization(url),
            )
            .await?;
            if status != AuthorizationStatus::Valid {
                return Err(AcmeError::InvalidAuthorization {
                    domain: authz.domain.clone(),
                    status: status.to_string(),
                });
            }

            bounded("challenge removal", self.timeouts.authorization, async {
                challenges
                    .remove_challenge(&record, &value)
                    .await
                    .map_err(AcmeError::from)
            })
            .await?;
            debug!(domain = %authz.domain, "Authorization valid, challenge record removed");
        }

        Ok(())
    }

    fn transition(&mut self, next: OrderState) {
        debug!(from = %self.state, to = %next, "Order state transition");
        self.state = next;
    }
}

/// Tally of one cleanup run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub deactivated: usize,
    /// Lookups or deactivations that failed and were suppressed
    pub failed: usize,
    pub timed_out: bool,
}

/// Background deactivation of authorizations left pending by an order.
///
/// Every error inside the task is logged and dropped. Dropping the task
/// detaches it.
#[derive(Debug)]
pub struct CleanupTask {
    handle: JoinHandle<CleanupReport>,
}

impl CleanupTask {
    pub fn spawn(session: Arc<dyn AcmeSession>, urls: Vec<String>, after: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut report = CleanupReport::default();
            let run = deactivate_pending(session.as_ref(), &urls, &mut report);
            if tokio::time::timeout(after, run).await.is_err() {
                debug!(after_secs = after.as_secs(), "Authorization cleanup timed out");
                report.timed_out = true;
            }
            report
        });

        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `grace` for the task, detaching it if it is still running.
    pub async fn settle(mut self, grace: Duration) -> Option<CleanupReport> {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                debug!(error = %e, "Authorization cleanup task aborted");
                None
            }
            Err(_) => {
                debug!("Authorization cleanup still running, detaching");
                None
            }
        }
    }
}

async fn deactivate_pending(session: &dyn AcmeSession, urls: &[String], report: &mut CleanupReport) {
    for url in urls {
        let authz = match session.authorization(url).await {
            Ok(authz) => authz,
            Err(e) => {
                debug!(authorization = %url, error = %e, "Cleanup lookup failed");
                report.failed += 1;
                continue;
            }
        };

        if authz.status != AuthorizationStatus::Pending {
            continue;
        }

        match session.deactivate_authorization(url).await {
            Ok(()) => {
                debug!(domain = %authz.domain, "Deactivated pending authorization");
                report.deactivated += 1;
            }
            Err(e) => {
                debug!(domain = %authz.domain, error = %e, "Deactivation failed");
                report.failed += 1;
            }
        }
    }
}
