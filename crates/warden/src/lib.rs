//! Certwarden Library
//!
//! Unattended ACME DNS-01 certificate issuance and renewal. One identity (an
//! email contact plus an ordered domain list) is registered with the CA once,
//! its certificates are renewed when they get within 30 days of expiry, and
//! everything is persisted as a single envelope-encrypted record.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certwarden::acme::{FileIdentityStore, InstantAcmeClient, Renewer};
//! use certwarden::dns::HttpDnsProvider;
//!
//! let renewer = Renewer::new(
//!     Arc::new(FileIdentityStore::new("/var/lib/certwarden")),
//!     Arc::new(InstantAcmeClient::new(config.acme_directory())),
//!     Arc::new(HttpDnsProvider::new(&config.dns_api_url, &config.dns_zone, None)?),
//!     passphrases,
//!     &config.email,
//!     config.domains.clone(),
//! );
//! let outcome = renewer.run().await?;
//! ```

pub mod acme;
pub mod dns;

pub use acme::{AcmeError, RenewalOutcome, RenewalScheduler, Renewer};
pub use dns::{HttpDnsProvider, TxtLookup};
