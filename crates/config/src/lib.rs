//! Configuration for certwarden
//!
//! All settings come from the process environment. Loading never aborts the
//! process; every problem surfaces as a [`ConfigError`] and the entry point
//! decides what to do with it.
//!
//! # Example
//!
//! ```no_run
//! use certwarden_config::{Config, FileSecretResolver};
//!
//! let config = Config::from_env()?;
//! let passphrases = config.resolve_passphrases(&FileSecretResolver)?;
//! # Ok::<(), certwarden_config::ConfigError>(())
//! ```

mod error;
mod passphrase;

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;
use validator::Validate;

pub use error::ConfigError;
pub use passphrase::{FileSecretResolver, Passphrase, PassphraseSource, Passphrases, SecretResolver};

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const DEFAULT_DNS_API_URL: &str = "http://localhost:8055";
const DEFAULT_STORE_PATH: &str = "./certwarden-store";

/// Raw environment, before secrets are wrapped.
#[derive(Deserialize)]
struct RawEnv {
    email: String,
    domains: Vec<String>,
    dns_zone: String,
    #[serde(default = "default_dns_api_url")]
    dns_api_url: String,
    #[serde(default)]
    dns_resolver: Option<String>,
    #[serde(default = "default_store_path")]
    store_path: PathBuf,
    #[serde(default)]
    acme_directory_url: Option<String>,
    #[serde(default)]
    acme_staging: bool,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    client_passphrase: Option<String>,
    #[serde(default)]
    client_passphrase_secret_arn: Option<String>,
    #[serde(default)]
    issuer_passphrase: Option<String>,
    #[serde(default)]
    issuer_passphrase_secret_arn: Option<String>,
}

fn default_dns_api_url() -> String {
    DEFAULT_DNS_API_URL.to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

/// Operational configuration
#[derive(Debug, Clone, Validate)]
pub struct Config {
    /// Identity email, store key and CA contact
    #[validate(email(message = "EMAIL must be a valid email address"))]
    pub email: String,

    /// Ordered domain list; the first entry is the certificate's subject
    #[validate(length(min = 1, message = "DOMAINS must list at least one domain"))]
    pub domains: Vec<String>,

    /// DNS zone the challenge records are published in
    #[validate(length(min = 1, message = "DNS_ZONE must not be empty"))]
    pub dns_zone: String,

    /// Management endpoint of the DNS challenge provider
    #[validate(url(message = "DNS_API_URL must be a valid URL"))]
    pub dns_api_url: String,

    /// Nameserver (`host:port`) used to confirm record propagation
    pub dns_resolver: Option<String>,

    /// Identity store location
    pub store_path: PathBuf,

    /// Explicit ACME directory URL
    pub acme_directory_url: Option<String>,

    /// Use the staging directory when no explicit URL is set
    pub acme_staging: bool,

    /// Debug logging
    pub debug: bool,

    /// Outer layer passphrase source (required)
    pub client_passphrase: PassphraseSource,

    /// Inner layer passphrase source (optional)
    pub issuer_passphrase: PassphraseSource,
}

impl Config {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load from an explicit set of variables and validate.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawEnv = envy::from_iter(vars)?;

        let domains: Vec<String> = raw
            .domains
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let config = Self {
            email: raw.email.trim().to_string(),
            domains,
            dns_zone: raw.dns_zone.trim().trim_end_matches('.').to_string(),
            dns_api_url: raw.dns_api_url,
            dns_resolver: raw.dns_resolver.filter(|r| !r.is_empty()),
            store_path: raw.store_path,
            acme_directory_url: raw.acme_directory_url.filter(|u| !u.is_empty()),
            acme_staging: raw.acme_staging,
            debug: raw.debug,
            client_passphrase: PassphraseSource::new(
                "CLIENT_PASSPHRASE",
                "CLIENT_PASSPHRASE_SECRET_ARN",
                raw.client_passphrase,
                raw.client_passphrase_secret_arn,
            ),
            issuer_passphrase: PassphraseSource::new(
                "ISSUER_PASSPHRASE",
                "ISSUER_PASSPHRASE_SECRET_ARN",
                raw.issuer_passphrase,
                raw.issuer_passphrase_secret_arn,
            ),
        };

        config.check()?;

        debug!(
            email = %config.email,
            domains = ?config.domains,
            zone = %config.dns_zone,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Run field validation plus the cross-field checks.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        for domain in &self.domains {
            validate_domain(domain)?;
            if !in_zone(domain, &self.dns_zone) {
                return Err(ConfigError::Invalid(format!(
                    "domain {} is outside DNS zone {}",
                    domain, self.dns_zone
                )));
            }
        }

        if !self.client_passphrase.is_configured() {
            return Err(ConfigError::MissingPassphrase {
                variable: "CLIENT_PASSPHRASE",
                secret_variable: "CLIENT_PASSPHRASE_SECRET_ARN",
            });
        }

        if let Some(url) = &self.acme_directory_url {
            url::Url::parse(url).map_err(|e| {
                ConfigError::Invalid(format!("ACME_DIRECTORY_URL {}: {}", url, e))
            })?;
        }

        Ok(())
    }

    /// Effective ACME directory URL
    pub fn acme_directory(&self) -> &str {
        match &self.acme_directory_url {
            Some(url) => url,
            None if self.acme_staging => LETSENCRYPT_STAGING,
            None => LETSENCRYPT_PRODUCTION,
        }
    }

    /// Resolve both passphrases.
    ///
    /// The client passphrase is required; the issuer passphrase degrades to
    /// absent (client-only mode).
    pub fn resolve_passphrases(
        &self,
        resolver: &dyn SecretResolver,
    ) -> Result<Passphrases, ConfigError> {
        let client = self.client_passphrase.require(resolver)?;
        let issuer = self.issuer_passphrase.optional(resolver);
        Ok(Passphrases::new(client, issuer))
    }
}

/// Reject domain names that can never be valid ACME identifiers.
fn validate_domain(domain: &str) -> Result<(), ConfigError> {
    let name = domain.strip_prefix("*.").unwrap_or(domain);

    if name.is_empty() {
        return Err(ConfigError::Invalid("domain cannot be empty".to_string()));
    }

    if name.contains(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!(
            "domain {:?} cannot contain spaces",
            domain
        )));
    }

    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(ConfigError::Invalid(format!(
            "domain {:?} has an empty label",
            domain
        )));
    }

    Ok(())
}

fn in_zone(domain: &str, zone: &str) -> bool {
    let domain = domain.strip_prefix("*.").unwrap_or(domain).to_ascii_lowercase();
    let zone = zone.to_ascii_lowercase();
    domain == zone || domain.ends_with(&format!(".{}", zone))
}
