//! Passphrase resolution
//!
//! Each passphrase can be supplied either directly (`CLIENT_PASSPHRASE`) or
//! through a reference to a secret (`CLIENT_PASSPHRASE_SECRET_ARN`). The
//! reference is handed to a [`SecretResolver`]; the default resolver treats
//! it as the path of a mounted secret file.
//!
//! Resolution order is: direct value, then secret reference, then absent.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::ConfigError;

/// A secret passphrase.
///
/// The value never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw passphrase bytes for key derivation
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

impl From<&str> for Passphrase {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Looks up secret values by reference.
pub trait SecretResolver: Send + Sync {
    /// Returns `Ok(None)` when the reference does not exist.
    fn resolve(&self, reference: &str) -> Result<Option<String>, ConfigError>;
}

/// Resolves a secret reference as the path of a file holding the secret.
///
/// A single trailing newline is stripped, the way secret mounts are usually
/// written.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSecretResolver;

impl SecretResolver for FileSecretResolver {
    fn resolve(&self, reference: &str) -> Result<Option<String>, ConfigError> {
        match std::fs::read_to_string(Path::new(reference)) {
            Ok(content) => {
                let value = content
                    .strip_suffix('\n')
                    .map(|s| s.strip_suffix('\r').unwrap_or(s))
                    .unwrap_or(&content);
                if value.is_empty() {
                    return Ok(None);
                }
                debug!(reference = %reference, "Resolved secret reference");
                Ok(Some(value.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::SecretUnreadable {
                reference: reference.to_string(),
                source,
            }),
        }
    }
}

/// Where a passphrase comes from.
#[derive(Clone)]
pub struct PassphraseSource {
    variable: &'static str,
    secret_variable: &'static str,
    value: Option<Passphrase>,
    secret_ref: Option<String>,
}

impl PassphraseSource {
    pub fn new(
        variable: &'static str,
        secret_variable: &'static str,
        value: Option<String>,
        secret_ref: Option<String>,
    ) -> Self {
        Self {
            variable,
            secret_variable,
            value: non_empty(value).map(Passphrase),
            secret_ref: non_empty(secret_ref),
        }
    }

    /// Whether either the direct value or a reference is configured
    pub fn is_configured(&self) -> bool {
        self.value.is_some() || self.secret_ref.is_some()
    }

    /// Resolve a passphrase that must be present.
    pub fn require(&self, resolver: &dyn SecretResolver) -> Result<Passphrase, ConfigError> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }

        let Some(reference) = &self.secret_ref else {
            return Err(ConfigError::MissingPassphrase {
                variable: self.variable,
                secret_variable: self.secret_variable,
            });
        };

        resolver
            .resolve(reference)?
            .map(Passphrase)
            .ok_or_else(|| ConfigError::SecretNotFound {
                reference: reference.clone(),
            })
    }

    /// Resolve a passphrase whose absence is a valid mode of operation.
    ///
    /// Unresolvable references degrade to `None`.
    pub fn optional(&self, resolver: &dyn SecretResolver) -> Option<Passphrase> {
        if let Some(value) = &self.value {
            return Some(value.clone());
        }

        let Some(reference) = &self.secret_ref else {
            info!(
                variable = self.variable,
                secret_variable = self.secret_variable,
                "Passphrase not configured, continuing without it"
            );
            return None;
        };

        match resolver.resolve(reference) {
            Ok(Some(value)) => Some(Passphrase(value)),
            Ok(None) => {
                warn!(reference = %reference, "Secret not found, continuing without it");
                None
            }
            Err(e) => {
                warn!(reference = %reference, error = %e, "Secret unreadable, continuing without it");
                None
            }
        }
    }
}

impl fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassphraseSource")
            .field("variable", &self.variable)
            .field("has_value", &self.value.is_some())
            .field("secret_ref", &self.secret_ref)
            .finish()
    }
}

/// The two independent passphrases protecting a stored identity.
#[derive(Debug, Clone)]
pub struct Passphrases {
    /// Outer layer, protects the whole identity record
    pub client: Passphrase,
    /// Inner layer, protects the CA registration; absent in client-only mode
    pub issuer: Option<Passphrase>,
}

impl Passphrases {
    pub fn new(client: Passphrase, issuer: Option<Passphrase>) -> Self {
        Self { client, issuer }
    }

    /// Whether only the client passphrase is available
    pub fn is_client_only(&self) -> bool {
        self.issuer.is_none()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
