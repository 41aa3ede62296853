//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal before any network call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set
    #[error("environment variable {0} not found")]
    MissingVariable(String),

    /// Neither the direct passphrase nor its secret reference is set
    #[error("environment variable {variable} and {secret_variable} not found, one of them must be set")]
    MissingPassphrase {
        variable: &'static str,
        secret_variable: &'static str,
    },

    /// A secret reference did not resolve to a value
    #[error("secret {reference} not found")]
    SecretNotFound { reference: String },

    /// Reading a secret reference failed
    #[error("failed to read secret {reference}: {source}")]
    SecretUnreadable {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    /// A value is present but malformed
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<envy::Error> for ConfigError {
    fn from(e: envy::Error) -> Self {
        match e {
            envy::Error::MissingValue(field) => ConfigError::MissingVariable(field.to_uppercase()),
            envy::Error::Custom(msg) => ConfigError::Invalid(msg),
        }
    }
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(e: validator::ValidationErrors) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}
