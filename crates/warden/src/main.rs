//! Certwarden - Main entry point
//!
//! Issues or renews the configured certificate once, or on an interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use certwarden::acme::{CertificateOutcome, FileIdentityStore, InstantAcmeClient};
use certwarden::{HttpDnsProvider, RenewalScheduler, Renewer};
use certwarden_config::{Config, FileSecretResolver};

/// Certwarden - unattended ACME DNS-01 certificate management
#[derive(Parser, Debug)]
#[command(name = "certwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long = "json-logs", global = true, env = "CERTWARDEN_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue or renew the certificate (default)
    Run {
        /// Keep running and check every N hours (minimum 1)
        #[arg(long = "interval", value_name = "HOURS")]
        interval: Option<u64>,
    },
    /// Write the stored key and certificate chain as PEM
    Export {
        /// Output file; stdout when omitted
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match cli.command.unwrap_or(Commands::Run { interval: None }) {
        Commands::Run { interval } => run(interval).await,
        Commands::Export { output } => export(output).await,
        Commands::Check => check(),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let debug_env = std::env::var("DEBUG")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    let log_level = if verbose || debug_env { "debug" } else { "info" };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config() -> Result<Config> {
    Config::from_env().context("Failed to load configuration")
}

fn build_renewer(config: &Config) -> Result<Renewer> {
    let passphrases = config
        .resolve_passphrases(&FileSecretResolver)
        .context("Failed to resolve passphrases")?;

    let challenges = HttpDnsProvider::new(
        config.dns_api_url.as_str(),
        config.dns_zone.as_str(),
        config.dns_resolver.as_deref(),
    )
    .context("Failed to create DNS challenge provider")?;

    info!(
        email = %config.email,
        domains = ?config.domains,
        directory = %config.acme_directory(),
        client_only = passphrases.is_client_only(),
        "Configured certificate identity"
    );

    Ok(Renewer::new(
        Arc::new(FileIdentityStore::new(config.store_path.clone())),
        Arc::new(InstantAcmeClient::new(config.acme_directory())),
        Arc::new(challenges),
        passphrases,
        config.email.as_str(),
        config.domains.clone(),
    ))
}

/// Run once, or forever on an interval
async fn run(interval: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let renewer = build_renewer(&config)?;

    if let Some(hours) = interval {
        RenewalScheduler::new(Arc::new(renewer))
            .with_interval(Duration::from_secs(hours.saturating_mul(3600)))
            .run()
            .await;
        return Ok(());
    }

    let outcome = renewer.run().await.context("Certificate renewal failed")?;
    match outcome.certificate {
        CertificateOutcome::Issued { not_after, .. } => {
            println!("certwarden: issued {} valid until {}", outcome.fingerprint, not_after)
        }
        CertificateOutcome::Skipped { not_after } => {
            println!("certwarden: {} valid until {}, not renewed", outcome.fingerprint, not_after)
        }
    }
    Ok(())
}

/// Export the stored bundle (client passphrase only)
async fn export(output: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let renewer = build_renewer(&config)?;

    let bundle = renewer.export().await.context("Failed to export certificate")?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, bundle)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                    .await
                    .with_context(|| format!("Failed to restrict {}", path.display()))?;
            }

            info!(path = %path.display(), "Exported certificate bundle");
        }
        None => print!("{}", bundle),
    }
    Ok(())
}

/// Validate configuration and exit
fn check() -> Result<()> {
    let config = load_config()?;
    config
        .resolve_passphrases(&FileSecretResolver)
        .context("Failed to resolve passphrases")?;

    info!("Configuration test successful:");
    info!("  - {} domain(s)", config.domains.len());
    info!("  - zone {}", config.dns_zone);
    info!("  - directory {}", config.acme_directory());

    println!("certwarden: configuration for {} is valid", config.email);
    Ok(())
}
