//! Certificate requests and issued chain validation

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use tracing::{debug, trace};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;
use x509_parser::public_key::PublicKey;

use super::error::{CryptoError, ValidationError};
use super::keys::{encode_pem, KeyMaterial};

/// Summary of a leaf certificate that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedLeaf {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names the leaf is valid for
    pub names: Vec<String>,
    /// Number of certificates in the chain, leaf included
    pub chain_len: usize,
}

/// Build a DER certificate signing request.
///
/// The subject common name is `domains[0]`; the remaining entries become
/// subject alternative names.
pub fn request(domains: &[String], key: &KeyMaterial) -> Result<Vec<u8>, ValidationError> {
    let (primary, additional) = domains
        .split_first()
        .ok_or_else(|| ValidationError::InvalidDomains("empty domain list".to_string()))?;

    let mut params = CertificateParams::new(additional.to_vec())
        .map_err(|e| ValidationError::InvalidDomains(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, primary.as_str());

    let key_pair = key
        .to_rcgen()
        .map_err(|e: CryptoError| ValidationError::Request(e.to_string()))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| ValidationError::Request(e.to_string()))?;

    let der: &[u8] = csr.der().as_ref();
    debug!(domain = %primary, sans = additional.len(), "Built certificate signing request");
    Ok(der.to_vec())
}

/// Validate an issued chain against the held key and domain list.
///
/// Checks run in order: a certificate is present, `now` is inside the leaf's
/// validity window, the leaf covers `domains[0]`, and the leaf's public key
/// is the public half of `key`.
pub fn validate(
    chain: &[Vec<u8>],
    now: DateTime<Utc>,
    domains: &[String],
    key: &KeyMaterial,
) -> Result<ValidatedLeaf, ValidationError> {
    let joined = chain.concat();
    let certs = parse_chain(&joined)?;
    let leaf = certs.first().ok_or(ValidationError::NoCertificate)?;

    let validity = leaf.validity();
    let not_before = to_datetime(validity.not_before.timestamp())?;
    let not_after = to_datetime(validity.not_after.timestamp())?;

    if now < not_before {
        return Err(ValidationError::NotYetValid {
            not_before: not_before.to_rfc3339(),
        });
    }
    if now > not_after {
        return Err(ValidationError::Expired {
            not_after: not_after.to_rfc3339(),
        });
    }

    let hostname = domains
        .first()
        .ok_or_else(|| ValidationError::InvalidDomains("empty domain list".to_string()))?;
    let names = dns_names(leaf)?;
    if !names.iter().any(|name| matches_hostname(name, hostname)) {
        return Err(ValidationError::HostnameMismatch {
            hostname: hostname.clone(),
        });
    }

    match leaf.public_key().parsed() {
        Ok(PublicKey::EC(point)) => {
            if point.data() != key.public_key_raw() {
                return Err(ValidationError::KeyMismatch);
            }
        }
        Ok(_) => {
            return Err(ValidationError::UnsupportedAlgorithm(
                leaf.public_key().algorithm.algorithm.to_id_string(),
            ))
        }
        Err(e) => return Err(ValidationError::Parse(e.to_string())),
    }

    trace!(hostname = %hostname, not_after = %not_after, "Certificate chain validated");

    Ok(ValidatedLeaf {
        not_before,
        not_after,
        names,
        chain_len: certs.len(),
    })
}

/// Render the distributable bundle: private key first, then one
/// `CERTIFICATE` block per chain entry in chain order.
pub fn render_bundle(key: &KeyMaterial, chain: &[Vec<u8>]) -> String {
    let mut bundle = key.to_pem();
    for der in chain {
        bundle.push_str(&encode_pem("CERTIFICATE", der));
    }
    bundle
}

fn parse_chain(mut rest: &[u8]) -> Result<Vec<X509Certificate<'_>>, ValidationError> {
    let mut certs = Vec::new();
    while !rest.is_empty() {
        let (remaining, cert) =
            parse_x509_certificate(rest).map_err(|e| ValidationError::Parse(e.to_string()))?;
        certs.push(cert);
        rest = remaining;
    }
    Ok(certs)
}

fn to_datetime(timestamp: i64) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| ValidationError::Parse(format!("timestamp {} out of range", timestamp)))
}

/// SAN DNS names, or the subject common names when the leaf has no SAN
/// extension.
fn dns_names(cert: &X509Certificate<'_>) -> Result<Vec<String>, ValidationError> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| ValidationError::Parse(e.to_string()))?;

    if let Some(san) = san {
        return Ok(san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect());
    }

    Ok(cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect())
}

/// Case-insensitive match supporting a single leftmost `*` label.
fn matches_hostname(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

    if pattern == hostname {
        return true;
    }

    match pattern.strip_prefix("*.") {
        Some(suffix) => match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && label != "*" && rest == suffix,
            None => false,
        },
        None => false,
    }
}
