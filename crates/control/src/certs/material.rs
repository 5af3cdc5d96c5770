//! Decoding and inspection of certificate material.
//!
//! Blobs hold a PEM certificate chain (leaf first) followed by the PEM
//! private key. Decoding parses the leaf for validity dates and subject
//! alternative names; everything else is carried opaquely so a blob
//! round-trips byte-identically.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::{GeneralName, ParsedExtension};

use bastion_config::CertificateRecord;

/// Failures decoding or generating certificate material.
#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("PEM parse error: {0}")]
    Pem(#[from] pem::PemError),

    #[error("X.509 parse error: {0}")]
    X509(String),

    #[error("no CERTIFICATE block in material")]
    MissingCertificate,

    #[error("no private key block in material")]
    MissingKey,

    #[error("certificate carries an unrepresentable validity period")]
    InvalidValidity,

    #[error("key/certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// A decoded server certificate: parsed leaf metadata plus the original
/// PEM text for both chain and key.
#[derive(Debug, Clone)]
pub struct CertificateMaterial {
    /// Full chain as stored, leaf first.
    pub chain_pem: String,
    pub key_pem: String,
    /// DER bytes of the leaf certificate.
    pub leaf_der: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS subject alternative names of the leaf, lowercased.
    pub sans: Vec<String>,
    /// Hex SHA-256 over the leaf DER.
    pub fingerprint: String,
}

impl CertificateMaterial {
    /// Decode a blob into material. The blob must contain at least one
    /// CERTIFICATE block (the first is the leaf) and exactly one private
    /// key block, in any order.
    pub fn decode(bytes: &[u8]) -> Result<Self, MaterialError> {
        let blocks = pem::parse_many(bytes)?;

        let mut chain = Vec::new();
        let mut key = None;
        for block in blocks {
            match block.tag() {
                "CERTIFICATE" => chain.push(block),
                "PRIVATE KEY" | "EC PRIVATE KEY" | "RSA PRIVATE KEY" => key = Some(block),
                other => {
                    return Err(MaterialError::X509(format!(
                        "unexpected PEM block '{other}'"
                    )))
                }
            }
        }

        let leaf = chain.first().ok_or(MaterialError::MissingCertificate)?;
        let key = key.ok_or(MaterialError::MissingKey)?;
        let leaf_der = leaf.contents().to_vec();

        let (_, parsed) = x509_parser::parse_x509_certificate(&leaf_der)
            .map_err(|e| MaterialError::X509(e.to_string()))?;

        let not_before = timestamp(parsed.validity().not_before.to_datetime().unix_timestamp())?;
        let not_after = timestamp(parsed.validity().not_after.to_datetime().unix_timestamp())?;

        let mut sans = Vec::new();
        for ext in parsed.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        sans.push(dns.to_ascii_lowercase());
                    }
                }
            }
        }

        let fingerprint = hex(&Sha256::digest(&leaf_der));
        let key_pem = pem::encode(&key);
        let chain_pem = pem::encode_many(&chain);

        Ok(Self {
            chain_pem,
            key_pem,
            leaf_der,
            not_before,
            not_after,
            sans,
            fingerprint,
        })
    }

    /// Serialize back to the blob layout: chain first, key last.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chain_pem.len() + self.key_pem.len());
        out.extend_from_slice(self.chain_pem.as_bytes());
        out.extend_from_slice(self.key_pem.as_bytes());
        out
    }

    /// Assemble material from ACME results: the provider's PEM chain and a
    /// separately generated private key.
    pub fn from_parts(chain_pem: &str, key_pem: &str) -> Result<Self, MaterialError> {
        let mut bytes = chain_pem.as_bytes().to_vec();
        if !chain_pem.ends_with('\n') {
            bytes.push(b'\n');
        }
        bytes.extend_from_slice(key_pem.as_bytes());
        Self::decode(&bytes)
    }

    /// Total validity period in whole days.
    pub fn validity_days(&self) -> i64 {
        (self.not_after - self.not_before).num_days()
    }

    /// Whether the leaf covers `host`, honoring single-label wildcards.
    pub fn covers_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.sans.iter().any(|san| {
            if let Some(suffix) = san.strip_prefix("*.") {
                host.strip_suffix(suffix)
                    .and_then(|rest| rest.strip_suffix('.'))
                    .is_some_and(|label| !label.is_empty() && !label.contains('.'))
            } else {
                san == &host
            }
        })
    }

    /// Mint an ephemeral self-signed certificate for `hosts`.
    ///
    /// Used as the admin-listener failsafe: if the configured admin
    /// certificate fails to decode, the listener still comes up with this.
    pub fn self_signed(hosts: &[String]) -> Result<Self, MaterialError> {
        let key = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(hosts.to_vec())?;
        if let Some(first) = hosts.first() {
            params
                .distinguished_name
                .push(rcgen::DnType::CommonName, first.clone());
        }
        let cert = params.self_signed(&key)?;

        let mut bytes = cert.pem().into_bytes();
        bytes.extend_from_slice(key.serialize_pem().as_bytes());
        Self::decode(&bytes)
    }
}

fn timestamp(ts: i64) -> Result<DateTime<Utc>, MaterialError> {
    DateTime::<Utc>::from_timestamp(ts, 0).ok_or(MaterialError::InvalidValidity)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A problem that makes a certificate unsuitable for serving a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertIssue {
    /// The record is hidden from admin-facing pickers.
    Hidden,
    NotYetValid,
    Expired,
    /// The leaf's SAN set does not cover the host in question.
    HostNotCovered(String),
    /// The blob failed to decode at all.
    Undecodable,
}

impl std::fmt::Display for CertIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertIssue::Hidden => write!(f, "certificate is inactive"),
            CertIssue::NotYetValid => write!(f, "certificate is not yet valid"),
            CertIssue::Expired => write!(f, "certificate has expired"),
            CertIssue::HostNotCovered(host) => {
                write!(f, "certificate does not cover '{host}'")
            }
            CertIssue::Undecodable => write!(f, "certificate material failed to decode"),
        }
    }
}

/// Evaluate a certificate record against a host it is bound to.
///
/// Used to generate admin-facing warnings; a certificate with issues still
/// serves, on the theory that a wrong certificate beats a refused handshake.
pub fn cert_issues(
    record: &CertificateRecord,
    material: Option<&CertificateMaterial>,
    host: &str,
    now: DateTime<Utc>,
) -> Vec<CertIssue> {
    let mut issues = Vec::new();
    if record.hidden {
        issues.push(CertIssue::Hidden);
    }
    match material {
        None => issues.push(CertIssue::Undecodable),
        Some(material) => {
            if now < material.not_before {
                issues.push(CertIssue::NotYetValid);
            }
            if now > material.not_after {
                issues.push(CertIssue::Expired);
            }
            if !host.is_empty() && !material.covers_host(host) {
                issues.push(CertIssue::HostNotCovered(host.to_string()));
            }
        }
    }
    issues
}
