//! ACME failure taxonomy.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::blob::BlobError;
use crate::certs::material::MaterialError;
use crate::dns::DnsError;

/// An RFC 7807 problem document as returned by ACME providers.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AcmeProblem {
    /// Error type URN, e.g. `urn:ietf:params:acme:error:badNonce`.
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl AcmeProblem {
    pub fn is_bad_nonce(&self) -> bool {
        self.problem_type.ends_with(":badNonce")
    }

    pub fn is_rate_limited(&self) -> bool {
        self.problem_type.ends_with(":rateLimited")
    }
}

impl std::fmt::Display for AcmeProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.problem_type)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Everything that can go wrong talking ACME.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The provider returned a problem document that is neither `badNonce`
    /// (retried once transparently) nor `rateLimited`.
    #[error("ACME problem: {0}")]
    Problem(AcmeProblem),

    /// The provider is rate-limiting us; all requests fail fast until
    /// `until` passes.
    #[error("ACME provider '{provider}' is rate-limited until {until}")]
    RateLimited {
        provider: String,
        until: DateTime<Utc>,
    },

    /// Network or HTTP-level failure. Not retried beyond the nonce case.
    #[error("ACME transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// An authorization or challenge reached a terminal non-valid state.
    #[error("{resource} ended in status '{status}'")]
    Validation { resource: String, status: String },

    /// A poll loop or the HTTP-01 wait exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("operation canceled")]
    Canceled,

    /// `newAccount` returned no `Location` header. Nothing is persisted.
    #[error("provider returned no account URL on account creation")]
    MissingAccountUrl,

    #[error("no ACME provider configured under id '{0}'")]
    UnknownProvider(String),

    #[error("provider '{0}' requires at least one contact email")]
    ContactRequired(String),

    #[error("account {0} not found")]
    AccountNotFound(bastion_common::AccountId),

    #[error("stored key for account {0} is missing")]
    AccountKeyMissing(bastion_common::AccountId),

    #[error("no configured host matches authorization for '{0}'")]
    UnmatchedAuthorization(String),

    #[error("authorization for '{host}' offers no {challenge} challenge")]
    ChallengeUnavailable { host: String, challenge: String },

    /// A replaced or canceled HTTP-01 entry; the newer attempt wins.
    #[error("pending challenge was superseded")]
    ChallengeSuperseded,

    #[error("JWS signing failed: {0}")]
    Signing(String),

    #[error("unexpected ACME response: {0}")]
    Wire(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Material(#[from] MaterialError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Store(#[from] bastion_config::StoreError),
}
