//! Control-plane data model.
//!
//! Rows here map one-to-one onto the persistence collaborator. A
//! [`ConfigRevision`] is immutable once committed, except for the
//! `confirmed`/`reverted`/`revert_reason` lifecycle flags; the running
//! topology is always a projection of exactly one committed revision.

use bastion_common::{AccountId, CertId, DnsProviderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One row of the strictly increasing, gap-tolerant revision sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRevision {
    pub revision: u64,
    /// Revision this row was cloned from.
    pub based_on_revision: u64,
    pub committed: bool,
    pub confirmed: bool,
    pub reverted: bool,
    pub revert_reason: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
    /// Confirm window length for this commit, in seconds.
    pub confirm_seconds: u32,
    pub admin: AdminSettings,
    pub bindings: CertificateBindings,
    pub topology: Topology,
}

impl ConfigRevision {
    /// Clone this revision forward as a fresh, editable candidate.
    pub fn clone_as(&self, revision: u64) -> Self {
        Self {
            revision,
            based_on_revision: self.revision,
            committed: false,
            confirmed: false,
            reverted: false,
            revert_reason: None,
            committed_at: None,
            confirm_seconds: self.confirm_seconds,
            admin: self.admin.clone(),
            bindings: self.bindings.clone(),
            topology: self.topology.clone(),
        }
    }

    /// An editable candidate: neither committed nor reverted.
    pub fn is_candidate(&self) -> bool {
        !self.committed && !self.reverted
    }
}

/// Admin listener settings carried by every revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSettings {
    /// Listen on all interfaces rather than loopback only.
    pub listen_any: bool,
    pub port: u16,
    /// Certificate presented on the admin listener.
    pub cert_id: CertId,
}

/// Certificate selection state scoped to a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBindings {
    /// Served when a connection carries no SNI or no binding matches.
    /// `None` means such connections are refused.
    pub fallback_cert: Option<CertId>,
    pub sni: Vec<SniBinding>,
}

/// Maps one hostname (exact or single leading wildcard) to a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniBinding {
    pub host: String,
    pub certificate_id: CertId,
}

/// Route/cluster topology handed to the external forwarding engine.
///
/// The routing-match semantics are out of scope here; these rows are
/// carried opaquely so the revision hash and restart detection cover them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub http_ports: BTreeSet<u16>,
    pub https_ports: BTreeSet<u16>,
    pub routes: Vec<RouteConfig>,
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub hosts: Vec<String>,
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    pub destinations: Vec<String>,
}

/// A server certificate row. Key and chain bytes live in the blob store,
/// keyed by `id`; this row carries only metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: CertId,
    pub name: String,
    /// Hidden records are excluded from admin-facing pickers but keep
    /// serving existing bindings.
    pub hidden: bool,
    pub kind: CertKind,
}

/// Discriminates how a certificate came to exist and how it renews.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CertKind {
    /// A private certificate authority usable for issuing.
    Authority,
    /// Issued by one of our own authorities.
    Issued { issuer: CertId },
    /// Obtained via ACME; renewed automatically.
    Acme {
        account_id: AccountId,
        hosts: Vec<AcmeHost>,
        /// Set immediately before each renewal attempt so a crash mid-attempt
        /// cannot retry-storm the provider.
        last_attempt: Option<DateTime<Utc>>,
    },
    /// Uploaded by the operator.
    Imported,
}

/// One DNS identifier on an ACME certificate, with its challenge strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeHost {
    pub host: String,
    pub challenge: ChallengeKind,
}

/// Supported ACME challenge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    Http01,
    Dns01 { provider_id: DnsProviderId },
}

impl ChallengeKind {
    /// Wire name per RFC 8555.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 { .. } => "dns-01",
        }
    }
}

/// An ACME account registered with a provider. The account private key is
/// stored externally, keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeAccount {
    pub id: AccountId,
    pub name: String,
    /// Configured provider this account belongs to.
    pub provider_id: String,
    /// Account URL returned by the provider's `newAccount` endpoint.
    pub directory_account_url: String,
    pub contact_emails: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_revision() -> ConfigRevision {
        ConfigRevision {
            revision: 7,
            based_on_revision: 6,
            committed: true,
            confirmed: true,
            reverted: false,
            revert_reason: None,
            committed_at: Some(Utc::now()),
            confirm_seconds: 60,
            admin: AdminSettings {
                listen_any: false,
                port: 8443,
                cert_id: CertId::new(),
            },
            bindings: CertificateBindings {
                fallback_cert: None,
                sni: vec![],
            },
            topology: Topology::default(),
        }
    }

    #[test]
    fn test_clone_as_resets_lifecycle_flags() {
        let committed = sample_revision();
        let candidate = committed.clone_as(9);

        assert_eq!(candidate.revision, 9);
        assert_eq!(candidate.based_on_revision, 7);
        assert!(candidate.is_candidate());
        assert!(!candidate.confirmed);
        assert!(candidate.committed_at.is_none());
        assert_eq!(candidate.admin, committed.admin);
    }

    #[test]
    fn test_challenge_wire_names() {
        assert_eq!(ChallengeKind::Http01.wire_name(), "http-01");
        let dns = ChallengeKind::Dns01 {
            provider_id: DnsProviderId::new(),
        };
        assert_eq!(dns.wire_name(), "dns-01");
    }
}
