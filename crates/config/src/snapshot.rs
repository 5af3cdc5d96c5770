//! The materialized running configuration.
//!
//! A [`RunningSnapshot`] is computed wholesale from exactly one committed,
//! unreverted revision and never mutated in place; promotion replaces the
//! whole value through the manager's watch channel.

use bastion_common::CertId;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::host_trie::HostTrie;
use crate::model::{CertificateRecord, ConfigRevision, Topology};

/// Immutable projection of the running revision.
#[derive(Debug)]
pub struct RunningSnapshot {
    pub revision: u64,
    /// Content hash over the revision's settings, bindings, and topology.
    pub config_hash: String,
    pub committed_at: DateTime<Utc>,

    pub warnings: Vec<String>,
    pub errors: Vec<String>,

    pub admin_listen_any: bool,
    pub admin_port: u16,
    pub admin_cert: CertId,

    pub http_ports: BTreeSet<u16>,
    pub https_ports: BTreeSet<u16>,

    pub fallback_cert: Option<CertId>,
    /// Hostname → certificate id, wildcard-aware. Never mutated after
    /// construction; rebuild-and-swap only.
    pub sni: HostTrie,

    /// Carried through for the external forwarding engine.
    pub topology: Topology,
}

impl RunningSnapshot {
    /// Project a revision into a snapshot.
    ///
    /// `certs` is the current set of certificate rows, used only to flag
    /// bindings that reference missing or hidden certificates; such
    /// bindings still enter the trie so a later-restored certificate
    /// starts serving without another commit.
    ///
    /// Warnings flag bindings that may recover on their own; errors flag
    /// bindings that can never serve as written (a wildcard anywhere but
    /// the leftmost label, or a host bound twice).
    pub fn project(revision: &ConfigRevision, certs: &[CertificateRecord]) -> Arc<Self> {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for binding in &revision.bindings.sni {
            let labels: Vec<&str> = binding.host.split('.').collect();
            if labels.iter().skip(1).any(|l| *l == "*") || binding.host == "*" {
                errors.push(format!(
                    "SNI binding '{}' is invalid: '*' may only replace the leftmost label of a multi-label host",
                    binding.host
                ));
            }
            if !seen.insert(binding.host.to_ascii_lowercase()) {
                errors.push(format!(
                    "duplicate SNI binding for '{}'; the last row wins",
                    binding.host
                ));
            }

            match certs.iter().find(|c| c.id == binding.certificate_id) {
                None => warnings.push(format!(
                    "SNI binding '{}' references unknown certificate {}",
                    binding.host, binding.certificate_id
                )),
                Some(record) if record.hidden => warnings.push(format!(
                    "SNI binding '{}' references inactive certificate '{}'",
                    binding.host, record.name
                )),
                Some(_) => {}
            }
        }

        if let Some(fallback) = revision.bindings.fallback_cert {
            if !certs.iter().any(|c| c.id == fallback) {
                warnings.push(format!(
                    "fallback certificate {fallback} not found; unmatched SNI connections will be refused"
                ));
            }
        }

        Arc::new(Self {
            revision: revision.revision,
            config_hash: config_hash(revision),
            committed_at: revision.committed_at.unwrap_or_else(Utc::now),
            warnings,
            errors,
            admin_listen_any: revision.admin.listen_any,
            admin_port: revision.admin.port,
            admin_cert: revision.admin.cert_id,
            http_ports: revision.topology.http_ports.clone(),
            https_ports: revision.topology.https_ports.clone(),
            fallback_cert: revision.bindings.fallback_cert,
            sni: HostTrie::new(&revision.bindings.sni),
            topology: revision.topology.clone(),
        })
    }

    /// Whether swapping from `self` to `next` needs a process restart
    /// rather than an in-place promotion: the listener port set, the admin
    /// binding, or the refuse-vs-fallback behavior changed.
    pub fn requires_restart(&self, next: &Self) -> bool {
        self.admin_port != next.admin_port
            || self.admin_listen_any != next.admin_listen_any
            || self.http_ports != next.http_ports
            || self.https_ports != next.https_ports
            || self.fallback_cert.is_some() != next.fallback_cert.is_some()
    }
}

/// SHA-256 over the canonical JSON of everything an administrator can edit.
///
/// Lifecycle flags and timestamps are excluded so a freshly cloned
/// candidate hashes identically to its basis until actually edited.
pub fn config_hash(revision: &ConfigRevision) -> String {
    let mut hasher = Sha256::new();
    // Serialization of these three structs is deterministic: ports are
    // BTreeSets and the vectors preserve row order.
    let encoded = serde_json::to_vec(&(&revision.admin, &revision.bindings, &revision.topology))
        .unwrap_or_default();
    hasher.update(&encoded);
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdminSettings, CertKind, CertificateBindings, SniBinding};

    fn revision_with_bindings(sni: Vec<SniBinding>) -> ConfigRevision {
        ConfigRevision {
            revision: 3,
            based_on_revision: 2,
            committed: true,
            confirmed: false,
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
                sni,
            },
            topology: Topology::default(),
        }
    }

    fn record(id: CertId, hidden: bool) -> CertificateRecord {
        CertificateRecord {
            id,
            name: "test".into(),
            hidden,
            kind: CertKind::Imported,
        }
    }

    #[test]
    fn test_hash_stable_across_clone() {
        let rev = revision_with_bindings(vec![]);
        let candidate = rev.clone_as(9);
        assert_eq!(config_hash(&rev), config_hash(&candidate));
    }

    #[test]
    fn test_hash_changes_with_bindings() {
        let a = revision_with_bindings(vec![]);
        let b = revision_with_bindings(vec![SniBinding {
            host: "example.com".into(),
            certificate_id: CertId::new(),
        }]);
        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_dangling_binding_warns() {
        let rev = revision_with_bindings(vec![SniBinding {
            host: "example.com".into(),
            certificate_id: CertId::new(),
        }]);
        let snapshot = RunningSnapshot::project(&rev, &[]);
        assert_eq!(snapshot.warnings.len(), 1);
        assert!(snapshot.warnings[0].contains("unknown certificate"));
    }

    #[test]
    fn test_hidden_binding_warns() {
        let id = CertId::new();
        let rev = revision_with_bindings(vec![SniBinding {
            host: "example.com".into(),
            certificate_id: id,
        }]);
        let snapshot = RunningSnapshot::project(&rev, &[record(id, true)]);
        assert!(snapshot.warnings[0].contains("inactive"));
        // the binding still resolves
        assert_eq!(snapshot.sni.lookup("example.com"), Some(id));
    }

    #[test]
    fn test_misplaced_wildcard_is_error() {
        let id = CertId::new();
        let rev = revision_with_bindings(vec![
            SniBinding {
                host: "www.*.example.com".into(),
                certificate_id: id,
            },
            SniBinding {
                host: "*".into(),
                certificate_id: id,
            },
        ]);
        let snapshot = RunningSnapshot::project(&rev, &[record(id, false)]);
        assert_eq!(snapshot.errors.len(), 2);
        assert!(snapshot.errors[0].contains("www.*.example.com"));
    }

    #[test]
    fn test_duplicate_binding_is_error() {
        let id = CertId::new();
        let rev = revision_with_bindings(vec![
            SniBinding {
                host: "example.com".into(),
                certificate_id: id,
            },
            SniBinding {
                host: "Example.COM".into(),
                certificate_id: CertId::new(),
            },
        ]);
        let snapshot = RunningSnapshot::project(&rev, &[record(id, false)]);
        assert_eq!(snapshot.errors.len(), 1);
        assert!(snapshot.errors[0].contains("duplicate"));
    }

    #[test]
    fn test_clean_projection_has_no_errors() {
        let id = CertId::new();
        let rev = revision_with_bindings(vec![SniBinding {
            host: "*.example.com".into(),
            certificate_id: id,
        }]);
        let snapshot = RunningSnapshot::project(&rev, &[record(id, false)]);
        assert!(snapshot.errors.is_empty());
        assert!(snapshot.warnings.is_empty());
    }

    #[test]
    fn test_restart_detection() {
        let rev = revision_with_bindings(vec![]);
        let a = RunningSnapshot::project(&rev, &[]);

        let mut changed = rev.clone_as(4);
        changed.committed_at = Some(Utc::now());
        changed.topology.https_ports.insert(443);
        let b = RunningSnapshot::project(&changed, &[]);

        assert!(a.requires_restart(&b));

        let same = rev.clone_as(5);
        let c = RunningSnapshot::project(&same, &[]);
        assert!(!a.requires_restart(&c));
    }
}
