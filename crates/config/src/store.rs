//! Repository traits over the persistence collaborator.
//!
//! The control plane assumes a transactional relational store; these traits
//! express the queries it needs ("latest committed & unreverted", "current
//! uncommitted", "specific revision") without binding to a database. The
//! bundled [`MemoryStore`] backs tests and single-process deployments.

use async_trait::async_trait;
use bastion_common::{AccountId, CertId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::model::{AcmeAccount, CertKind, CertificateRecord, ConfigRevision};

/// Revision-row persistence.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn insert(&self, revision: ConfigRevision) -> Result<(), StoreError>;

    /// Overwrite a revision row in full (candidate edits).
    async fn update(&self, revision: ConfigRevision) -> Result<(), StoreError>;

    async fn get(&self, revision: u64) -> Result<Option<ConfigRevision>, StoreError>;

    /// The highest committed, unreverted revision — the running one.
    async fn latest_committed_unreverted(&self) -> Result<Option<ConfigRevision>, StoreError>;

    /// All uncommitted, unreverted rows. Exactly one is expected; extras
    /// are crash leftovers the manager self-heals at startup.
    async fn uncommitted_unreverted(&self) -> Result<Vec<ConfigRevision>, StoreError>;

    /// Next free revision number (strictly increasing, gap-tolerant).
    async fn next_revision(&self) -> Result<u64, StoreError>;

    async fn set_confirmed(&self, revision: u64) -> Result<(), StoreError>;

    async fn set_reverted(&self, revision: u64, reason: &str) -> Result<(), StoreError>;

    /// Atomically delete the current candidate row and insert its
    /// replacement. Either both happen or neither does.
    async fn replace_candidate(
        &self,
        delete_revision: u64,
        insert: ConfigRevision,
    ) -> Result<(), StoreError>;
}

/// Certificate-row persistence. Cryptographic material lives in the blob
/// store; these rows are metadata only.
#[async_trait]
pub trait CertificateRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError>;

    async fn get(&self, id: CertId) -> Result<Option<CertificateRecord>, StoreError>;

    async fn upsert(&self, record: CertificateRecord) -> Result<(), StoreError>;

    async fn delete(&self, id: CertId) -> Result<(), StoreError>;

    /// Record the start of an ACME renewal attempt. Persisted before the
    /// network call so a crash mid-attempt cannot retry-storm.
    async fn set_last_attempt(&self, id: CertId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// ACME account persistence.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get(&self, id: AccountId) -> Result<Option<AcmeAccount>, StoreError>;

    async fn upsert(&self, account: AcmeAccount) -> Result<(), StoreError>;

    async fn delete(&self, id: AccountId) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    revisions: BTreeMap<u64, ConfigRevision>,
    certificates: BTreeMap<CertId, CertificateRecord>,
    accounts: BTreeMap<AccountId, AcmeAccount>,
}

/// In-memory implementation of all three repositories.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevisionStore for MemoryStore {
    async fn insert(&self, revision: ConfigRevision) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.revisions.contains_key(&revision.revision) {
            return Err(StoreError::Backend(format!(
                "revision {} already exists",
                revision.revision
            )));
        }
        inner.revisions.insert(revision.revision, revision);
        Ok(())
    }

    async fn update(&self, revision: ConfigRevision) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.revisions.contains_key(&revision.revision) {
            return Err(StoreError::RevisionNotFound(revision.revision));
        }
        inner.revisions.insert(revision.revision, revision);
        Ok(())
    }

    async fn get(&self, revision: u64) -> Result<Option<ConfigRevision>, StoreError> {
        Ok(self.inner.read().revisions.get(&revision).cloned())
    }

    async fn latest_committed_unreverted(&self) -> Result<Option<ConfigRevision>, StoreError> {
        Ok(self
            .inner
            .read()
            .revisions
            .values()
            .rev()
            .find(|r| r.committed && !r.reverted)
            .cloned())
    }

    async fn uncommitted_unreverted(&self) -> Result<Vec<ConfigRevision>, StoreError> {
        Ok(self
            .inner
            .read()
            .revisions
            .values()
            .filter(|r| !r.committed && !r.reverted)
            .cloned()
            .collect())
    }

    async fn next_revision(&self) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .revisions
            .keys()
            .next_back()
            .map_or(1, |highest| highest + 1))
    }

    async fn set_confirmed(&self, revision: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let row = inner
            .revisions
            .get_mut(&revision)
            .ok_or(StoreError::RevisionNotFound(revision))?;
        row.confirmed = true;
        Ok(())
    }

    async fn set_reverted(&self, revision: u64, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let row = inner
            .revisions
            .get_mut(&revision)
            .ok_or(StoreError::RevisionNotFound(revision))?;
        row.reverted = true;
        row.revert_reason = Some(reason.to_string());
        Ok(())
    }

    async fn replace_candidate(
        &self,
        delete_revision: u64,
        insert: ConfigRevision,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.revisions.contains_key(&delete_revision) {
            return Err(StoreError::RevisionNotFound(delete_revision));
        }
        if inner.revisions.contains_key(&insert.revision) {
            return Err(StoreError::Backend(format!(
                "revision {} already exists",
                insert.revision
            )));
        }
        inner.revisions.remove(&delete_revision);
        inner.revisions.insert(insert.revision, insert);
        Ok(())
    }
}

#[async_trait]
impl CertificateRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        Ok(self.inner.read().certificates.values().cloned().collect())
    }

    async fn get(&self, id: CertId) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self.inner.read().certificates.get(&id).cloned())
    }

    async fn upsert(&self, record: CertificateRecord) -> Result<(), StoreError> {
        self.inner.write().certificates.insert(record.id, record);
        Ok(())
    }

    async fn delete(&self, id: CertId) -> Result<(), StoreError> {
        self.inner.write().certificates.remove(&id);
        Ok(())
    }

    async fn set_last_attempt(&self, id: CertId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .certificates
            .get_mut(&id)
            .ok_or(StoreError::CertificateNotFound(id))?;
        match &mut record.kind {
            CertKind::Acme { last_attempt, .. } => {
                *last_attempt = Some(at);
                Ok(())
            }
            _ => Err(StoreError::Backend(format!(
                "certificate {id} is not ACME-managed"
            ))),
        }
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn get(&self, id: AccountId) -> Result<Option<AcmeAccount>, StoreError> {
        Ok(self.inner.read().accounts.get(&id).cloned())
    }

    async fn upsert(&self, account: AcmeAccount) -> Result<(), StoreError> {
        self.inner.write().accounts.insert(account.id, account);
        Ok(())
    }

    async fn delete(&self, id: AccountId) -> Result<(), StoreError> {
        self.inner.write().accounts.remove(&id);
        Ok(())
    }
}
