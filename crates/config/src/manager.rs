//! Candidate → commit → confirm/rollback state machine.
//!
//! The manager owns the candidate pointer, the confirm-window timer, and
//! the watch channel that publishes each new [`RunningSnapshot`]. All
//! revision-mutating operations are serialized by a single-slot gate; a
//! caller that finds the gate held gets an immediate error instead of
//! queueing behind the conflicting operation.

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RevisionError;
use crate::model::ConfigRevision;
use crate::snapshot::{config_hash, RunningSnapshot};
use crate::store::{CertificateRepository, RevisionStore};

/// Reason recorded when the confirm window elapses without confirmation.
const REASON_CONFIRM_TIMEOUT: &str = "confirm window expired without confirmation";
/// Reason recorded for crash-recovered candidate rows at startup.
const REASON_STARTUP_ORPHAN: &str = "abandoned candidate recovered at startup";

/// Owns the revision lifecycle and publishes running snapshots.
///
/// Exactly one committed, unreverted revision is running and exactly one
/// uncommitted, unreverted revision is the candidate at every observable
/// instant, including mid-rollback.
pub struct RevisionManager {
    store: Arc<dyn RevisionStore>,
    certs: Arc<dyn CertificateRepository>,

    /// Single-slot gate over commit/confirm/revert/discard/promote.
    gate: Mutex<()>,
    /// Revision number of the row currently open for editing.
    candidate: AtomicU64,

    snapshot_tx: watch::Sender<Arc<RunningSnapshot>>,
    /// Tripped instead of publishing when a promotion needs new listeners.
    restart: CancellationToken,
    shutdown: CancellationToken,
    /// Cancels the in-flight confirm timer, if any.
    confirm_timer: SyncMutex<Option<CancellationToken>>,
}

impl RevisionManager {
    /// Load state from the store, self-heal, and start publishing.
    ///
    /// `initial` seeds revision 1 (committed and confirmed) when the store
    /// is empty. Any uncommitted, unreverted row beyond the chosen
    /// candidate is a crash leftover and is marked reverted here. If the
    /// running revision is unconfirmed — the process died inside a confirm
    /// window — the window is re-entered with its original length.
    pub async fn start(
        store: Arc<dyn RevisionStore>,
        certs: Arc<dyn CertificateRepository>,
        initial: ConfigRevision,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, RevisionError> {
        let running = match store.latest_committed_unreverted().await? {
            Some(running) => running,
            None => {
                let mut seed = initial;
                seed.revision = 1;
                seed.based_on_revision = 0;
                seed.committed = true;
                seed.confirmed = true;
                seed.reverted = false;
                seed.revert_reason = None;
                seed.committed_at = Some(Utc::now());
                info!("seeding initial configuration revision");
                store.insert(seed.clone()).await?;
                seed
            }
        };

        // Highest leftover edit becomes the candidate; the rest are healed.
        let mut editable = store.uncommitted_unreverted().await?;
        editable.sort_by_key(|r| r.revision);
        let candidate = match editable.pop() {
            Some(row) => row,
            None => {
                let next = store.next_revision().await?;
                let clone = running.clone_as(next);
                store.insert(clone.clone()).await?;
                clone
            }
        };
        for orphan in editable {
            warn!(revision = orphan.revision, "reverting abandoned candidate");
            store
                .set_reverted(orphan.revision, REASON_STARTUP_ORPHAN)
                .await?;
        }

        let cert_rows = certs.list().await?;
        let snapshot = RunningSnapshot::project(&running, &cert_rows);
        let (snapshot_tx, _) = watch::channel(Arc::clone(&snapshot));

        let manager = Arc::new(Self {
            store,
            certs,
            gate: Mutex::new(()),
            candidate: AtomicU64::new(candidate.revision),
            snapshot_tx,
            restart: CancellationToken::new(),
            shutdown,
            confirm_timer: SyncMutex::new(None),
        });

        if !running.confirmed {
            info!(
                revision = running.revision,
                confirm_seconds = running.confirm_seconds,
                "running revision is unconfirmed, re-entering confirm window"
            );
            manager.spawn_confirm_timer(running.confirm_seconds);
        }

        Ok(manager)
    }

    /// Current running snapshot.
    pub fn running(&self) -> Arc<RunningSnapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    /// Subscribe to snapshot promotions. A late subscriber immediately
    /// observes the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RunningSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Cancelled when a committed revision needs new listeners and the
    /// process must restart to apply it.
    pub fn restart_token(&self) -> CancellationToken {
        self.restart.clone()
    }

    /// Revision number currently open for editing.
    pub fn candidate_revision(&self) -> u64 {
        self.candidate.load(Ordering::Acquire)
    }

    /// Fetch the candidate row for editing.
    pub async fn current_candidate(&self) -> Result<ConfigRevision, RevisionError> {
        let number = self.candidate_revision();
        match self.store.get(number).await? {
            Some(row) if row.is_candidate() => Ok(row),
            _ => Err(RevisionError::CandidateInconsistent(number)),
        }
    }

    /// Persist an edited candidate. The row must be the tracked candidate
    /// and still editable.
    pub async fn update_candidate(&self, edited: ConfigRevision) -> Result<(), RevisionError> {
        let number = self.candidate_revision();
        if edited.revision != number || !edited.is_candidate() {
            return Err(RevisionError::CandidateInconsistent(edited.revision));
        }
        self.store.update(edited).await?;
        Ok(())
    }

    /// Whether the candidate differs from the running revision in any
    /// administrator-editable way.
    pub async fn changes_pending(&self) -> Result<bool, RevisionError> {
        let candidate = self.current_candidate().await?;
        Ok(config_hash(&candidate) != self.running().config_hash)
    }

    /// Commit the candidate and open a confirm window of `confirm_seconds`.
    ///
    /// Fails with [`RevisionError::AwaitingConfirm`] while a prior commit's
    /// window is unresolved and with [`RevisionError::InProgress`] if any
    /// other revision-mutating operation holds the gate. On success the
    /// candidate becomes running, a fresh clone of it becomes the new
    /// candidate, and the snapshot is published — unless the new revision
    /// changes the listener set, in which case the restart token is tripped
    /// and the confirm window is re-entered by the restarted process.
    pub async fn request_commit(
        self: &Arc<Self>,
        confirm_seconds: u32,
    ) -> Result<Arc<RunningSnapshot>, RevisionError> {
        let _slot = self.gate.try_lock().map_err(|_| RevisionError::InProgress)?;

        let running = self
            .store
            .latest_committed_unreverted()
            .await?
            .ok_or(RevisionError::NoPriorRevision)?;
        if !running.confirmed {
            return Err(RevisionError::AwaitingConfirm);
        }

        let mut committing = self.current_candidate().await?;
        committing.committed = true;
        committing.confirmed = false;
        committing.committed_at = Some(Utc::now());
        committing.confirm_seconds = confirm_seconds;
        self.store.update(committing.clone()).await?;

        let next = self.store.next_revision().await?;
        let new_candidate = committing.clone_as(next);
        self.store.insert(new_candidate).await?;
        self.candidate.store(next, Ordering::Release);

        info!(
            revision = committing.revision,
            candidate = next,
            confirm_seconds,
            "committed configuration revision"
        );

        let cert_rows = self.certs.list().await?;
        let snapshot = RunningSnapshot::project(&committing, &cert_rows);
        for warning in &snapshot.warnings {
            warn!(revision = committing.revision, %warning, "snapshot warning");
        }
        for problem in &snapshot.errors {
            error!(revision = committing.revision, %problem, "snapshot error");
        }

        if self.running().requires_restart(&snapshot) {
            info!(
                revision = committing.revision,
                "committed revision changes the listener set, requesting restart"
            );
            self.restart.cancel();
            return Ok(snapshot);
        }

        // send_replace, not send: the value must move even when nothing
        // is subscribed yet, or running() would keep serving the old one.
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        self.spawn_confirm_timer(confirm_seconds);
        Ok(snapshot)
    }

    /// Confirm the running revision and cancel its rollback timer.
    ///
    /// Idempotent: confirming an already-confirmed revision is a silent
    /// no-op, with no second event.
    pub async fn confirm_commit(&self) -> Result<(), RevisionError> {
        let _slot = self.gate.try_lock().map_err(|_| RevisionError::InProgress)?;

        let running = self
            .store
            .latest_committed_unreverted()
            .await?
            .ok_or(RevisionError::NoPriorRevision)?;
        if running.confirmed {
            debug!(revision = running.revision, "already confirmed");
            return Ok(());
        }

        self.cancel_confirm_timer();
        self.store.set_confirmed(running.revision).await?;
        info!(revision = running.revision, "configuration confirmed");
        Ok(())
    }

    /// Roll the unconfirmed running revision back without waiting for the
    /// window to expire.
    pub async fn cancel_confirm(self: &Arc<Self>) -> Result<(), RevisionError> {
        let _slot = self.gate.try_lock().map_err(|_| RevisionError::InProgress)?;

        let running = self
            .store
            .latest_committed_unreverted()
            .await?
            .ok_or(RevisionError::NoPriorRevision)?;
        if running.confirmed {
            return Err(RevisionError::AlreadyConfirmed);
        }

        self.cancel_confirm_timer();
        self.rollback_locked("canceled by administrator").await
    }

    /// Revert an unconfirmed running revision because the process could not
    /// bring its listeners up. The data-plane supervisor calls this from
    /// its listener bring-up path when binding the committed port set
    /// fails, during startup and before any admin operation can contend
    /// for the gate.
    pub async fn rollback_failed_startup(self: &Arc<Self>, reason: &str) -> Result<(), RevisionError> {
        let _slot = self.gate.lock().await;

        let running = self
            .store
            .latest_committed_unreverted()
            .await?
            .ok_or(RevisionError::NoPriorRevision)?;
        if running.confirmed {
            return Err(RevisionError::AlreadyConfirmed);
        }

        self.cancel_confirm_timer();
        self.rollback_locked(reason).await
    }

    /// Throw away the candidate's edits: atomically replace it with a
    /// fresh clone of the running revision.
    pub async fn discard_candidate(&self) -> Result<(), RevisionError> {
        let _slot = self.gate.try_lock().map_err(|_| RevisionError::InProgress)?;
        let running = self
            .store
            .latest_committed_unreverted()
            .await?
            .ok_or(RevisionError::NoPriorRevision)?;
        self.respawn_candidate_from(&running).await
    }

    /// Replace the candidate with a fresh clone of `target`, typically to
    /// resurrect an older revision for re-commit.
    pub async fn promote_revision_to_candidate(&self, target: u64) -> Result<(), RevisionError> {
        let _slot = self.gate.try_lock().map_err(|_| RevisionError::InProgress)?;
        let source = self
            .store
            .get(target)
            .await?
            .ok_or(RevisionError::RevisionNotFound(target))?;
        self.respawn_candidate_from(&source).await
    }

    /// Delete the tracked candidate row and insert `source.clone_as(next)`
    /// in its place. The candidate pointer only moves after the store
    /// reports success, so a failed swap leaves the prior candidate intact.
    async fn respawn_candidate_from(&self, source: &ConfigRevision) -> Result<(), RevisionError> {
        let old = self.candidate_revision();
        let next = self.store.next_revision().await?;
        let fresh = source.clone_as(next);
        self.store.replace_candidate(old, fresh).await?;
        self.candidate.store(next, Ordering::Release);
        debug!(
            from = source.revision,
            candidate = next,
            "candidate respawned"
        );
        Ok(())
    }

    /// Revert the running revision and restore the previous good one.
    /// Caller must hold the gate and have canceled the confirm timer.
    async fn rollback_locked(self: &Arc<Self>, reason: &str) -> Result<(), RevisionError> {
        let running = self
            .store
            .latest_committed_unreverted()
            .await?
            .ok_or(RevisionError::NoPriorRevision)?;

        // The seed revision has nothing to fall back to and is never
        // auto-reverted; leaving it running beats serving nothing.
        let restored = match self.previous_committed(running.revision).await? {
            Some(restored) => restored,
            None => return Err(RevisionError::NoPriorRevision),
        };

        self.store.set_reverted(running.revision, reason).await?;
        warn!(
            reverted = running.revision,
            restored = restored.revision,
            reason,
            "configuration rolled back"
        );

        self.respawn_candidate_from(&restored).await?;

        let cert_rows = self.certs.list().await?;
        let snapshot = RunningSnapshot::project(&restored, &cert_rows);
        if self.running().requires_restart(&snapshot) {
            info!(
                revision = restored.revision,
                "restored revision changes the listener set, requesting restart"
            );
            self.restart.cancel();
            return Ok(());
        }
        self.snapshot_tx.send_replace(snapshot);
        Ok(())
    }

    /// Highest committed, unreverted revision strictly below `below`.
    async fn previous_committed(
        &self,
        below: u64,
    ) -> Result<Option<ConfigRevision>, RevisionError> {
        for number in (1..below).rev() {
            if let Some(row) = self.store.get(number).await? {
                if row.committed && !row.reverted {
                    return Ok(Some(row));
                }
            }
        }
        Ok(None)
    }

    /// Arm the confirm-window timer, replacing any previous one.
    fn spawn_confirm_timer(self: &Arc<Self>, confirm_seconds: u32) {
        let token = CancellationToken::new();
        if let Some(previous) = self.confirm_timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(u64::from(confirm_seconds))) => {
                    // Unlike admin calls, the timer waits for the gate
                    // rather than erroring out.
                    let _slot = manager.gate.lock().await;
                    if let Err(err) = manager.rollback_locked(REASON_CONFIRM_TIMEOUT).await {
                        error!(error = %err, "confirm-window rollback failed");
                    }
                }
            }
        });
    }

    fn cancel_confirm_timer(&self) {
        if let Some(token) = self.confirm_timer.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdminSettings, CertificateBindings, SniBinding, Topology};
    use crate::store::MemoryStore;
    use bastion_common::CertId;

    fn initial_revision() -> ConfigRevision {
        ConfigRevision {
            revision: 0,
            based_on_revision: 0,
            committed: false,
            confirmed: false,
            reverted: false,
            revert_reason: None,
            committed_at: None,
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

    async fn manager_with_store() -> (Arc<RevisionManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = RevisionManager::start(
            store.clone(),
            store.clone(),
            initial_revision(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (manager, store)
    }

    async fn assert_one_running_one_candidate(store: &MemoryStore) {
        let running = store.latest_committed_unreverted().await.unwrap();
        assert!(running.is_some(), "no running revision");
        let candidates = store.uncommitted_unreverted().await.unwrap();
        assert_eq!(candidates.len(), 1, "expected exactly one candidate");
    }

    async fn edit_candidate(manager: &RevisionManager) {
        let mut candidate = manager.current_candidate().await.unwrap();
        candidate.bindings.sni.push(SniBinding {
            host: format!("rev{}.example.com", candidate.revision),
            certificate_id: CertId::new(),
        });
        manager.update_candidate(candidate).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_seeds_revision_and_candidate() {
        let (manager, store) = manager_with_store().await;

        assert_eq!(manager.running().revision, 1);
        assert_eq!(manager.candidate_revision(), 2);
        assert_one_running_one_candidate(&store).await;
    }

    #[tokio::test]
    async fn test_commit_then_confirm() {
        let (manager, store) = manager_with_store().await;
        edit_candidate(&manager).await;

        let snapshot = manager.request_commit(60).await.unwrap();
        assert_eq!(snapshot.revision, 2);
        assert_eq!(manager.running().revision, 2);
        assert_eq!(manager.candidate_revision(), 3);
        assert_one_running_one_candidate(&store).await;

        manager.confirm_commit().await.unwrap();
        let running = store.latest_committed_unreverted().await.unwrap().unwrap();
        assert!(running.confirmed);
    }

    #[tokio::test]
    async fn test_commit_promotes_without_subscribers() {
        let (manager, _) = manager_with_store().await;
        edit_candidate(&manager).await;

        // no receiver exists while the commit lands
        manager.request_commit(60).await.unwrap();
        assert_eq!(manager.running().revision, 2);

        // a late subscriber immediately observes the promoted snapshot
        let updates = manager.subscribe();
        assert_eq!(updates.borrow().revision, 2);
    }

    #[tokio::test]
    async fn test_rollback_promotes_without_subscribers() {
        let (manager, _) = manager_with_store().await;
        edit_candidate(&manager).await;
        manager.request_commit(600).await.unwrap();
        assert_eq!(manager.running().revision, 2);

        manager.cancel_confirm().await.unwrap();
        assert_eq!(manager.running().revision, 1);
        assert_eq!(manager.subscribe().borrow().revision, 1);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let (manager, _) = manager_with_store().await;
        edit_candidate(&manager).await;
        manager.request_commit(60).await.unwrap();

        manager.confirm_commit().await.unwrap();
        manager.confirm_commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_while_window_open_is_rejected() {
        let (manager, store) = manager_with_store().await;
        edit_candidate(&manager).await;
        manager.request_commit(600).await.unwrap();

        let before_running = manager.running().revision;
        let before_candidate = manager.candidate_revision();

        let err = manager.request_commit(60).await.unwrap_err();
        assert!(matches!(err, RevisionError::AwaitingConfirm));
        assert_eq!(manager.running().revision, before_running);
        assert_eq!(manager.candidate_revision(), before_candidate);
        assert_one_running_one_candidate(&store).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_window_expiry_rolls_back() {
        let (manager, store) = manager_with_store().await;
        manager.confirm_commit().await.unwrap(); // seed is confirmed already
        edit_candidate(&manager).await;
        manager.request_commit(30).await.unwrap();
        assert_eq!(manager.running().revision, 2);

        let mut updates = manager.subscribe();
        tokio::time::sleep(Duration::from_secs(31)).await;
        updates.changed().await.unwrap();

        assert_eq!(manager.running().revision, 1);
        let reverted = RevisionStore::get(&*store, 2).await.unwrap().unwrap();
        assert!(reverted.reverted);
        assert!(reverted.revert_reason.is_some());
        assert_one_running_one_candidate(&store).await;

        // the window resolved, so a new commit is accepted again
        edit_candidate(&manager).await;
        manager.request_commit(60).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_startup_rollback_records_reason() {
        let (manager, store) = manager_with_store().await;
        edit_candidate(&manager).await;
        manager.request_commit(600).await.unwrap();
        assert_eq!(manager.running().revision, 2);

        manager
            .rollback_failed_startup("listener bind failed: address in use")
            .await
            .unwrap();

        let reverted = RevisionStore::get(&*store, 2).await.unwrap().unwrap();
        assert!(reverted.reverted);
        assert_eq!(
            reverted.revert_reason.as_deref(),
            Some("listener bind failed: address in use")
        );
        assert_one_running_one_candidate(&store).await;
    }

    #[tokio::test]
    async fn test_cancel_confirm_restores_previous() {
        let (manager, store) = manager_with_store().await;
        edit_candidate(&manager).await;
        manager.request_commit(600).await.unwrap();

        manager.cancel_confirm().await.unwrap();
        assert_eq!(manager.running().revision, 1);
        assert_one_running_one_candidate(&store).await;

        let err = manager.cancel_confirm().await.unwrap_err();
        assert!(matches!(err, RevisionError::AlreadyConfirmed));
    }

    #[tokio::test]
    async fn test_discard_candidate_respawns_clean() {
        let (manager, store) = manager_with_store().await;
        edit_candidate(&manager).await;
        assert!(manager.changes_pending().await.unwrap());

        manager.discard_candidate().await.unwrap();
        assert!(!manager.changes_pending().await.unwrap());
        assert_ne!(manager.candidate_revision(), 2);
        assert_one_running_one_candidate(&store).await;
    }

    #[tokio::test]
    async fn test_promote_old_revision_to_candidate() {
        let (manager, _) = manager_with_store().await;
        edit_candidate(&manager).await;
        manager.request_commit(60).await.unwrap();
        manager.confirm_commit().await.unwrap();

        manager.promote_revision_to_candidate(1).await.unwrap();
        let candidate = manager.current_candidate().await.unwrap();
        assert_eq!(candidate.based_on_revision, 1);
        assert!(candidate.bindings.sni.is_empty());
    }

    #[tokio::test]
    async fn test_promote_unknown_revision_fails() {
        let (manager, _) = manager_with_store().await;
        let err = manager.promote_revision_to_candidate(99).await.unwrap_err();
        assert!(matches!(err, RevisionError::RevisionNotFound(99)));
    }

    #[tokio::test]
    async fn test_startup_heals_orphan_candidates() {
        let store = Arc::new(MemoryStore::new());
        let mut seed = initial_revision();
        seed.revision = 1;
        seed.committed = true;
        seed.confirmed = true;
        seed.committed_at = Some(Utc::now());
        store.insert(seed.clone()).await.unwrap();
        // two leftover edits from a crashed process
        store.insert(seed.clone_as(2)).await.unwrap();
        store.insert(seed.clone_as(3)).await.unwrap();

        let manager = RevisionManager::start(
            store.clone(),
            store.clone(),
            initial_revision(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // the highest survives as candidate, the other is reverted
        assert_eq!(manager.candidate_revision(), 3);
        let healed = RevisionStore::get(&*store, 2).await.unwrap().unwrap();
        assert!(healed.reverted);
        assert_one_running_one_candidate(&store).await;
    }

    #[tokio::test]
    async fn test_port_change_requests_restart_without_publishing() {
        let (manager, _) = manager_with_store().await;
        let mut candidate = manager.current_candidate().await.unwrap();
        candidate.topology.https_ports.insert(443);
        manager.update_candidate(candidate).await.unwrap();

        let restart = manager.restart_token();
        assert!(!restart.is_cancelled());

        manager.request_commit(60).await.unwrap();
        assert!(restart.is_cancelled());
        // the in-process snapshot is not swapped; the restarted process
        // projects the new revision itself
        assert_eq!(manager.running().revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_running_reenters_window_at_startup() {
        let store = Arc::new(MemoryStore::new());
        let mut first = initial_revision();
        first.revision = 1;
        first.committed = true;
        first.confirmed = true;
        first.committed_at = Some(Utc::now());
        store.insert(first.clone()).await.unwrap();
        let mut second = first.clone_as(2);
        second.committed = true;
        second.confirmed = false;
        second.committed_at = Some(Utc::now());
        second.confirm_seconds = 30;
        store.insert(second).await.unwrap();

        let manager = RevisionManager::start(
            store.clone(),
            store.clone(),
            initial_revision(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(manager.running().revision, 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            store
                .latest_committed_unreverted()
                .await
                .unwrap()
                .unwrap()
                .revision,
            1
        );
        assert_one_running_one_candidate(&store).await;
    }
}
