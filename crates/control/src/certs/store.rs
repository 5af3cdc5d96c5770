//! The live certificate set: cache, selection, and renewal.
//!
//! Owns the concurrent id→material cache plus the two pinned slots (admin
//! and fallback certificate). Selection on the handshake path is lock-free:
//! a trie walk against the current snapshot and a map read. Every snapshot
//! promotion triggers a wholesale rebuild; the renewal loop wakes hourly
//! (or on an explicit signal) and re-orders anything past its renewal
//! point.

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bastion_common::CertId;
use bastion_config::{CertKind, CertificateRecord, CertificateRepository, RunningSnapshot};

use super::material::{cert_issues, CertificateMaterial, MaterialError};
use crate::acme::{AcmeClient, AcmeError};
use crate::blob::{BlobError, BlobStore};

/// Renewal attempts started less than this many hours after the previous
/// one are skipped, even if the certificate is past its renewal point.
const ATTEMPT_DAMPENING_HOURS: i64 = 12;
/// Renewal loop cadence between explicit signals.
const RENEWAL_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Hostname placed on the ephemeral admin failsafe certificate.
const FAILSAFE_HOST: &str = "bastion-admin";

/// Certificate store failures.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate {0} has no stored material")]
    NoMaterial(CertId),

    #[error("certificate {0} not found")]
    NotFound(CertId),

    #[error(transparent)]
    Material(#[from] MaterialError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Store(#[from] bastion_config::StoreError),

    #[error(transparent)]
    Acme(#[from] AcmeError),
}

/// Result of one renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    /// A previous attempt ran less than 12 hours ago.
    RecentAttempt,
    /// The record is not ACME-managed.
    NotAcmeManaged,
}

struct RenewalEntry {
    cert_id: CertId,
    renew_at: DateTime<Utc>,
}

/// Concurrent decoded-certificate store and renewal driver.
pub struct CertificateManager {
    records: Arc<dyn CertificateRepository>,
    blobs: Arc<dyn BlobStore>,
    acme: Arc<AcmeClient>,

    cache: DashMap<CertId, Arc<CertificateMaterial>>,
    snapshot: ArcSwap<RunningSnapshot>,
    /// Always present: falls back to an ephemeral self-signed certificate
    /// so the admin listener can come up no matter what.
    admin: ArcSwap<CertificateMaterial>,
    fallback: ArcSwapOption<CertificateMaterial>,

    worklist: Mutex<Vec<RenewalEntry>>,
    renew_now: Notify,
    shutdown: CancellationToken,
}

impl CertificateManager {
    /// Build the manager and run the first rebuild against `snapshot`.
    pub async fn new(
        records: Arc<dyn CertificateRepository>,
        blobs: Arc<dyn BlobStore>,
        acme: Arc<AcmeClient>,
        snapshot: Arc<RunningSnapshot>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, CertError> {
        let failsafe = CertificateMaterial::self_signed(&[FAILSAFE_HOST.to_string()])?;
        let manager = Arc::new(Self {
            records,
            blobs,
            acme,
            cache: DashMap::new(),
            snapshot: ArcSwap::from(Arc::clone(&snapshot)),
            admin: ArcSwap::from_pointee(failsafe),
            fallback: ArcSwapOption::empty(),
            worklist: Mutex::new(Vec::new()),
            renew_now: Notify::new(),
            shutdown,
        });
        manager.rebuild(snapshot).await;
        Ok(manager)
    }

    // ---- selection (handshake hot path) ----

    /// Pick the certificate for an SNI hostname.
    ///
    /// Empty hostname means the client sent no SNI: serve the fallback.
    /// A trie miss also falls back — and when no fallback is configured,
    /// `None` tells the caller to refuse the connection.
    pub fn select_certificate(&self, sni_hostname: &str) -> Option<Arc<CertificateMaterial>> {
        if sni_hostname.is_empty() {
            return self.fallback.load_full();
        }
        let snapshot = self.snapshot.load();
        match snapshot.sni.lookup(sni_hostname) {
            Some(id) => match self.cache.get(&id) {
                Some(material) => Some(Arc::clone(&material)),
                None => self.fallback.load_full(),
            },
            None => self.fallback.load_full(),
        }
    }

    /// The certificate presented on the admin listener.
    pub fn admin_certificate(&self) -> Arc<CertificateMaterial> {
        self.admin.load_full()
    }

    pub fn fallback_certificate(&self) -> Option<Arc<CertificateMaterial>> {
        self.fallback.load_full()
    }

    // ---- cache ----

    /// Decode-from-blob with memoization. `force_reload` overwrites the
    /// cached entry, used after renewal writes fresh material.
    pub async fn get_certificate(
        &self,
        id: CertId,
        force_reload: bool,
    ) -> Result<Arc<CertificateMaterial>, CertError> {
        if !force_reload {
            if let Some(cached) = self.cache.get(&id) {
                return Ok(Arc::clone(&cached));
            }
        }
        let bytes = self
            .blobs
            .read(&id.to_string())
            .await?
            .ok_or(CertError::NoMaterial(id))?;
        let material = Arc::new(CertificateMaterial::decode(&bytes)?);
        self.cache.insert(id, Arc::clone(&material));
        Ok(material)
    }

    /// Remove a certificate entirely: row, blob, and cache entry.
    pub async fn purge_certificate(&self, id: CertId) -> Result<(), CertError> {
        self.records.delete(id).await?;
        self.blobs.delete(&id.to_string()).await?;
        self.cache.remove(&id);
        info!(certificate = %id, "certificate purged");
        Ok(())
    }

    /// Mint and persist a self-signed server certificate for `hosts`.
    pub async fn create_self_signed(
        &self,
        name: &str,
        hosts: &[String],
    ) -> Result<CertificateRecord, CertError> {
        let material = CertificateMaterial::self_signed(hosts)?;
        let record = CertificateRecord {
            id: CertId::new(),
            name: name.to_string(),
            hidden: false,
            kind: CertKind::Imported,
        };
        self.blobs
            .write(&record.id.to_string(), &material.encode())
            .await?;
        self.records.upsert(record.clone()).await?;
        self.cache.insert(record.id, Arc::new(material));
        info!(certificate = %record.id, name, "self-signed certificate created");
        Ok(record)
    }

    // ---- snapshot reaction ----

    /// Rebuild all derived state for a newly promoted snapshot.
    pub async fn rebuild(&self, snapshot: Arc<RunningSnapshot>) {
        debug!(revision = snapshot.revision, "rebuilding certificate store");
        self.snapshot.store(Arc::clone(&snapshot));

        // Admin certificate: decode failures must never keep the admin
        // listener down, so the ephemeral failsafe stays in place.
        match self.get_certificate(snapshot.admin_cert, false).await {
            Ok(material) => self.admin.store(material),
            Err(err) => {
                warn!(
                    certificate = %snapshot.admin_cert,
                    error = %err,
                    "admin certificate unusable, serving ephemeral self-signed"
                );
                match CertificateMaterial::self_signed(&[FAILSAFE_HOST.to_string()]) {
                    Ok(failsafe) => self.admin.store(Arc::new(failsafe)),
                    // keep whatever admin certificate was pinned before
                    Err(err) => error!(error = %err, "failsafe generation failed"),
                }
            }
        }

        match snapshot.fallback_cert {
            Some(id) => match self.get_certificate(id, false).await {
                Ok(material) => self.fallback.store(Some(material)),
                Err(err) => {
                    warn!(certificate = %id, error = %err, "fallback certificate unusable");
                    self.fallback.store(None);
                }
            },
            None => self.fallback.store(None),
        }

        // Warm every certificate the SNI bindings reference, then evict
        // strays (the pinned admin/fallback stay).
        let bindings = snapshot.sni.bindings();
        let mut referenced: HashSet<CertId> = bindings.iter().map(|&(_, id)| id).collect();
        referenced.insert(snapshot.admin_cert);
        if let Some(id) = snapshot.fallback_cert {
            referenced.insert(id);
        }
        for &id in &referenced {
            if let Err(err) = self.get_certificate(id, false).await {
                debug!(certificate = %id, error = %err, "referenced certificate not loadable");
            }
        }
        self.cache.retain(|id, _| referenced.contains(id));

        self.log_binding_issues(&bindings).await;
        self.rebuild_worklist().await;
    }

    /// Warn about bindings whose certificate is inactive, outside its
    /// validity window, undecodable, or does not cover the bound host.
    /// The binding still serves; a wrong certificate beats a refused
    /// handshake.
    async fn log_binding_issues(&self, bindings: &[(String, CertId)]) {
        let now = Utc::now();
        for (host, id) in bindings {
            let record = match self.records.get(*id).await {
                Ok(Some(record)) => record,
                // missing rows are flagged by the snapshot projection
                Ok(None) => continue,
                Err(err) => {
                    debug!(certificate = %id, error = %err, "binding check skipped");
                    continue;
                }
            };
            let material = self.cache.get(id).map(|m| Arc::clone(&m));
            for issue in cert_issues(&record, material.as_deref(), host, now) {
                warn!(host = %host, certificate = %id, "{issue}");
            }
        }
    }

    /// Recompute the renewal worklist from the ACME-managed records.
    async fn rebuild_worklist(&self) {
        let records = match self.records.list().await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "listing certificates for renewal worklist failed");
                return;
            }
        };

        let mut entries = Vec::new();
        for record in records {
            if record.hidden || !matches!(record.kind, CertKind::Acme { .. }) {
                continue;
            }
            // A record without decodable material has never been issued
            // (or lost its blob): due immediately.
            let renew_at = match self.get_certificate(record.id, false).await {
                Ok(material) => renew_at(&material),
                Err(_) => Utc::now(),
            };
            entries.push(RenewalEntry {
                cert_id: record.id,
                renew_at,
            });
        }
        entries.sort_by_key(|e| e.renew_at);
        debug!(entries = entries.len(), "renewal worklist rebuilt");
        *self.worklist.lock() = entries;
    }

    // ---- renewal loop ----

    /// Wake the renewal loop ahead of its hourly cadence.
    pub fn signal_renewal(&self) {
        self.renew_now.notify_one();
    }

    /// Drive rebuilds and renewals until shutdown.
    pub async fn run(self: Arc<Self>, mut snapshots: watch::Receiver<Arc<RunningSnapshot>>) {
        let mut sweep = tokio::time::interval(RENEWAL_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("certificate manager stopping");
                    return;
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let snapshot = Arc::clone(&snapshots.borrow_and_update());
                    self.rebuild(snapshot).await;
                }
                _ = sweep.tick() => {
                    self.renewal_pass().await;
                }
                _ = self.renew_now.notified() => {
                    self.renewal_pass().await;
                }
            }
        }
    }

    /// Renew everything past its renewal point.
    pub async fn renewal_pass(&self) {
        let now = Utc::now();
        let due: Vec<CertId> = self
            .worklist
            .lock()
            .iter()
            .filter(|e| e.renew_at <= now)
            .map(|e| e.cert_id)
            .collect();
        if due.is_empty() {
            return;
        }
        debug!(due = due.len(), "renewal pass starting");

        let mut renewed_any = false;
        for id in due {
            match self.renew_certificate(id).await {
                Ok(RenewalOutcome::Renewed) => renewed_any = true,
                Ok(RenewalOutcome::RecentAttempt) => {
                    debug!(certificate = %id, "skipping renewal, attempted recently");
                }
                Ok(RenewalOutcome::NotAcmeManaged) => {}
                // Logged and left for the next pass; the previously valid
                // certificate keeps serving.
                Err(err) => warn!(certificate = %id, error = %err, "renewal failed"),
            }
        }
        if renewed_any {
            let snapshot = self.snapshot.load_full();
            self.rebuild(snapshot).await;
        }
    }

    /// Renew one certificate through its ACME account.
    pub async fn renew_certificate(&self, id: CertId) -> Result<RenewalOutcome, CertError> {
        let record = self
            .records
            .get(id)
            .await?
            .ok_or(CertError::NotFound(id))?;
        let (account_id, hosts, last_attempt) = match record.kind {
            CertKind::Acme {
                account_id,
                hosts,
                last_attempt,
            } => (account_id, hosts, last_attempt),
            _ => return Ok(RenewalOutcome::NotAcmeManaged),
        };

        let now = Utc::now();
        if last_attempt.is_some_and(|at| now - at < ChronoDuration::hours(ATTEMPT_DAMPENING_HOURS)) {
            return Ok(RenewalOutcome::RecentAttempt);
        }

        // Persisted before the network call: a crash mid-attempt must not
        // retry-storm the provider on restart.
        self.records.set_last_attempt(id, now).await?;

        info!(certificate = %id, hosts = hosts.len(), "renewing certificate");
        let material = self
            .acme
            .order_certificate(account_id, &hosts, &self.shutdown)
            .await?;

        self.blobs.write(&id.to_string(), &material.encode()).await?;
        self.get_certificate(id, true).await?;
        info!(
            certificate = %id,
            not_after = %material.not_after,
            "certificate renewed"
        );
        Ok(RenewalOutcome::Renewed)
    }
}

/// The point in a certificate's life when renewal should begin:
/// halfway for short-lived (≤ 30 day) certificates, two thirds in
/// otherwise.
fn renew_at(material: &CertificateMaterial) -> DateTime<Utc> {
    let lifetime = material.not_after - material.not_before;
    let factor = if lifetime.num_days() <= 30 { 0.5 } else { 2.0 / 3.0 };
    let offset = ChronoDuration::seconds((lifetime.num_seconds() as f64 * factor) as i64);
    material.not_before + offset
}
