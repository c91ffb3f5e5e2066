use super::types::{cutoff, RetentionConfig, SweepReport};
use crate::auth::{AuthStore, LoginState};
use crate::blob::{self, BlobStore};
use crate::error::{Result, StoreError};
use crate::index::MailIndex;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background retention sweeper, one per engine instance
pub struct RetentionEngine {
    index: Arc<dyn MailIndex>,
    blobs: Arc<dyn BlobStore>,
    auth: Option<Arc<dyn AuthStore>>,
    config: RetentionConfig,
    running: AtomicBool,
    migrated: AtomicBool,
}

/// Clears the single-flight flag when a sweep ends, even on cancellation
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionEngine {
    pub fn new(
        index: Arc<dyn MailIndex>,
        blobs: Arc<dyn BlobStore>,
        auth: Option<Arc<dyn AuthStore>>,
        config: RetentionConfig,
    ) -> Self {
        RetentionEngine {
            index,
            blobs,
            auth,
            config,
            running: AtomicBool::new(false),
            migrated: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Whether a sweep is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep cycle.
    ///
    /// Returns `None` without doing anything if another cycle is still
    /// running on this engine.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Retention sweep already running, skipping");
            return None;
        }
        let _guard = SweepGuard(&self.running);

        let mut report = SweepReport::new(now);

        self.expire_messages(now, &mut report).await;

        if let Some(max_age) = self.config.unused_account_retention {
            self.delete_unused_accounts(now, max_age, &mut report).await;
        }

        self.reconcile_orphans(now, &mut report).await;

        if report.is_noop() && report.failures == 0 {
            debug!("Retention sweep finished, nothing to do");
        } else {
            info!(
                "Retention sweep: {} message(s) expired, {} account(s) deleted, \
                 {} blob(s) reclaimed, {} orphan(s) reclaimed, {} failure(s)",
                report.messages_expired,
                report.accounts_deleted,
                report.blobs_reclaimed,
                report.orphans_reclaimed,
                report.failures
            );
        }

        Some(report)
    }

    async fn expire_messages(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let mailboxes = match self.index.list_all_mailboxes().await {
            Ok(mailboxes) => mailboxes,
            Err(e) => {
                warn!("Retention: cannot list mailboxes: {}", e);
                report.failures += 1;
                return;
            }
        };

        for mailbox in mailboxes {
            let Some(max_age) = mailbox.max_age.or(self.config.message_retention) else {
                continue;
            };

            match self
                .index
                .expire_messages(mailbox.id, cutoff(now, max_age))
                .await
            {
                Ok(expunged) if !expunged.is_empty() => {
                    debug!(
                        "Expired {} message(s) from mailbox {} ({})",
                        expunged.uids.len(),
                        mailbox.name,
                        mailbox.id
                    );
                    report.messages_expired += expunged.uids.len();
                    report.blobs_reclaimed +=
                        blob::reclaim(self.blobs.as_ref(), &expunged.unreferenced).await;
                }
                Ok(_) => {}
                // Deleted concurrently
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!("Retention: cannot expire mailbox {}: {}", mailbox.id, e);
                    report.failures += 1;
                }
            }
        }
    }

    /// Protect legacy accounts before any unused-account decision is made.
    /// Runs until it succeeds once.
    async fn ensure_migrated(&self, auth: &dyn AuthStore, report: &mut SweepReport) -> Result<()> {
        if self.migrated.load(Ordering::Acquire) {
            return Ok(());
        }

        let changed = auth.mark_unset_as_logged_in().await?;
        report.accounts_protected = changed;
        self.migrated.store(true, Ordering::Release);
        Ok(())
    }

    async fn delete_unused_accounts(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
        report: &mut SweepReport,
    ) {
        let Some(auth) = self.auth.as_deref() else {
            warn!("Retention: unused-account sweep configured without an auth store");
            return;
        };

        if let Err(e) = self.ensure_migrated(auth, report).await {
            warn!(
                "Retention: login-state migration failed, skipping unused-account sweep: {}",
                e
            );
            report.failures += 1;
            return;
        }

        let candidates = match auth.list_accounts().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Retention: cannot list credential records: {}", e);
                report.failures += 1;
                return;
            }
        };

        let threshold = cutoff(now, max_age);
        for username in candidates {
            match self.is_unused(auth, &username, threshold).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("Retention: skipping account {}: {}", username, e);
                    report.failures += 1;
                    continue;
                }
            }

            match self.delete_account(auth, &username, report).await {
                Ok(true) => {
                    info!("Deleted unused account {}", username);
                    report.accounts_deleted += 1;
                }
                Ok(false) => {
                    debug!("Account {} has logged in, keeping it", username);
                }
                Err(e) => {
                    warn!("Retention: failed to delete unused account {}: {}", username, e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn is_unused(
        &self,
        auth: &dyn AuthStore,
        username: &str,
        threshold: DateTime<Utc>,
    ) -> Result<bool> {
        if auth.get_created_at(username).await? >= threshold {
            return Ok(false);
        }
        Ok(auth.get_login_state(username).await? == LoginState::Never)
    }

    /// Index first, then the auth store. The index re-checks its own login
    /// record under the account lock, so a login that lands after
    /// [`is_unused`](Self::is_unused) still protects the account.
    /// An account already gone from the index is a deletion that failed half
    /// way and is finished here.
    async fn delete_account(
        &self,
        auth: &dyn AuthStore,
        username: &str,
        report: &mut SweepReport,
    ) -> Result<bool> {
        match self.index.delete_account_if_unused(username).await {
            Ok(Some(unreferenced)) => {
                report.blobs_reclaimed += blob::reclaim(self.blobs.as_ref(), &unreferenced).await;
            }
            Ok(None) => return Ok(false),
            Err(StoreError::NotFound(_)) => {
                debug!("Account {} already absent from the index", username);
            }
            Err(e) => return Err(e),
        }

        match auth.delete(username).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn reconcile_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let threshold = cutoff(now, self.config.orphan_grace);

        match self.blobs.sweep_incomplete(threshold).await {
            Ok(removed) => report.orphans_reclaimed += removed,
            Err(e) => {
                warn!("Retention: cannot sweep incomplete {} blobs: {}", self.blobs.kind(), e);
                report.failures += 1;
            }
        }

        let stored = match self.blobs.list().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Retention: cannot list {} blobs: {}", self.blobs.kind(), e);
                report.failures += 1;
                return;
            }
        };

        let candidates: Vec<_> = stored
            .into_iter()
            .filter(|info| info.stored_at < threshold)
            .collect();
        if candidates.is_empty() {
            return;
        }

        // Read after listing, so a row committed in between still protects its blob
        let referenced = match self.index.referenced_blob_keys().await {
            Ok(referenced) => referenced,
            Err(e) => {
                warn!("Retention: cannot read referenced blob keys: {}", e);
                report.failures += 1;
                return;
            }
        };

        let orphans: Vec<_> = candidates
            .into_iter()
            .filter(|info| !referenced.contains(&info.key))
            .map(|info| info.key)
            .collect();

        for key in &orphans {
            warn!("Reclaiming orphaned blob {}", key);
        }
        report.orphans_reclaimed += blob::reclaim(self.blobs.as_ref(), &orphans).await;
    }

    /// Start the periodic sweep on the current tokio runtime
    pub fn start(self: Arc<Self>) -> RetentionHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let interval = self.config.interval;

        let task = tokio::spawn(async move {
            info!("Starting retention engine (interval {:?})", interval);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once(Utc::now()).await;
                    }
                }
            }

            info!("Retention engine stopped");
        });

        RetentionHandle { token, task }
    }
}

/// Handle to a running retention loop
pub struct RetentionHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RetentionHandle {
    /// Stop the loop after the current cycle and wait for it
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Retention task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
