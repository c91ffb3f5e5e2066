use crate::config::RetentionSettings;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Retention sweep configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Time between two sweep cycles
    pub interval: Duration,
    /// Global maximum message age, overridden per mailbox
    pub message_retention: Option<Duration>,
    /// Age after which a never-used account is deleted
    pub unused_account_retention: Option<Duration>,
    /// Minimum age of an unreferenced blob before it is reclaimed
    pub orphan_grace: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig::from(&RetentionSettings::default())
    }
}

impl From<&RetentionSettings> for RetentionConfig {
    fn from(settings: &RetentionSettings) -> Self {
        RetentionConfig {
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            message_retention: settings.message_retention_secs.map(Duration::from_secs),
            unused_account_retention: settings
                .unused_account_retention_secs
                .map(Duration::from_secs),
            orphan_grace: Duration::from_secs(settings.orphan_grace_secs),
        }
    }
}

/// Outcome of one sweep cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub messages_expired: usize,
    pub accounts_deleted: usize,
    /// Legacy credential records protected by the login-state migration
    pub accounts_protected: u64,
    pub blobs_reclaimed: usize,
    pub orphans_reclaimed: usize,
    /// Candidates or mailboxes skipped after an error, retried next cycle
    pub failures: usize,
}

impl SweepReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        SweepReport {
            started_at,
            messages_expired: 0,
            accounts_deleted: 0,
            accounts_protected: 0,
            blobs_reclaimed: 0,
            orphans_reclaimed: 0,
            failures: 0,
        }
    }

    /// Whether the cycle changed anything
    pub fn is_noop(&self) -> bool {
        self.messages_expired == 0
            && self.accounts_deleted == 0
            && self.accounts_protected == 0
            && self.blobs_reclaimed == 0
            && self.orphans_reclaimed == 0
    }
}

/// `now - age`, saturating at the earliest representable instant
pub fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
