use crate::blob::BlobKey;
use crate::config::DeliveryConfig;
use crate::index::{MailboxId, MessageMeta, ModSeq, Uid};

/// Facade operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full mailbox access
    Full,
    /// Membership checks only, every mailbox operation fails with `LookupOnly`
    LookupOnly,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Largest accepted message body in bytes
    pub max_message_size: usize,
    /// Mailbox receiving quarantined deliveries, created on first use
    pub quarantine_mailbox: String,
    /// Never store or report `\Recent`
    pub suppress_recent: bool,
    pub mode: Mode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for EngineOptions {
    fn from(config: &DeliveryConfig) -> Self {
        EngineOptions {
            max_message_size: config.max_message_size,
            quarantine_mailbox: config.quarantine_mailbox.clone(),
            suppress_recent: config.suppress_recent,
            mode: if config.lookup_only {
                Mode::LookupOnly
            } else {
                Mode::Full
            },
        }
    }
}

/// Where a delivered message ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Account the recipient resolved to
    pub username: String,
    pub mailbox: MailboxId,
    pub uid: Uid,
    pub modseq: ModSeq,
    pub blob_key: BlobKey,
}

/// Message metadata together with its body
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub meta: MessageMeta,
    pub body: Vec<u8>,
}

/// Result of an administrative purge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub mailboxes: usize,
    pub messages: usize,
    pub blobs_reclaimed: usize,
}
