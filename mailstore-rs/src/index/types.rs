use crate::blob::BlobKey;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Per-mailbox message identifier, strictly increasing, never reused
pub type Uid = u32;

/// Per-mailbox modification sequence
pub type ModSeq = u64;

/// Name of the mailbox every account starts with
pub const INBOX: &str = "INBOX";

/// Hierarchy separator in mailbox names
pub const HIERARCHY_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId(pub i64);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account as recorded in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    /// Normalized username
    pub username: String,
    pub created_at: DateTime<Utc>,
    /// `None` until the first successful login
    pub first_login_at: Option<DateTime<Utc>>,
}

/// Special-use designation of a mailbox (RFC 6154)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialUse {
    Junk,
    Trash,
    Sent,
    Drafts,
    Archive,
}

impl SpecialUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialUse::Junk => "\\Junk",
            SpecialUse::Trash => "\\Trash",
            SpecialUse::Sent => "\\Sent",
            SpecialUse::Drafts => "\\Drafts",
            SpecialUse::Archive => "\\Archive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "\\junk" => Some(SpecialUse::Junk),
            "\\trash" => Some(SpecialUse::Trash),
            "\\sent" => Some(SpecialUse::Sent),
            "\\drafts" => Some(SpecialUse::Drafts),
            "\\archive" => Some(SpecialUse::Archive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub account_id: i64,
    pub name: String,
    pub uid_validity: u32,
    /// UID the next appended message will receive
    pub next_uid: Uid,
    /// Last modseq handed out in this mailbox (0 = none yet)
    pub highest_modseq: ModSeq,
    pub special_use: Option<SpecialUse>,
    /// Per-mailbox override of the message retention period
    pub max_age: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Mailbox {
    pub fn is_inbox(&self) -> bool {
        self.name == INBOX
    }
}

/// Validate a mailbox name and return its canonical spelling.
///
/// `INBOX` is case-insensitive, every other name is kept as given.
pub fn canonical_mailbox_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("empty mailbox name".to_string()));
    }
    if name.eq_ignore_ascii_case(INBOX) {
        return Ok(INBOX.to_string());
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidName(format!(
            "control character in mailbox name {:?}",
            name
        )));
    }
    if name.starts_with(HIERARCHY_SEPARATOR)
        || name.ends_with(HIERARCHY_SEPARATOR)
        || name.split(HIERARCHY_SEPARATOR).any(|part| part.is_empty())
    {
        return Err(StoreError::InvalidName(format!(
            "malformed mailbox hierarchy {:?}",
            name
        )));
    }

    // Children of INBOX keep the canonical parent spelling
    match name.split_once(HIERARCHY_SEPARATOR) {
        Some((parent, rest)) if parent.eq_ignore_ascii_case(INBOX) => {
            Ok(format!("{}{}{}", INBOX, HIERARCHY_SEPARATOR, rest))
        }
        _ => Ok(name.to_string()),
    }
}

/// Message flags
pub mod flags {
    pub const SEEN: &str = "\\Seen";
    pub const ANSWERED: &str = "\\Answered";
    pub const FLAGGED: &str = "\\Flagged";
    pub const DELETED: &str = "\\Deleted";
    pub const DRAFT: &str = "\\Draft";
    pub const RECENT: &str = "\\Recent";

    pub(super) const SYSTEM: [&str; 6] = [SEEN, ANSWERED, FLAGGED, DELETED, DRAFT, RECENT];
}

/// Set of message flags.
///
/// System flags (`\Seen`, ...) are matched case-insensitively and stored in
/// their canonical spelling; keywords are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn canonical(flag: &str) -> String {
        flags::SYSTEM
            .iter()
            .find(|system| system.eq_ignore_ascii_case(flag))
            .map(|system| system.to_string())
            .unwrap_or_else(|| flag.to_string())
    }

    pub fn insert(&mut self, flag: &str) {
        let flag = flag.trim();
        if !flag.is_empty() {
            self.0.insert(Self::canonical(flag));
        }
    }

    pub fn remove(&mut self, flag: &str) {
        self.0.remove(&Self::canonical(flag.trim()));
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(&Self::canonical(flag))
    }

    pub fn is_seen(&self) -> bool {
        self.contains(flags::SEEN)
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(flags::DELETED)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Parse the space-separated storage form
    pub fn parse(stored: &str) -> Self {
        stored.split_whitespace().collect()
    }

    /// Space-separated storage form
    pub fn to_stored(&self) -> String {
        self.0.iter().cloned().collect::<Vec<_>>().join(" ")
    }
}

impl<'a> FromIterator<&'a str> for FlagSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut set = FlagSet::new();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

/// Flag change requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagDelta {
    Add(FlagSet),
    Remove(FlagSet),
    Replace(FlagSet),
}

impl FlagDelta {
    pub fn apply(&self, current: &FlagSet) -> FlagSet {
        match self {
            FlagDelta::Add(add) => {
                let mut next = current.clone();
                for flag in add.iter() {
                    next.insert(flag);
                }
                next
            }
            FlagDelta::Remove(remove) => {
                let mut next = current.clone();
                for flag in remove.iter() {
                    next.remove(flag);
                }
                next
            }
            FlagDelta::Replace(replace) => replace.clone(),
        }
    }

    pub fn without(&self, flag: &str) -> FlagDelta {
        let strip = |set: &FlagSet| {
            let mut set = set.clone();
            set.remove(flag);
            set
        };
        match self {
            FlagDelta::Add(s) => FlagDelta::Add(strip(s)),
            FlagDelta::Remove(s) => FlagDelta::Remove(strip(s)),
            FlagDelta::Replace(s) => FlagDelta::Replace(strip(s)),
        }
    }
}

/// Message metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub mailbox_id: MailboxId,
    pub uid: Uid,
    pub modseq: ModSeq,
    pub flags: FlagSet,
    pub size: u64,
    pub blob_key: BlobKey,
    pub received_at: DateTime<Utc>,
}

/// Message to append, body already written to the blob store
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub flags: FlagSet,
    pub size: u64,
    pub blob_key: BlobKey,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appended {
    pub uid: Uid,
    pub modseq: ModSeq,
}

/// Outcome of any operation that removes message rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expunged {
    pub uids: Vec<Uid>,
    /// Modseq consumed by the removal, `None` if nothing was removed
    pub modseq: Option<ModSeq>,
    /// Blob keys no longer referenced by any message row
    pub unreferenced: Vec<BlobKey>,
}

impl Expunged {
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}

/// Which messages an administrative purge removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeFilter {
    /// Every message flagged `\Seen`
    Seen,
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub accounts: u64,
    pub mailboxes: u64,
    pub messages: u64,
    /// Sum of message sizes in bytes
    pub total_size: u64,
}
