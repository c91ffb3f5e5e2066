//! Address and username normalization
//!
//! Maps raw address/username strings to the canonical keys used for
//! account lookups and comparisons. Every function here is pure.
//!
//! # Profiles
//! - `casefold-email`: case-fold the local part, canonicalize the domain
//! - `casefold`: case-fold the whole string
//! - `preserve-email`: keep the local part's case, canonicalize the domain
//! - `preserve`: keep case
//! - `identity`: no transformation and no checks
//!
//! Every profile but `identity` maps fullwidth and halfwidth forms to their
//! ordinary counterparts and composes the result to NFC, so visually equal
//! inputs end up as the same key.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use unicode_normalization::char::decompose_compatible;
use unicode_normalization::UnicodeNormalization;

/// Normalization profile selected by configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    #[serde(rename = "casefold-email")]
    CasefoldEmail,
    #[serde(rename = "casefold")]
    Casefold,
    #[serde(rename = "preserve-email")]
    PreserveEmail,
    #[serde(rename = "preserve")]
    Preserve,
    #[serde(rename = "identity")]
    Identity,
}

impl Default for Profile {
    fn default() -> Self {
        Profile::CasefoldEmail
    }
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::CasefoldEmail => "casefold-email",
            Profile::Casefold => "casefold",
            Profile::PreserveEmail => "preserve-email",
            Profile::Preserve => "preserve",
            Profile::Identity => "identity",
        }
    }

    /// Normalize `raw` according to this profile
    pub fn normalize(&self, raw: &str) -> Result<String> {
        normalize(raw, *self)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "casefold-email" => Ok(Profile::CasefoldEmail),
            "casefold" => Ok(Profile::Casefold),
            "preserve-email" => Ok(Profile::PreserveEmail),
            "preserve" => Ok(Profile::Preserve),
            "identity" => Ok(Profile::Identity),
            other => Err(StoreError::Config(format!(
                "unknown normalization profile: {}",
                other
            ))),
        }
    }
}

/// Normalize a raw address or username
pub fn normalize(raw: &str, profile: Profile) -> Result<String> {
    if profile == Profile::Identity {
        return Ok(raw.to_string());
    }

    check_safe(raw)?;
    let mapped = map_width(raw);

    match profile {
        Profile::CasefoldEmail => normalize_email(&mapped, true),
        Profile::PreserveEmail => normalize_email(&mapped, false),
        Profile::Casefold => Ok(compose(&mapped, true)),
        Profile::Preserve | Profile::Identity => Ok(compose(&mapped, false)),
    }
}

/// Fullwidth and halfwidth forms (U+FF01..U+FFEE) to their compatibility
/// decomposition, e.g. `ａ` to `a`
fn map_width(raw: &str) -> String {
    let mut mapped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if ('\u{FF01}'..='\u{FFEE}').contains(&c) {
            decompose_compatible(c, |d| mapped.push(d));
        } else {
            mapped.push(c);
        }
    }
    mapped
}

fn compose(s: &str, fold_case: bool) -> String {
    if fold_case {
        s.to_lowercase().nfc().collect()
    } else {
        s.nfc().collect()
    }
}

fn normalize_email(raw: &str, fold_local: bool) -> Result<String> {
    // Local parts may legally contain a quoted '@', the domain never does.
    let Some((local, domain)) = raw.rsplit_once('@') else {
        // Bare usernames (postmaster, local accounts) have no domain part
        return Ok(compose(raw, fold_local));
    };

    if local.is_empty() {
        return Err(StoreError::InvalidUsername(format!(
            "empty local part in {:?}",
            raw
        )));
    }

    let domain = canonical_domain(domain)?;
    let local = compose(local, fold_local);

    Ok(format!("{}@{}", local, domain))
}

/// Map a domain to its canonical Unicode form (punycode decoded, lowercased)
pub fn canonical_domain(domain: &str) -> Result<String> {
    if domain.is_empty() {
        return Err(StoreError::InvalidUsername("empty domain".to_string()));
    }

    let (unicode, result) = idna::domain_to_unicode(domain);
    result.map_err(|e| StoreError::InvalidUsername(format!("domain {:?}: {:?}", domain, e)))?;

    if unicode.is_empty() || unicode.starts_with('.') || unicode.contains("..") {
        return Err(StoreError::InvalidUsername(format!(
            "malformed domain {:?}",
            domain
        )));
    }

    Ok(unicode.trim_end_matches('.').to_string())
}

/// Bidirectional formatting characters that can make two different
/// usernames render identically.
fn is_bidi_control(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

fn check_safe(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(StoreError::InvalidUsername("empty username".to_string()));
    }

    if let Some(c) = raw
        .chars()
        .find(|c| c.is_control() || c.is_whitespace() || is_bidi_control(*c) || is_invisible(*c))
    {
        return Err(StoreError::InvalidUsername(format!(
            "disallowed character U+{:04X} in {:?}",
            c as u32,
            raw
        )));
    }

    Ok(())
}
