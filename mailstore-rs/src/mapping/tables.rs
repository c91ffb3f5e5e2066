use super::{Lookup, MappingTable};
use crate::config::TableConfig;
use crate::error::{Result, StoreError};
use crate::normalize::{canonical_domain, Profile};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Build the table named by configuration, keys normalized with `profile`
pub fn from_config(config: &TableConfig, profile: Profile) -> Result<Arc<dyn MappingTable>> {
    Ok(match config {
        TableConfig::Identity => Arc::new(IdentityTable),
        TableConfig::Static { entries } => {
            Arc::new(StaticTable::normalized(entries.clone(), profile)?)
        }
        TableConfig::File { path } => Arc::new(FileTable::open(path, profile)?),
        TableConfig::Regex {
            pattern,
            replacement,
        } => Arc::new(RegexTable::new(pattern, replacement)?),
    })
}

/// Every key maps to itself
pub struct IdentityTable;

#[async_trait::async_trait]
impl MappingTable for IdentityTable {
    async fn lookup(&self, key: &str) -> Result<Lookup> {
        Ok(Lookup::Present(key.to_string()))
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Fixed key/value map
///
/// An empty value marks a key as present without redirect. A key of the
/// form `@domain` matches every address of that domain not listed
/// explicitly (catch-all).
pub struct StaticTable {
    entries: HashMap<String, String>,
}

impl StaticTable {
    /// Keys are used exactly as given
    pub fn new(entries: HashMap<String, String>) -> Self {
        StaticTable { entries }
    }

    /// Keys brought into the form the pipeline looks them up in: addresses
    /// through `profile`, `@domain` keys through domain canonicalization.
    pub fn normalized(entries: HashMap<String, String>, profile: Profile) -> Result<Self> {
        if profile == Profile::Identity {
            return Ok(Self::new(entries));
        }

        let mut normalized = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            let key = match key.strip_prefix('@') {
                Some(domain) => canonical_domain(domain).map(|d| format!("@{}", d)),
                None => profile.normalize(&key),
            }
            .map_err(|e| StoreError::Config(format!("table key {:?}: {}", key, e)))?;

            if normalized.contains_key(&key) {
                return Err(StoreError::Config(format!(
                    "table key {:?} listed twice after normalization",
                    key
                )));
            }
            normalized.insert(key, value);
        }

        Ok(StaticTable {
            entries: normalized,
        })
    }

    fn get(&self, key: &str) -> Lookup {
        let value = self.entries.get(key).or_else(|| {
            key.rsplit_once('@')
                .and_then(|(_, domain)| self.entries.get(&format!("@{}", domain)))
        });

        match value {
            None => Lookup::Absent,
            Some(v) if v.is_empty() => Lookup::PresentEmpty,
            Some(v) => Lookup::Present(v.clone()),
        }
    }
}

#[async_trait::async_trait]
impl MappingTable for StaticTable {
    async fn lookup(&self, key: &str) -> Result<Lookup> {
        Ok(self.get(key))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Static table loaded from a text file
///
/// One entry per line, `key: value` or a bare `key`. Blank lines and lines
/// starting with `#` are skipped.
pub struct FileTable {
    inner: StaticTable,
}

impl FileTable {
    pub fn open<P: AsRef<Path>>(path: P, profile: Profile) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("cannot read table file {}: {}", path.display(), e))
        })?;
        Self::parse(&content, profile)
    }

    pub fn parse(content: &str, profile: Profile) -> Result<Self> {
        let mut entries = HashMap::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            if key.is_empty() {
                return Err(StoreError::Config(format!(
                    "table file line {}: empty key",
                    lineno + 1
                )));
            }

            entries.insert(key.to_string(), value.to_string());
        }

        Ok(FileTable {
            inner: StaticTable::normalized(entries, profile)?,
        })
    }
}

#[async_trait::async_trait]
impl MappingTable for FileTable {
    async fn lookup(&self, key: &str) -> Result<Lookup> {
        Ok(self.inner.get(key))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Rewrites keys matching a pattern, everything else is absent
pub struct RegexTable {
    pattern: Regex,
    replacement: String,
}

impl RegexTable {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| StoreError::Config(format!("invalid table pattern: {}", e)))?;

        Ok(RegexTable {
            pattern,
            replacement: replacement.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl MappingTable for RegexTable {
    async fn lookup(&self, key: &str) -> Result<Lookup> {
        if !self.pattern.is_match(key) {
            return Ok(Lookup::Absent);
        }

        let replaced = self.pattern.replace(key, self.replacement.as_str());
        if replaced.is_empty() {
            Ok(Lookup::PresentEmpty)
        } else {
            Ok(Lookup::Present(replaced.into_owned()))
        }
    }

    fn name(&self) -> &'static str {
        "regex"
    }
}
