//! Delivery and authentication address mapping
//!
//! Every address goes through the normalizer first, then through a
//! pluggable [`MappingTable`] that may rename, redirect or reject it.

pub mod tables;

pub use tables::{FileTable, IdentityTable, RegexTable, StaticTable};

use crate::config::TableConfig;
use crate::error::{Result, StoreError};
use crate::normalize::Profile;
use std::sync::Arc;
use tracing::debug;

/// Three-way table lookup result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Not a recognized key
    Absent,
    /// Recognized, no redirect value (membership test)
    PresentEmpty,
    /// Recognized, redirect to value
    Present(String),
}

/// Lookup table consumed by the pipeline
#[async_trait::async_trait]
pub trait MappingTable: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Lookup>;

    fn name(&self) -> &'static str;
}

/// Why an address is being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Delivery,
    Auth,
}

/// Normalizer + table for one purpose
#[derive(Clone)]
pub struct Pipeline {
    profile: Profile,
    table: Arc<dyn MappingTable>,
}

impl Pipeline {
    pub fn new(profile: Profile, table: Arc<dyn MappingTable>) -> Self {
        Pipeline { profile, table }
    }

    /// Pipeline with the identity table
    pub fn identity(profile: Profile) -> Self {
        Self::new(profile, Arc::new(IdentityTable))
    }

    pub fn from_config(profile: Profile, table: &TableConfig) -> Result<Self> {
        Ok(Self::new(profile, tables::from_config(table, profile)?))
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Resolve a raw address to a mailbox-resolving key
    pub async fn resolve(&self, raw: &str) -> Result<String> {
        let key = self.profile.normalize(raw)?;

        match self.table.lookup(&key).await? {
            Lookup::Absent => Err(StoreError::NotFound(format!("address {}", key))),
            Lookup::PresentEmpty => Ok(key),
            Lookup::Present(value) => {
                let target = self.profile.normalize(&value)?;
                debug!("{} table mapped {} to {}", self.table.name(), key, target);
                Ok(target)
            }
        }
    }

    /// Membership check: does the table recognize this address at all
    pub async fn exists(&self, raw: &str) -> Result<bool> {
        let key = self.profile.normalize(raw)?;
        Ok(self.table.lookup(&key).await? != Lookup::Absent)
    }
}

/// Delivery and authentication pipelines side by side
#[derive(Clone)]
pub struct Resolver {
    delivery: Pipeline,
    auth: Pipeline,
}

impl Resolver {
    pub fn new(delivery: Pipeline, auth: Pipeline) -> Self {
        Resolver { delivery, auth }
    }

    pub fn pipeline(&self, purpose: Purpose) -> &Pipeline {
        match purpose {
            Purpose::Delivery => &self.delivery,
            Purpose::Auth => &self.auth,
        }
    }

    pub async fn resolve(&self, raw: &str, purpose: Purpose) -> Result<String> {
        self.pipeline(purpose).resolve(raw).await
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new(
            Pipeline::identity(Profile::CasefoldEmail),
            Pipeline::identity(Profile::CasefoldEmail),
        )
    }
}
