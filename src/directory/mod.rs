//! Service directory
//!
//! Resolves tag patterns to sets of service addresses using a Consul catalog
//! snapshot. The snapshot is loaded once per run; every rule in that run
//! sees the same directory contents.
//!
//! # Catalog format
//!
//! A JSON array of catalog entries. Only three fields are read:
//!
//! ```json
//! [
//!   {"Node": "node-01.eu-dc1.app.prod", "ServiceAddress": "10.0.0.5",
//!    "ServiceTags": ["app.web", "metrics.node"]}
//! ]
//! ```

pub mod repository;

use crate::core::error::{Error, Result};
use crate::core::filter::AddressSet;
use crate::core::rules::is_wildcard;
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, info};

pub use repository::{CatalogSource, FileRepository, HttpRepository, Repository};

/// A single catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "ServiceAddress")]
    pub service_address: String,
    #[serde(rename = "ServiceTags", default, deserialize_with = "null_as_empty")]
    pub service_tags: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl CatalogEntry {
    fn address(&self) -> Result<IpAddr> {
        self.service_address.trim().parse().map_err(|_| {
            Error::Lookup(format!(
                "node {} has invalid service address '{}'",
                self.node, self.service_address
            ))
        })
    }
}

/// Parses a raw catalog payload.
pub fn parse_catalog(raw: &[u8]) -> Result<Vec<CatalogEntry>> {
    serde_json::from_slice(raw).map_err(|e| Error::Lookup(format!("invalid catalog payload: {e}")))
}

#[derive(Debug, Clone, Default)]
pub struct ServiceDirectory {
    entries: Vec<CatalogEntry>,
}

impl ServiceDirectory {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Fetches and parses the catalog from `repository`.
    pub async fn load(repository: &impl Repository) -> Result<Self> {
        info!("Loading directory from {}", repository.describe());
        let raw = repository.fetch().await?;
        let entries = parse_catalog(&raw)?;
        info!("Directory holds {} entries", entries.len());
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Addresses of all entries whose tags match `pattern`.
    ///
    /// `ALL` (any case) matches every entry. Anything else is lower-cased and
    /// used as an unanchored regular expression against each tag.
    pub fn resolve(&self, pattern: &str) -> Result<AddressSet> {
        let mut addresses = AddressSet::new();

        if is_wildcard(pattern) {
            for entry in &self.entries {
                addresses.insert(entry.address()?);
            }
            return Ok(addresses);
        }

        let regex = compile_pattern(pattern)?;
        for entry in &self.entries {
            if entry.service_tags.iter().any(|tag| regex.is_match(tag)) {
                addresses.insert(entry.address()?);
            }
        }

        debug!("Pattern '{pattern}' resolved to {} addresses", addresses.len());
        Ok(addresses)
    }

    /// This host's service address, by exact node name.
    pub fn local_address(&self, hostname: &str) -> Result<IpAddr> {
        info!("Getting parameters for hostname: {hostname}");
        self.entries
            .iter()
            .find(|entry| entry.node == hostname)
            .ok_or_else(|| Error::NotFound(format!("host {hostname} not in directory")))?
            .address()
    }

    /// Whether a rule with this destination pattern applies to `local`.
    pub fn is_eligible(&self, destination: &str, local: IpAddr) -> Result<bool> {
        Ok(self.resolve(destination)?.contains(&local))
    }
}

/// Compiles a tag pattern the way [`ServiceDirectory::resolve`] uses it.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&pattern.to_lowercase())
        .map_err(|e| Error::Lookup(format!("invalid pattern '{pattern}': {e}")))
}
