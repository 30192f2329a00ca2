//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::chain;
use crate::core::filter::AddressSet;
use crate::core::memory::{MemoryFilter, MemoryRule};
use crate::directory::{CatalogEntry, ServiceDirectory};
use std::net::IpAddr;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("MESHWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("MESHWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Builds an address set from string literals.
pub fn addrs(list: &[&str]) -> AddressSet {
    list.iter().map(|s| ip(s)).collect()
}

/// Permit rules for `list` followed by the terminal deny.
pub fn chain_rules(list: &[&str]) -> Vec<MemoryRule> {
    let mut rules: Vec<MemoryRule> = list.iter().map(|s| MemoryRule::Permit(ip(s))).collect();
    rules.push(MemoryRule::Deny);
    rules
}

/// A memory filter with a linked live chain per `(port, addresses)`.
pub fn filter_with_chains(chains: &[(u16, &[&str])]) -> MemoryFilter {
    let filter = MemoryFilter::new();
    for (port, list) in chains {
        filter.install(&chain::live_name(*port), *port, chain_rules(list));
    }
    filter
}

pub fn entry(node: &str, addr: &str, tags: &[&str]) -> CatalogEntry {
    CatalogEntry {
        node: node.to_string(),
        service_address: addr.to_string(),
        service_tags: tags.iter().map(ToString::to_string).collect(),
    }
}

/// Small fleet: two metrics nodes, two app nodes, a logs node and a backup node.
pub fn sample_directory() -> ServiceDirectory {
    ServiceDirectory::from_entries(vec![
        entry("metrics-1", "10.0.0.5", &["metrics.prometheus"]),
        entry("metrics-2", "10.0.0.6", &["metrics.prometheus"]),
        entry("app-1", "10.0.0.10", &["app.web"]),
        entry("app-2", "10.0.0.11", &["app.api"]),
        entry("logs-1", "10.0.0.20", &["logs.loki"]),
        entry("backup-1", "10.0.0.30", &["backups.restic"]),
    ])
}
