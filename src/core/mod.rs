//! Ruleset reconciliation core
//!
//! This module contains the logic that keeps iptables in line with the
//! desired access rules. It provides:
//!
//! - [`chain`]: Naming convention for managed chains
//! - [`filter`]: Reader/writer capability traits over the packet filter
//! - [`reconciler`]: Diff detection, atomic rotation and obsolete-chain purge
//! - [`iptables`]: Production filter driving the `iptables` binary
//! - [`memory`]: In-memory filter for tests
//! - [`rules`]: Access rules as supplied by configuration
//! - [`error`]: Error types for reconciliation

pub mod chain;
pub mod error;
pub mod filter;
pub mod iptables;
pub mod memory;
pub mod reconciler;
pub mod rules;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
