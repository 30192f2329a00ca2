//! Capability traits over the kernel packet filter
//!
//! The reconciler never talks to iptables directly. It is handed a value
//! implementing both [`ChainStateReader`] and [`RulesetWriter`]:
//!
//! - [`crate::core::iptables::IptablesFilter`] drives the real `iptables` binary
//! - [`crate::core::memory::MemoryFilter`] keeps chains in memory for tests
//!
//! Implementations hold no state of their own beyond the handle they need to
//! reach the packet filter; every read goes to the live system.

#![allow(async_fn_in_trait)]

use crate::core::chain;
use crate::core::error::Result;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Set of source addresses permitted on a port.
pub type AddressSet = BTreeSet<IpAddr>;

/// Read-only queries against the packet filter.
pub trait ChainStateReader {
    /// Whether a chain with this exact name exists in the table.
    async fn exists(&self, chain: &str) -> Result<bool>;

    /// Names of every chain in the table, built-in ones included.
    async fn list_chains(&self) -> Result<Vec<String>>;

    /// Source addresses of every permit rule in `chain`.
    ///
    /// The terminal deny rule carries no address qualifier and is excluded.
    /// Callers check [`ChainStateReader::exists`] first; querying a missing
    /// chain is a read error, not an empty set.
    async fn current_addresses(&self, chain: &str) -> Result<AddressSet>;

    /// Ports of all live managed chains currently installed.
    async fn list_managed_chains(&self) -> Result<BTreeSet<u16>> {
        Ok(self
            .list_chains()
            .await?
            .iter()
            .filter_map(|name| chain::port_from_name(name))
            .collect())
    }
}

/// Mutation primitives, each close to a single packet filter operation.
pub trait RulesetWriter {
    async fn create_chain(&self, chain: &str) -> Result<()>;

    async fn append_permit(&self, chain: &str, addr: IpAddr) -> Result<()>;

    /// Appends the terminal deny rule unless the chain already has one.
    async fn append_deny_if_absent(&self, chain: &str) -> Result<()>;

    /// Jumps traffic for `port` from the hook into `chain`. No-op if linked.
    async fn link_to_hook(&self, chain: &str, port: u16) -> Result<()>;

    /// Removes the hook jump for `port` into `chain`. No-op if not linked.
    async fn unlink_from_hook(&self, chain: &str, port: u16) -> Result<()>;

    /// Renames a chain; existing hook jumps follow the chain.
    async fn rename(&self, old: &str, new: &str) -> Result<()>;

    /// Flushes and deletes a chain. The chain must already be unlinked.
    async fn clear_and_delete(&self, chain: &str) -> Result<()>;
}

/// Convenience bound for a full packet filter handle.
pub trait PacketFilter: ChainStateReader + RulesetWriter {}

impl<T: ChainStateReader + RulesetWriter> PacketFilter for T {}
