//! Ruleset reconciliation engine
//!
//! Owns every lifecycle decision for managed chains. The packet filter is the
//! only source of truth: nothing is cached between calls, so a chain edited
//! out-of-band is detected and rebuilt on the next run.
//!
//! # Rotation
//!
//! A port's policy is replaced by building a complete staging chain, linking
//! it into the hook, and only then retiring the old live chain:
//!
//! ```text
//! create staging -> permits -> deny -> link staging
//!     -> [unlink old live -> delete old live] -> rename staging to live
//! ```
//!
//! Once a port has been linked it never passes through a state with no
//! deny-terminated chain in front of it. There is no rollback. A failed step
//! surfaces as an error and the next run, driven by [`RulesetReconciler::has_changed`],
//! repairs whatever was left behind.

use crate::core::chain;
use crate::core::error::Result;
use crate::core::filter::{AddressSet, PacketFilter};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Outcome of [`RulesetReconciler::purge_obsolete`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Ports whose live chain was unlinked and deleted.
    pub removed: Vec<u16>,
    /// Ports whose cleanup failed, with the error text.
    pub failed: Vec<(u16, String)>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What [`RulesetReconciler::reconcile`] did to the live chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// No live chain existed; the staging chain was promoted directly.
    Created,
    /// The previous live chain was unlinked and deleted.
    Replaced,
}

pub struct RulesetReconciler<F> {
    filter: F,
}

impl<F: PacketFilter> RulesetReconciler<F> {
    pub fn new(filter: F) -> Self {
        Self { filter }
    }

    /// The packet filter handle this reconciler drives.
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Whether the live chain for `port` permits anything other than exactly `desired`.
    ///
    /// A missing chain always counts as changed, and so does a staging chain
    /// left behind by an interrupted rotation, since only `reconcile` clears it.
    pub async fn has_changed(&self, port: u16, desired: &AddressSet) -> Result<bool> {
        let live = chain::live_name(port);
        let staging = chain::staging_name(port);

        if self.filter.exists(&staging).await? {
            warn!("Found leftover staging chain {staging} for port {port}");
            return Ok(true);
        }

        if !self.filter.exists(&live).await? {
            info!("Ruleset for port {port} doesn't exist");
            return Ok(true);
        }

        let current = self.filter.current_addresses(&live).await?;

        if current.len() != desired.len() || !desired.iter().all(|ip| current.contains(ip)) {
            info!(
                "Ruleset for port {port} has been changed ({} installed, {} desired)",
                current.len(),
                desired.len()
            );
            return Ok(true);
        }

        info!("Ruleset for port {port} hasn't been changed");
        Ok(false)
    }

    /// Replaces the policy for `port` with `desired` via atomic rotation.
    pub async fn reconcile(&self, port: u16, desired: &AddressSet) -> Result<Rotation> {
        let live = chain::live_name(port);
        let staging = chain::staging_name(port);

        info!("Creating rules for port {port} ({} addresses)", desired.len());

        // A staging chain only survives an interrupted rotation. If the old
        // live chain is already gone it may be the only thing linked, so it
        // takes the live name and is retired like any other old live chain.
        if self.filter.exists(&staging).await? {
            if self.filter.exists(&live).await? {
                warn!("Removing leftover staging chain {staging} from an interrupted run");
                self.remove_chain(&staging, port).await?;
            } else {
                warn!("Adopting leftover staging chain {staging} as {live}");
                self.filter.rename(&staging, &live).await?;
            }
        }

        let live_existed = self.filter.exists(&live).await?;

        self.build_linked_chain(&staging, port, desired).await?;

        if live_existed {
            self.remove_chain(&live, port).await?;
        }

        debug!("Promoting {staging} to {live}");
        self.filter.rename(&staging, &live).await?;

        info!("Port {port} now enforced by {live}");
        Ok(if live_existed {
            Rotation::Replaced
        } else {
            Rotation::Created
        })
    }

    /// Removes every live managed chain whose port is not in `retained`.
    ///
    /// Cleanup is best-effort: a failure on one port is logged and recorded,
    /// and the remaining ports are still processed. Only a failure to
    /// enumerate chains is returned as an error.
    pub async fn purge_obsolete(&self, retained: &BTreeSet<u16>) -> Result<PurgeReport> {
        info!("Purging obsolete chains");

        let chains = self.filter.list_chains().await?;
        let mut report = PurgeReport::default();

        let obsolete: BTreeSet<chain::ManagedName> = chains
            .iter()
            .filter_map(|name| chain::parse(name))
            .filter(|managed| !retained.contains(&managed.port))
            .collect();

        for managed in obsolete {
            let name = if managed.staging {
                chain::staging_name(managed.port)
            } else {
                chain::live_name(managed.port)
            };

            match self.remove_chain(&name, managed.port).await {
                Ok(()) => {
                    if !managed.staging {
                        report.removed.push(managed.port);
                    }
                }
                Err(e) => {
                    warn!("Failed to purge chain {name}: {e}");
                    report.failed.push((managed.port, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Ports of all live managed chains currently installed.
    pub async fn list_managed_chains(&self) -> Result<BTreeSet<u16>> {
        self.filter.list_managed_chains().await
    }

    async fn build_linked_chain(&self, name: &str, port: u16, desired: &AddressSet) -> Result<()> {
        debug!("Building chain {name}");
        self.filter.create_chain(name).await?;

        for addr in desired {
            self.filter.append_permit(name, *addr).await?;
        }

        // Drop in case the hook's default policy is accept
        self.filter.append_deny_if_absent(name).await?;
        self.filter.link_to_hook(name, port).await
    }

    async fn remove_chain(&self, name: &str, port: u16) -> Result<()> {
        info!("Unlinking chain {name} for port {port}");
        self.filter.unlink_from_hook(name, port).await?;

        info!("Deleting chain {name}");
        self.filter.clear_and_delete(name).await
    }
}
