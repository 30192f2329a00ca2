//! In-memory packet filter
//!
//! Models a single iptables table closely enough to exercise the reconciler:
//! chains hold ordered rules, the hook holds ordered `(port, chain)` jumps,
//! renames carry hook references along, and deleting a referenced or
//! non-empty chain fails the way iptables does.
//!
//! Every mutation appends a [`HookSnapshot`] to an internal history so tests
//! can sample what the hook looked like between sub-steps of a rotation.
//! Failures can be injected per operation and chain.

use crate::core::error::{Error, Result};
use crate::core::filter::{AddressSet, ChainStateReader, RulesetWriter};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

/// A rule inside a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRule {
    Permit(IpAddr),
    Deny,
}

/// Operations that can be made to fail with [`MemoryFilter::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Exists,
    ListChains,
    CurrentAddresses,
    CreateChain,
    AppendPermit,
    AppendDeny,
    Link,
    Unlink,
    Rename,
    ClearAndDelete,
}

/// Hook state after one mutation: every linked chain with its rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSnapshot {
    pub op: Op,
    pub links: Vec<(u16, String, Vec<MemoryRule>)>,
}

impl HookSnapshot {
    /// Linked chains for `port` whose rules end in exactly one deny.
    pub fn deny_terminated_links(&self, port: u16) -> usize {
        self.links
            .iter()
            .filter(|(p, _, rules)| {
                *p == port
                    && rules.last() == Some(&MemoryRule::Deny)
                    && rules.iter().filter(|r| **r == MemoryRule::Deny).count() == 1
            })
            .count()
    }

    pub fn links_for(&self, port: u16) -> usize {
        self.links.iter().filter(|(p, _, _)| *p == port).count()
    }
}

#[derive(Debug, Default)]
struct State {
    chains: BTreeMap<String, Vec<MemoryRule>>,
    hook: Vec<(u16, String)>,
    failures: HashSet<(Op, String)>,
    history: Vec<HookSnapshot>,
}

impl State {
    fn check(&self, op: Op, chain: &str) -> Result<()> {
        if self.failures.contains(&(op, chain.to_string())) {
            return Err(injected(op, chain));
        }
        Ok(())
    }

    fn chain_mut(&mut self, op: Op, chain: &str) -> Result<&mut Vec<MemoryRule>> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| write_error(op, chain, "No chain/target/match by that name."))
    }

    fn record(&mut self, op: Op) {
        let links = self
            .hook
            .iter()
            .map(|(port, chain)| {
                let rules = self.chains.get(chain).cloned().unwrap_or_default();
                (*port, chain.clone(), rules)
            })
            .collect();
        self.history.push(HookSnapshot { op, links });
    }
}

/// In-memory stand-in for the `filter` table.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    state: Mutex<State>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain with the given rules, linked for `port`, bypassing history.
    pub fn install(&self, chain: &str, port: u16, rules: Vec<MemoryRule>) {
        let mut state = self.lock();
        state.chains.insert(chain.to_string(), rules);
        if !state.hook.iter().any(|(p, c)| *p == port && c == chain) {
            state.hook.push((port, chain.to_string()));
        }
    }

    /// Creates an unlinked chain, bypassing history.
    pub fn install_unlinked(&self, chain: &str, rules: Vec<MemoryRule>) {
        self.lock().chains.insert(chain.to_string(), rules);
    }

    /// Makes every future `op` on `chain` fail.
    pub fn fail_on(&self, op: Op, chain: &str) {
        self.lock().failures.insert((op, chain.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Rules of `chain`, if it exists.
    pub fn rules(&self, chain: &str) -> Option<Vec<MemoryRule>> {
        self.lock().chains.get(chain).cloned()
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.lock().chains.keys().cloned().collect()
    }

    /// Current hook jumps in order.
    pub fn hook(&self) -> Vec<(u16, String)> {
        self.lock().hook.clone()
    }

    /// Snapshots recorded after each mutation, oldest first.
    pub fn history(&self) -> Vec<HookSnapshot> {
        self.lock().history.clone()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-call
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn injected(op: Op, chain: &str) -> Error {
    match op {
        Op::Exists | Op::ListChains | Op::CurrentAddresses => Error::Read {
            command: format!("{op:?} {chain}"),
            message: "injected failure".to_string(),
            exit_code: Some(1),
        },
        _ => write_error(op, chain, "injected failure"),
    }
}

fn write_error(op: Op, chain: &str, message: &str) -> Error {
    Error::Write {
        command: format!("{op:?} {chain}"),
        message: message.to_string(),
        exit_code: Some(1),
    }
}

impl ChainStateReader for MemoryFilter {
    async fn exists(&self, chain: &str) -> Result<bool> {
        let state = self.lock();
        state.check(Op::Exists, chain)?;
        Ok(state.chains.contains_key(chain))
    }

    async fn list_chains(&self) -> Result<Vec<String>> {
        let state = self.lock();
        state.check(Op::ListChains, "")?;
        let mut names = vec!["INPUT".to_string(), "FORWARD".to_string(), "OUTPUT".to_string()];
        names.extend(state.chains.keys().cloned());
        Ok(names)
    }

    async fn current_addresses(&self, chain: &str) -> Result<AddressSet> {
        let state = self.lock();
        state.check(Op::CurrentAddresses, chain)?;
        let rules = state.chains.get(chain).ok_or_else(|| Error::Read {
            command: format!("CurrentAddresses {chain}"),
            message: "No chain/target/match by that name.".to_string(),
            exit_code: Some(1),
        })?;

        Ok(rules
            .iter()
            .filter_map(|rule| match rule {
                MemoryRule::Permit(addr) => Some(*addr),
                MemoryRule::Deny => None,
            })
            .collect())
    }
}

impl RulesetWriter for MemoryFilter {
    async fn create_chain(&self, chain: &str) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::CreateChain, chain)?;
        if state.chains.contains_key(chain) {
            return Err(write_error(Op::CreateChain, chain, "Chain already exists."));
        }
        state.chains.insert(chain.to_string(), Vec::new());
        state.record(Op::CreateChain);
        Ok(())
    }

    async fn append_permit(&self, chain: &str, addr: IpAddr) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::AppendPermit, chain)?;
        state.chain_mut(Op::AppendPermit, chain)?.push(MemoryRule::Permit(addr));
        state.record(Op::AppendPermit);
        Ok(())
    }

    async fn append_deny_if_absent(&self, chain: &str) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::AppendDeny, chain)?;
        let rules = state.chain_mut(Op::AppendDeny, chain)?;
        if !rules.contains(&MemoryRule::Deny) {
            rules.push(MemoryRule::Deny);
        }
        state.record(Op::AppendDeny);
        Ok(())
    }

    async fn link_to_hook(&self, chain: &str, port: u16) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::Link, chain)?;
        if !state.chains.contains_key(chain) {
            return Err(write_error(Op::Link, chain, "Couldn't load target"));
        }
        if !state.hook.iter().any(|(p, c)| *p == port && c == chain) {
            state.hook.push((port, chain.to_string()));
        }
        state.record(Op::Link);
        Ok(())
    }

    async fn unlink_from_hook(&self, chain: &str, port: u16) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::Unlink, chain)?;
        state.hook.retain(|(p, c)| !(*p == port && c == chain));
        state.record(Op::Unlink);
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::Rename, old)?;
        if state.chains.contains_key(new) {
            return Err(write_error(Op::Rename, new, "File exists."));
        }
        let rules = state
            .chains
            .remove(old)
            .ok_or_else(|| write_error(Op::Rename, old, "No chain/target/match by that name."))?;
        state.chains.insert(new.to_string(), rules);
        for (_, chain) in &mut state.hook {
            if chain == old {
                *chain = new.to_string();
            }
        }
        state.record(Op::Rename);
        Ok(())
    }

    async fn clear_and_delete(&self, chain: &str) -> Result<()> {
        let mut state = self.lock();
        state.check(Op::ClearAndDelete, chain)?;
        if state.hook.iter().any(|(_, c)| c == chain) {
            return Err(write_error(Op::ClearAndDelete, chain, "Too many links."));
        }
        if state.chains.remove(chain).is_none() {
            return Err(write_error(
                Op::ClearAndDelete,
                chain,
                "No chain/target/match by that name.",
            ));
        }
        state.record(Op::ClearAndDelete);
        Ok(())
    }
}
