//! The reconciliation run
//!
//! One [`Agent::run`] call is one pass of the control loop:
//!
//! 1. Look up this host's own address in the directory
//! 2. Select the rules whose destination pattern matches this host
//! 3. Resolve each selected rule's source pattern to addresses
//! 4. Rebuild every port whose installed permit set differs
//! 5. Purge managed chains for ports no rule selected
//!
//! Every address is resolved before the first mutation, so a directory
//! failure aborts the run with the packet filter untouched. A filter error
//! while enforcing a port aborts the run too. Purge failures are reported,
//! never escalated.

use crate::audit::{self, AuditEvent, AuditLog, EventType};
use crate::core::error::Result;
use crate::core::filter::{AddressSet, PacketFilter};
use crate::core::reconciler::{PurgeReport, Rotation, RulesetReconciler};
use crate::core::rules::Rule;
use crate::directory::ServiceDirectory;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{info, warn};
use uuid::Uuid;

/// Whether the run may touch the packet filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Enforce,
    /// Read-only: report what an enforcing run would change.
    Check,
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: Mode,
    pub local_address: IpAddr,
    /// Ports selected by at least one rule (the purge retention set).
    pub applied_ports: BTreeSet<u16>,
    /// Ports whose chain was rebuilt (or would be, in check mode).
    pub rebuilt: Vec<u16>,
    pub unchanged: Vec<u16>,
    /// Ports removed by purge (or that would be, in check mode).
    pub purge: PurgeReport,
    /// Set when managed chains could not even be enumerated for purge.
    pub purge_error: Option<String>,
}

/// Desired permit set per port, in order of first declaration.
///
/// Several rules may target one port; their sources are merged so the port
/// converges instead of flip-flopping between rules on every run.
pub fn plan(
    rules: &[Rule],
    directory: &ServiceDirectory,
    local: IpAddr,
) -> Result<Vec<(u16, AddressSet)>> {
    let mut plan: Vec<(u16, AddressSet)> = Vec::new();

    for rule in rules {
        if !directory.is_eligible(&rule.destination, local)? {
            info!(
                "Rule {} -> {} :{} does not apply to this host",
                rule.source, rule.destination, rule.port
            );
            continue;
        }

        let addresses = directory.resolve(&rule.source)?;

        match plan.iter_mut().find(|(port, _)| *port == rule.port) {
            Some((_, desired)) => desired.extend(addresses),
            None => plan.push((rule.port, addresses)),
        }
    }

    Ok(plan)
}

pub struct Agent<F> {
    reconciler: RulesetReconciler<F>,
    audit: Option<AuditLog>,
    mode: Mode,
}

impl<F: PacketFilter> Agent<F> {
    pub fn new(filter: F) -> Self {
        Self {
            reconciler: RulesetReconciler::new(filter),
            audit: None,
            mode: Mode::Enforce,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn reconciler(&self) -> &RulesetReconciler<F> {
        &self.reconciler
    }

    /// One full pass of the control loop for `hostname`.
    pub async fn run(
        &self,
        rules: &[Rule],
        directory: &ServiceDirectory,
        hostname: &str,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        info!("Starting run {run_id} ({:?}) for {hostname}", self.mode);

        let local_address = directory.local_address(hostname)?;
        info!("My ip: {local_address}");

        let plan = plan(rules, directory, local_address)?;

        let mut report = RunReport {
            run_id,
            mode: self.mode,
            local_address,
            applied_ports: plan.iter().map(|(port, _)| *port).collect(),
            rebuilt: Vec::new(),
            unchanged: Vec::new(),
            purge: PurgeReport::default(),
            purge_error: None,
        };

        for (port, desired) in &plan {
            if !self.reconciler.has_changed(*port, desired).await? {
                report.unchanged.push(*port);
                continue;
            }

            if self.mode == Mode::Enforce {
                self.enforce(run_id, *port, desired).await?;
            }
            report.rebuilt.push(*port);
        }

        match self.mode {
            Mode::Enforce => self.purge(run_id, &mut report).await,
            Mode::Check => match self.reconciler.list_managed_chains().await {
                Ok(installed) => {
                    report.purge.removed = installed
                        .difference(&report.applied_ports)
                        .copied()
                        .collect();
                }
                Err(e) => report.purge_error = Some(e.to_string()),
            },
        }

        if self.mode == Mode::Enforce {
            let clean = report.purge.is_clean() && report.purge_error.is_none();
            let details = serde_json::json!({
                "local_address": local_address.to_string(),
                "applied_ports": report.applied_ports,
                "rebuilt": report.rebuilt,
                "unchanged": report.unchanged,
                "purged": report.purge.removed,
            });
            let event =
                AuditEvent::run_completed(run_id, clean, details, report.purge_error.clone());
            audit::record(self.audit.as_ref(), event).await;
        }

        info!(
            "Run {run_id} finished: {} rebuilt, {} unchanged, {} purged",
            report.rebuilt.len(),
            report.unchanged.len(),
            report.purge.removed.len()
        );
        Ok(report)
    }

    async fn enforce(&self, run_id: Uuid, port: u16, desired: &AddressSet) -> Result<()> {
        let details = serde_json::json!({
            "addresses": desired.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });

        let (event_type, outcome) = match self.reconciler.reconcile(port, desired).await {
            Ok(Rotation::Created) => (EventType::ChainCreated, Ok(())),
            Ok(Rotation::Replaced) => (EventType::ChainRotated, Ok(())),
            Err(e) => (EventType::ChainRotated, Err(e)),
        };

        let error = outcome.as_ref().err().map(ToString::to_string);
        let event = AuditEvent::chain(run_id, event_type, port, details, error);
        audit::record(self.audit.as_ref(), event).await;
        outcome
    }

    async fn purge(&self, run_id: Uuid, report: &mut RunReport) {
        let purge = match self.reconciler.purge_obsolete(&report.applied_ports).await {
            Ok(purge) => purge,
            Err(e) => {
                warn!("Could not enumerate managed chains for purge: {e}");
                report.purge_error = Some(e.to_string());
                return;
            }
        };

        let removed = purge.removed.iter().map(|port| (*port, None));
        let failed = purge.failed.iter().map(|(port, e)| (*port, Some(e.clone())));
        for (port, error) in removed.chain(failed) {
            let event_type = if error.is_none() {
                EventType::ChainPurged
            } else {
                EventType::PurgeFailed
            };
            let event = AuditEvent::chain(run_id, event_type, port, serde_json::Value::Null, error);
            audit::record(self.audit.as_ref(), event).await;
        }

        report.purge = purge;
    }
}
