#[cfg(test)]
mod tests_impl {
    use crate::core::chain::{live_name, staging_name};
    use crate::core::error::Error;
    use crate::core::filter::{ChainStateReader, RulesetWriter};
    use crate::core::memory::{MemoryFilter, MemoryRule, Op};
    use crate::core::reconciler::{Rotation, RulesetReconciler};
    use crate::core::test_helpers::{addrs, chain_rules, filter_with_chains, ip};
    use std::collections::BTreeSet;

    /// Every snapshot from the first link of `port` onwards has a
    /// deny-terminated chain linked for it.
    fn assert_no_gap(filter: &MemoryFilter, port: u16) {
        let history = filter.history();
        let first_link = history
            .iter()
            .position(|snapshot| snapshot.links_for(port) > 0)
            .unwrap_or(history.len());

        for snapshot in &history[first_link..] {
            assert!(
                snapshot.deny_terminated_links(port) >= 1,
                "port {port} unprotected after {:?}: {:?}",
                snapshot.op,
                snapshot.links
            );
        }
    }

    fn assert_single_live_link(filter: &MemoryFilter, port: u16) {
        let linked: Vec<_> = filter.hook().into_iter().filter(|(p, _)| *p == port).collect();
        assert_eq!(linked, vec![(port, live_name(port))]);
    }

    #[tokio::test]
    async fn test_metrics_scenario_from_empty() {
        let filter = MemoryFilter::new();
        let reconciler = RulesetReconciler::new(filter);
        let desired = addrs(&["10.0.0.5", "10.0.0.6"]);

        assert!(reconciler.has_changed(9100, &desired).await.unwrap());
        let rotation = reconciler.reconcile(9100, &desired).await.unwrap();
        assert_eq!(rotation, Rotation::Created);

        let filter = reconciler.filter();
        assert_eq!(
            filter.rules("managed_9100").unwrap(),
            chain_rules(&["10.0.0.5", "10.0.0.6"])
        );
        assert!(filter.rules("managed_9100_staging").is_none());
        assert_single_live_link(filter, 9100);
        assert_no_gap(filter, 9100);

        assert!(!reconciler.has_changed(9100, &desired).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let reconciler = RulesetReconciler::new(MemoryFilter::new());
        let desired = addrs(&["10.0.0.5"]);

        reconciler.reconcile(80, &desired).await.unwrap();
        let first = reconciler.filter().rules(&live_name(80));

        assert!(!reconciler.has_changed(80, &desired).await.unwrap());
        reconciler.reconcile(80, &desired).await.unwrap();

        assert_eq!(reconciler.filter().rules(&live_name(80)), first);
        assert_single_live_link(reconciler.filter(), 80);
    }

    #[tokio::test]
    async fn test_has_changed_ignores_rule_order() {
        let filter = filter_with_chains(&[(443, &["10.0.0.6", "10.0.0.5"])]);
        let reconciler = RulesetReconciler::new(filter);

        assert!(
            !reconciler
                .has_changed(443, &addrs(&["10.0.0.5", "10.0.0.6"]))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_has_changed_detects_out_of_band_edits() {
        let filter = filter_with_chains(&[(443, &["10.0.0.5", "10.0.0.6"])]);
        let reconciler = RulesetReconciler::new(filter);
        let desired = addrs(&["10.0.0.5", "10.0.0.6"]);

        // Someone adds a permit by hand
        reconciler
            .filter()
            .install(&live_name(443), 443, chain_rules(&["10.0.0.5", "10.0.0.6", "10.9.9.9"]));
        assert!(reconciler.has_changed(443, &desired).await.unwrap());

        // Someone removes one
        reconciler
            .filter()
            .install(&live_name(443), 443, chain_rules(&["10.0.0.5"]));
        assert!(reconciler.has_changed(443, &desired).await.unwrap());

        // Someone deletes the chain outright
        let filter = reconciler.filter();
        filter.unlink_from_hook(&live_name(443), 443).await.unwrap();
        filter.clear_and_delete(&live_name(443)).await.unwrap();
        assert!(reconciler.has_changed(443, &desired).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_never_leaves_port_unprotected() {
        let filter = filter_with_chains(&[(9100, &["10.0.0.5"])]);
        let reconciler = RulesetReconciler::new(filter);

        let rotation = reconciler
            .reconcile(9100, &addrs(&["10.0.0.5", "10.0.0.6", "10.0.0.7"]))
            .await
            .unwrap();
        assert_eq!(rotation, Rotation::Replaced);

        let filter = reconciler.filter();
        assert_no_gap(filter, 9100);
        assert_eq!(filter.history().last().unwrap().deny_terminated_links(9100), 1);
        assert_single_live_link(filter, 9100);
        assert_eq!(
            filter.rules(&live_name(9100)).unwrap(),
            chain_rules(&["10.0.0.5", "10.0.0.6", "10.0.0.7"])
        );
    }

    #[tokio::test]
    async fn test_empty_desired_set_is_deny_only() {
        let filter = filter_with_chains(&[(3306, &["10.0.0.30"])]);
        let reconciler = RulesetReconciler::new(filter);

        assert!(reconciler.has_changed(3306, &addrs(&[])).await.unwrap());
        reconciler.reconcile(3306, &addrs(&[])).await.unwrap();

        assert_eq!(
            reconciler.filter().rules(&live_name(3306)).unwrap(),
            vec![MemoryRule::Deny]
        );
        assert_single_live_link(reconciler.filter(), 3306);
        assert!(!reconciler.has_changed(3306, &addrs(&[])).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_ports_untouched_by_rotation() {
        let filter = filter_with_chains(&[(80, &["10.0.0.1"]), (443, &["10.0.0.2"])]);
        let reconciler = RulesetReconciler::new(filter);

        reconciler.reconcile(80, &addrs(&["10.0.0.3"])).await.unwrap();

        let filter = reconciler.filter();
        assert_eq!(filter.rules(&live_name(443)).unwrap(), chain_rules(&["10.0.0.2"]));
        assert!(filter.history().iter().all(|s| s.deny_terminated_links(443) == 1));
    }

    #[tokio::test]
    async fn test_write_failure_propagates_and_keeps_old_chain() {
        let filter = filter_with_chains(&[(9100, &["10.0.0.5"])]);
        filter.fail_on(Op::AppendPermit, &staging_name(9100));
        let reconciler = RulesetReconciler::new(filter);

        let result = reconciler.reconcile(9100, &addrs(&["10.0.0.6"])).await;
        assert!(matches!(result, Err(Error::Write { .. })));

        // The old policy stays in force
        let filter = reconciler.filter();
        assert_single_live_link(filter, 9100);
        assert_eq!(filter.rules(&live_name(9100)).unwrap(), chain_rules(&["10.0.0.5"]));
        assert_no_gap(filter, 9100);
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let filter = MemoryFilter::new();
        filter.fail_on(Op::Exists, &live_name(22));
        let reconciler = RulesetReconciler::new(filter);

        let result = reconciler.has_changed(22, &addrs(&["10.0.0.1"])).await;
        assert!(matches!(result, Err(Error::Read { .. })));
    }

    #[tokio::test]
    async fn test_next_run_repairs_interrupted_rotation() {
        let filter = filter_with_chains(&[(9100, &["10.0.0.5"])]);
        filter.fail_on(Op::Link, &staging_name(9100));
        let reconciler = RulesetReconciler::new(filter);
        let desired = addrs(&["10.0.0.5", "10.0.0.6"]);

        assert!(reconciler.reconcile(9100, &desired).await.is_err());
        assert!(reconciler.filter().rules(&staging_name(9100)).is_some());

        reconciler.filter().clear_failures();
        assert!(reconciler.has_changed(9100, &desired).await.unwrap());
        reconciler.reconcile(9100, &desired).await.unwrap();

        let filter = reconciler.filter();
        assert!(filter.rules(&staging_name(9100)).is_none());
        assert_eq!(
            filter.rules(&live_name(9100)).unwrap(),
            chain_rules(&["10.0.0.5", "10.0.0.6"])
        );
        assert_single_live_link(filter, 9100);
    }

    #[tokio::test]
    async fn test_leftover_linked_staging_is_adopted() {
        // Interrupted after the old live chain was deleted but before the rename
        let filter = MemoryFilter::new();
        filter.install(&staging_name(9100), 9100, chain_rules(&["10.0.0.5"]));
        let reconciler = RulesetReconciler::new(filter);

        let rotation = reconciler
            .reconcile(9100, &addrs(&["10.0.0.5", "10.0.0.6"]))
            .await
            .unwrap();
        assert_eq!(rotation, Rotation::Replaced);

        let filter = reconciler.filter();
        assert_no_gap(filter, 9100);
        assert_single_live_link(filter, 9100);
        assert!(filter.rules(&staging_name(9100)).is_none());
    }

    #[tokio::test]
    async fn test_leftover_staging_is_repaired_when_directory_reverts() {
        let filter = filter_with_chains(&[(9100, &["10.0.0.5"])]);
        filter.fail_on(Op::Unlink, &live_name(9100));
        let reconciler = RulesetReconciler::new(filter);

        // Staging is linked, then retiring the old live chain fails
        let result = reconciler
            .reconcile(9100, &addrs(&["10.0.0.5", "10.0.0.6"]))
            .await;
        assert!(result.is_err());
        reconciler.filter().clear_failures();

        // The live chain already matches, but the linked staging chain must go
        let desired = addrs(&["10.0.0.5"]);
        assert!(reconciler.has_changed(9100, &desired).await.unwrap());
        reconciler.reconcile(9100, &desired).await.unwrap();

        let filter = reconciler.filter();
        assert!(filter.rules(&staging_name(9100)).is_none());
        assert_single_live_link(filter, 9100);
        assert_eq!(
            filter.rules(&live_name(9100)).unwrap(),
            chain_rules(&["10.0.0.5"])
        );
        assert!(!reconciler.has_changed(9100, &desired).await.unwrap());

        reconciler
            .purge_obsolete(&BTreeSet::from([9100]))
            .await
            .unwrap();
        assert_eq!(reconciler.filter().hook(), vec![(9100, live_name(9100))]);
    }

    #[tokio::test]
    async fn test_purge_removes_only_unretained_ports() {
        let filter = filter_with_chains(&[
            (80, &["10.0.0.1"]),
            (443, &["10.0.0.1"]),
            (22, &["10.0.0.1"]),
        ]);
        let reconciler = RulesetReconciler::new(filter);

        let report = reconciler
            .purge_obsolete(&BTreeSet::from([80, 443]))
            .await
            .unwrap();

        assert_eq!(report.removed, vec![22]);
        assert!(report.is_clean());
        assert_eq!(
            reconciler.list_managed_chains().await.unwrap(),
            BTreeSet::from([80, 443])
        );
        assert!(reconciler.filter().hook().iter().all(|(port, _)| *port != 22));
    }

    #[tokio::test]
    async fn test_purge_is_best_effort() {
        let filter = filter_with_chains(&[
            (22, &["10.0.0.1"]),
            (23, &["10.0.0.1"]),
            (80, &["10.0.0.1"]),
        ]);
        filter.fail_on(Op::ClearAndDelete, &live_name(22));
        let reconciler = RulesetReconciler::new(filter);

        let report = reconciler
            .purge_obsolete(&BTreeSet::from([80]))
            .await
            .unwrap();

        assert_eq!(report.removed, vec![23]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 22);
        assert!(!report.is_clean());
        assert!(reconciler.filter().rules(&live_name(23)).is_none());
    }

    #[tokio::test]
    async fn test_purge_enumeration_failure_is_error() {
        let filter = filter_with_chains(&[(22, &["10.0.0.1"])]);
        filter.fail_on(Op::ListChains, "");
        let reconciler = RulesetReconciler::new(filter);

        let result = reconciler.purge_obsolete(&BTreeSet::new()).await;
        assert!(matches!(result, Err(Error::Read { .. })));
        assert!(reconciler.filter().rules(&live_name(22)).is_some());
    }

    #[tokio::test]
    async fn test_purge_sweeps_obsolete_staging_and_ignores_foreign_chains() {
        let filter = filter_with_chains(&[(80, &["10.0.0.1"])]);
        filter.install_unlinked(&staging_name(22), chain_rules(&[]));
        filter.install_unlinked(&staging_name(80), chain_rules(&[]));
        filter.install_unlinked("DOCKER", vec![]);
        filter.install_unlinked("managed_080", vec![]);
        let reconciler = RulesetReconciler::new(filter);

        let report = reconciler
            .purge_obsolete(&BTreeSet::from([80]))
            .await
            .unwrap();

        assert!(report.removed.is_empty());
        let names = reconciler.filter().chain_names();
        assert!(!names.contains(&staging_name(22)));
        assert!(names.contains(&staging_name(80)));
        assert!(names.contains(&"DOCKER".to_string()));
        assert!(names.contains(&"managed_080".to_string()));
    }

    #[tokio::test]
    async fn test_list_managed_chains_skips_staging() {
        let filter = filter_with_chains(&[(80, &[]), (9100, &["10.0.0.5"])]);
        filter.install_unlinked(&staging_name(22), vec![]);

        assert_eq!(
            filter.list_managed_chains().await.unwrap(),
            BTreeSet::from([80, 9100])
        );
        assert_eq!(
            filter.current_addresses(&live_name(9100)).await.unwrap(),
            BTreeSet::from([ip("10.0.0.5")])
        );
    }
}
