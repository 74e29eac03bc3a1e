//! End-to-end flow: analyze targets, execute the suggestions under the safety
//! gates, then evaluate the applied changes for rollback.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bidopt_automation::controller::ExecutionDecision;
    use bidopt_automation::rollback::{RollbackManager, RollbackRule};
    use bidopt_automation::{ExecutionController, ExecutionStatus};
    use bidopt_core::config::{AlgorithmParameters, AutomationDefaults, RollbackConfig};
    use bidopt_core::notify::{capture_notifier, NotificationKind};
    use bidopt_core::ports::{InMemorySampleStore, RecordingAdPlatform};
    use bidopt_core::types::{ExecutionType, SuggestionType, TargetSnapshot, TargetType};
    use bidopt_engine::OptimizationEngine;
    use chrono::Utc;

    fn snapshot(id: &str, clicks: u64, orders: u64, spend: f64, sales: f64) -> TargetSnapshot {
        TargetSnapshot {
            account_id: "acct-1".into(),
            campaign_id: "camp-1".into(),
            target_id: id.into(),
            target_type: TargetType::Keyword,
            text: None,
            match_type: None,
            current_bid: 1.0,
            impressions: 8000,
            clicks,
            spend,
            sales,
            orders,
        }
    }

    fn controller_with_limit(
        max_daily_bids: u32,
    ) -> (Arc<ExecutionController>, Arc<RecordingAdPlatform>) {
        let mut defaults = AutomationDefaults::default();
        defaults.boundary.max_daily_bid_adjustments = max_daily_bids;
        let platform = Arc::new(RecordingAdPlatform::new());
        let controller = Arc::new(ExecutionController::new(
            defaults,
            platform.clone(),
            capture_notifier(),
        ));
        (controller, platform)
    }

    #[test]
    fn test_suggestions_flow_through_controller() {
        let engine = OptimizationEngine::new(
            AlgorithmParameters::default(),
            Arc::new(InMemorySampleStore::new()),
        );
        let targets = vec![
            snapshot("kw-cheap", 40, 4, 15.0, 100.0),
            snapshot("kw-dead", 40, 0, 40.0, 0.0),
            snapshot("kw-pricey", 40, 2, 80.0, 100.0),
            snapshot("kw-new", 3, 0, 3.0, 0.0),
        ];
        let suggestions = engine.analyze_targets(&targets);
        assert_eq!(suggestions.len(), 4);
        assert_eq!(suggestions[0].target_id, "kw-pricey");
        assert_eq!(
            suggestions.last().map(|s| s.suggestion_type),
            Some(SuggestionType::Maintain)
        );

        let decisions: Vec<_> = suggestions
            .iter()
            .filter_map(ExecutionDecision::from_suggestion)
            .collect();
        assert_eq!(decisions.len(), 3);

        let (controller, platform) = controller_with_limit(100);
        let batch = controller.execute_batch("acct-1", &decisions);
        assert_eq!(batch.outcomes.success, 3);
        assert_eq!(platform.applied().len(), 3);
        assert!(platform
            .applied()
            .iter()
            .any(|c| c.target_id == "kw-dead" && c.execution_type == ExecutionType::Pause));
    }

    #[test]
    fn test_daily_cap_blocks_remainder_in_order() {
        let (controller, _) = controller_with_limit(5);
        let results: Vec<_> = (0..8)
            .map(|i| {
                controller.execute(&ExecutionDecision::new(
                    "acct-1",
                    format!("kw-{i}"),
                    ExecutionType::BidAdjustment,
                    1.0,
                    1.1,
                    90.0,
                ))
            })
            .collect();
        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert!(statuses[..5].iter().all(|s| *s == ExecutionStatus::Success));
        assert!(statuses[5..].iter().all(|s| *s == ExecutionStatus::Blocked));
    }

    #[test]
    fn test_concurrent_submissions_respect_daily_cap() {
        let (controller, platform) = controller_with_limit(10);
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let controller = controller.clone();
                scope.spawn(move || {
                    for i in 0..10 {
                        controller.execute(&ExecutionDecision::new(
                            "acct-1",
                            format!("kw-{worker}-{i}"),
                            ExecutionType::BidAdjustment,
                            1.0,
                            1.1,
                            90.0,
                        ));
                    }
                });
            }
        });
        let results = controller.audit().results_for("acct-1");
        let successes = results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Success)
            .count();
        assert_eq!(results.len(), 40);
        assert_eq!(successes, 10);
        assert_eq!(platform.applied().len(), 10);
    }

    #[test]
    fn test_underperforming_change_is_rolled_back() {
        let (controller, platform) = controller_with_limit(100);
        let notifier = capture_notifier();
        let rollback = RollbackManager::new(
            RollbackConfig::default(),
            controller.clone(),
            notifier.clone(),
        );
        rollback.add_rule(RollbackRule::new("acct-1", "weekly profit", 50.0, 7));

        let applied = controller.execute(&ExecutionDecision::new(
            "acct-1",
            "kw-1",
            ExecutionType::BidAdjustment,
            1.0,
            1.25,
            90.0,
        ));
        assert_eq!(applied.status, ExecutionStatus::Success);
        rollback.track(&applied, 100.0).unwrap();
        rollback.record_actual_profit(&applied.id, 7, 20.0).unwrap();

        let now = Utc::now();
        let raised = rollback.evaluate_all("acct-1", now);
        assert_eq!(raised.len(), 1);
        assert!((raised[0].profit_difference_percent - 20.0).abs() < 1e-9);
        assert_eq!(notifier.count_kind(NotificationKind::RollbackTriggered), 1);

        rollback.approve(&raised[0].id, now).unwrap();
        let revert = rollback.execute(&raised[0].id, now).unwrap();
        assert_eq!(revert.status, ExecutionStatus::Success);
        assert!((platform.applied()[1].new_value - 1.0).abs() < 1e-9);
        assert_eq!(
            controller.audit().get(&applied.id).map(|r| r.status),
            Some(ExecutionStatus::RolledBack)
        );
    }
}
