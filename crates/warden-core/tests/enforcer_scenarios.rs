//! End-to-end enforcement ticks against in-memory gateways.

mod common;

use chrono::{Duration, Utc};

use common::{Harness, account};
use warden_core::account::{AccountUpdate, DeactivationReason};
use warden_core::enforcer::{QuotaEnforcer, TickOutcome};

fn enforcer(harness: &Harness) -> QuotaEnforcer {
    QuotaEnforcer::new(harness.plane.clone(), harness.metrics.clone())
}

#[tokio::test]
async fn traffic_over_limit_deactivates_and_restarts() {
    let now = Utc::now();
    let harness = Harness::new(vec![account("a", 1.0, 30, now, 900_000_000)]);
    harness.metrics.set_traffic("a", 150_000_000, 50_000_000);

    let report = enforcer(&harness).run_tick_at(now).await;

    assert_eq!(report.outcome, TickOutcome::PolicyChanged);
    assert_eq!(report.deactivations.len(), 1);
    assert_eq!(report.deactivations[0].reason, DeactivationReason::TrafficLimit);
    assert_eq!(report.restart_generation, Some(1));

    let stored = &harness.persisted()["a"];
    assert_eq!(stored.traffic_used_bytes, 1_100_000_000);
    assert!(!stored.is_active);

    // the restarted proxy no longer lists the account
    let tags = harness.launcher.last_client_tags();
    assert_eq!(tags.len(), 1);
    assert_ne!(tags[0], "user_a");
}

#[tokio::test]
async fn expired_account_deactivates_on_time() {
    let now = Utc::now();
    let created = now - Duration::days(31);
    let harness = Harness::new(vec![account("a", 10.0, 30, created, 0)]);

    let report = enforcer(&harness).run_tick_at(now).await;

    assert_eq!(report.outcome, TickOutcome::PolicyChanged);
    assert_eq!(report.deactivations[0].reason, DeactivationReason::TimeLimit);
    assert_eq!(report.restart_generation, Some(1));
    assert!(!harness.persisted()["a"].is_active);
}

#[tokio::test]
async fn failing_account_is_isolated() {
    let now = Utc::now();
    let harness = Harness::new(vec![
        account("a", 10.0, 30, now, 100),
        account("b", 10.0, 30, now, 100),
    ]);
    harness.metrics.fail_for("a");
    harness.metrics.set_traffic("b", 1_000, 2_000);

    let report = enforcer(&harness).run_tick_at(now).await;

    assert_eq!(report.outcome, TickOutcome::UsageChanged);
    assert_eq!(report.skipped, vec!["a".to_string()]);
    assert_eq!(report.persisted, Some(true));
    assert!(report.restart_generation.is_none());
    assert_eq!(harness.plane.supervisor().generation(), 0);

    let stored = harness.persisted();
    assert_eq!(stored["a"].traffic_used_bytes, 100);
    assert_eq!(stored["b"].traffic_used_bytes, 3_100);
}

#[tokio::test]
async fn usage_only_tick_persists_without_restart() {
    let now = Utc::now();
    let harness = Harness::new(vec![account("a", 10.0, 30, now, 0)]);
    harness.metrics.set_traffic("a", 10, 0);

    let report = enforcer(&harness).run_tick_at(now).await;
    assert_eq!(report.outcome, TickOutcome::UsageChanged);
    assert_eq!(harness.store.put_count(), 1);
    assert_eq!(harness.launcher.starts.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn persistence_failure_does_not_roll_back_or_block_restart() {
    let now = Utc::now();
    let harness = Harness::new(vec![account("a", 1.0, 30, now, 1_073_741_800)]);
    harness.metrics.set_traffic("a", 24, 0);
    harness.store.set_fail_puts(true);

    let report = enforcer(&harness).run_tick_at(now).await;

    assert_eq!(report.persisted, Some(false));
    assert_eq!(report.restart_generation, Some(1));
    let live = harness.plane.registry().get("a").await.unwrap();
    assert_eq!(live.traffic_used_bytes, 1_073_741_824);
    assert!(!live.is_active);
}

#[tokio::test]
async fn admin_limit_change_survives_tick() {
    let now = Utc::now();
    let harness = Harness::new(vec![account("a", 10.0, 30, now, 0)]);
    harness.metrics.set_traffic("a", 500, 0);

    // usage deltas are added to the live record, not a stale copy
    harness
        .plane
        .registry()
        .update("a", |a| a.traffic_limit_gb = 20.0)
        .await
        .unwrap();
    enforcer(&harness).run_tick_at(now).await;

    let live = harness.plane.registry().get("a").await.unwrap();
    assert_eq!(live.traffic_limit_gb, 20.0);
    assert_eq!(live.traffic_used_bytes, 500);
}

#[tokio::test]
async fn usage_is_monotonic_across_ticks() {
    let now = Utc::now();
    let harness = Harness::new(vec![account("a", 100.0, 30, now, 0)]);
    let enforcer = enforcer(&harness);

    let mut previous = 0;
    for (up, down) in [(5, 5), (0, 0), (-3, 7), (1_000, 0)] {
        harness.metrics.set_traffic("a", up, down);
        enforcer.run_tick_at(now).await;
        let used = harness.plane.registry().get("a").await.unwrap().traffic_used_bytes;
        assert!(used >= previous);
        previous = used;
    }
    assert_eq!(previous, 1_017);
}

#[tokio::test]
async fn one_shot_tick_reports_restart_instead_of_launching() {
    let now = Utc::now();
    let harness = Harness::new(vec![account("a", 1.0, 30, now, 1_073_741_824)]);

    let report = enforcer(&harness).without_restart().run_tick_at(now).await;

    assert_eq!(report.outcome, TickOutcome::PolicyChanged);
    assert!(report.restart_required);
    assert!(report.restart_generation.is_none());
    assert_eq!(report.persisted, Some(true));
    assert_eq!(harness.launcher.starts.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(!harness.persisted()["a"].is_active);
}

#[tokio::test]
async fn reactivated_over_limit_account_is_deactivated_again() {
    let now = Utc::now();
    let mut over = account("a", 1.0, 30, now, 2_000_000_000);
    over.is_active = false;
    let harness = Harness::new(vec![over]);

    let reactivated = harness
        .plane
        .update_account(
            "a",
            AccountUpdate {
                is_active: Some(true),
                ..AccountUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(reactivated.is_active);
    assert_eq!(reactivated.traffic_used_bytes, 2_000_000_000);
    assert_eq!(harness.launcher.last_client_tags(), vec!["user_a".to_string()]);
    assert_eq!(harness.plane.supervisor().generation(), 1);

    let report = enforcer(&harness).run_tick_at(now).await;

    assert_eq!(report.outcome, TickOutcome::PolicyChanged);
    assert_eq!(report.deactivations[0].reason, DeactivationReason::TrafficLimit);
    assert_eq!(report.restart_generation, Some(2));
    assert!(!harness.persisted()["a"].is_active);
    let tags = harness.launcher.last_client_tags();
    assert_eq!(tags.len(), 1);
    assert_ne!(tags[0], "user_a");
}
