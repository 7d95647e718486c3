//! Integration tests for the reconciliation loop
//!
//! Covers whole cycles: ordering of the per-workspace pass against routing
//! and capacity, failure containment, auto-suspend and the supervisor.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{adapters, test_config, Harness, DOMAIN};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use ws_adapters::fake::{FakeCache, FakeCloud, Operation};
use ws_adapters::AdapterError;
use ws_orchestrator::test_utils::{create_test_db, workspace_in_state};
use ws_orchestrator::{
    LifecycleRequest, NewWorkspace, SqliteWorkspaceStore, WorkspaceState, WorkspaceStore,
};
use ws_reconciler::{spawn_supervised, Config, OperatorSignals, Reconciler};

#[tokio::test]
async fn test_new_workspace_goes_live_and_is_routed() {
    let h = Harness::new();
    let workspace = h.insert("Data Science", "small").await;

    h.cycles(3).await;

    let live = h.get(&workspace.id).await;
    assert_eq!(live.state, WorkspaceState::Active);
    assert!(live.handles.is_complete());

    let table = h.cloud.published_table().expect("table published");
    assert_eq!(
        table.get(&format!("data-science.{}", DOMAIN)),
        live.handles.routing_backend.as_deref()
    );
}

#[tokio::test]
async fn test_routing_is_published_every_cycle() {
    let h = Harness::new();
    h.seed("ws-1", "small", WorkspaceState::Active);

    h.cycles(3).await;
    assert_eq!(h.cloud.publish_count(), 3);
}

#[tokio::test]
async fn test_converged_fleet_makes_no_resource_calls() {
    let h = Harness::new();
    h.seed("ws-1", "small", WorkspaceState::Active);
    h.seed("ws-2", "small", WorkspaceState::Suspended);
    let before = h.get("ws-1").await.version;

    let report = h.reconciler.run_cycle().await;

    assert_eq!(report.converged, 0);
    assert_eq!(report.failed, 0);
    assert!(h.cloud.resource_calls().is_empty());
    assert_eq!(h.get("ws-1").await.version, before);
    assert_eq!(report.routes_published, Some(1));
}

#[tokio::test]
async fn test_handle_invariants_hold_after_every_cycle() {
    let h = Harness::new();
    let alpha = h.insert("alpha", "small").await;
    let beta = h.insert("beta", "small").await;
    h.seed("gamma", "small", WorkspaceState::Active);

    for cycle in 0..12 {
        if cycle == 4 {
            let mut b = h.get(&beta.id).await;
            b.pending_request = Some(LifecycleRequest::Suspend);
            h.store.update_workspace(&beta.id, b.version, &b).await.unwrap();
        }
        if cycle == 6 {
            let mut g = h.get("gamma").await;
            g.pending_request = Some(LifecycleRequest::Delete);
            h.store.update_workspace("gamma", g.version, &g).await.unwrap();
        }

        h.reconciler.run_cycle().await;

        for w in h.store.list_workspaces().await.unwrap() {
            assert!(w.handles_consistent(), "cycle {cycle}: {} in {}", w.id, w.state);
        }
    }

    assert_eq!(h.get(&alpha.id).await.state, WorkspaceState::Active);
    assert_eq!(h.get(&beta.id).await.state, WorkspaceState::Suspended);
    assert!(h.store.get_workspace("gamma").await.is_err());

    let table = h.cloud.published_table().unwrap();
    assert_eq!(table.len(), 1);
    assert!(table.get(&format!("alpha.{}", DOMAIN)).is_some());
}

#[tokio::test]
async fn test_list_failure_skips_whole_cycle() {
    let h = Harness::new();
    h.seed("ws-1", "small", WorkspaceState::Active);
    h.store.fail_list(true);

    let report = h.reconciler.run_cycle().await;

    assert!(report.skipped);
    assert!(h.cloud.calls().is_empty());
    assert_eq!(h.cloud.publish_count(), 0);

    h.store.fail_list(false);
    let report = h.reconciler.run_cycle().await;
    assert!(!report.skipped);
    assert_eq!(h.cloud.publish_count(), 1);
}

#[tokio::test]
async fn test_failed_publish_keeps_previous_table() {
    let h = Harness::new();
    h.seed("ws-1", "small", WorkspaceState::Active);
    h.reconciler.run_cycle().await;
    let previous = h.cloud.published_table().unwrap();

    h.seed("ws-2", "small", WorkspaceState::Active);
    h.cloud.fail_always(
        Operation::PublishRoutingTable,
        AdapterError::Transient("apiserver unavailable".to_string()),
    );
    let report = h.reconciler.run_cycle().await;

    assert_eq!(report.routes_published, None);
    assert_eq!(h.cloud.published_table(), Some(previous));

    h.cloud.clear_failures();
    let report = h.reconciler.run_cycle().await;
    assert_eq!(report.routes_published, Some(2));
}

#[tokio::test]
async fn test_one_failing_workspace_does_not_stop_the_others() {
    let h = Harness::new();
    let mut bad = workspace_in_state("bad", "small", WorkspaceState::Provisioning);
    bad.handles.database = Some("db-bad".to_string());
    h.seed_workspace(bad);
    h.seed("good", "small", WorkspaceState::Provisioning);
    h.cloud.fail_always(
        Operation::CreateSearchEndpoint,
        AdapterError::Transient("search cluster throttled".to_string()),
    );

    let report = h.reconciler.run_cycle().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.converged, 1);

    assert!(h.get("good").await.handles.database.is_some());
    let bad = h.get("bad").await;
    assert_eq!(bad.state, WorkspaceState::Provisioning);
    assert!(bad.handles.search.is_none());
}

#[tokio::test]
async fn test_panic_in_one_workspace_is_contained_and_retried() {
    let h = Harness::new();
    let first = h.insert("first", "small").await;
    let second = h.insert("second", "small").await;
    h.cloud
        .panic_next(Operation::CreateCredentials, Some(second.id.as_str()));

    let report = h.reconciler.run_cycle().await;
    assert_eq!(report.panicked, 1);
    assert!(h.get(&first.id).await.handles.database.is_some());
    assert!(h.get(&second.id).await.handles.database.is_none());
    assert!(report.routes_published.is_some());

    let report = h.reconciler.run_cycle().await;
    assert_eq!(report.panicked, 0);
    assert!(h.get(&second.id).await.handles.database.is_some());
}

#[tokio::test]
async fn test_reservation_blocks_routing_until_quota_frees() {
    let h = Harness::new();
    for i in 0..10 {
        h.seed(&format!("live-{i}"), "small", WorkspaceState::Active);
    }
    let waiting = h.insert("waiting", "small").await;

    h.cycles(5).await;

    let blocked = h.get(&waiting.id).await;
    assert_eq!(blocked.state, WorkspaceState::Provisioning);
    assert!(blocked.provisioning_blocked);
    assert!(blocked.handles.database.is_some());
    assert!(blocked.handles.search.is_some());
    assert!(blocked.handles.routing_backend.is_none());
    assert_eq!(h.cloud.count(Operation::CreateRoutingBackend), 0);

    let mut leaving = h.get("live-0").await;
    leaving.pending_request = Some(LifecycleRequest::Delete);
    h.store
        .update_workspace("live-0", leaving.version, &leaving)
        .await
        .unwrap();

    h.cycles(2).await;

    let admitted = h.get(&waiting.id).await;
    assert!(!admitted.provisioning_blocked);
    assert_eq!(admitted.state, WorkspaceState::Active);
    assert!(admitted.handles.routing_backend.is_some());
}

#[tokio::test]
async fn test_idle_workspace_is_suspended() {
    let config = Config {
        auto_suspend_minutes: 60,
        ..test_config()
    };
    let h = Harness::with_config(config);

    let mut idle = workspace_in_state("idle", "small", WorkspaceState::Active);
    idle.last_active_at = Utc::now() - ChronoDuration::minutes(61);
    h.seed_workspace(idle);

    let mut busy = workspace_in_state("busy", "small", WorkspaceState::Active);
    busy.last_active_at = Utc::now() - ChronoDuration::minutes(59);
    h.seed_workspace(busy);

    h.reconciler.run_cycle().await;
    assert_eq!(
        h.get("idle").await.pending_request,
        Some(LifecycleRequest::Suspend)
    );
    assert_eq!(h.get("busy").await.pending_request, None);

    h.cycles(2).await;
    let idle = h.get("idle").await;
    assert_eq!(idle.state, WorkspaceState::Suspended);
    assert!(idle.handles.routing_backend.is_none());
    assert_eq!(h.get("busy").await.state, WorkspaceState::Active);

    let table = h.cloud.published_table().unwrap();
    assert!(table.get(&format!("idle.{}", DOMAIN)).is_none());
    assert!(table.get(&format!("busy.{}", DOMAIN)).is_some());
}

#[tokio::test]
async fn test_idle_workspace_is_suspended_while_a_step_keeps_failing() {
    let config = Config {
        auto_suspend_minutes: 60,
        ..test_config()
    };
    let h = Harness::with_config(config);

    let mut drifted = workspace_in_state("drifted", "small", WorkspaceState::Active);
    drifted.handles.search = None;
    drifted.last_active_at = Utc::now() - ChronoDuration::minutes(120);
    h.seed_workspace(drifted);
    h.cloud.fail_always(
        Operation::CreateSearchEndpoint,
        AdapterError::Transient("search cluster throttled".to_string()),
    );

    let report = h.reconciler.run_cycle().await;
    assert_eq!(report.failed, 1);
    assert_eq!(
        h.get("drifted").await.pending_request,
        Some(LifecycleRequest::Suspend)
    );

    h.cycles(2).await;
    let suspended = h.get("drifted").await;
    assert_eq!(suspended.state, WorkspaceState::Suspended);
    assert!(suspended.handles.routing_backend.is_none());
}

#[tokio::test]
async fn test_resumed_idle_workspace_stays_active() {
    let config = Config {
        auto_suspend_minutes: 60,
        ..test_config()
    };
    let h = Harness::with_config(config);

    let mut sleeping = workspace_in_state("sleeping", "small", WorkspaceState::Suspended);
    sleeping.last_active_at = Utc::now() - ChronoDuration::days(2);
    h.seed_workspace(sleeping);

    let signals = OperatorSignals::new(
        h.store.clone(),
        Arc::new(h.cloud.clone()),
        Arc::new(FakeCache::new()),
        Duration::from_secs(60),
        3,
    );
    signals
        .request("alice", "sleeping", LifecycleRequest::Resume)
        .await
        .unwrap();

    h.cycles(2).await;
    let resumed = h.get("sleeping").await;
    assert_eq!(resumed.state, WorkspaceState::Active);
    assert_eq!(resumed.pending_request, None);

    h.cycles(2).await;
    let later = h.get("sleeping").await;
    assert_eq!(later.state, WorkspaceState::Active);
    assert_eq!(later.pending_request, None);
}

#[tokio::test]
async fn test_auto_suspend_disabled_by_default() {
    let h = Harness::new();
    let mut idle = workspace_in_state("idle", "small", WorkspaceState::Active);
    idle.last_active_at = Utc::now() - ChronoDuration::days(30);
    h.seed_workspace(idle);

    h.cycles(2).await;
    assert_eq!(h.get("idle").await.state, WorkspaceState::Active);
}

#[tokio::test]
async fn test_parallel_pass_reconciles_every_workspace() {
    let config = Config {
        workspace_concurrency: 4,
        class_quotas: BTreeMap::new(),
        ..test_config()
    };
    let h = Harness::with_config(config);
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(h.insert(&format!("ws-{i}"), "large").await.id);
    }

    h.cycles(3).await;

    for id in &ids {
        assert_eq!(h.get(id).await.state, WorkspaceState::Active, "{id}");
    }
    assert_eq!(h.cloud.published_table().unwrap().len(), 8);
    assert_eq!(h.cloud.count(Operation::CreateRoutingBackend), 8);
}

#[tokio::test]
async fn test_sqlite_store_end_to_end() {
    let pool = create_test_db().await;
    let store = Arc::new(SqliteWorkspaceStore::new(pool));
    let cloud = FakeCloud::new();
    let reconciler = Reconciler::new(&test_config(), store.clone(), adapters(&cloud)).unwrap();

    let workspace = store
        .insert_workspace(NewWorkspace::new("tenant-a", "alpha", "small"))
        .await
        .unwrap();

    for _ in 0..3 {
        reconciler.run_cycle().await;
    }
    let active = store.get_workspace(&workspace.id).await.unwrap();
    assert_eq!(active.state, WorkspaceState::Active);
    assert_eq!(active.version, 4);

    let mut doomed = active.clone();
    doomed.pending_request = Some(LifecycleRequest::Delete);
    store
        .update_workspace(&active.id, active.version, &doomed)
        .await
        .unwrap();

    for _ in 0..5 {
        reconciler.run_cycle().await;
    }
    assert!(store.get_workspace(&workspace.id).await.unwrap_err().is_not_found());
    assert!(cloud.live_handles().is_empty());
    assert!(cloud.published_table().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = Harness::new();
    h.seed("ws-1", "small", WorkspaceState::Active);
    let shutdown = CancellationToken::new();

    let reconciler = h.reconciler.clone();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { reconciler.run(token).await });

    wait_for(|| h.cloud.publish_count() >= 1).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_supervisor_restarts_panicked_loop() {
    let h = Harness::new();
    h.seed("ws-1", "small", WorkspaceState::Active);
    h.cloud.panic_next(Operation::PublishRoutingTable, None);

    let shutdown = CancellationToken::new();
    let supervisor = spawn_supervised(h.reconciler.clone(), shutdown.clone());

    wait_for(|| h.cloud.publish_count() >= 1).await;
    shutdown.cancel();

    let restarts = tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert_eq!(restarts, 1);
    assert_eq!(h.cloud.count(Operation::PublishRoutingTable), 2);
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
