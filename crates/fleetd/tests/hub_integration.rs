//! Hub integration tests.
//!
//! Run the full hub against an in-memory store: placements get scheduled
//! through store events, update runs roll the bindings out stage by stage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{HubConfig, RolloutConfig};
use fleet_metrics::{HubMetrics, epoch_secs};
use fleet_rollout::{BindingUpdater, UpdateRunController};
use fleet_state::*;
use fleetd::Hub;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn member(name: &str, env: &str) -> MemberCluster {
    MemberCluster {
        name: name.to_string(),
        labels: labels(&[("env", env)]),
        leaving: false,
        status: MemberClusterStatus {
            last_heartbeat: Some(epoch_secs()),
            ..Default::default()
        },
        resource_version: 0,
    }
}

fn create_placement(store: &StateStore, policy: PlacementPolicy) -> ObjectKey {
    let placement = Placement {
        namespace: None,
        name: "crp".to_string(),
        generation: 1,
        policy: policy.clone(),
        finalizers: vec![],
        deletion_timestamp: None,
        conditions: vec![],
        resource_version: 0,
    };
    store.create_placement(&placement).unwrap();
    store
        .create_policy_snapshot(&PolicySnapshot {
            namespace: None,
            name: PolicySnapshot::name_for("crp", 0),
            placement_name: "crp".to_string(),
            index: 0,
            generation: 1,
            policy,
            status: PolicySnapshotStatus::default(),
            resource_version: 0,
        })
        .unwrap();
    placement.key()
}

struct Running {
    store: StateStore,
    metrics: Arc<HubMetrics>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("hub did not stop")
            .unwrap()
            .unwrap();
    }
}

fn start_hub(config: HubConfig) -> Running {
    let store = StateStore::open_in_memory().unwrap();
    let metrics = Arc::new(HubMetrics::new());
    let (tx, rx) = watch::channel(false);
    let hub = Hub::new(store.clone(), config, Arc::clone(&metrics));
    let handle = tokio::spawn(hub.run(rx));
    Running {
        store,
        metrics,
        shutdown: tx,
        handle,
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn binding_states(store: &StateStore) -> BTreeMap<String, BindingState> {
    store
        .list_bindings()
        .unwrap()
        .into_iter()
        .map(|b| (b.target_cluster, b.state))
        .collect()
}

fn run_phase(store: &StateStore, key: &ObjectKey) -> Option<RunPhase> {
    store.get_update_run(key).unwrap().and_then(|r| r.status.phase)
}

#[tokio::test]
async fn placement_is_scheduled_and_rolled_out() {
    let hub = start_hub(HubConfig::default());
    let store = hub.store.clone();

    for (name, env) in [("canary-1", "canary"), ("prod-1", "prod"), ("prod-2", "prod")] {
        store.put_member_cluster(&member(name, env)).unwrap();
    }
    let placement = create_placement(&store, PlacementPolicy::default());

    eventually("bindings for every cluster", || binding_states(&store).len() == 3).await;
    assert!(binding_states(&store).values().all(|s| *s == BindingState::Scheduled));
    eventually("scheduled condition", || {
        store
            .get_placement(&placement)
            .unwrap()
            .is_some_and(|p| is_condition_true(find_condition(&p.conditions, SCHEDULED_CONDITION), 1))
    })
    .await;
    assert_eq!(
        hub.metrics
            .placement_status_last_timestamp
            .matching(&[("name", "crp")])
            .len(),
        1
    );

    let run = UpdateRun {
        namespace: None,
        name: "run-1".to_string(),
        generation: 1,
        spec: UpdateRunSpec {
            placement_name: "crp".to_string(),
            state: RunRequestState::Run,
            stages: vec![
                StageDefinition {
                    name: "canary".to_string(),
                    cluster_labels: labels(&[("env", "canary")]),
                    requires_approval: false,
                    max_concurrency: None,
                },
                StageDefinition {
                    name: "prod".to_string(),
                    cluster_labels: labels(&[("env", "prod")]),
                    requires_approval: true,
                    max_concurrency: Some(1),
                },
            ],
        },
        status: UpdateRunStatus::default(),
        deletion_timestamp: None,
        resource_version: 0,
    };
    store.create_update_run(&run).unwrap();
    let run_key = run.key();

    eventually("prod stage waiting for approval", || {
        store.get_update_run(&run_key).unwrap().is_some_and(|r| {
            r.status.stages.get(1).is_some_and(|s| {
                s.tasks.iter().all(|t| t.phase == TaskPhase::ApprovalRequestCreated)
            })
        })
    })
    .await;
    let states = binding_states(&store);
    assert_eq!(states["canary-1"], BindingState::Bound);
    assert_eq!(states["prod-1"], BindingState::Scheduled);

    let operator = UpdateRunController::new(
        store.clone(),
        Arc::new(BindingUpdater::new(store.clone())),
        Arc::new(HubMetrics::new()),
        &RolloutConfig::default(),
    );
    operator.approve_task(&run_key, "prod", "prod-1").unwrap();
    operator.approve_task(&run_key, "prod", "prod-2").unwrap();

    eventually("run to succeed", || run_phase(&store, &run_key) == Some(RunPhase::Succeeded)).await;
    assert!(binding_states(&store).values().all(|s| *s == BindingState::Bound));
    assert_eq!(
        hub.metrics
            .update_run_approval_request_latency
            .sample_count(&["", "run-1", fleet_rollout::TASK_TYPE_CLUSTER_UPDATE]),
        2
    );

    // Deleting the run releases its metrics.
    operator.request_update_run_deletion(&run_key).unwrap();
    eventually("run to be removed", || store.get_update_run(&run_key).unwrap().is_none()).await;
    eventually("run metrics to be released", || {
        hub.metrics.update_run_status_last_timestamp.series_count() == 0
    })
    .await;

    hub.stop().await;
}

#[tokio::test]
async fn leaving_cluster_is_unscheduled_and_deletion_cleans_up() {
    let hub = start_hub(HubConfig::default());
    let store = hub.store.clone();

    store.put_member_cluster(&member("a", "prod")).unwrap();
    store.put_member_cluster(&member("b", "prod")).unwrap();
    let placement = create_placement(&store, PlacementPolicy::default());
    eventually("two bindings", || binding_states(&store).len() == 2).await;

    let mut leaving = store
        .list_member_clusters()
        .unwrap()
        .into_iter()
        .find(|c| c.name == "b")
        .unwrap();
    leaving.leaving = true;
    store.put_member_cluster(&leaving).unwrap();

    // A scheduled binding on a leaving cluster is simply dropped.
    eventually("binding on the leaving cluster dropped", || {
        !binding_states(&store).contains_key("b")
    })
    .await;
    assert_eq!(binding_states(&store).len(), 1);

    store.request_placement_deletion(&placement, epoch_secs()).unwrap();
    eventually("placement removed", || store.get_placement(&placement).unwrap().is_none()).await;
    assert!(binding_states(&store).is_empty());
    eventually("placement metrics released", || {
        hub.metrics.placement_status_last_timestamp.series_count() == 0
    })
    .await;

    hub.stop().await;
}

#[tokio::test]
async fn disabled_features_leave_objects_alone() {
    let mut config = HubConfig::default();
    config.features.enable_resource_placement_apis = false;
    let hub = start_hub(config);
    let store = hub.store.clone();

    store.put_member_cluster(&member("a", "prod")).unwrap();
    create_placement(&store, PlacementPolicy::default());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(binding_states(&store).is_empty());

    hub.stop().await;
}
