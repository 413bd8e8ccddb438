//! Whole-stack applies against the simulated backend.

use std::collections::BTreeSet;
use std::path::Path;

use stackgrid_core::config::{ImageSource, ResolvedStack};
use stackgrid_core::{ResourceKind, StackConfig};
use stackgrid_network::BoundaryRole;
use stackgrid_orchestrator::{
    ApplyOptions, NodeFate, NodeId, Orchestrator, Plan, ProvisionError, Providers,
};
use stackgrid_sim::{AuthorityBehavior, Faults, Mutation, Operation, SimulatedCloud};
use stackgrid_state::{EntityStatus, RunOutcome, StateStore};
use tokio::sync::watch;

const DIGEST_CHAR: char = 'a';

fn stack(extra: &str) -> ResolvedStack {
    stack_with_digest(DIGEST_CHAR, extra)
}

/// The demo stack pinned to an image digest made of `digest_char`.
fn stack_with_digest(digest_char: char, extra: &str) -> ResolvedStack {
    let toml = format!(
        r#"
[stack]
name = "demo"
domain_record = "app.example.com"
hosted_zone_id = "Z0123456789ABC"

[certificate]
validation_timeout = "90s"
poll_interval = "15s"

[service]
image = "registry.example.com/demo/app@sha256:{digest}"
{extra}
"#,
        digest = digest_char.to_string().repeat(64),
    );
    StackConfig::from_toml(&toml)
        .unwrap()
        .resolve(Path::new("."))
        .unwrap()
}

fn orchestrator(cloud: &SimulatedCloud, stack: &ResolvedStack, store: &StateStore) -> Orchestrator {
    Orchestrator::new(
        Plan::build(stack).unwrap(),
        Providers::from_backend(cloud.clone()),
        store.clone(),
    )
}

/// A shutdown channel whose sender is gone; it never fires.
fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn count(cloud: &SimulatedCloud, operation: Operation) -> usize {
    cloud
        .calls()
        .iter()
        .filter(|c| c.operation == operation)
        .count()
}

#[tokio::test(start_paused = true)]
async fn fresh_apply_creates_every_node() {
    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    let orch = orchestrator(&cloud, &stack(""), &store);

    let report = orch
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    assert_eq!(report.created().len(), NodeId::ALL.len());
    assert!(report.retired.is_empty());
    assert_eq!(cloud.resources_of(ResourceKind::Subnet).len(), 4);
    assert_eq!(cloud.resources_of(ResourceKind::Listener).len(), 2);
    assert_eq!(cloud.resources_of(ResourceKind::ManagedService).len(), 1);

    let alias = cloud
        .records("Z0123456789ABC")
        .into_iter()
        .find(|r| r.name == "app.example.com")
        .expect("alias record published");
    assert!(alias.value.contains(".edge.sim.local"));

    let runs = store.list_runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
    assert_eq!(store.list_entities().unwrap().len(), NodeId::ALL.len());
}

#[tokio::test(start_paused = true)]
async fn http_listener_never_exists_without_https() {
    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    orchestrator(&cloud, &stack(""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    let snapshots = cloud.snapshots();
    assert!(snapshots.iter().any(|s| s.listener_ports().contains(&80)));
    for snapshot in snapshots {
        let ports = snapshot.listener_ports();
        if ports.contains(&80) {
            assert!(ports.contains(&443), "port 80 without 443 at seq {}", snapshot.seq);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn second_apply_changes_nothing() {
    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    let resolved = stack("");
    orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();
    let mutations = cloud.mutating_calls().len();
    let requests = count(&cloud, Operation::CertificateRequest);

    let report = orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    assert!(report.is_noop(), "unexpected changes: {:?}", report.fates);
    assert_eq!(cloud.mutating_calls().len(), mutations);
    assert_eq!(count(&cloud, Operation::CertificateRequest), requests);
    assert_eq!(store.list_runs().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn image_change_rolls_the_service_and_retires_the_old_definition() {
    let context = tempfile::tempdir().unwrap();
    std::fs::write(context.path().join("main.rs"), "fn main() {}").unwrap();
    let mut resolved = stack("");
    resolved.service.image = ImageSource::Build {
        context: context.path().to_path_buf(),
        repository: "demo/app".to_string(),
    };

    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();
    let first_definition = cloud.resources_of(ResourceKind::WorkloadDefinition)[0].id.clone();

    std::fs::write(context.path().join("main.rs"), "fn main() { println!(\"v2\"); }").unwrap();
    let report = orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    assert_eq!(
        report.fate(NodeId::Image),
        Some(&NodeFate::Created { generation: 2 })
    );
    assert_eq!(
        report.fate(NodeId::WorkloadDefinition),
        Some(&NodeFate::Created { generation: 2 })
    );
    assert_eq!(
        report.fate(NodeId::ManagedService),
        Some(&NodeFate::Updated { generation: 1 })
    );
    assert_eq!(
        report.fate(NodeId::Network),
        Some(&NodeFate::Kept { generation: 1 })
    );
    assert!(
        report
            .retired
            .iter()
            .any(|label| label.ends_with("workload-definition:0000000001"))
    );

    // The old definition goes only after the service moved off it.
    let events = cloud.events();
    let service_updated = events
        .iter()
        .position(|e| e.kind == ResourceKind::ManagedService && e.mutation == Mutation::Updated)
        .expect("service updated");
    let definition_deleted = events
        .iter()
        .position(|e| e.id == first_definition && e.mutation == Mutation::Deleted)
        .expect("old definition deleted");
    assert!(service_updated < definition_deleted);
    assert_eq!(cloud.resources_of(ResourceKind::WorkloadDefinition).len(), 1);

    let history = store
        .list_history(&NodeId::WorkloadDefinition.key())
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, EntityStatus::Retired);
}

#[tokio::test(start_paused = true)]
async fn certificate_timeout_leaves_exactly_the_unblocked_work_ready() {
    let cloud = SimulatedCloud::with_faults(Faults::default().authority(AuthorityBehavior::Never));
    let store = StateStore::open_in_memory().unwrap();

    let err = orchestrator(&cloud, &stack(""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap_err();

    let ProvisionError::PartialApplyFailure {
        ref failed,
        ref skipped,
        ref ready_unused,
    } = err
    else {
        panic!("expected a partial failure, got {err}");
    };
    let failed: Vec<NodeId> = failed.iter().map(|f| f.node).collect();
    assert_eq!(failed, vec![NodeId::CertificateValidation]);
    assert!(matches!(
        err.failure_of(NodeId::CertificateValidation),
        Some(ProvisionError::ValidationTimeout { waited_ms: 90_000, .. })
    ));

    let skipped: BTreeSet<NodeId> = skipped.iter().copied().collect();
    assert_eq!(
        skipped,
        BTreeSet::from([
            NodeId::HttpsListener,
            NodeId::HttpRedirectListener,
            NodeId::ManagedService,
        ])
    );

    let ready_unused: BTreeSet<NodeId> = ready_unused.iter().copied().collect();
    assert_eq!(
        ready_unused,
        BTreeSet::from([
            NodeId::Network,
            NodeId::Boundary(BoundaryRole::Workload),
            NodeId::BoundaryRules,
            NodeId::PrivateEndpoints,
            NodeId::Cluster,
            NodeId::WorkloadDefinition,
            NodeId::EdgeRouter,
            NodeId::TargetPool,
            NodeId::Certificate,
            NodeId::ValidationRecord,
        ])
    );

    // The network completed in full; nothing listens yet.
    assert_eq!(cloud.resources_of(ResourceKind::Subnet).len(), 4);
    assert_eq!(cloud.resources_of(ResourceKind::PrivateEndpoint).len(), 3);
    assert!(cloud.resources_of(ResourceKind::Listener).is_empty());

    let record = store
        .get_entity(&NodeId::CertificateValidation.key())
        .unwrap()
        .unwrap();
    assert!(matches!(record.status, EntityStatus::Failed { terminal: true, .. }));
    let runs = store.list_runs().unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::PartiallyApplied);
    assert_eq!(runs[0].skipped.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_certificate_blocks_until_reissued() {
    let cloud = SimulatedCloud::with_faults(Faults::default().authority(AuthorityBehavior::Never));
    let store = StateStore::open_in_memory().unwrap();
    let resolved = stack("");
    orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap_err();

    // Without re-issuance nothing reaches the authority.
    let requests = count(&cloud, Operation::CertificateRequest);
    let polls = count(&cloud, Operation::CertificatePoll);
    let err = orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::CertificateTerminal { .. }));
    assert_eq!(count(&cloud, Operation::CertificateRequest), requests);
    assert_eq!(count(&cloud, Operation::CertificatePoll), polls);

    cloud.set_faults(Faults::default());
    let report = orchestrator(&cloud, &resolved, &store)
        .apply(
            ApplyOptions {
                reissue_certificate: true,
            },
            no_shutdown(),
        )
        .await
        .unwrap();
    assert_eq!(
        report.fate(NodeId::Certificate),
        Some(&NodeFate::Created { generation: 2 })
    );
    assert_eq!(
        report.fate(NodeId::CertificateValidation),
        Some(&NodeFate::Created { generation: 2 })
    );
    assert!(report.fate(NodeId::HttpsListener).is_some_and(NodeFate::is_ready));
    assert_eq!(count(&cloud, Operation::CertificateRequest), requests + 1);

    let runs = store.list_runs().unwrap();
    let outcomes: Vec<RunOutcome> = runs.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            RunOutcome::PartiallyApplied,
            RunOutcome::Rejected,
            RunOutcome::Succeeded
        ]
    );
    let timeouts = runs
        .iter()
        .filter(|r| r.outcome == RunOutcome::PartiallyApplied)
        .filter(|r| r.failed.iter().any(|f| f.starts_with("certificate-validation")))
        .count();
    assert_eq!(timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_never_duplicate_resources() {
    let faults = Faults::default()
        .transient(ResourceKind::Subnet, 2)
        .transient(ResourceKind::BoundaryRule, 1)
        .lose_responses(ResourceKind::LoadBalancer, 1)
        .lose_responses(ResourceKind::Listener, 1)
        .lose_responses(ResourceKind::ManagedService, 1);
    let cloud = SimulatedCloud::with_faults(faults);
    let store = StateStore::open_in_memory().unwrap();

    orchestrator(&cloud, &stack(""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    assert_eq!(cloud.resources_of(ResourceKind::Subnet).len(), 4);
    assert_eq!(cloud.resources_of(ResourceKind::LoadBalancer).len(), 1);
    assert_eq!(cloud.resources_of(ResourceKind::Listener).len(), 2);
    assert_eq!(cloud.resources_of(ResourceKind::ManagedService).len(), 1);
    assert!(cloud.mutating_calls().iter().any(|c| !c.ok));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_image_stalls_the_rollout() {
    let cloud = SimulatedCloud::with_faults(unhealthy(DIGEST_CHAR));
    let store = StateStore::open_in_memory().unwrap();

    let err = orchestrator(&cloud, &stack(""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap_err();

    assert!(matches!(
        err.failure_of(NodeId::ManagedService),
        Some(ProvisionError::RolloutStalled { rolled_back: false, .. })
    ));
    let ProvisionError::PartialApplyFailure { skipped, .. } = &err else {
        panic!("expected a partial failure");
    };
    assert!(skipped.is_empty());
}

fn unhealthy(digest_char: char) -> Faults {
    Faults::default().unhealthy_image(format!("sha256:{}", digest_char.to_string().repeat(8)))
}

#[tokio::test(start_paused = true)]
async fn service_left_by_a_stalled_create_is_retired_by_the_next_apply() {
    let cloud = SimulatedCloud::with_faults(unhealthy('a'));
    let store = StateStore::open_in_memory().unwrap();

    let err = orchestrator(&cloud, &stack_with_digest('a', ""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap_err();
    assert!(matches!(
        err.failure_of(NodeId::ManagedService),
        Some(ProvisionError::RolloutStalled { .. })
    ));
    let stalled = cloud.resources_of(ResourceKind::ManagedService);
    assert_eq!(stalled.len(), 1);
    let failed = store
        .get_entity(&NodeId::ManagedService.key())
        .unwrap()
        .unwrap();
    assert!(matches!(failed.status, EntityStatus::Failed { .. }));
    assert_eq!(failed.resource_id.as_ref(), Some(&stalled[0].id));

    cloud.set_faults(Faults::default());
    let report = orchestrator(&cloud, &stack_with_digest('b', ""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    assert_eq!(
        report.fate(NodeId::ManagedService),
        Some(&NodeFate::Created { generation: 2 })
    );
    let services = cloud.resources_of(ResourceKind::ManagedService);
    assert_eq!(services.len(), 1);
    assert_ne!(services[0].id, stalled[0].id);
    let service_label = format!("{}:{:010}", NodeId::ManagedService.key(), 1);
    assert!(report.retired.contains(&service_label));

    let history = store.list_history(&NodeId::ManagedService.key()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, EntityStatus::Retired);
}

#[tokio::test(start_paused = true)]
async fn stalled_in_place_rollout_keeps_the_old_revision_serving() {
    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    orchestrator(&cloud, &stack_with_digest('a', ""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();
    let before = cloud.resources_of(ResourceKind::ManagedService);
    assert_eq!(before.len(), 1);
    let serving = before[0].attributes["serving_revision"].clone();
    assert!(serving.is_string());
    let stored = store
        .get_entity(&NodeId::ManagedService.key())
        .unwrap()
        .unwrap();

    cloud.set_faults(unhealthy('b'));
    let err = orchestrator(&cloud, &stack_with_digest('b', ""), &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap_err();

    assert!(matches!(
        err.failure_of(NodeId::ManagedService),
        Some(ProvisionError::RolloutStalled { rolled_back: false, .. })
    ));

    // Same service, still on the first revision.
    let after = cloud.resources_of(ResourceKind::ManagedService);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].attributes["serving_revision"], serving);
    assert_eq!(
        store.get_entity(&NodeId::ManagedService.key()).unwrap(),
        Some(stored)
    );

    // The definition it still runs is superseded but not deleted.
    assert_eq!(cloud.resources_of(ResourceKind::WorkloadDefinition).len(), 2);
    let history = store
        .list_history(&NodeId::WorkloadDefinition.key())
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, EntityStatus::Superseded);
    let runs = store.list_runs().unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.retired.is_empty()));
    assert!(
        runs.iter()
            .any(|run| run.outcome == RunOutcome::PartiallyApplied)
    );
}

#[tokio::test(start_paused = true)]
async fn resource_removed_out_of_band_is_replaced() {
    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    let resolved = stack("");
    orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();
    let cluster = cloud.resources_of(ResourceKind::Cluster)[0].id.clone();
    assert!(cloud.remove_out_of_band(&cluster));

    let report = orchestrator(&cloud, &resolved, &store)
        .apply(ApplyOptions::default(), no_shutdown())
        .await
        .unwrap();

    assert_eq!(
        report.fate(NodeId::Cluster),
        Some(&NodeFate::Created { generation: 2 })
    );
    // A service cannot move clusters in place.
    assert_eq!(
        report.fate(NodeId::ManagedService),
        Some(&NodeFate::Created { generation: 2 })
    );
    assert_eq!(cloud.resources_of(ResourceKind::Cluster).len(), 1);
    assert_eq!(cloud.resources_of(ResourceKind::ManagedService).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_apply_starts_nothing() {
    let cloud = SimulatedCloud::new();
    let store = StateStore::open_in_memory().unwrap();
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let err = orchestrator(&cloud, &stack(""), &store)
        .apply(ApplyOptions::default(), rx)
        .await
        .unwrap_err();

    let ProvisionError::PartialApplyFailure {
        failed, skipped, ..
    } = &err
    else {
        panic!("expected a partial failure");
    };
    assert!(failed.is_empty());
    assert_eq!(skipped.len(), NodeId::ALL.len());
    assert!(cloud.mutating_calls().is_empty());
}
