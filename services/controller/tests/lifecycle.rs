//! End-to-end lifecycle of machines and experiment tasks through a live
//! controller: create, converge, expire, recover, delete.

mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use faultline_controller::reconcile::MACHINE_FINALIZER;
use faultline_store::{Object, SessionHealth, TaskPhase};
use faultline_wire::FaultKind;
use harness::{fast_config, key, machine, task, FakeAgent, TestCluster};

#[tokio::test]
async fn machine_create_fetch_delete() {
    let cluster = TestCluster::start(FakeAgent::new(), fast_config()).await;

    let created = cluster
        .machines
        .create(machine("foo", "http://123.123.123.123:2333"))
        .await
        .unwrap();
    assert!(created.meta.uid.is_some());
    assert_eq!(created.meta.resource_version, 1);

    let fetched = cluster.machines.get(&key("foo")).await.unwrap();
    assert_eq!(fetched.spec.address, "http://123.123.123.123:2333");

    // The controller takes its teardown finalizer shortly after create.
    harness::wait_until("machine finalizer to be added", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("foo"))
                .await
                .map(|m| m.meta.has_finalizer(MACHINE_FINALIZER))
                .unwrap_or(false)
        }
    })
    .await;

    cluster.machines.delete(&key("foo")).await.unwrap();
    harness::wait_for_gone(&cluster.machines, &key("foo")).await;

    // No task ever referenced it, so no session was ever attempted.
    assert_eq!(cluster.agent.authenticate_calls.load(Ordering::SeqCst), 0);
    cluster.stop().await;
}

#[tokio::test]
async fn fault_lifecycle_runs_to_recovered_without_user_action() {
    let agent = FakeAgent::new();
    let cluster = TestCluster::start(agent.clone(), fast_config()).await;

    cluster
        .machines
        .create(machine("foo", "http://123.123.123.123:2333"))
        .await
        .unwrap();

    let mut events = cluster.tasks.watch().await;
    let created = cluster
        .tasks
        .create(task("net-delay", "foo", FaultKind::NetworkDelay, Some(1)))
        .await
        .unwrap();
    let task_key = created.key();

    harness::wait_for_phase(&cluster.tasks, &task_key, TaskPhase::Recovered).await;

    let finished = cluster.tasks.get(&task_key).await.unwrap();
    let applied_at = finished.status.applied_at.unwrap();
    let expired_at = finished.status.expired_at.unwrap();
    let recovered_at = finished.status.recovered_at.unwrap();
    assert!(applied_at <= expired_at);
    assert!(expired_at <= recovered_at);
    assert!(finished.status.last_error.is_none());
    assert!(!finished.status.orphaned);

    // Observable phase order, deduplicated across status writes.
    let phases = harness::phase_transitions(&mut events);
    assert_eq!(
        phases,
        vec![
            TaskPhase::Pending,
            TaskPhase::Applying,
            TaskPhase::Applied,
            TaskPhase::Expired,
            TaskPhase::Recovering,
            TaskPhase::Recovered,
        ]
    );

    // Exactly one injection and one removal reached the host.
    assert_eq!(agent.apply_calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.recover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.active_fault_count(), 0);

    // The session established for the experiment shows on the machine.
    let m = cluster.machines.get(&key("foo")).await.unwrap();
    assert_eq!(m.status.session, SessionHealth::Connected);
    assert!(m.status.last_reachable_at.is_some());

    cluster.stop().await;
}

#[tokio::test]
async fn task_without_duration_stays_applied_until_deleted() {
    let agent = FakeAgent::new();
    let cluster = TestCluster::start(agent.clone(), fast_config()).await;

    cluster
        .machines
        .create(machine("db-1", "http://10.0.0.7:2333"))
        .await
        .unwrap();
    let created = cluster
        .tasks
        .create(task("partition", "db-1", FaultKind::NetworkPartition, None))
        .await
        .unwrap();
    let task_key = created.key();

    harness::wait_for_phase(&cluster.tasks, &task_key, TaskPhase::Applied).await;

    // Several resync periods later it is still applied, with no retries.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let current = cluster.tasks.get(&task_key).await.unwrap();
    assert_eq!(current.status.phase, TaskPhase::Applied);
    assert!(current.status.expired_at.is_none());
    assert_eq!(agent.apply_calls.load(Ordering::SeqCst), 1);

    // Only deletion ends an open-ended experiment.
    cluster.tasks.delete(&task_key).await.unwrap();
    harness::wait_for_gone(&cluster.tasks, &task_key).await;
    assert_eq!(agent.recover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.active_fault_count(), 0);

    cluster.stop().await;
}
