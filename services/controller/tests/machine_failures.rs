//! Host-side failure handling: invalid addresses, rejected credentials,
//! and hosts that stop answering altogether.

mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use faultline_store::{modify, ErrorKind, Object, SessionHealth, TaskPhase};
use faultline_wire::FaultKind;
use harness::{fast_config, key, machine, task, FakeAgent, TestCluster};

#[tokio::test]
async fn malformed_address_never_touches_the_network() {
    let agent = FakeAgent::new();
    let cluster = TestCluster::start(agent.clone(), fast_config()).await;

    cluster
        .machines
        .create(machine("foo", "not-a-url"))
        .await
        .unwrap();
    let created = cluster
        .tasks
        .create(task("delay", "foo", FaultKind::NetworkDelay, None))
        .await
        .unwrap();

    harness::wait_until("machine to be rejected as misconfigured", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("foo"))
                .await
                .map(|m| m.status.session == SessionHealth::ConfigRejected)
                .unwrap_or(false)
        }
    })
    .await;
    harness::wait_for_phase(&cluster.tasks, &created.key(), TaskPhase::Failed).await;

    let m = cluster.machines.get(&key("foo")).await.unwrap();
    assert_eq!(m.status.last_error.unwrap().class, ErrorKind::Config);
    let t = cluster.tasks.get(&created.key()).await.unwrap();
    assert_eq!(t.status.last_error.unwrap().class, ErrorKind::Config);

    // A bad address is settled by inspection alone.
    assert_eq!(cluster.sessions.connect_attempts(&key("foo")).await, 0);
    assert_eq!(agent.authenticate_calls.load(Ordering::SeqCst), 0);

    cluster.stop().await;
}

#[tokio::test]
async fn rejected_credentials_latch_until_spec_changes() {
    let agent = FakeAgent::new();
    agent.require_credential("rotated-secret");
    let cluster = TestCluster::start(agent.clone(), fast_config()).await;

    let mut m = machine("vault-7", "http://10.9.0.3:2333");
    m.spec.credentials = Some("expired-secret".to_string());
    cluster.machines.create(m).await.unwrap();
    let created = cluster
        .tasks
        .create(task("kill", "vault-7", FaultKind::ProcessKill, None))
        .await
        .unwrap();

    harness::wait_until("auth failure to reach machine status", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("vault-7"))
                .await
                .map(|m| m.status.session == SessionHealth::AuthFailed)
                .unwrap_or(false)
        }
    })
    .await;
    assert_eq!(agent.authenticate_calls.load(Ordering::SeqCst), 1);

    // Resyncs keep coming; none of them replays the rejected credential.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(agent.authenticate_calls.load(Ordering::SeqCst), 1);
    let waiting = cluster.tasks.get(&created.key()).await.unwrap();
    assert_eq!(waiting.status.phase, TaskPhase::Applying);
    assert_eq!(waiting.status.last_error.unwrap().class, ErrorKind::Auth);

    // Fixing the credential unlatches the slot on the next pass.
    modify(&cluster.machines, &key("vault-7"), |m| {
        m.spec.credentials = Some("rotated-secret".to_string());
    })
    .await
    .unwrap();

    harness::wait_for_phase(&cluster.tasks, &created.key(), TaskPhase::Applied).await;
    assert_eq!(agent.authenticate_calls.load(Ordering::SeqCst), 2);
    harness::wait_until("machine to report the live session", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("vault-7"))
                .await
                .map(|m| m.status.session == SessionHealth::Connected)
                .unwrap_or(false)
        }
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn unreachable_host_escalates_after_backoff_ceiling() {
    let agent = FakeAgent::new();
    agent.set_refuse_connections(true);
    let cluster = TestCluster::start(agent.clone(), fast_config()).await;

    cluster
        .machines
        .create(machine("edge-9", "http://172.16.3.9:2333"))
        .await
        .unwrap();
    let created = cluster
        .tasks
        .create(task("loss", "edge-9", FaultKind::NetworkLoss, None))
        .await
        .unwrap();

    harness::wait_until("machine to be marked unreachable", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("edge-9"))
                .await
                .map(|m| m.status.session == SessionHealth::Unreachable)
                .unwrap_or(false)
        }
    })
    .await;

    // The ceiling caps how hard a dead host gets hammered.
    assert_eq!(cluster.sessions.connect_attempts(&key("edge-9")).await, 3);
    let t = cluster.tasks.get(&created.key()).await.unwrap();
    assert_eq!(t.status.last_error.unwrap().class, ErrorKind::Unreachable);

    // Inside the reduced-frequency window no further attempts are made,
    // resyncs or not.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cluster.sessions.connect_attempts(&key("edge-9")).await, 3);
    assert_eq!(agent.authenticate_calls.load(Ordering::SeqCst), 0);

    cluster.stop().await;
}

#[tokio::test]
async fn unreachable_host_recovers_without_operator_help() {
    let agent = FakeAgent::new();
    agent.set_refuse_connections(true);
    let mut config = fast_config();
    config.unreachable_probe_interval = Duration::from_millis(250);
    let cluster = TestCluster::start(agent.clone(), config).await;

    cluster
        .machines
        .create(machine("edge-9", "http://172.16.3.9:2333"))
        .await
        .unwrap();
    let created = cluster
        .tasks
        .create(task("loss", "edge-9", FaultKind::NetworkLoss, None))
        .await
        .unwrap();

    harness::wait_until("machine to be marked unreachable", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("edge-9"))
                .await
                .map(|m| m.status.session == SessionHealth::Unreachable)
                .unwrap_or(false)
        }
    })
    .await;

    // The host comes back; the next scheduled probe window reconnects
    // and the experiment proceeds with nobody touching the task.
    agent.set_refuse_connections(false);
    harness::wait_for_phase(&cluster.tasks, &created.key(), TaskPhase::Applied).await;

    harness::wait_until("machine to report the live session", || {
        let machines = cluster.machines.clone();
        async move {
            machines
                .get(&key("edge-9"))
                .await
                .map(|m| m.status.session == SessionHealth::Connected)
                .unwrap_or(false)
        }
    })
    .await;

    cluster.stop().await;
}
