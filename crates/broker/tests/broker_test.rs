//! Broker integration tests against the in-process mock agent.

use std::sync::Arc;
use std::time::Duration;

use sandpiper_broker::testing::MockAgent;
use sandpiper_broker::{ops, Broker, BrokerConfig, BrokerError, ProcessState};
use tonic::Code;

async fn broker_for(agents: &[&MockAgent], expiry: Duration) -> Arc<Broker> {
    let endpoints: Vec<String> = agents.iter().map(|a| a.endpoint()).collect();
    let config = BrokerConfig {
        context_expiry: expiry,
        ..Default::default()
    };
    Broker::connect(&endpoints, config)
        .await
        .expect("broker connect")
}

#[tokio::test]
async fn startup_reclaims_leftover_sandboxes() {
    let agent = MockAgent::spawn().await;
    let _broker = broker_for(&[&agent], Duration::from_secs(60)).await;
    assert_eq!(agent.close_all_count(), 1);
}

#[tokio::test]
async fn lease_release_and_expire_closes_exactly_once() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_millis(150)).await;

    let lease = broker.lease("app1", "", "w1").await.expect("lease");
    assert_eq!(agent.open_count(), 1);
    assert_eq!(broker.agent_loads().await, vec![1]);

    let open = agent.last_open().expect("open request");
    assert_eq!(open.worktree_id, "w1");
    assert_eq!(open.source_worktree_id, "");
    assert_eq!(open.ports, vec![8080, 2089]);

    drop(lease);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(agent.close_count(), 1);
    assert_eq!(broker.agent_loads().await, vec![0]);
    assert_eq!(broker.live_contexts().await, 0);
}

#[tokio::test]
async fn placement_balances_across_agents_in_order() {
    let a = MockAgent::spawn().await;
    let b = MockAgent::spawn().await;
    let broker = broker_for(&[&a, &b], Duration::from_secs(60)).await;

    let _l1 = broker.lease("app1", "", "w1").await.expect("lease app1");
    let _l2 = broker.lease("app2", "", "w2").await.expect("lease app2");
    let _l3 = broker.lease("app3", "", "w3").await.expect("lease app3");

    // Ties break toward configuration order, so the first agent gets two.
    assert_eq!(broker.agent_loads().await, vec![2, 1]);
    assert_eq!(a.open_count(), 2);
    assert_eq!(b.open_count(), 1);
}

#[tokio::test]
async fn concurrent_leases_coalesce_onto_one_open() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_secs(60)).await;

    let (l1, l2) = tokio::join!(
        broker.lease("app1", "", "w1"),
        broker.lease("app1", "", "w1")
    );
    let l1 = l1.expect("first lease");
    let l2 = l2.expect("second lease");

    assert_eq!(agent.open_count(), 1);
    assert!(Arc::ptr_eq(l1.context(), l2.context()));
    assert_eq!(broker.app_ref_count("app1").await, Some(2));

    drop(l1);
    drop(l2);
    assert_eq!(broker.app_ref_count("app1").await, Some(0));
}

#[tokio::test]
async fn worktree_mismatch_is_rejected_without_a_new_open() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_secs(60)).await;

    let _lease = broker.lease("app1", "", "w1").await.expect("lease");
    let err = broker.lease("app1", "", "w2").await.unwrap_err();
    assert!(matches!(err, BrokerError::InconsistentWorktree { .. }));
    assert_eq!(agent.open_count(), 1);
}

#[tokio::test]
async fn sequential_lease_release_reuses_one_sandbox() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_millis(300)).await;

    for _ in 0..5 {
        let lease = broker.lease("app1", "", "w1").await.expect("lease");
        drop(lease);
    }
    assert_eq!(agent.open_count(), 1);
    assert_eq!(agent.close_count(), 0);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(agent.close_count(), 1);
}

#[tokio::test]
async fn held_leases_block_expiry() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_millis(100)).await;

    let l1 = broker.lease("app1", "", "w1").await.expect("lease one");
    let l2 = broker.lease("app1", "", "w1").await.expect("lease two");

    // Several expiry windows pass while both leases are out.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agent.close_count(), 0);
    assert_eq!(broker.live_contexts().await, 1);

    drop(l1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agent.close_count(), 0);

    drop(l2);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(agent.close_count(), 1);
    assert_eq!(broker.agent_loads().await, vec![0]);
}

#[tokio::test]
async fn tracker_notifies_subscribers_on_change_only() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_secs(60)).await;

    let lease = broker.lease("app1", "", "w1").await.expect("lease");
    let (sub_id, mut states) = lease.subscribe_state();

    // The current state arrives immediately.
    assert_eq!(states.recv().await, Some(ProcessState::NotRunning));

    // A stream of identical polls produces no further events.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(states.try_recv().is_err());

    agent.set_app_state(ProcessState::Running);
    let next = tokio::time::timeout(Duration::from_secs(2), states.recv())
        .await
        .expect("state change within two seconds");
    assert_eq!(next, Some(ProcessState::Running));

    agent.set_app_state(ProcessState::Finished);
    let next = tokio::time::timeout(Duration::from_secs(2), states.recv())
        .await
        .expect("second state change");
    assert_eq!(next, Some(ProcessState::Finished));

    lease.unsubscribe_state(sub_id);
}

#[tokio::test]
async fn stale_close_counts_as_a_clean_teardown() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_millis(150)).await;

    agent.fail_close(Code::InvalidArgument, "no such context");

    let lease = broker.lease("app1", "", "w1").await.expect("lease");
    drop(lease);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(agent.close_attempts(), 1);
    assert_eq!(broker.live_contexts().await, 0);
    assert_eq!(broker.agent_loads().await, vec![0]);

    // The app can come back afterwards.
    let _lease = broker.lease("app1", "", "w1").await.expect("re-lease");
    assert_eq!(agent.open_count(), 2);
}

#[tokio::test]
async fn fatal_close_fences_the_context_forever() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_millis(150)).await;

    agent.fail_close(Code::Internal, "disk exploded");

    let lease = broker.lease("app1", "", "w1").await.expect("lease");
    drop(lease);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(agent.close_attempts() >= 1);

    // The entry stays in the registry so the app can never be reopened,
    // and new leases fail fast instead of blocking on the leaked fence.
    assert_eq!(broker.live_contexts().await, 1);
    let err = broker.lease("app1", "", "w1").await.unwrap_err();
    assert!(matches!(err, BrokerError::PoisonedContext { .. }));
    assert_eq!(agent.open_count(), 1);

    // Other apps are unaffected.
    let _other = broker.lease("app2", "", "w2").await.expect("other app");
    assert_eq!(agent.open_count(), 2);
}

#[tokio::test]
async fn counters_match_live_contexts_at_quiescence() {
    let a = MockAgent::spawn().await;
    let b = MockAgent::spawn().await;
    let broker = broker_for(&[&a, &b], Duration::from_millis(150)).await;

    let l1 = broker.lease("app1", "", "w1").await.expect("app1");
    let _l2 = broker.lease("app2", "", "w2").await.expect("app2");
    let _l3 = broker.lease("app3", "", "w3").await.expect("app3");

    let loads = broker.agent_loads().await;
    assert_eq!(loads.iter().sum::<usize>(), broker.live_contexts().await);

    drop(l1);
    tokio::time::sleep(Duration::from_millis(700)).await;

    let loads = broker.agent_loads().await;
    assert_eq!(loads.iter().sum::<usize>(), broker.live_contexts().await);
    assert_eq!(broker.live_contexts().await, 2);
}

#[tokio::test]
async fn existing_lease_only_returns_live_contexts() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_secs(60)).await;

    assert!(broker
        .existing_lease("app1")
        .await
        .expect("existing")
        .is_none());

    let lease = broker.lease("app1", "", "w1").await.expect("lease");
    let second = broker
        .existing_lease("app1")
        .await
        .expect("existing")
        .expect("context is live");
    assert!(Arc::ptr_eq(lease.context(), second.context()));
    assert_eq!(agent.open_count(), 1);
}

#[tokio::test]
async fn context_ops_reach_the_sandbox_services() {
    let agent = MockAgent::spawn().await;
    let broker = broker_for(&[&agent], Duration::from_secs(60)).await;

    let lease = broker.lease("app1", "", "w1").await.expect("lease");

    ops::configure_process(
        &lease,
        "app",
        &["/scripts/log_run".to_string(), "npm start".to_string()],
        "/app",
        8080,
        &[("PORT".to_string(), "8080".to_string())],
    )
    .await
    .expect("configure");
    assert_eq!(agent.configure_count(), 1);

    ops::restart_process(
        &lease,
        "app",
        &["/scripts/log_run".to_string(), "npm start".to_string()],
        &[],
    )
    .await
    .expect("restart");
    assert_eq!(agent.restart_count(), 1);

    ops::run_task(&lease, "sync_types", &[], true)
        .await
        .expect("run task");
    assert_eq!(agent.exec_tasks(), vec!["sync_types".to_string()]);

    ops::save_worktree(&lease).await.expect("save");
    assert_eq!(agent.save_count(), 1);
}
