//! A server started with `Raft::join` dials an existing one-server cluster
//! and becomes a voting member through the ordinary `AddServer` catchup
//! path (§4.3, §6.3).

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::MemLog;
use fixtures::MemStateMachine;
use fixtures::TestNetwork;
use ovraft::raft_types::ServerId;
use ovraft::Config;
use ovraft::Raft;

fn test_config() -> Config {
    Config::build("test-cluster".into())
        .election_timeout_min(150)
        .election_timeout_max(300)
        .heartbeat_interval(20)
        .validate()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_dials_and_catches_up() {
    let network = TestNetwork::new();

    let leader_id = ServerId::new();
    let leader = Raft::new(
        leader_id,
        "mem:leader".into(),
        test_config(),
        network.clone(),
        Arc::new(MemStateMachine::default()),
        MemLog::default(),
    );
    network.register(leader_id, "mem:leader", leader.clone());
    leader.initialize().await.expect("initialize");

    let joiner_id = ServerId::new();
    let joiner = Raft::join(
        joiner_id,
        "mem:joiner".into(),
        test_config(),
        network.clone(),
        Arc::new(MemStateMachine::default()),
        MemLog::default(),
        vec!["mem:leader".into()],
        None,
    );
    network.register(joiner_id, "mem:joiner", joiner.clone());

    let mut wait = joiner.wait(Duration::from_secs(5));
    wait.metrics(|m| !m.joining, "joined")
        .await
        .expect("joiner becomes a voting member");

    assert_eq!(joiner.cluster_id(), leader.cluster_id());
    assert!(!joiner.is_joining());

    let leader_metrics = leader.metrics();
    assert!(leader_metrics.leader_metrics.unwrap().replication.contains_key(&joiner_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_rejects_unexpected_cluster_id() {
    let network = TestNetwork::new();

    let leader_id = ServerId::new();
    let leader = Raft::new(
        leader_id,
        "mem:leader".into(),
        test_config(),
        network.clone(),
        Arc::new(MemStateMachine::default()),
        MemLog::default(),
    );
    network.register(leader_id, "mem:leader", leader.clone());
    leader.initialize().await.expect("initialize");

    let wrong_expected = ovraft::raft_types::ClusterId(uuid::Uuid::new_v4());
    let joiner_id = ServerId::new();
    let joiner = Raft::join(
        joiner_id,
        "mem:joiner".into(),
        test_config(),
        network.clone(),
        Arc::new(MemStateMachine::default()),
        MemLog::default(),
        vec!["mem:leader".into()],
        Some(wrong_expected),
    );
    network.register(joiner_id, "mem:joiner", joiner.clone());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(joiner.cluster_id().is_none());
    assert!(joiner.is_joining());
}
