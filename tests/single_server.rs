//! A single-server cluster can be created and commits entries to itself.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::MemLog;
use fixtures::MemStateMachine;
use fixtures::TestNetwork;
use ovraft::error::CommandStatus;
use ovraft::raft_types::ServerId;
use ovraft::Config;
use ovraft::Raft;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_and_commit() {
    let id = ServerId::new();
    let config = Config::build("test-cluster".into()).validate().unwrap();
    let network = TestNetwork::new();
    let state_machine = Arc::new(MemStateMachine::default());
    let log = MemLog::default();

    let raft = Raft::new(id, "tcp:127.0.0.1:9000".into(), config, network.clone(), state_machine.clone(), log);
    network.register(id, "tcp:127.0.0.1:9000", raft.clone());

    raft.initialize().await.expect("initialize");

    let status = tokio::time::timeout(Duration::from_secs(5), raft.client_write(b"hello".to_vec()))
        .await
        .expect("no timeout")
        .expect("no protocol error");
    assert_eq!(status, CommandStatus::Success);

    let applied = state_machine.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1, b"hello".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_before_initialize_is_rejected() {
    let id = ServerId::new();
    let config = Config::build("test-cluster".into()).validate().unwrap();
    let network = TestNetwork::new();
    let state_machine = Arc::new(MemStateMachine::default());
    let log = MemLog::default();

    let raft = Raft::new(id, "tcp:127.0.0.1:9001".into(), config, network.clone(), state_machine, log);
    network.register(id, "tcp:127.0.0.1:9001", raft.clone());

    let status = tokio::time::timeout(Duration::from_secs(2), raft.client_write(b"x".to_vec()))
        .await
        .expect("no timeout")
        .expect("no protocol error");
    assert_eq!(status, CommandStatus::NotLeader);
}

/// Scenario 1 (§8): after a restart, replaying the log file reproduces
/// `cluster_id`, the committed entry, and enough membership state for the
/// sole server to resume as leader without a fresh `initialize`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_replays_log_and_resumes_leadership() {
    let id = ServerId::new();
    let config = Config::build("test-cluster".into()).validate().unwrap();
    let network = TestNetwork::new();
    let state_machine = Arc::new(MemStateMachine::default());
    let log = MemLog::default();

    let raft = Raft::new(
        id,
        "tcp:127.0.0.1:9002".into(),
        config.clone(),
        network.clone(),
        state_machine.clone(),
        log.clone(),
    );
    network.register(id, "tcp:127.0.0.1:9002", raft.clone());
    raft.initialize().await.expect("initialize");

    let status = tokio::time::timeout(Duration::from_secs(5), raft.client_write(b"x".to_vec()))
        .await
        .expect("no timeout")
        .expect("no protocol error");
    assert_eq!(status, CommandStatus::Success);

    let before = raft.metrics();
    assert_eq!(before.last_log_index, 2);
    raft.close().await;

    let network2 = TestNetwork::new();
    let restarted = Raft::new(
        id,
        "tcp:127.0.0.1:9002".into(),
        config,
        network2.clone(),
        state_machine,
        log.reopen(),
    );
    network2.register(id, "tcp:127.0.0.1:9002", restarted.clone());

    let mut wait = restarted.wait(Duration::from_secs(5));
    let after = wait.state(ovraft::State::Leader).await.expect("resumed as leader");
    assert_eq!(after.cluster_id, before.cluster_id);
    assert_eq!(after.last_log_index, 2);
    assert!(!restarted.is_joining());
}
