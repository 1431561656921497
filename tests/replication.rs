//! Growing a single-server cluster to three servers via `AddServer`, then
//! confirming a write committed on the leader replicates to both followers.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::MemLog;
use fixtures::MemStateMachine;
use fixtures::TestNetwork;
use ovraft::error::CommandStatus;
use ovraft::error::ServerOpStatus;
use ovraft::raft_types::ServerId;
use ovraft::Config;
use ovraft::Raft;

fn spawn_node(
    id: ServerId,
    address: &str,
    network: Arc<TestNetwork>,
) -> (Raft, Arc<MemStateMachine>) {
    let config = Config::build("test-cluster".into())
        .election_timeout_min(150)
        .election_timeout_max(300)
        .heartbeat_interval(20)
        .validate()
        .unwrap();
    let state_machine = Arc::new(MemStateMachine::default());
    let log = MemLog::default();
    let raft = Raft::new(id, address.to_string(), config, network.clone(), state_machine.clone(), log);
    network.register(id, address, raft.clone());
    (raft, state_machine)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_replicates_writes() {
    let network = TestNetwork::new();

    let leader_id = ServerId::new();
    let (leader, leader_sm) = spawn_node(leader_id, "mem:leader", network.clone());
    leader.initialize().await.expect("initialize");

    let follower_a_id = ServerId::new();
    let (_follower_a, sm_a) = spawn_node(follower_a_id, "mem:a", network.clone());
    let follower_b_id = ServerId::new();
    let (_follower_b, sm_b) = spawn_node(follower_b_id, "mem:b", network.clone());

    let add_a = leader.add_server(follower_a_id, "mem:a".into()).await;
    assert_eq!(add_a, ServerOpStatus::Success);
    // Single-server-at-a-time reconfiguration: wait for this add to commit
    // before starting the next one, or it would be rejected as InProgress.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let add_b = leader.add_server(follower_b_id, "mem:b".into()).await;
    assert_eq!(add_b, ServerOpStatus::Success);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = tokio::time::timeout(Duration::from_secs(5), leader.client_write(b"v1".to_vec()))
        .await
        .expect("no timeout")
        .expect("no protocol error");
    assert_eq!(status, CommandStatus::Success);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(leader_sm.applied.lock().unwrap().len(), 1);
    assert_eq!(sm_a.applied.lock().unwrap().len(), 1);
    assert_eq!(sm_b.applied.lock().unwrap().len(), 1);
}
