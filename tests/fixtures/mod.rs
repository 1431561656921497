//! Shared test harness: an in-memory record log, state machine, and a
//! routing-table network that wires a set of `Raft` handles together.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use ovraft::codec::Envelope;
use ovraft::log::Record;
use ovraft::network::RaftNetwork;
use ovraft::raft_types::ServerId;
use ovraft::state_machine::StateMachine;
use ovraft::Raft;
use ovraft::RecordLog;

/// An in-memory stand-in for the append-only record log.
///
/// Backed by a shared `Vec<Record>` so a test can simulate a restart: call
/// [`MemLog::reopen`] to get a fresh read cursor over the same underlying
/// records, the way re-`open`ing the same file on disk would (§4.9).
#[derive(Default, Clone)]
pub struct MemLog {
    records: Arc<Mutex<Vec<Record>>>,
    cursor: usize,
}

impl MemLog {
    /// A handle over the same records, positioned at the start, as if the
    /// file had just been re-opened after a crash/restart.
    pub fn reopen(&self) -> Self {
        Self {
            records: self.records.clone(),
            cursor: 0,
        }
    }
}

impl RecordLog for MemLog {
    fn read_next_record(&mut self) -> anyhow::Result<Option<Record>> {
        let records = self.records.lock().unwrap();
        if self.cursor < records.len() {
            let record = records[self.cursor].clone();
            self.cursor += 1;
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    fn append_record(&mut self, record: &Record) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        records.push(record.clone());
        self.cursor = records.len();
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn replace_start(&mut self, header: &Record, snapshot: &Record) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        *records = vec![header.clone(), snapshot.clone()];
        self.cursor = records.len();
        Ok(())
    }

    fn replace_commit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn replace_abort(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An in-memory application: records every applied `(index, data)` pair.
#[derive(Default)]
pub struct MemStateMachine {
    pub applied: Mutex<Vec<(u64, Vec<u8>)>>,
}

#[async_trait]
impl StateMachine for MemStateMachine {
    async fn apply(&self, index: u64, data: &[u8]) {
        self.applied.lock().unwrap().push((index, data.to_vec()));
    }

    async fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    async fn restore(&self, _data: &[u8]) {
        self.applied.lock().unwrap().clear();
    }
}

/// A network that delivers `send` calls directly into other nodes' inboxes
/// via a shared routing table, optionally dropping traffic to/from
/// "isolated" nodes to simulate a partition.
#[derive(Default)]
pub struct TestNetwork {
    routes: Mutex<HashMap<ServerId, Raft>>,
    by_address: Mutex<HashMap<String, ServerId>>,
    isolated: Mutex<std::collections::BTreeSet<ServerId>>,
}

impl TestNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: ServerId, address: &str, handle: Raft) {
        self.routes.lock().unwrap().insert(id, handle);
        self.by_address.lock().unwrap().insert(address.to_string(), id);
    }

    pub fn isolate(&self, id: ServerId) {
        self.isolated.lock().unwrap().insert(id);
    }

    pub fn heal(&self, id: ServerId) {
        self.isolated.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl RaftNetwork for TestNetwork {
    async fn send(&self, target: ServerId, envelope: Envelope) {
        let isolated = self.isolated.lock().unwrap();
        if isolated.contains(&target) || isolated.contains(&envelope.from) {
            return;
        }
        drop(isolated);
        let handle = self.routes.lock().unwrap().get(&target).cloned();
        if let Some(handle) = handle {
            handle.receive(envelope);
        }
    }

    async fn dial(&self, address: &str, envelope: Envelope) {
        let target = self.by_address.lock().unwrap().get(address).copied();
        if let Some(target) = target {
            self.send(target, envelope).await;
        }
    }
}
