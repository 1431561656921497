//! The fsync worker and the durability-waiter queue (§5).
//!
//! The record log's `commit` call is potentially slow (a real fsync), so it
//! is not performed inline on the main event loop. Instead a single
//! background OS thread owns the log and performs commits; the main loop
//! publishes a `requested` sequence number every time it appends something
//! that needs to become durable, and the worker publishes `durable` once it
//! has synced up to that point. Anything gated on durability (a positive
//! `AppendReply`, a vote grant, the leader's own `match_index` advancing) is
//! queued against the `requested` value in effect when it was produced and
//! released once `durable` reaches it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::log::RecordLog;
use crate::log::Record;

/// The monotone `requested`/`durable` counters shared between the main loop
/// and the fsync worker thread.
#[derive(Debug, Default)]
struct Counters {
    requested: u64,
    durable: u64,
    /// Set once the worker thread has exited after a fatal log error.
    failed: bool,
}

/// A handle the main loop holds to request durability and be notified of
/// progress. Cloning shares the same underlying counters and queue.
pub struct DurabilityHandle {
    shared: Arc<(Mutex<Counters>, Condvar)>,
    to_worker: std::sync::mpsc::Sender<WorkerMsg>,
    /// Async-friendly mirror of `durable`, for the main loop's `tokio::select!`.
    durable_rx: watch::Receiver<u64>,
    /// Held so `close()` can join the worker thread instead of merely
    /// detaching it (§6.3: `close` "joins the fsync worker").
    thread: Option<std::thread::JoinHandle<()>>,
}

enum WorkerMsg {
    Append(Record),
    Commit,
    Shutdown,
}

impl DurabilityHandle {
    /// Spawn the fsync worker thread, taking ownership of `log`.
    pub fn spawn<L: RecordLog>(mut log: L) -> Self {
        let shared = Arc::new((Mutex::new(Counters::default()), Condvar::new()));
        let (tx, rx) = std::sync::mpsc::channel::<WorkerMsg>();
        let (durable_tx, durable_rx) = watch::channel(0u64);

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("ovraft-fsync".to_string())
            .spawn(move || {
                let (lock, cvar) = &*worker_shared;
                loop {
                    match rx.recv() {
                        Ok(WorkerMsg::Append(record)) => {
                            if let Err(err) = log.append_record(&record) {
                                tracing::error!(?err, "record log append failed");
                                let mut counters = lock.lock().unwrap();
                                counters.failed = true;
                                cvar.notify_all();
                                continue;
                            }
                        }
                        Ok(WorkerMsg::Commit) => {
                            let result = log.commit();
                            let mut counters = lock.lock().unwrap();
                            match result {
                                Ok(()) => {
                                    counters.durable = counters.requested;
                                }
                                Err(err) => {
                                    tracing::error!(?err, "record log fsync failed");
                                    counters.failed = true;
                                }
                            }
                            let _ = durable_tx.send(counters.durable);
                            cvar.notify_all();
                        }
                        Ok(WorkerMsg::Shutdown) | Err(_) => break,
                    }
                }
            })
            .expect("failed to spawn fsync worker thread");

        Self {
            shared,
            to_worker: tx,
            durable_rx,
            thread: Some(thread),
        }
    }

    /// Signal the worker to stop and block until its thread has exited.
    pub fn shutdown_and_join(&mut self) {
        let _ = self.to_worker.send(WorkerMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// An async-friendly receiver that changes every time `durable` advances.
    pub fn durable_receiver(&self) -> watch::Receiver<u64> {
        self.durable_rx.clone()
    }

    /// Append `record` and bump `requested`, returning the sequence number
    /// this append must reach `durable` to be considered synced.
    pub fn request(&self, record: Record) -> u64 {
        let (lock, _cvar) = &*self.shared;
        let seq = {
            let mut counters = lock.lock().unwrap();
            counters.requested += 1;
            counters.requested
        };
        let _ = self.to_worker.send(WorkerMsg::Append(record));
        let _ = self.to_worker.send(WorkerMsg::Commit);
        seq
    }

    /// The most recently observed durable sequence number.
    pub fn durable_seq(&self) -> u64 {
        let (lock, _cvar) = &*self.shared;
        lock.lock().unwrap().durable
    }

    pub fn has_failed(&self) -> bool {
        let (lock, _cvar) = &*self.shared;
        lock.lock().unwrap().failed
    }

    /// Block the calling (non-async) context until `seq` is durable or the
    /// worker fails. Used only from blocking contexts; the async path uses
    /// `DurabilityWaiters` instead.
    pub fn block_until_durable(&self, seq: u64) -> bool {
        let (lock, cvar) = &*self.shared;
        let mut counters = lock.lock().unwrap();
        while counters.durable < seq && !counters.failed {
            counters = cvar.wait(counters).unwrap();
        }
        !counters.failed
    }
}

impl Drop for DurabilityHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// FIFO queue of actions deferred until a given `requested` sequence number
/// becomes durable, drained from the async main loop each time the worker
/// reports progress.
#[derive(Default)]
pub struct DurabilityWaiters {
    queue: VecDeque<(u64, oneshot::Sender<bool>)>,
}

impl DurabilityWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `seq` becoming durable; resolves to `true` once
    /// it does, or `false` if the log failed first.
    pub fn wait_for(&mut self, seq: u64) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.queue.push_back((seq, tx));
        rx
    }

    /// Release every waiter whose sequence number is now durable.
    pub fn release_up_to(&mut self, durable: u64) {
        while let Some((seq, _)) = self.queue.front() {
            if *seq > durable {
                break;
            }
            let (_, tx) = self.queue.pop_front().unwrap();
            let _ = tx.send(true);
        }
    }

    /// Fail every outstanding waiter, e.g. after the log worker dies.
    pub fn fail_all(&mut self) {
        while let Some((_, tx)) = self.queue.pop_front() {
            let _ = tx.send(false);
        }
    }
}
