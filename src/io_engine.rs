//! I/O completion engine (§4.2).
//!
//! The source dispatches reads through a Windows completion port; a worker
//! thread pops a priority-ordered task queue and runs it. We keep that
//! shape — a bounded worker pool draining a priority queue behind a lock,
//! one task per outstanding request — but each worker issues its read
//! *synchronously* rather than waiting on an overlapped completion. The
//! pool is still where the concurrency comes from: while one worker blocks
//! on disk, the others keep dequeuing. This is an intentional, idiomatic
//! substitution for true Windows overlapped I/O (see the doc comment on
//! `ntfs::winapi::read_volume_at`), grounded in the single-worker
//! task-queue-plus-semaphore shape of the source's background worker, only
//! generalized from one thread to N.

use crate::error::{NtfsIndexError, Result};
use crate::ntfs::winapi::SafeHandle;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// What a completion handler asks the engine to do with its packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Schedule the next block in this run.
    Requeue,
    /// The packet's work is done; nothing more to schedule for it.
    Done,
    /// Drop the packet; its buffer is no longer needed.
    Destroy,
}

/// One outstanding read, carrying enough context for the caller to resume
/// the scheduler's state machine from a completion.
pub struct ReadTask {
    pub offset: u64,
    pub buffer: Vec<u8>,
    pub priority: i64,
    pub on_complete: Box<dyn FnOnce(Result<(u64, Vec<u8>)>) -> Action + Send>,
}

struct QueuedTask(ReadTask);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; higher `priority` pops first, matching
        // the source's "insert before timestamp" ordering where smaller
        // timestamps (earlier deadlines) run first — we invert the sense so
        // `priority` reads naturally as "more urgent is larger".
        self.0.priority.cmp(&other.0.priority)
    }
}

struct Shared {
    pending: Mutex<BinaryHeap<QueuedTask>>,
    terminated: AtomicBool,
}

/// N-worker read engine bound to one volume handle.
pub struct IoEngine {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoEngine {
    /// Spawn `worker_threads` workers (falling back to the logical CPU
    /// count, one in debug builds, matching the source's thread-count
    /// policy) that pull from a shared priority queue and read from
    /// `handle` synchronously.
    pub fn start(handle: Arc<SafeHandle>, worker_threads: Option<usize>) -> Self {
        let count = worker_threads.unwrap_or_else(|| {
            if cfg!(debug_assertions) {
                1
            } else {
                num_cpus::get().max(1)
            }
        });

        let shared = Arc::new(Shared { pending: Mutex::new(BinaryHeap::new()), terminated: AtomicBool::new(false) });
        let (wake_tx, wake_rx) = bounded::<()>(count * 4 + 16);

        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = Arc::clone(&handle);
            let wake_rx: Receiver<()> = wake_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("ntfs-mft-search-io-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, shared, handle, wake_rx))
                    .expect("failed to spawn I/O worker thread"),
            );
        }

        Self { shared, wake_tx, workers: Mutex::new(workers) }
    }

    /// Enqueue a read, highest `priority` serviced first. Fails with
    /// `Cancelled` once `close()` has been called.
    pub fn read_file(&self, task: ReadTask) -> Result<()> {
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(NtfsIndexError::Cancelled);
        }
        self.shared.pending.lock().push(QueuedTask(task));
        let _ = self.wake_tx.send(());
        Ok(())
    }

    /// Synthesize a completion without touching the volume — used for
    /// shutdown and zero-length extents.
    pub fn post(&self, key_buffer: Vec<u8>, offset: u64, on_complete: Box<dyn FnOnce(Result<(u64, Vec<u8>)>) -> Action + Send>) {
        on_complete(Ok((offset, key_buffer)));
    }

    /// Stop accepting new reads, wake every worker with a sentinel, and join
    /// them. Matches the source's "N sentinel completions, one per worker"
    /// shutdown shape. Takes `&self` rather than consuming it — callers
    /// hold this behind an `Arc` shared with in-flight reads, so `close`
    /// only needs to take the join handles out from under the lock, not own
    /// the engine outright. Idempotent: a second call finds no handles left
    /// and is a no-op. Must be called from a thread that isn't one of this
    /// engine's own workers, or the join below deadlocks.
    pub fn close(&self) {
        self.shared.terminated.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            let _ = self.wake_tx.send(());
        }
        for worker in workers {
            let _ = worker.join();
        }
        debug!("io engine closed, all workers joined");
    }
}

fn worker_loop(worker_id: usize, shared: Arc<Shared>, handle: Arc<SafeHandle>, wake_rx: Receiver<()>) {
    loop {
        if wake_rx.recv().is_err() {
            return;
        }
        if shared.terminated.load(Ordering::Acquire) {
            return;
        }

        let task = shared.pending.lock().pop();
        let Some(QueuedTask(task)) = task else { continue };

        trace!(worker_id, offset = task.offset, "issuing read");
        let mut buffer = task.buffer;
        let result = crate::ntfs::winapi::read_volume_at(&handle, task.offset, &mut buffer)
            .map(|_| (task.offset, buffer));

        // The completion handler's return value is part of the `Overlapped`
        // contract (§4.2): whatever it asks for — requeue the next block,
        // keep the buffer alive, or drop it — the handler itself already
        // performed the follow-up (e.g. calling `read_file` again), so the
        // engine's job here ends at letting the packet drop.
        let _: Action = (task.on_complete)(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_task_orders_by_priority_descending() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedTask(ReadTask { offset: 0, buffer: vec![], priority: 1, on_complete: Box::new(|_| Action::Done) }));
        heap.push(QueuedTask(ReadTask { offset: 0, buffer: vec![], priority: 5, on_complete: Box::new(|_| Action::Done) }));
        heap.push(QueuedTask(ReadTask { offset: 0, buffer: vec![], priority: 3, on_complete: Box::new(|_| Action::Done) }));

        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|t| t.0.priority)).collect();
        assert_eq!(order, vec![5, 3, 1]);
    }
}
