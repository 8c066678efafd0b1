//! Assigns tasks to free workers, or queues them when every worker is busy.
//!
//! Two locks, one direction of acquisition each: `add_task` takes the
//! free-stack lock, drops it, then (only if no worker was free) takes the
//! backlog lock. `release_thread` takes the backlog lock, and only acquires
//! the free-stack lock if the backlog was empty. The two locks are never
//! held in the same direction simultaneously, so there is no deadlock to
//! reason about.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::task::Task;
use crate::worker::{self, Worker, WorkerHandle};

/// A fixed set of worker threads that execute [`Task`]s handed to it,
/// queueing work in FIFO order when every worker is busy.
pub struct ThreadPool {
    handles: Vec<Arc<WorkerHandle>>,
    free: Mutex<Vec<usize>>,
    backlog: Mutex<VecDeque<Task>>,
}

impl ThreadPool {
    /// Creates a pool with `count` workers, all initially free. `count` may
    /// be zero, in which case [`ThreadPool::add_task`] always queues and
    /// nothing ever drains the backlog — callers that submit slow work to a
    /// zero-worker pool must run it inline instead.
    pub fn spawn(count: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let pool_stub = PoolStub(weak.clone());
            let (handles, workers) = worker::spawn_threads(count, pool_stub.into());
            std::mem::forget(workers);

            ThreadPool {
                free: Mutex::new((0..handles.len()).collect()),
                handles,
                backlog: Mutex::new(VecDeque::new()),
            }
        })
    }

    /// Hands `task` to a free worker, or appends it to the backlog if every
    /// worker is currently busy.
    pub fn add_task(&self, task: Task) {
        let mut free = self.free.lock().unwrap();
        if let Some(id) = free.pop() {
            drop(free);
            self.handles[id].assign(task);
        } else {
            drop(free);
            self.backlog.lock().unwrap().push_back(task);
        }
    }

    /// Called by a worker immediately after it finishes executing a task.
    /// Drains one backlog item directly onto the worker if any is waiting;
    /// otherwise returns the worker to the free stack. A released worker
    /// always drains its own backlog item before parking, so the backlog
    /// can never starve.
    pub(crate) fn release_thread(&self, id: usize) {
        let mut backlog = self.backlog.lock().unwrap();
        if let Some(task) = backlog.pop_front() {
            drop(backlog);
            self.handles[id].assign(task);
        } else {
            drop(backlog);
            self.free.lock().unwrap().push(id);
        }
    }

    /// Number of workers currently parked in the free stack (test/diagnostic
    /// use only).
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Number of tasks currently waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap().len()
    }

    /// Number of workers backing this pool.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

// `worker::spawn_threads` wants an `Arc<ThreadPool>` to hand each worker so
// it can call back into `release_thread`, but the pool doesn't exist until
// its workers do. `Arc::new_cyclic` breaks the cycle: workers are handed a
// weak-backed stub during construction and the real pool is only completed
// once spawning returns.
struct PoolStub(std::sync::Weak<ThreadPool>);

impl From<PoolStub> for Arc<ThreadPool> {
    fn from(stub: PoolStub) -> Self {
        // Safe to upgrade unconditionally: by the time a worker actually
        // calls back through this handle, `Arc::new_cyclic`'s closure has
        // returned and the strong value is alive for the life of the
        // process (the pool is never dropped while workers run).
        stub.0
            .upgrade()
            .expect("thread pool dropped while workers are still running")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn blocking_task(started: mpsc::Sender<()>, release: mpsc::Receiver<()>) -> Task {
        Task::Test(Box::new(move || {
            started.send(()).unwrap();
            release.recv().unwrap();
        }))
    }

    fn signal_task(done: mpsc::Sender<()>) -> Task {
        Task::Test(Box::new(move || {
            done.send(()).unwrap();
        }))
    }

    #[test]
    fn queues_to_backlog_when_every_worker_busy() {
        let pool = ThreadPool::spawn(1);
        let (busy_tx, busy_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        // Occupy the single worker with a task that blocks until released.
        pool.add_task(blocking_task(busy_tx, release_rx));
        busy_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        pool.add_task(signal_task(done_tx));
        assert_eq!(1, pool.backlog_len());

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(0, pool.backlog_len());
        assert_eq!(1, pool.free_count());
    }

    #[test]
    fn released_worker_drains_backlog_before_parking() {
        let pool = ThreadPool::spawn(1);
        let (busy_tx, busy_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        pool.add_task(blocking_task(busy_tx, release_rx));
        busy_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        pool.add_task(signal_task(done_tx));

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(1, pool.free_count());
        assert_eq!(0, pool.backlog_len());
    }
}
