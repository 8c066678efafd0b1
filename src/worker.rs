//! Worker threads: sleep on a condition, run one task, report back.
//!
//! Each worker owns two task slots (`in`/`out`) guarded by its own sleep
//! lock, swapped under that lock so the submitter never overwrites a task
//! the worker is mid-assignment on.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::pool::ThreadPool;
use crate::task::Task;

struct Slots {
    has_work: bool,
    task_in: Option<Task>,
    task_out: Option<Task>,
}

/// Shared state a worker thread and its pool both touch: the sleep lock,
/// condition variable, and the in/out task slots.
pub(crate) struct WorkerHandle {
    id: usize,
    slots: Mutex<Slots>,
    sleep: Condvar,
}

impl WorkerHandle {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(WorkerHandle {
            id,
            slots: Mutex::new(Slots {
                has_work: false,
                task_in: None,
                task_out: None,
            }),
            sleep: Condvar::new(),
        })
    }

    /// Assigns `task` to this worker and wakes it. Only the submitter (the
    /// pool, on behalf of `add_task`/`release_thread`) calls this, and only
    /// while holding the sleep lock — closing the window where a notify
    /// could be missed between the check and the wait.
    pub(crate) fn assign(&self, task: Task) {
        let mut slots = self.slots.lock().unwrap();
        slots.task_in = Some(task);
        slots.has_work = true;
        self.sleep.notify_one();
    }
}

/// An OS thread backing one slot in a [`ThreadPool`]. Never joined — there
/// is no shutdown protocol; the handle is kept only for the `JoinHandle`'s
/// own sake (dropping it detaches the thread, which is exactly the desired
/// behavior on process exit).
pub(crate) struct Worker {
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns the worker thread, which immediately parks waiting for its
    /// first task.
    pub(crate) fn spawn(shared: Arc<WorkerHandle>, pool: Arc<ThreadPool>) -> Self {
        let handle = std::thread::Builder::new()
            .name(format!("duolane-worker-{}", shared.id))
            .spawn(move || Self::run(shared, pool))
            .expect("failed to spawn worker thread");

        Worker { handle }
    }

    fn run(shared: Arc<WorkerHandle>, pool: Arc<ThreadPool>) {
        loop {
            let task = {
                let mut slots = shared.slots.lock().unwrap();
                slots = shared
                    .sleep
                    .wait_while(slots, |s| !s.has_work)
                    .unwrap();
                std::mem::swap(&mut slots.task_in, &mut slots.task_out);
                slots.has_work = false;
                slots.task_out.take()
            };

            let Some(task) = task else { continue };

            debug!(worker = shared.id, "running task");
            task.execute();
            pool.release_thread(shared.id);
        }
    }
}

pub(crate) fn spawn_threads(
    count: usize,
    pool: Arc<ThreadPool>,
) -> (Vec<Arc<WorkerHandle>>, Vec<Worker>) {
    let mut handles = Vec::with_capacity(count);
    let mut workers = Vec::with_capacity(count);

    for id in 0..count {
        let shared = WorkerHandle::new(id);
        workers.push(Worker::spawn(shared.clone(), pool.clone()));
        handles.push(shared);
    }

    if count == 0 {
        error!("spawned thread pool with zero workers; all slow requests will run inline");
    }

    (handles, workers)
}
