//! Polymorphic work items moved between the main thread, the thread pool,
//! and the async signal path.
//!
//! A tagged union of the two concrete variants, rather than a boxed trait
//! object: `AcceptTask` is boxed because it embeds a whole reactor
//! (listener, `Poll`, connection slab); `SlowTask` is tiny and stored
//! inline, which is the only variant actually submitted at request-rate
//! frequency.

use std::time::Duration;

use crossbeam_channel::Sender;
use mio::{Token, Waker};
use std::sync::Arc;

use crate::accept::AcceptTask;

/// A unit of work handed to a [`crate::pool::ThreadPool`] worker.
///
/// Move-only by construction (an enum holding its payload by value): handing
/// a `Task` to a worker transfers ownership, so there is no way to observe
/// a task from two places at once.
pub enum Task {
    /// Runs one reactor's accept loop for the remainder of the process.
    Accept(Box<AcceptTask>),
    /// Sleeps for the configured duration, then signals the connection's
    /// reactor that the reply may be released.
    Slow(SlowTask),
    /// Arbitrary closure, compiled only for unit tests that need to drive
    /// the thread pool without a real reactor or socket.
    #[cfg(test)]
    Test(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Executes this task, consuming it. Invoked exactly once per
    /// assignment to a worker.
    pub fn execute(self) {
        match self {
            Task::Accept(task) => task.run(),
            Task::Slow(task) => task.execute(),
            #[cfg(test)]
            Task::Test(f) => f(),
        }
    }
}

/// The work item behind a `/test/slow` request: sleep, then wake the owning
/// reactor through its async signal handle.
///
/// The signal handle pairing (`completions` + `waker`) is the same channel +
/// `mio::Waker` combination this codebase's `Listener`/`Worker` already use
/// to let a background thread notify a reactor thread of a finished
/// connection, reused here as the async watcher a reactor polls for
/// worker-side completions.
pub struct SlowTask {
    token: Token,
    duration: Duration,
    completions: Sender<Token>,
    waker: Arc<Waker>,
}

impl SlowTask {
    /// Builds a slow task for `token`, to run on whichever worker picks it
    /// up.
    pub fn new(token: Token, duration: Duration, completions: Sender<Token>, waker: Arc<Waker>) -> Self {
        SlowTask {
            token,
            duration,
            completions,
            waker,
        }
    }

    fn execute(self) {
        std::thread::sleep(self.duration);
        // Worker -> reactor happens-before is established by this send
        // followed by the wake: the reactor's async callback clears
        // `async_outstanding` as its first action, after observing the
        // token on the channel.
        if self.completions.send(self.token).is_ok() {
            let _ = self.waker.wake();
        }
    }
}
