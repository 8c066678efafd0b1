//! Error types and process exit codes.
//!
//! Per-connection and per-reactor failures never cross a thread boundary;
//! only startup and configuration failures propagate to `main` and need a
//! shared type.

use std::io;

/// Exit code returned by the process for each class of failure.
pub const EXIT_OK: i32 = 0;
/// Allocation / slab exhaustion at startup.
pub const EXIT_OUT_OF_MEMORY: i32 = 10;
/// Any other uncaught failure.
pub const EXIT_FAILURE: i32 = 100;

/// Failures that can abort startup or bring down a whole reactor thread.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The accept capacity could not be reserved for a reactor.
    #[error("out of memory reserving {capacity} connection slots")]
    OutOfMemory {
        /// Requested slab capacity.
        capacity: usize,
    },

    /// A socket syscall (bind, listen, setsockopt, accept) failed in a way
    /// that isn't recoverable for the reactor performing it.
    #[error("socket operation '{op}' failed: {source}")]
    Socket {
        /// Name of the failing operation, for diagnostics.
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `mio::Poll` construction or registration failed.
    #[error("reactor setup failed: {0}")]
    Reactor(#[source] io::Error),

    /// Daemonization failed.
    #[error("failed to daemonize: {0}")]
    Daemonize(#[source] io::Error),
}

impl ServerError {
    /// Maps this error onto the process's exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::OutOfMemory { .. } => EXIT_OUT_OF_MEMORY,
            _ => EXIT_FAILURE,
        }
    }
}
