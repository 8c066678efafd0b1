//! Entry point: spawns the thread pool, launches `accept_threads - 1`
//! accept tasks on pool workers, and runs one more on the main thread.
//!
//! Resolves thread counts, spawns `accept_pool_sz + worker_threads` workers
//! up front, submits `accept_pool_sz` `AcceptTask`s to the pool, optionally
//! daemonizes, then runs the last `AcceptTask` synchronously on the calling
//! thread.

use std::net::SocketAddr;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use duolane::accept::AcceptTask;
use duolane::config::ServerConfig;
use duolane::error::{ServerError, EXIT_OK};
use duolane::pool::ThreadPool;
use duolane::slab_pool::ConnPool;
use duolane::task::Task;

fn main() -> ExitCode {
    let config = ServerConfig::from_args();
    init_tracing(config.verbose);

    match run(config) {
        Ok(()) => ExitCode::from(EXIT_OK as u8),
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_tracing(verbose: bool) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let default = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .try_init();
}

fn run(config: ServerConfig) -> Result<(), ServerError> {
    // Main thread is also an accept thread, so it doesn't need its own
    // worker slot.
    let accept_pool_sz = config.accept_threads - 1;
    let pool = ThreadPool::spawn(accept_pool_sz + config.worker_threads);

    info!(
        accept_threads = config.accept_threads,
        worker_threads = config.worker_threads,
        per_reactor_bytes = ConnPool::memsize(config.accept_capacity),
        total_bytes = ConnPool::memsize(config.accept_capacity) * config.accept_threads,
        "running accept threads"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    for _ in 0..accept_pool_sz {
        let task = AcceptTask::bind(
            addr,
            config.accept_capacity,
            pool.clone(),
            config.slow_duration,
            config.worker_threads,
        )?;
        pool.add_task(Task::Accept(Box::new(task)));
    }

    if config.daemonize {
        daemonize(config.verbose)?;
    }

    let last = AcceptTask::bind(
        addr,
        config.accept_capacity,
        pool.clone(),
        config.slow_duration,
        config.worker_threads,
    )?;
    last.run();

    Ok(())
}

/// Detaches from the controlling terminal and chdirs to `/var/tmp`.
/// `noclose` is tied to `verbose` so `--verbose --daemonize` still gets
/// diagnostics instead of having stdout/stderr redirected to `/dev/null`.
#[cfg(unix)]
fn daemonize(verbose: bool) -> Result<(), ServerError> {
    use std::ffi::CString;

    let dir = CString::new("/var/tmp").expect("static path has no interior nul");
    // SAFETY: `dir` is a valid, nul-terminated C string live for this call.
    if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
        return Err(ServerError::Daemonize(std::io::Error::last_os_error()));
    }

    let noclose = i32::from(verbose);
    // SAFETY: no preconditions beyond being a valid libc call; `daemon`
    // forks and re-execs nothing, it only detaches the calling process.
    if unsafe { libc::daemon(1, noclose) } != 0 {
        return Err(ServerError::Daemonize(std::io::Error::last_os_error()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn daemonize(_verbose: bool) -> Result<(), ServerError> {
    Err(ServerError::Daemonize(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "daemonize is only supported on unix",
    )))
}

