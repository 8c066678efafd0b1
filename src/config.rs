//! Runtime configuration, parsed from the process's CLI surface.

use std::time::Duration;

use clap::Parser;

/// `duolane` — a multi-reactor fast/slow HTTP/1.1 demo server.
#[derive(Debug, Parser)]
#[command(name = "duolaned", version, about)]
struct Cli {
    /// TCP port to bind.
    #[arg(long)]
    port: u16,

    /// Number of reactor (accept) threads. Defaults to hardware parallelism.
    #[arg(long)]
    accept_threads: Option<usize>,

    /// Number of worker threads backing slow requests. Defaults to
    /// `accept_threads`.
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Per-reactor connection slab capacity.
    #[arg(long)]
    accept_capacity: usize,

    /// Milliseconds a slow request sleeps before its reply is released.
    #[arg(long)]
    slow_duration: u64,

    /// Enable diagnostic logging.
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Detach the process and chdir to `/var/tmp`.
    #[arg(long, default_value_t = false)]
    daemonize: bool,
}

/// Resolved runtime configuration, consumed by the accept tasks and thread
/// pool. Built once in `main` and never mutated afterward.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to bind on every reactor.
    pub port: u16,
    /// Number of reactor threads; one of these runs on the main thread.
    pub accept_threads: usize,
    /// Number of general worker threads servicing slow requests.
    pub worker_threads: usize,
    /// Per-reactor connection slab capacity.
    pub accept_capacity: usize,
    /// How long a slow request blocks its worker before replying.
    pub slow_duration: Duration,
    /// Whether diagnostic logging is enabled.
    pub verbose: bool,
    /// Whether to daemonize before running the main-thread reactor.
    pub daemonize: bool,
}

impl ServerConfig {
    /// Parses `std::env::args`, resolving the accept/worker thread defaults
    /// to hardware parallelism.
    pub fn from_args() -> Self {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Self {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let accept_threads = cli.accept_threads.unwrap_or(hw).max(1);
        let worker_threads = cli.worker_threads.unwrap_or(accept_threads);

        ServerConfig {
            port: cli.port,
            accept_threads,
            worker_threads,
            accept_capacity: cli.accept_capacity,
            slow_duration: Duration::from_millis(cli.slow_duration),
            verbose: cli.verbose,
            daemonize: cli.daemonize,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn worker_threads_defaults_to_accept_threads() {
        let cli = Cli {
            port: 8080,
            accept_threads: Some(4),
            worker_threads: None,
            accept_capacity: 1024,
            slow_duration: 200,
            verbose: false,
            daemonize: false,
        };
        let config = ServerConfig::from_cli(cli);
        assert_eq!(4, config.worker_threads);
    }

    #[test]
    fn explicit_worker_threads_is_preserved() {
        let cli = Cli {
            port: 8080,
            accept_threads: Some(4),
            worker_threads: Some(2),
            accept_capacity: 1024,
            slow_duration: 200,
            verbose: false,
            daemonize: false,
        };
        let config = ServerConfig::from_cli(cli);
        assert_eq!(2, config.worker_threads);
    }

    #[test]
    fn slow_duration_is_milliseconds() {
        let cli = Cli {
            port: 8080,
            accept_threads: Some(1),
            worker_threads: None,
            accept_capacity: 16,
            slow_duration: 250,
            verbose: false,
            daemonize: false,
        };
        let config = ServerConfig::from_cli(cli);
        assert_eq!(Duration::from_millis(250), config.slow_duration);
    }
}
