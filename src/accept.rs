//! Owns one reactor: a listening socket shared at the kernel level via
//! `SO_REUSEPORT`, its `mio::Poll`, and the slab of connections it drives.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::connection::Outcome;
use crate::error::ServerError;
use crate::pool::ThreadPool;
use crate::slab_pool::ConnPool;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 1024;

/// One reactor's listening socket, `Poll`, and connection slab, plus the
/// shared thread pool and signal handle every connection it accepts is
/// constructed with.
pub struct AcceptTask {
    listener: mio::net::TcpListener,
    poll: Poll,
    connections: ConnPool,
    pool: Arc<ThreadPool>,
    completions_tx: Sender<Token>,
    completions_rx: Receiver<Token>,
    waker: Arc<Waker>,
    slow_duration: Duration,
    worker_threads: usize,
}

impl AcceptTask {
    /// Binds `addr` with `SO_REUSEPORT` set, so every `AcceptTask` bound to
    /// the same address gets an independent, kernel-balanced share of
    /// incoming connections.
    pub fn bind(
        addr: SocketAddr,
        accept_capacity: usize,
        pool: Arc<ThreadPool>,
        slow_duration: Duration,
        worker_threads: usize,
    ) -> Result<Self, ServerError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Socket { op: "socket", source: e })?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::Socket { op: "setsockopt(SO_REUSEADDR)", source: e })?;
        socket
            .set_reuse_port(true)
            .map_err(|e| ServerError::Socket { op: "setsockopt(SO_REUSEPORT)", source: e })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Socket { op: "fcntl(O_NONBLOCK)", source: e })?;
        socket
            .bind(&addr.into())
            .map_err(|e| ServerError::Socket { op: "bind", source: e })?;
        socket
            .listen(1024)
            .map_err(|e| ServerError::Socket { op: "listen", source: e })?;

        let listener = mio::net::TcpListener::from_std(socket.into());

        let poll = Poll::new().map_err(ServerError::Reactor)?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKE_TOKEN).map_err(ServerError::Reactor)?,
        );
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();

        let connections = ConnPool::new(accept_capacity);
        info!(
            capacity = accept_capacity,
            bytes = ConnPool::memsize(accept_capacity),
            "reserved connection slab"
        );

        Ok(AcceptTask {
            listener,
            poll,
            connections,
            pool,
            completions_tx,
            completions_rx,
            waker,
            slow_duration,
            worker_threads,
        })
    }

    /// Address this reactor's listener is bound to. Useful for tests that
    /// bind to port 0 and need to learn the OS-assigned port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs this reactor's event loop for the remainder of the process.
    pub fn run(mut self) {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut self.listener, LISTEN_TOKEN, Interest::READABLE)
        {
            error!(error = %e, "failed to register listener; reactor exiting");
            return;
        }

        // One opportunistic accept before entering the loop: avoids a round
        // trip through `Poll::poll` for the very first connection, should
        // one already be sitting in the accept queue.
        if let Some((stream, _)) = self.try_accept_one() {
            self.accept_connection(stream);
        }

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "reactor poll failed; reactor exiting");
                return;
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept_ready(),
                    WAKE_TOKEN => self.drain_completions(),
                    token => {
                        if self.dispatch(token, event.is_readable(), event.is_writable()) {
                            error!(?token, "unexpected socket error; reactor exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn try_accept_one(&self) -> Option<(TcpStream, SocketAddr)> {
        match self.listener.accept() {
            Ok(pair) => Some(pair),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                error!(error = %e, "accept failed on warm-up accept");
                None
            }
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => self.accept_connection(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!(error = %e, "accept failed; reactor's listener is unaffected");
                    return;
                }
            }
        }
    }

    fn accept_connection(&mut self, stream: TcpStream) {
        let entry = match self.connections.try_vacant_entry() {
            Ok(entry) => entry,
            Err(_) => {
                warn!("connection slab at capacity; dropping accepted connection");
                drop(stream);
                return;
            }
        };

        let token = entry.token();
        let ctx = crate::connection::ConnectionContext::new(
            token,
            stream,
            self.poll.registry(),
            self.pool.clone(),
            self.completions_tx.clone(),
            self.waker.clone(),
            self.slow_duration,
            self.worker_threads,
        );

        match ctx {
            Ok(ctx) => {
                entry.insert(ctx);
            }
            Err(e) => warn!(error = %e, "failed to register accepted connection"),
        }
    }

    /// Dispatches a readiness event to the connection at `token`. Returns
    /// `true` if the underlying socket call hit an unexpected errno, in
    /// which case the caller must stop this reactor's whole event loop
    /// rather than merely tear down the one connection.
    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) -> bool {
        let registry = self.poll.registry();
        let Some(ctx) = self.connections.get_mut(token.0) else {
            return false;
        };

        let mut outcome = Outcome::Continue;
        if readable {
            outcome = ctx.on_readable(registry);
        }
        if writable && outcome == Outcome::Continue {
            outcome = ctx.on_writable(registry);
        }

        match outcome {
            Outcome::Continue => false,
            Outcome::Destroy => {
                self.destroy(token);
                false
            }
            Outcome::Fatal => {
                self.destroy(token);
                true
            }
        }
    }

    fn drain_completions(&mut self) {
        loop {
            match self.completions_rx.try_recv() {
                Ok(token) => self.complete_async(token),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn complete_async(&mut self, token: Token) {
        let registry = self.poll.registry();
        let Some(ctx) = self.connections.get_mut(token.0) else {
            debug!(?token, "async signal for a connection no longer in the slab");
            return;
        };

        if ctx.on_async_signal(registry) == Outcome::Destroy {
            self.destroy(token);
        }
    }

    fn destroy(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(ctx) = self.connections.get_mut(token.0) {
            // Defer destruction while a worker still references this
            // connection's token through an in-flight SlowTask — the async
            // signal path will call back into `destroy` once it completes.
            if ctx.async_outstanding() {
                return;
            }
            ctx.terminate(registry);
            self.connections.release(token.0);
        }
    }
}
