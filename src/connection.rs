//! Per-connection state machine: receive buffer, request parser, response
//! cursor, and the reactor registrations that drive them.
//!
//! A `ConnectionContext` lives entirely on the reactor thread that accepted
//! it — the one exception is the `SlowTask` it may hand to the thread pool,
//! which carries only a `Token`, a duration, and clones of the reactor's
//! completion channel and waker, never a pointer back into this struct.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};
use tracing::{trace, warn};

use crate::parser::{ParseStatus, RequestParser, Service};
use crate::pool::ThreadPool;
use crate::response::RESPONSE;
use crate::task::{SlowTask, Task};

const BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Offloaded,
    Writing,
    Terminating,
}

/// What the owning reactor should do after feeding an event to a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Leave the context where it is; it remains registered and live.
    Continue,
    /// The context is finished (response fully sent, a protocol error, or an
    /// ordinary peer disconnect); the caller must remove it from its slab.
    Destroy,
    /// An unexpected errno on a socket call — not `WouldBlock` or
    /// `Interrupted` — was observed. This is a reactor-wide failure, not a
    /// per-connection one: the caller must tear this context down and then
    /// stop running its whole event loop.
    Fatal,
}

/// State spanning one accepted connection from first byte to close.
pub struct ConnectionContext {
    token: Token,
    stream: TcpStream,
    state: State,
    closed: bool,
    buf: Box<[u8; BUFFER_SIZE]>,
    received: usize,
    parser: RequestParser,
    sent: usize,
    async_outstanding: bool,
    pool: Arc<ThreadPool>,
    completions: Sender<Token>,
    waker: Arc<Waker>,
    slow_duration: Duration,
    /// True when the server was configured with zero slow-task workers, in
    /// which case a slow classification runs inline instead of offloading.
    /// This is deliberately *not* `pool.worker_count() == 0`: the pool also
    /// carries `accept_threads - 1` workers permanently pinned to reactor
    /// loops, which never release back to the pool, so the pool's total
    /// worker count says nothing about slow-task capacity.
    degenerate: bool,
}

impl ConnectionContext {
    /// Registers `stream` for read readiness under `token` and builds the
    /// context around it. `completions`/`waker` are the owning reactor's
    /// shared signal handle, cloned once per connection so a `SlowTask` can
    /// report back without holding a pointer into this struct. `worker_threads`
    /// is the configured count of workers dedicated to slow tasks, which
    /// decides whether a slow classification offloads or runs inline.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: Token,
        mut stream: TcpStream,
        registry: &Registry,
        pool: Arc<ThreadPool>,
        completions: Sender<Token>,
        waker: Arc<Waker>,
        slow_duration: Duration,
        worker_threads: usize,
    ) -> io::Result<Self> {
        registry.register(&mut stream, token, Interest::READABLE)?;

        Ok(ConnectionContext {
            token,
            stream,
            state: State::Reading,
            closed: false,
            buf: Box::new([0; BUFFER_SIZE]),
            received: 0,
            parser: RequestParser::new(),
            sent: 0,
            async_outstanding: false,
            pool,
            completions,
            waker,
            slow_duration,
            degenerate: worker_threads == 0,
        })
    }

    /// Token this context is registered under on its reactor.
    pub fn token(&self) -> Token {
        self.token
    }

    /// True while a worker still holds this context's token through an
    /// in-flight `SlowTask`; the owning reactor must not destroy the
    /// context while this holds, even if the peer has gone away.
    pub fn async_outstanding(&self) -> bool {
        self.async_outstanding
    }

    /// Handles a readable event. Returns [`Outcome::Destroy`] only for
    /// protocol errors and peer disconnects discovered before classification
    /// — offload and close-during-offload are handled internally and never
    /// destroy the context from this call (see `on_async_signal`).
    pub fn on_readable(&mut self, registry: &Registry) -> Outcome {
        match self.state {
            State::Reading => self.read_and_classify(registry),
            State::Offloaded => {
                // The protocol has no more bytes to deliver before the
                // response; any further readable event — real data or a
                // peer close — means the connection can't be finished
                // normally. The worker still references this context's
                // token, so it isn't safe to destroy yet.
                trace!(token = ?self.token, "unexpected read while offloaded");
                self.enter_terminating(registry);
                Outcome::Continue
            }
            State::Writing | State::Terminating => Outcome::Continue,
        }
    }

    fn read_and_classify(&mut self, registry: &Registry) -> Outcome {
        loop {
            if self.received == BUFFER_SIZE {
                warn!(token = ?self.token, "receive buffer exhausted without a complete request");
                return Outcome::Destroy;
            }

            match self.stream.read(&mut self.buf[self.received..]) {
                Ok(0) => return Outcome::Destroy,
                Ok(n) => {
                    self.received += n;
                    match self.parser.advance(&self.buf[..self.received]) {
                        ParseStatus::Continue => continue,
                        ParseStatus::Terminate => return Outcome::Destroy,
                        ParseStatus::Proceed => return self.classify(registry),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Outcome::Continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Outcome::Fatal,
            }
        }
    }

    fn classify(&mut self, registry: &Registry) -> Outcome {
        match self.parser.service {
            Service::Fast => self.arm_write(registry),
            // Degenerate configuration: no workers to offload to, so the
            // slow path is treated exactly like the fast one.
            Service::Slow if self.degenerate => self.arm_write(registry),
            Service::Slow => {
                self.async_outstanding = true;
                self.state = State::Offloaded;
                self.pool.add_task(Task::Slow(SlowTask::new(
                    self.token,
                    self.slow_duration,
                    self.completions.clone(),
                    self.waker.clone(),
                )));
                Outcome::Continue
            }
            Service::Undefined => unreachable!("classify called before PROCEED"),
        }
    }

    fn arm_write(&mut self, registry: &Registry) -> Outcome {
        self.state = State::Writing;
        match registry.reregister(&mut self.stream, self.token, Interest::WRITABLE) {
            Ok(()) => Outcome::Continue,
            Err(_) => Outcome::Destroy,
        }
    }

    /// Handles a writable event, sending as much of [`RESPONSE`] as the
    /// socket accepts. Returns [`Outcome::Destroy`] once the whole response
    /// has been sent or the send fails outright.
    pub fn on_writable(&mut self, _registry: &Registry) -> Outcome {
        if self.state != State::Writing {
            return Outcome::Continue;
        }

        loop {
            if self.sent == RESPONSE.len() {
                return Outcome::Destroy;
            }

            match self.stream.write(&RESPONSE[self.sent..]) {
                Ok(0) => return Outcome::Destroy,
                Ok(n) => {
                    self.sent += n;
                    if self.sent == RESPONSE.len() {
                        return Outcome::Destroy;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Outcome::Continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Outcome::Fatal,
            }
        }
    }

    /// Handles the reactor's async signal for this context, delivered once
    /// the `SlowTask` that carried its token has finished. Clearing
    /// `async_outstanding` is the first action, establishing the
    /// happens-before edge with the worker's send.
    pub fn on_async_signal(&mut self, registry: &Registry) -> Outcome {
        self.async_outstanding = false;

        match self.state {
            State::Offloaded => self.arm_write(registry),
            State::Terminating => Outcome::Destroy,
            State::Reading | State::Writing => Outcome::Continue,
        }
    }

    fn enter_terminating(&mut self, registry: &Registry) {
        self.state = State::Terminating;
        self.terminate(registry);
    }

    /// Closes the socket side of this connection and stops its watchers.
    /// Idempotent: a context only ever pays the deregistration cost once,
    /// however many paths call `terminate`.
    pub fn terminate(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.closed = true;
    }
}
