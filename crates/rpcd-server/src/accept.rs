//! Accept admission
//!
//! One readiness callback on the listener runs one admission attempt:
//!
//! ```text
//! accept ──err──► Backoff { retry_at = now + interval }  → StopMonitoring
//!    │ ok
//!    ▼
//! descriptor budget ──short──► close, warn              → ContinueMonitoring
//!    │ ok
//!    ▼
//! O_NONBLOCK ──err──► close, error                      → ContinueMonitoring
//!    │ ok
//!    ▼
//! Monitored, factory → dispatcher (READABLE)            → ContinueMonitoring
//! ```
//!
//! While in backoff the listener is not registered with the dispatcher;
//! `Server::work` registers it again once the deadline has passed.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use rpcd_core::MethodRegistry;

use crate::connection::ConnectionFactory;
use crate::dispatch::{Context, EventMask, Interest, Source};
use crate::socket::SocketApi;

/// Listener monitoring state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
    /// Registered for accept readiness (or not yet bound).
    Monitored,
    /// Last accept failed; unmonitored until `retry_at` on the dispatcher clock.
    Backoff { retry_at: Duration },
}

/// Outcome of the descriptor budget check.
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// Fewer than `reserve` descriptors are free.
    Exhausted { free: usize },
    /// The free count could not be determined.
    Unknown(io::Error),
}

/// Descriptor budget: admit only while at least `reserve` descriptors stay free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    reserve: usize,
}

impl AdmissionPolicy {
    pub fn new(reserve: usize) -> Self {
        Self { reserve }
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    pub fn check(&self, sockets: &dyn SocketApi) -> Admission {
        if self.reserve == 0 {
            return Admission::Admitted;
        }
        match sockets.free_descriptors(self.reserve) {
            Ok(free) if free >= self.reserve => Admission::Admitted,
            Ok(free) => Admission::Exhausted { free },
            Err(e) => Admission::Unknown(e),
        }
    }
}

/// Owns the listening descriptor and runs admission on it.
pub struct Acceptor {
    fd: Option<RawFd>,
    sockets: Rc<dyn SocketApi>,
    factory: Box<dyn ConnectionFactory>,
    methods: MethodRegistry,
    policy: AdmissionPolicy,
    retry_interval: Duration,
    state: AcceptState,
}

impl Acceptor {
    pub fn new(
        sockets: Rc<dyn SocketApi>,
        factory: Box<dyn ConnectionFactory>,
        methods: MethodRegistry,
        policy: AdmissionPolicy,
        retry_interval: Duration,
    ) -> Self {
        Self {
            fd: None,
            sockets,
            factory,
            methods,
            policy,
            retry_interval,
            state: AcceptState::Monitored,
        }
    }

    /// Listening descriptor, if bound.
    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn state(&self) -> AcceptState {
        self.state
    }

    /// True while the last accept failed and the retry is pending.
    pub fn accept_error(&self) -> bool {
        matches!(self.state, AcceptState::Backoff { .. })
    }

    /// Take ownership of a freshly set-up listener, closing any previous one.
    pub fn attach(&mut self, fd: RawFd) {
        self.close();
        self.fd = Some(fd);
    }

    /// Close the listener. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            tracing::debug!(fd, "closing listener");
            self.sockets.close(fd);
        }
        self.state = AcceptState::Monitored;
    }

    /// Backoff deadline reached at `now`.
    pub fn retry_due(&self, now: Duration) -> bool {
        match self.state {
            AcceptState::Backoff { retry_at } => now >= retry_at,
            AcceptState::Monitored => false,
        }
    }

    /// Leave backoff; the caller registers the listener again.
    pub fn rearm(&mut self) {
        self.state = AcceptState::Monitored;
    }

    /// Run one admission attempt.
    pub fn accept_connection(&mut self, cx: &mut Context<'_>) -> Interest {
        let Some(listen_fd) = self.fd else {
            return Interest::StopMonitoring;
        };

        let fd = match self.sockets.accept(listen_fd) {
            Ok(fd) => fd,
            Err(e) => {
                let retry_at = cx.now() + self.retry_interval;
                if e.kind() == io::ErrorKind::WouldBlock {
                    tracing::debug!(fd = listen_fd, "accept would block, backing off");
                } else {
                    tracing::error!(fd = listen_fd, error = %e, "could not accept connection");
                }
                self.state = AcceptState::Backoff { retry_at };
                return Interest::StopMonitoring;
            }
        };

        match self.policy.check(&*self.sockets) {
            Admission::Admitted => {}
            Admission::Exhausted { free } => {
                tracing::warn!(
                    fd,
                    free,
                    reserve = self.policy.reserve(),
                    "too few free descriptors, rejecting connection"
                );
                self.sockets.close(fd);
                return Interest::ContinueMonitoring;
            }
            Admission::Unknown(e) => {
                tracing::warn!(fd, error = %e, "cannot count free descriptors, rejecting connection");
                self.sockets.close(fd);
                return Interest::ContinueMonitoring;
            }
        }

        if let Err(e) = self.sockets.set_non_blocking(fd) {
            tracing::error!(fd, error = %e, "could not set connection to non-blocking mode");
            self.sockets.close(fd);
            return Interest::ContinueMonitoring;
        }

        self.state = AcceptState::Monitored;
        let conn = self.factory.create_connection(fd, self.methods.clone());
        tracing::debug!(fd, listener = listen_fd, "connection accepted");
        cx.add_source(conn, EventMask::READABLE);
        Interest::ContinueMonitoring
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.fd)
            .field("policy", &self.policy)
            .field("retry_interval", &self.retry_interval)
            .field("state", &self.state)
            .finish()
    }
}

/// The listener as seen by the dispatcher.
///
/// Shares the acceptor with the server. Dropping it (on `StopMonitoring`
/// or `clear()`) leaves the listening descriptor open; the server closes it.
pub struct ListenerSource {
    fd: RawFd,
    acceptor: Rc<RefCell<Acceptor>>,
}

impl ListenerSource {
    pub fn new(fd: RawFd, acceptor: Rc<RefCell<Acceptor>>) -> Self {
        Self { fd, acceptor }
    }
}

impl Source for ListenerSource {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn handle_event(&mut self, _ready: EventMask, cx: &mut Context<'_>) -> Interest {
        self.acceptor.borrow_mut().accept_connection(cx)
    }
}
