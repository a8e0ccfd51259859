//! Test doubles for the socket layer, the readiness wait and connections.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use rpcd_core::MethodRegistry;

use crate::clock::ManualClock;
use crate::dispatch::{Context, EventMask, Interest, PollFd, Poller, Source};
use crate::error::SetupStep;
use crate::socket::SocketApi;

#[derive(Debug, Default, Clone)]
struct FakeFd {
    non_blocking: bool,
    port: Option<u16>,
    backlog: Option<i32>,
}

#[derive(Debug)]
struct FakeState {
    next_fd: RawFd,
    next_ephemeral: u16,
    open: BTreeMap<RawFd, FakeFd>,
    fail_step: Option<SetupStep>,
    accepts: VecDeque<Result<(), i32>>,
    non_blocking_failures: usize,
    free: Result<usize, i32>,
    budget_requests: Vec<usize>,
    closed: Vec<RawFd>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_fd: 100,
            next_ephemeral: 40000,
            open: BTreeMap::new(),
            fail_step: None,
            accepts: VecDeque::new(),
            non_blocking_failures: 0,
            free: Ok(1024),
            budget_requests: Vec::new(),
            closed: Vec::new(),
        }
    }
}

impl FakeState {
    fn alloc(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd, FakeFd::default());
        fd
    }

    fn check(&self, step: SetupStep) -> io::Result<()> {
        if self.fail_step == Some(step) {
            Err(io::Error::from_raw_os_error(libc::EACCES))
        } else {
            Ok(())
        }
    }

    fn entry(&mut self, fd: RawFd) -> io::Result<&mut FakeFd> {
        self.open
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

/// In-memory `SocketApi`. Clones share state, so a test can keep one
/// handle while the server owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeSockets {
    state: Rc<RefCell<FakeState>>,
}

impl FakeSockets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make one listener setup step fail until `clear_failure()`.
    pub fn fail_at(&self, step: SetupStep) {
        self.state.borrow_mut().fail_step = Some(step);
    }

    pub fn clear_failure(&self) {
        self.state.borrow_mut().fail_step = None;
    }

    /// Queue a client for the next `accept()`.
    pub fn queue_client(&self) {
        self.state.borrow_mut().accepts.push_back(Ok(()));
    }

    /// Queue an `accept()` failure with `errno`.
    pub fn queue_accept_error(&self, errno: i32) {
        self.state.borrow_mut().accepts.push_back(Err(errno));
    }

    /// Fail the next `count` calls to `set_non_blocking()`.
    pub fn fail_non_blocking(&self, count: usize) {
        self.state.borrow_mut().non_blocking_failures = count;
    }

    pub fn set_free_descriptors(&self, free: usize) {
        self.state.borrow_mut().free = Ok(free);
    }

    pub fn fail_free_descriptors(&self) {
        self.state.borrow_mut().free = Err(libc::EMFILE);
    }

    /// `wanted` of every `free_descriptors()` call, in order.
    pub fn budget_requests(&self) -> Vec<usize> {
        self.state.borrow().budget_requests.clone()
    }

    pub fn is_open(&self, fd: RawFd) -> bool {
        self.state.borrow().open.contains_key(&fd)
    }

    pub fn is_non_blocking(&self, fd: RawFd) -> bool {
        self.state
            .borrow()
            .open
            .get(&fd)
            .map_or(false, |f| f.non_blocking)
    }

    pub fn backlog(&self, fd: RawFd) -> Option<i32> {
        self.state.borrow().open.get(&fd).and_then(|f| f.backlog)
    }

    pub fn open_count(&self) -> usize {
        self.state.borrow().open.len()
    }

    /// Every descriptor closed so far, in order.
    pub fn closed(&self) -> Vec<RawFd> {
        self.state.borrow().closed.clone()
    }
}

impl SocketApi for FakeSockets {
    fn socket(&self) -> io::Result<RawFd> {
        let mut st = self.state.borrow_mut();
        st.check(SetupStep::Create)?;
        Ok(st.alloc())
    }

    fn set_non_blocking(&self, fd: RawFd) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check(SetupStep::NonBlocking)?;
        if st.non_blocking_failures > 0 {
            st.non_blocking_failures -= 1;
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        st.entry(fd)?.non_blocking = true;
        Ok(())
    }

    fn set_reuse_addr(&self, fd: RawFd) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check(SetupStep::ReuseAddr)?;
        st.entry(fd)?;
        Ok(())
    }

    fn bind(&self, fd: RawFd, port: u16) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check(SetupStep::Bind)?;
        if port != 0 && st.open.values().any(|f| f.port == Some(port)) {
            return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
        }
        let port = if port == 0 {
            st.next_ephemeral += 1;
            st.next_ephemeral
        } else {
            port
        };
        st.entry(fd)?.port = Some(port);
        Ok(())
    }

    fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check(SetupStep::Listen)?;
        st.entry(fd)?.backlog = Some(backlog);
        Ok(())
    }

    fn accept(&self, fd: RawFd) -> io::Result<RawFd> {
        let mut st = self.state.borrow_mut();
        if st.entry(fd)?.backlog.is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        match st.accepts.pop_front() {
            Some(Ok(())) => Ok(st.alloc()),
            Some(Err(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn close(&self, fd: RawFd) {
        let mut st = self.state.borrow_mut();
        if st.open.remove(&fd).is_some() {
            st.closed.push(fd);
        }
    }

    fn bound_port(&self, fd: RawFd) -> io::Result<u16> {
        let mut st = self.state.borrow_mut();
        st.check(SetupStep::BoundPort)?;
        st.entry(fd)?
            .port
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn free_descriptors(&self, wanted: usize) -> io::Result<usize> {
        let mut st = self.state.borrow_mut();
        st.budget_requests.push(wanted);
        st.free
            .map(|free| free.min(wanted))
            .map_err(io::Error::from_raw_os_error)
    }
}

/// Poller that reports every requested event as ready, optionally moving a
/// `ManualClock` forward on each wait, and records which descriptors were
/// offered.
#[derive(Debug)]
pub struct ScriptedPoller {
    /// Report readiness; when false every wait times out.
    pub ready: bool,
    /// Simulated cost of each wait.
    pub step: Option<(ManualClock, Duration)>,
    /// Errors returned (as errno) before any further wait.
    pub errors: VecDeque<i32>,
    offered: Rc<RefCell<Vec<RawFd>>>,
}

impl ScriptedPoller {
    pub fn new() -> Self {
        Self {
            ready: true,
            step: None,
            errors: VecDeque::new(),
            offered: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Shared log of every descriptor placed in a poll set.
    pub fn offered(&self) -> Rc<RefCell<Vec<RawFd>>> {
        self.offered.clone()
    }
}

impl Poller for ScriptedPoller {
    fn poll(&mut self, fds: &mut [PollFd], _timeout: Option<Duration>) -> io::Result<usize> {
        if let Some((clock, step)) = &self.step {
            clock.advance(*step);
        }
        if let Some(errno) = self.errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        self.offered.borrow_mut().extend(fds.iter().map(|p| p.fd));
        if !self.ready {
            return Ok(0);
        }
        for p in fds.iter_mut() {
            p.revents = p.events;
        }
        Ok(fds.len())
    }
}

/// Connection stand-in: counts events and closes its descriptor through
/// the socket layer when dropped.
pub struct TestConnection {
    fd: RawFd,
    pub methods: MethodRegistry,
    sockets: Option<Rc<dyn SocketApi>>,
    events: Rc<Cell<usize>>,
}

impl TestConnection {
    pub fn new(fd: RawFd, methods: MethodRegistry) -> Self {
        Self {
            fd,
            methods,
            sockets: None,
            events: Rc::new(Cell::new(0)),
        }
    }

    pub fn with_sockets(fd: RawFd, methods: MethodRegistry, sockets: Rc<dyn SocketApi>) -> Self {
        Self {
            fd,
            methods,
            sockets: Some(sockets),
            events: Rc::new(Cell::new(0)),
        }
    }

    pub fn events(&self) -> Rc<Cell<usize>> {
        self.events.clone()
    }
}

impl Source for TestConnection {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn handle_event(&mut self, _ready: EventMask, _cx: &mut Context<'_>) -> Interest {
        self.events.set(self.events.get() + 1);
        Interest::ContinueMonitoring
    }
}

impl Drop for TestConnection {
    fn drop(&mut self) {
        if let Some(sockets) = self.sockets.take() {
            sockets.close(self.fd);
        }
    }
}
