//! # Dispatcher: the single-threaded readiness loop
//!
//! The dispatcher owns a set of event sources (the server's listener and
//! every live connection) and repeatedly:
//! 1. Builds a `PollFd` per source from its event mask
//! 2. Waits in `Poller::poll()` for up to the remaining timeout
//! 3. Calls `handle_event()` on each ready source
//! 4. Keeps or drops the source according to the returned `Interest`
//! 5. Installs sources created during the pass (newly accepted clients)
//!
//! Dropping a source releases it. A connection owns its descriptor, so
//! dropping it closes the socket; the server's listener is shared with the
//! server and survives being dropped from monitoring.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;

/// Readiness kinds a source can wait for, and that a poll reports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READABLE: EventMask = EventMask(1 << 0);
    pub const WRITABLE: EventMask = EventMask(1 << 1);
    pub const EXCEPTION: EventMask = EventMask(1 << 2);

    #[inline]
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(EventMask::READABLE) {
            parts.push("READABLE");
        }
        if self.contains(EventMask::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.contains(EventMask::EXCEPTION) {
            parts.push("EXCEPTION");
        }
        if parts.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

/// What a source wants after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Keep the source registered.
    ContinueMonitoring,
    /// Remove the source; the dispatcher drops it.
    StopMonitoring,
}

/// An I/O source driven by the dispatcher.
///
/// **Contract:**
/// - `handle_event()` must NEVER block; the descriptor is non-blocking.
/// - `fd()` must stay the same while the source is registered.
pub trait Source {
    fn fd(&self) -> RawFd;

    /// React to readiness. New sources and mask changes go through `cx`.
    fn handle_event(&mut self, ready: EventMask, cx: &mut Context<'_>) -> Interest;

    /// Release the descriptor. Called by `Dispatcher::clear()` before the
    /// source is dropped. Sources that close in `Drop` can ignore it.
    fn close(&mut self) {}
}

struct Entry {
    source: Box<dyn Source>,
    mask: EventMask,
}

/// Handler-side view of the dispatcher during one event.
pub struct Context<'a> {
    now: Duration,
    mask: EventMask,
    added: &'a mut Vec<Entry>,
    exit: &'a ExitHandle,
}

impl<'a> Context<'a> {
    /// Dispatcher time at the end of the wait that produced this event.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Mask of the source being handled.
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Change what the source being handled waits for.
    pub fn set_mask(&mut self, mask: EventMask) {
        self.mask = mask;
    }

    /// Hand a new source to the dispatcher. It is monitored from the next
    /// pass on; ownership moves to the dispatcher.
    pub fn add_source(&mut self, source: Box<dyn Source>, mask: EventMask) {
        self.added.push(Entry { source, mask });
    }

    /// Ask the loop to return after the current pass.
    pub fn request_exit(&self) {
        self.exit.exit();
    }
}

/// One descriptor in a poll set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: EventMask,
    pub revents: EventMask,
}

impl PollFd {
    pub fn new(fd: RawFd, events: EventMask) -> Self {
        Self {
            fd,
            events,
            revents: EventMask::NONE,
        }
    }
}

/// Readiness wait.
///
/// **Contract:** fill `revents` for every ready entry and return the number
/// of ready entries. `timeout = None` waits indefinitely. Interrupted waits
/// return `ErrorKind::Interrupted`.
pub trait Poller {
    fn poll(&mut self, fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize>;
}

/// `Poller` over `poll(2)`.
#[derive(Debug, Default)]
pub struct SysPoller {
    raw: Vec<libc::pollfd>,
}

impl SysPoller {
    pub fn new() -> Self {
        Self::default()
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so a sub-millisecond remainder still waits
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Poller for SysPoller {
    fn poll(&mut self, fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize> {
        self.raw.clear();
        self.raw.extend(fds.iter().map(|p| {
            let mut events = 0;
            if p.events.contains(EventMask::READABLE) {
                events |= libc::POLLIN;
            }
            if p.events.contains(EventMask::WRITABLE) {
                events |= libc::POLLOUT;
            }
            if p.events.contains(EventMask::EXCEPTION) {
                events |= libc::POLLPRI;
            }
            libc::pollfd {
                fd: p.fd,
                events,
                revents: 0,
            }
        }));

        let n = unsafe {
            libc::poll(
                self.raw.as_mut_ptr(),
                self.raw.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for (p, raw) in fds.iter_mut().zip(self.raw.iter()) {
            let mut revents = EventMask::NONE;
            // Hangup and errors surface as readable so the owner sees EOF
            if raw.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                && p.events.contains(EventMask::READABLE)
            {
                revents |= EventMask::READABLE;
            }
            if raw.revents & libc::POLLOUT != 0 {
                revents |= EventMask::WRITABLE;
            }
            if raw.revents & (libc::POLLPRI | libc::POLLNVAL | libc::POLLERR) != 0 {
                revents |= EventMask::EXCEPTION;
            }
            p.revents = revents;
        }
        Ok(n as usize)
    }
}

/// Cooperative stop request for `Dispatcher::work`. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct ExitHandle {
    requested: Rc<Cell<bool>>,
}

impl ExitHandle {
    pub fn exit(&self) {
        self.requested.set(true);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.get()
    }

    fn reset(&self) {
        self.requested.set(false);
    }
}

/// Owns the registered sources and runs the readiness loop.
pub struct Dispatcher {
    sources: Vec<Entry>,
    poller: Box<dyn Poller>,
    clock: Rc<dyn Clock>,
    exit: ExitHandle,
}

impl Dispatcher {
    pub fn new(poller: Box<dyn Poller>, clock: Rc<dyn Clock>) -> Self {
        Self {
            sources: Vec::new(),
            poller,
            clock,
            exit: ExitHandle::default(),
        }
    }

    /// Monitor `source` for `mask`. Ownership moves to the dispatcher.
    ///
    /// A descriptor may be registered at most once.
    pub fn add_source(&mut self, source: Box<dyn Source>, mask: EventMask) {
        debug_assert!(
            !self.contains(source.fd()),
            "fd {} registered twice",
            source.fd()
        );
        tracing::trace!(fd = source.fd(), ?mask, "add source");
        self.sources.push(Entry { source, mask });
    }

    /// Stop monitoring `fd` and return its source. `None` if absent.
    pub fn remove_source(&mut self, fd: RawFd) -> Option<Box<dyn Source>> {
        let idx = self.sources.iter().position(|e| e.source.fd() == fd)?;
        tracing::trace!(fd, "remove source");
        Some(self.sources.remove(idx).source)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.sources.iter().any(|e| e.source.fd() == fd)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Request that `work` return after its current pass.
    pub fn exit(&self) {
        self.exit.exit();
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    /// Close and drop every source.
    pub fn clear(&mut self) {
        for mut entry in self.sources.drain(..) {
            entry.source.close();
        }
    }

    /// Run the loop for up to `timeout` (`None` = until `exit()`), or until
    /// no sources remain.
    pub fn work(&mut self, timeout: Option<Duration>) {
        let end = timeout.map(|t| self.clock.now() + t);
        self.exit.reset();

        let mut fds: Vec<PollFd> = Vec::new();
        while !self.sources.is_empty() {
            fds.clear();
            fds.extend(self.sources.iter().map(|e| PollFd::new(e.source.fd(), e.mask)));

            let wait = end.map(|end| end.saturating_sub(self.clock.now()));
            match self.poller.poll(&mut fds, wait) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "dispatcher: error in poll");
                    return;
                }
            }

            self.dispatch_ready(&fds);

            if self.exit.is_requested() {
                break;
            }
            if let Some(end) = end {
                if self.clock.now() >= end {
                    break;
                }
            }
        }
    }

    /// Deliver one pass of readiness to the sources that reported any.
    fn dispatch_ready(&mut self, fds: &[PollFd]) {
        let now = self.clock.now();
        let mut added = Vec::new();
        let mut kept = Vec::with_capacity(self.sources.len());

        for (mut entry, pfd) in self.sources.drain(..).zip(fds.iter()) {
            if pfd.revents.is_empty() {
                kept.push(entry);
                continue;
            }

            let mut cx = Context {
                now,
                mask: entry.mask,
                added: &mut added,
                exit: &self.exit,
            };
            match entry.source.handle_event(pfd.revents, &mut cx) {
                Interest::ContinueMonitoring => {
                    entry.mask = cx.mask;
                    kept.push(entry);
                }
                Interest::StopMonitoring => {
                    tracing::trace!(fd = pfd.fd, "source dropped from monitoring");
                }
            }
        }

        kept.append(&mut added);
        self.sources = kept;
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fds: Vec<RawFd> = self.sources.iter().map(|e| e.source.fd()).collect();
        f.debug_struct("Dispatcher")
            .field("sources", &fds)
            .field("exit_requested", &self.exit.is_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::ScriptedPoller;
    use std::cell::RefCell;

    /// Source that logs every event and follows a script of answers.
    struct Scripted {
        fd: RawFd,
        answers: Vec<Interest>,
        log: Rc<RefCell<Vec<RawFd>>>,
        closed: Rc<Cell<usize>>,
        spawn: Option<RawFd>,
    }

    impl Scripted {
        fn new(fd: RawFd, log: &Rc<RefCell<Vec<RawFd>>>) -> Self {
            Self {
                fd,
                answers: Vec::new(),
                log: log.clone(),
                closed: Rc::new(Cell::new(0)),
                spawn: None,
            }
        }
    }

    impl Source for Scripted {
        fn fd(&self) -> RawFd {
            self.fd
        }

        fn handle_event(&mut self, _ready: EventMask, cx: &mut Context<'_>) -> Interest {
            self.log.borrow_mut().push(self.fd);
            if let Some(child) = self.spawn.take() {
                let child = Scripted::new(child, &self.log);
                cx.add_source(Box::new(child), EventMask::READABLE);
            }
            if self.answers.is_empty() {
                Interest::ContinueMonitoring
            } else {
                self.answers.remove(0)
            }
        }

        fn close(&mut self) {
            self.closed.set(self.closed.get() + 1);
        }
    }

    fn dispatcher() -> (Dispatcher, ManualClock) {
        let clock = ManualClock::new();
        let poller = ScriptedPoller::new();
        (Dispatcher::new(Box::new(poller), Rc::new(clock.clone())), clock)
    }

    #[test]
    fn test_work_without_sources_returns() {
        let (mut disp, _clock) = dispatcher();
        disp.work(None);
        disp.work(Some(Duration::from_secs(10)));
        assert!(disp.is_empty());
    }

    #[test]
    fn test_stop_monitoring_drops_source() {
        let (mut disp, _clock) = dispatcher();
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut a = Scripted::new(5, &log);
        a.answers = vec![Interest::StopMonitoring];
        let b = Scripted::new(6, &log);
        disp.add_source(Box::new(a), EventMask::READABLE);
        disp.add_source(Box::new(b), EventMask::READABLE);

        disp.work(Some(Duration::ZERO));
        assert_eq!(*log.borrow(), vec![5, 6]);
        assert!(!disp.contains(5));
        assert!(disp.contains(6));

        disp.work(Some(Duration::ZERO));
        assert_eq!(*log.borrow(), vec![5, 6, 6]);
    }

    #[test]
    fn test_sources_added_during_pass_join_next_pass() {
        let (mut disp, _clock) = dispatcher();
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut parent = Scripted::new(3, &log);
        parent.spawn = Some(9);
        disp.add_source(Box::new(parent), EventMask::READABLE);

        disp.work(Some(Duration::ZERO));
        assert_eq!(*log.borrow(), vec![3]);
        assert!(disp.contains(9));

        disp.work(Some(Duration::ZERO));
        assert_eq!(*log.borrow(), vec![3, 3, 9]);
    }

    #[test]
    fn test_remove_source_is_safe_when_absent() {
        let (mut disp, _clock) = dispatcher();
        let log = Rc::new(RefCell::new(Vec::new()));
        disp.add_source(Box::new(Scripted::new(4, &log)), EventMask::READABLE);

        assert!(disp.remove_source(4).is_some());
        assert!(disp.remove_source(4).is_none());
        assert!(disp.is_empty());
    }

    #[test]
    fn test_clear_closes_everything() {
        let (mut disp, _clock) = dispatcher();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = Scripted::new(7, &log);
        let closed = a.closed.clone();
        disp.add_source(Box::new(a), EventMask::READABLE);
        disp.add_source(Box::new(Scripted::new(8, &log)), EventMask::READABLE);

        disp.clear();
        assert!(disp.is_empty());
        assert_eq!(closed.get(), 1);

        // Clearing an empty dispatcher is fine
        disp.clear();
        disp.work(Some(Duration::ZERO));
    }

    #[test]
    fn test_exit_stops_after_current_pass() {
        let clock = ManualClock::new();
        let mut poller = ScriptedPoller::new();
        // Each wait costs 10ms of simulated time
        poller.step = Some((clock.clone(), Duration::from_millis(10)));
        let mut disp = Dispatcher::new(Box::new(poller), Rc::new(clock.clone()));

        struct Quitter;
        impl Source for Quitter {
            fn fd(&self) -> RawFd {
                11
            }
            fn handle_event(&mut self, _ready: EventMask, cx: &mut Context<'_>) -> Interest {
                cx.request_exit();
                Interest::ContinueMonitoring
            }
        }
        disp.add_source(Box::new(Quitter), EventMask::READABLE);

        // Unbounded wait returns after one pass because of the request
        disp.work(None);
        assert_eq!(clock.now(), Duration::from_millis(10));

        // The request does not leak into the next call
        disp.work(Some(Duration::from_millis(100)));
        assert_eq!(clock.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_work_respects_timeout() {
        let clock = ManualClock::new();
        let mut poller = ScriptedPoller::new();
        poller.ready = false;
        poller.step = Some((clock.clone(), Duration::from_millis(40)));
        let mut disp = Dispatcher::new(Box::new(poller), Rc::new(clock.clone()));
        let log = Rc::new(RefCell::new(Vec::new()));
        disp.add_source(Box::new(Scripted::new(2, &log)), EventMask::READABLE);

        disp.work(Some(Duration::from_millis(100)));
        // Three waits of 40ms: 40, 80, 120 >= 100
        assert_eq!(clock.now(), Duration::from_millis(120));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_poll_errors() {
        let clock = ManualClock::new();
        let mut poller = ScriptedPoller::new();
        poller.errors.push_back(libc::EINTR);
        poller.errors.push_back(libc::EBADF);
        let offered = poller.offered();
        let mut disp = Dispatcher::new(Box::new(poller), Rc::new(clock.clone()));
        let log = Rc::new(RefCell::new(Vec::new()));
        disp.add_source(Box::new(Scripted::new(2, &log)), EventMask::READABLE);

        // EINTR is retried, EBADF ends the call without touching sources
        disp.work(None);
        assert!(offered.borrow().is_empty());
        assert!(log.borrow().is_empty());
        assert!(disp.contains(2));

        disp.work(Some(Duration::ZERO));
        assert_eq!(*log.borrow(), vec![2]);
    }

    #[test]
    fn test_set_mask_persists() {
        let (mut disp, _clock) = dispatcher();

        struct Writer;
        impl Source for Writer {
            fn fd(&self) -> RawFd {
                12
            }
            fn handle_event(&mut self, _ready: EventMask, cx: &mut Context<'_>) -> Interest {
                cx.set_mask(EventMask::WRITABLE);
                Interest::ContinueMonitoring
            }
        }
        disp.add_source(Box::new(Writer), EventMask::READABLE);
        disp.work(Some(Duration::ZERO));
        assert_eq!(disp.sources[0].mask, EventMask::WRITABLE);
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn test_event_mask_ops() {
        let m = EventMask::READABLE | EventMask::WRITABLE;
        assert!(m.contains(EventMask::READABLE));
        assert!(!m.contains(EventMask::EXCEPTION));
        assert!(m.intersects(EventMask::WRITABLE | EventMask::EXCEPTION));
        assert!(EventMask::NONE.is_empty());
        assert_eq!(format!("{:?}", m), "READABLE|WRITABLE");
    }
}
