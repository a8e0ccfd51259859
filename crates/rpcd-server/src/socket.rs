//! Synchronous socket primitives.
//!
//! `SocketApi` is the thin syscall layer the listener lifecycle and the
//! acceptor are written against. Every call returns immediately; errors
//! carry the OS error (and therefore its message) in `io::Error`.
//!
//! # Implementors
//!
//! - `SysSocket` (default): IPv4 TCP over `libc`, descriptor flags via `nix`.
//! - `testing::FakeSockets` (tests only): scripted failures, leak tracking.

use std::io;
use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::resource::{getrlimit, Resource};

/// Socket syscalls used by the server.
///
/// **Contract:** no method may block. Descriptors are plain `RawFd`s; the
/// caller owns them and must hand every descriptor it no longer needs to
/// `close()`.
pub trait SocketApi {
    /// Create an IPv4 stream socket.
    fn socket(&self) -> io::Result<RawFd>;

    fn set_non_blocking(&self, fd: RawFd) -> io::Result<()>;

    /// Allow the port to be re-bound immediately after a restart.
    fn set_reuse_addr(&self, fd: RawFd) -> io::Result<()>;

    /// Bind to `port` on all interfaces. Port 0 asks for an ephemeral port.
    fn bind(&self, fd: RawFd, port: u16) -> io::Result<()>;

    fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()>;

    /// Accept one pending client. `WouldBlock` when none is queued.
    fn accept(&self, fd: RawFd) -> io::Result<RawFd>;

    fn close(&self, fd: RawFd);

    /// Port the descriptor is actually bound to.
    fn bound_port(&self, fd: RawFd) -> io::Result<u16>;

    /// Descriptors this process can still open before hitting its limit,
    /// counted up to `wanted`. The result never exceeds `wanted`, so the
    /// cost stays bounded by what the caller needs to know.
    fn free_descriptors(&self, wanted: usize) -> io::Result<usize>;
}

/// `SocketApi` over the host's BSD socket calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysSocket;

impl SysSocket {
    pub fn new() -> Self {
        Self
    }
}

#[inline]
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SOCK_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;

        fn raw_accept(fd: RawFd) -> libc::c_int {
            unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC) }
        }
    } else {
        const SOCK_FLAGS: libc::c_int = 0;

        fn raw_accept(fd: RawFd) -> libc::c_int {
            unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) }
        }
    }
}

/// Count unused descriptor slots below `limit`, highest first, stopping
/// once `wanted` are found. Closed slots report POLLNVAL.
fn count_free_slots(limit: usize, wanted: usize) -> io::Result<usize> {
    const CHUNK: usize = 64;
    let mut free = 0;
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(CHUNK);
    let mut end = limit;
    while end > 0 && free < wanted {
        let start = end.saturating_sub(CHUNK);
        fds.clear();
        fds.extend((start..end).map(|fd| libc::pollfd {
            fd: fd as RawFd,
            events: 0,
            revents: 0,
        }));
        cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) })?;
        free += fds.iter().filter(|p| p.revents & libc::POLLNVAL != 0).count();
        end = start;
    }
    Ok(free.min(wanted))
}

impl SocketApi for SysSocket {
    fn socket(&self) -> io::Result<RawFd> {
        cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | SOCK_FLAGS, 0) })
    }

    fn set_non_blocking(&self, fd: RawFd) -> io::Result<()> {
        let flags = fcntl(fd, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    fn set_reuse_addr(&self, fd: RawFd) -> io::Result<()> {
        let opt: libc::c_int = 1;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    fn bind(&self, fd: RawFd, port: u16) -> io::Result<()> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        addr.sin_port = port.to_be();

        cvt(unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(&addr) as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()> {
        cvt(unsafe { libc::listen(fd, backlog) })?;
        Ok(())
    }

    fn accept(&self, fd: RawFd) -> io::Result<RawFd> {
        cvt(raw_accept(fd))
    }

    fn close(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn bound_port(&self, fd: RawFd) -> io::Result<u16> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        Ok(u16::from_be(addr.sin_port))
    }

    fn free_descriptors(&self, wanted: usize) -> io::Result<usize> {
        let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
        if soft == libc::RLIM_INFINITY {
            return Ok(wanted);
        }
        // Descriptors are ints whatever the limit says
        let limit = usize::try_from(soft).unwrap_or(usize::MAX).min(RawFd::MAX as usize);
        count_free_slots(limit, wanted)
    }
}
