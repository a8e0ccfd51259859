//! Listening socket setup with rollback.
//!
//! Each step runs only after the previous one succeeded. Any failure
//! closes the descriptor, logs which step failed and returns it, so a
//! failed call leaves nothing behind and the caller may retry at once.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{SetupError, SetupStep};
use crate::socket::SocketApi;

/// Create, configure, bind and listen. Returns the descriptor and the
/// port it is actually bound to (relevant when `port` is 0).
pub fn open_listener(
    sockets: &dyn SocketApi,
    port: u16,
    backlog: i32,
) -> Result<(RawFd, u16), SetupError> {
    let fd = sockets.socket().map_err(|e| {
        tracing::error!(port, error = %e, "{}", SetupStep::Create);
        SetupError::new(SetupStep::Create, e)
    })?;

    match configure(sockets, fd, port, backlog) {
        Ok(bound) => {
            tracing::debug!(fd, port = bound, backlog, "listening socket ready");
            Ok((fd, bound))
        }
        Err((step, e)) => {
            tracing::error!(fd, port, error = %e, "{}", step);
            sockets.close(fd);
            Err(SetupError::new(step, e))
        }
    }
}

fn configure(
    sockets: &dyn SocketApi,
    fd: RawFd,
    port: u16,
    backlog: i32,
) -> Result<u16, (SetupStep, io::Error)> {
    sockets
        .set_non_blocking(fd)
        .map_err(|e| (SetupStep::NonBlocking, e))?;
    sockets
        .set_reuse_addr(fd)
        .map_err(|e| (SetupStep::ReuseAddr, e))?;
    sockets.bind(fd, port).map_err(|e| (SetupStep::Bind, e))?;
    sockets
        .listen(fd, backlog)
        .map_err(|e| (SetupStep::Listen, e))?;
    sockets.bound_port(fd).map_err(|e| (SetupStep::BoundPort, e))
}
