//! Connection factory seam.
//!
//! The server never looks inside a connection. It accepts the descriptor,
//! asks the factory for a `Source` that owns it, and moves that source
//! into the dispatcher.

use std::os::unix::io::RawFd;

use rpcd_core::MethodRegistry;

use crate::dispatch::Source;

/// Builds the per-connection protocol handler for an accepted client.
///
/// **Contract:** the returned source owns `fd` and must close it when
/// dropped or when `Source::close()` is called. `fd` is already
/// non-blocking.
pub trait ConnectionFactory {
    fn create_connection(&self, fd: RawFd, methods: MethodRegistry) -> Box<dyn Source>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(RawFd, MethodRegistry) -> Box<dyn Source>,
{
    fn create_connection(&self, fd: RawFd, methods: MethodRegistry) -> Box<dyn Source> {
        self(fd, methods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConnection;

    #[test]
    fn test_closure_is_a_factory() {
        let factory = |fd: RawFd, methods: MethodRegistry| -> Box<dyn Source> {
            Box::new(TestConnection::new(fd, methods))
        };
        let conn = factory.create_connection(42, MethodRegistry::new());
        assert_eq!(conn.fd(), 42);
    }
}
