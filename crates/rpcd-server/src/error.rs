//! Server error types.

use std::fmt;
use std::io;

use thiserror::Error;

/// One step of listening-socket setup, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    /// socket(2)
    Create,
    /// O_NONBLOCK on the listening descriptor
    NonBlocking,
    /// SO_REUSEADDR
    ReuseAddr,
    /// bind(2)
    Bind,
    /// listen(2)
    Listen,
    /// getsockname(2) to read back the bound port
    BoundPort,
}

impl SetupStep {
    pub const ALL: [SetupStep; 6] = [
        SetupStep::Create,
        SetupStep::NonBlocking,
        SetupStep::ReuseAddr,
        SetupStep::Bind,
        SetupStep::Listen,
        SetupStep::BoundPort,
    ];
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            SetupStep::Create => "could not create socket",
            SetupStep::NonBlocking => "could not set socket to non-blocking input mode",
            SetupStep::ReuseAddr => "could not set SO_REUSEADDR socket option",
            SetupStep::Bind => "could not bind to specified port",
            SetupStep::Listen => "could not set socket in listening mode",
            SetupStep::BoundPort => "could not read back bound port",
        };
        f.write_str(what)
    }
}

/// Listening-socket setup failed. The descriptor has already been closed.
#[derive(Debug, Error)]
#[error("{step} ({source})")]
pub struct SetupError {
    pub step: SetupStep,
    #[source]
    pub source: io::Error,
}

impl SetupError {
    pub fn new(step: SetupStep, source: io::Error) -> Self {
        Self { step, source }
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    InvalidValue(&'static str),
}
