//! Library defaults for `ServerConfig`.

// Pending-connection queue length passed to listen(2)
pub const BACKLOG: i32 = 5;

// Delay before the listener is monitored again after a failed accept (ms)
pub const ACCEPT_RETRY_MS: u64 = 1000;

// Free descriptors that must remain for a new connection to be admitted
pub const FD_RESERVE: usize = 32;

// Register system.listMethods / system.methodHelp at startup
pub const INTROSPECTION: bool = false;
