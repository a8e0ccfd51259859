//! The server: composition root for registry, introspection, listener and
//! dispatcher.
//!
//! # Example
//!
//! ```ignore
//! use rpcd_server::Server;
//!
//! let mut server = Server::builder()
//!     .config(ServerConfig::from_env().introspection(true))
//!     .build(|fd, methods| -> Box<dyn Source> { Box::new(MyConnection::new(fd, methods)) })?;
//!
//! server.add_method(Rc::new(Echo));
//! let port = server.bind(8080)?;
//! server.work(None);
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rpcd_core::{Introspection, Method, MethodRegistry, Value};

use crate::accept::{Acceptor, AdmissionPolicy, ListenerSource};
use crate::clock::{Clock, MonotonicClock};
use crate::config::ServerConfig;
use crate::connection::ConnectionFactory;
use crate::dispatch::{Dispatcher, EventMask, ExitHandle, Poller, SysPoller};
use crate::error::{ConfigError, SetupError};
use crate::listen::open_listener;
use crate::socket::{SocketApi, SysSocket};

/// Builder for `Server`. Collaborators left unset use the system ones.
#[derive(Default)]
pub struct ServerBuilder {
    config: Option<ServerConfig>,
    sockets: Option<Rc<dyn SocketApi>>,
    poller: Option<Box<dyn Poller>>,
    clock: Option<Rc<dyn Clock>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration to use. Defaults to `ServerConfig::from_env()`.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn sockets(mut self, sockets: Rc<dyn SocketApi>) -> Self {
        self.sockets = Some(sockets);
        self
    }

    pub fn poller(mut self, poller: Box<dyn Poller>) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the server.
    pub fn build<F>(self, factory: F) -> Result<Server, ConfigError>
    where
        F: ConnectionFactory + 'static,
    {
        let config = self.config.unwrap_or_else(ServerConfig::from_env);
        config.validate()?;
        config.log();

        let sockets = self.sockets.unwrap_or_else(|| Rc::new(SysSocket::new()));
        let poller = self.poller.unwrap_or_else(|| Box::new(SysPoller::new()));
        let clock = self.clock.unwrap_or_else(|| Rc::new(MonotonicClock::new()));
        Ok(Server::assemble(config, sockets, poller, clock, Box::new(factory)))
    }
}

/// RPC server core.
///
/// Owns the method registry, the introspection helpers, the listening
/// socket and the dispatcher that drives the listener and every accepted
/// connection. Single-threaded: the server is `!Send`.
pub struct Server {
    config: ServerConfig,
    sockets: Rc<dyn SocketApi>,
    dispatcher: Dispatcher,
    acceptor: Rc<RefCell<Acceptor>>,
    methods: MethodRegistry,
    introspection: Introspection,
    port: u16,
}

impl Server {
    /// Server with library default configuration and system collaborators.
    pub fn new<F>(factory: F) -> Self
    where
        F: ConnectionFactory + 'static,
    {
        Self::assemble(
            ServerConfig::default(),
            Rc::new(SysSocket::new()),
            Box::new(SysPoller::new()),
            Rc::new(MonotonicClock::new()),
            Box::new(factory),
        )
    }

    fn assemble(
        config: ServerConfig,
        sockets: Rc<dyn SocketApi>,
        poller: Box<dyn Poller>,
        clock: Rc<dyn Clock>,
        factory: Box<dyn ConnectionFactory>,
    ) -> Self {
        let methods = MethodRegistry::new();
        let acceptor = Acceptor::new(
            sockets.clone(),
            factory,
            methods.clone(),
            AdmissionPolicy::new(config.fd_reserve),
            config.accept_retry_interval,
        );

        let mut server = Self {
            sockets,
            dispatcher: Dispatcher::new(poller, clock),
            acceptor: Rc::new(RefCell::new(acceptor)),
            methods,
            introspection: Introspection::new(),
            port: 0,
            config,
        };
        if server.config.introspection {
            server.enable_introspection(true);
        }
        server
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    /// Register `method`, replacing any method of the same name.
    pub fn add_method(&self, method: Rc<dyn Method>) {
        if let Some(old) = self.methods.add_method(method) {
            tracing::debug!(method = old.name(), "method replaced");
        }
    }

    pub fn remove_method(&self, method: &dyn Method) {
        self.methods.remove_method(method);
    }

    pub fn remove_method_named(&self, name: &str) {
        self.methods.remove_method_named(name);
    }

    pub fn find_method(&self, name: &str) -> Option<Rc<dyn Method>> {
        self.methods.find_method(name)
    }

    /// Names of all registered methods followed by `system.multicall`.
    pub fn list_methods(&self) -> Value {
        self.methods.list_methods()
    }

    /// Shared registry handle, as given to connections.
    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    pub fn enable_introspection(&mut self, enabled: bool) {
        self.introspection.set_enabled(enabled, &self.methods);
    }

    pub fn introspection_enabled(&self) -> bool {
        self.introspection.is_enabled()
    }

    // ------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------

    /// `bind_and_listen` with the configured backlog.
    pub fn bind(&mut self, port: u16) -> Result<u16, SetupError> {
        self.bind_and_listen(port, self.config.backlog)
    }

    /// Set up a listener on `port` (0 = ephemeral) and start accepting.
    ///
    /// Returns the bound port. On failure nothing changes: a previous
    /// listener stays in place and `port()` keeps its value.
    pub fn bind_and_listen(&mut self, port: u16, backlog: i32) -> Result<u16, SetupError> {
        let (fd, bound) = open_listener(&*self.sockets, port, backlog)?;

        let old = self.acceptor.borrow().fd();
        if let Some(old) = old {
            self.dispatcher.remove_source(old);
            tracing::debug!(old, new = fd, "replacing listener");
        }
        self.acceptor.borrow_mut().attach(fd);
        self.port = bound;

        let source = ListenerSource::new(fd, self.acceptor.clone());
        self.dispatcher.add_source(Box::new(source), EventMask::READABLE);
        tracing::info!(port = bound, fd, backlog, "listening");
        Ok(bound)
    }

    /// Bound port, or 0 if never bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True while accepting is suspended after a failed accept.
    pub fn accept_error(&self) -> bool {
        self.acceptor.borrow().accept_error()
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Serve for up to `timeout` (`None` = until `exit()` or nothing is left
    /// to monitor).
    pub fn work(&mut self, timeout: Option<Duration>) {
        self.rearm_listener();
        self.dispatcher.work(timeout);
    }

    fn rearm_listener(&mut self) {
        let now = self.dispatcher.now();
        let fd = {
            let mut acceptor = self.acceptor.borrow_mut();
            let Some(fd) = acceptor.fd() else {
                return;
            };
            if !acceptor.retry_due(now) || self.dispatcher.contains(fd) {
                return;
            }
            acceptor.rearm();
            fd
        };
        tracing::debug!(fd, "accept retry due, monitoring listener again");
        let source = ListenerSource::new(fd, self.acceptor.clone());
        self.dispatcher.add_source(Box::new(source), EventMask::READABLE);
    }

    /// Ask a running `work` to return after its current pass.
    pub fn exit(&self) {
        self.dispatcher.exit();
    }

    /// Handle for requesting exit from inside a handler or method.
    pub fn exit_handle(&self) -> ExitHandle {
        self.dispatcher.exit_handle()
    }

    /// Close every connection and the listener. Registry, introspection and
    /// `port()` are kept. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if !self.dispatcher.is_empty() {
            tracing::debug!(sources = self.dispatcher.len(), "shutting down");
        }
        self.dispatcher.clear();
        self.acceptor.borrow_mut().close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("config", &self.config)
            .field("methods", &self.methods)
            .field("introspection", &self.introspection.is_enabled())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
