//! rpcd Echo Server
//!
//! Single-threaded demo server over the rpcd core. Each line a client sends
//! is one call: `method arg...`.
//!
//! Usage:
//!     cargo build --release -p rpcd-echo
//!     ./target/release/rpcd-echo [port] [--backlog N] [--no-introspection] [--tick-ms MS]
//!
//! Test with:
//!     printf 'add 1 2\nsystem.listMethods\nsystem.methodHelp add\n' | nc localhost 9999
//!
//! Logging follows `RUST_LOG` (default `info,rpcd=debug`).

mod connection;
mod methods;

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rpcd_core::MethodRegistry;
use rpcd_server::{Server, ServerConfig, Source};

use connection::LineConnection;
use methods::{Add, Echo};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "rpcd-echo")]
#[command(about = "Line-oriented demo server for the rpcd core")]
struct Args {
    /// TCP port to listen on (0 picks a free port)
    #[arg(default_value_t = 9999)]
    port: u16,

    /// listen(2) backlog (overrides RPCD_BACKLOG)
    #[arg(long)]
    backlog: Option<i32>,

    /// Do not register system.listMethods / system.methodHelp
    #[arg(long)]
    no_introspection: bool,

    /// Longest single wait before the shutdown flag is checked (ms)
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rpcd=debug")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // SIGINT/SIGTERM for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    let mut config = ServerConfig::from_env().introspection(!args.no_introspection);
    if let Some(backlog) = args.backlog {
        config = config.backlog(backlog);
    }

    let mut server = Server::builder()
        .config(config)
        .build(|fd: RawFd, methods: MethodRegistry| -> Box<dyn Source> {
            Box::new(LineConnection::new(fd, methods))
        })?;
    server.add_method(Rc::new(Echo));
    server.add_method(Rc::new(Add));

    let port = server.bind(args.port)?;
    tracing::info!(port, "rpcd-echo ready");

    let tick = Duration::from_millis(args.tick_ms.max(1));
    while RUNNING.load(Ordering::Relaxed) {
        let started = Instant::now();
        server.work(Some(tick));

        // Nothing is monitored while the listener backs off with no clients
        if server.accept_error() {
            if let Some(rest) = tick.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    tracing::info!("shutting down");
    server.shutdown();
    Ok(())
}
