//! # rpcd-core
//!
//! Core types for the rpcd RPC server.
//!
//! This crate is platform-agnostic and contains no socket code.
//! Listening, accepting and the readiness loop live in `rpcd-server`.
//!
//! ## Modules
//!
//! - `value` - RPC value representation (tagged union of protocol types)
//! - `fault` - Protocol-level faults returned by methods
//! - `method` - The `Method` trait implemented by every callable
//! - `registry` - Name → method mapping shared with connections
//! - `introspection` - `system.listMethods` / `system.methodHelp` and their toggle
//! - `env` - Environment variable utilities

pub mod value;
pub mod fault;
pub mod method;
pub mod registry;
pub mod introspection;
pub mod env;

// Re-exports for convenience
pub use value::{Value, ValueType};
pub use fault::{Fault, FaultCode};
pub use method::Method;
pub use registry::{MethodRegistry, WeakRegistry};
pub use introspection::{Introspection, LIST_METHODS, METHOD_HELP, MULTICALL};
pub use env::{env_get, env_get_bool, env_get_opt};
