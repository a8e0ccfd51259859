//! Environment variable utilities
//!
//! Runtime overrides for server configuration are read through these
//! helpers. Unset or unparsable variables fall back to the caller's default
//! and log the rejected value, so a typo never aborts startup.
//!
//! # Usage
//!
//! ```ignore
//! use rpcd_core::env::{env_get, env_get_bool};
//!
//! let backlog: i32 = env_get("RPCD_BACKLOG", 5);
//! let introspection = env_get_bool("RPCD_INTROSPECTION", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" as true and "0", "false", "no", "off"
/// as false (case-insensitive). Anything else returns the default.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unrecognised boolean");
            default
        }
    }
}

/// Get environment variable as optional value
///
/// Returns `Some(T)` if the variable is set and parses successfully.
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable value");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
