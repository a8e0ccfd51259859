//! The callable-method abstraction.
//!
//! Every remotely invocable operation implements `Method`. The server and
//! its connections only ever see `Rc<dyn Method>` handles; concrete types
//! stay with whoever registered them.

use crate::fault::Fault;
use crate::value::Value;

/// A named remote method.
///
/// **Contract:**
/// - `name()` is the registry key and must not change after registration.
/// - `execute()` runs on the server thread and must not block.
/// - Argument problems are reported as `Err(Fault)`, never by panicking.
pub trait Method {
    /// Protocol name, e.g. `"system.listMethods"`.
    fn name(&self) -> &str;

    /// Human-readable documentation returned by `system.methodHelp`.
    fn help(&self) -> String {
        String::new()
    }

    /// Invoke the method. `params` is the positional parameter array.
    fn execute(&self, params: &Value) -> Result<Value, Fault>;
}

impl std::fmt::Debug for dyn Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method").field("name", &self.name()).finish()
    }
}
