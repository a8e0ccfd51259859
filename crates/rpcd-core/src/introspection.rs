//! Built-in introspection methods.
//!
//! Two helpers let clients discover what a server offers:
//!
//! - `system.listMethods` - every registered name plus `system.multicall`
//! - `system.methodHelp`  - help text of one named method
//!
//! `Introspection` is the on/off switch. The helpers are built on the first
//! enable and then kept for the owner's whole lifetime, so toggling only
//! adds or removes registry entries.

use std::rc::Rc;

use crate::fault::Fault;
use crate::method::Method;
use crate::registry::{MethodRegistry, WeakRegistry};
use crate::value::Value;

/// Protocol name of the method listing helper.
pub const LIST_METHODS: &str = "system.listMethods";
/// Protocol name of the help lookup helper.
pub const METHOD_HELP: &str = "system.methodHelp";
/// Protocol name of batched calls, advertised by `system.listMethods`.
pub const MULTICALL: &str = "system.multicall";

/// Lists all methods available on a server.
struct ListMethods {
    registry: WeakRegistry,
}

impl Method for ListMethods {
    fn name(&self) -> &str {
        LIST_METHODS
    }

    fn help(&self) -> String {
        "List all methods available on a server as an array of strings".to_string()
    }

    fn execute(&self, _params: &Value) -> Result<Value, Fault> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Fault::internal(format!("{}: server is gone", LIST_METHODS)))?;
        Ok(registry.list_methods())
    }
}

/// Retrieves the help string for a named method.
struct MethodHelp {
    registry: WeakRegistry,
}

impl Method for MethodHelp {
    fn name(&self) -> &str {
        METHOD_HELP
    }

    fn help(&self) -> String {
        "Retrieve the help string for a named method".to_string()
    }

    fn execute(&self, params: &Value) -> Result<Value, Fault> {
        let name = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| Fault::invalid_params(format!("{}: Invalid argument type", METHOD_HELP)))?;

        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Fault::internal(format!("{}: server is gone", METHOD_HELP)))?;

        let method = registry
            .find_method(name)
            .ok_or_else(|| Fault::method_not_found(format!("{}: Unknown method name", METHOD_HELP)))?;

        Ok(Value::String(method.help()))
    }
}

/// The two helper instances, built once.
#[derive(Debug, Clone)]
struct Helpers {
    list_methods: Rc<dyn Method>,
    method_help: Rc<dyn Method>,
}

impl Helpers {
    fn new(registry: &MethodRegistry) -> Self {
        Self {
            list_methods: Rc::new(ListMethods {
                registry: registry.downgrade(),
            }),
            method_help: Rc::new(MethodHelp {
                registry: registry.downgrade(),
            }),
        }
    }
}

/// Introspection on/off switch.
///
/// ```ignore
/// let registry = MethodRegistry::new();
/// let mut introspection = Introspection::default();
///
/// introspection.set_enabled(true, &registry);   // builds + registers helpers
/// introspection.set_enabled(false, &registry);  // unregisters, keeps them
/// introspection.set_enabled(true, &registry);   // re-registers the same ones
/// ```
#[derive(Debug, Default)]
pub struct Introspection {
    enabled: bool,
    helpers: Option<Helpers>,
}

impl Introspection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True once the helpers have been built.
    pub fn is_constructed(&self) -> bool {
        self.helpers.is_some()
    }

    /// Turn introspection on or off. Repeating the current state is a no-op.
    pub fn set_enabled(&mut self, enabled: bool, registry: &MethodRegistry) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;

        if enabled {
            let helpers = self.helpers.get_or_insert_with(|| Helpers::new(registry));
            registry.add_method(helpers.list_methods.clone());
            registry.add_method(helpers.method_help.clone());
            tracing::debug!("introspection enabled");
        } else {
            registry.remove_method_named(LIST_METHODS);
            registry.remove_method_named(METHOD_HELP);
            tracing::debug!("introspection disabled");
        }
    }
}
