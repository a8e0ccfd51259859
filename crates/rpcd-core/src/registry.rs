//! MethodRegistry - name → method mapping
//!
//! The registry is a cheap-to-clone handle over a single shared map. The
//! server owns the primary handle; every connection receives a clone so it
//! can resolve method names while executing requests, and the introspection
//! helpers keep a `WeakRegistry` so the registry never owns itself.
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). Borrows are never
//! held across a call into `Method::execute`, so a method may freely use the
//! registry (that is exactly what `system.listMethods` does).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::introspection::MULTICALL;
use crate::method::Method;
use crate::value::Value;

type MethodMap = BTreeMap<String, Rc<dyn Method>>;

/// Shared handle to the method table.
///
/// Invariant: at most one method per name; the last `add_method` wins.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Rc<RefCell<MethodMap>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under its own name, replacing any previous entry.
    ///
    /// Returns the method that was replaced, if any.
    pub fn add_method(&self, method: Rc<dyn Method>) -> Option<Rc<dyn Method>> {
        let name = method.name().to_string();
        tracing::trace!(method = %name, "add method");
        self.methods.borrow_mut().insert(name, method)
    }

    /// Remove whatever is registered under `method.name()`. No-op if absent.
    pub fn remove_method(&self, method: &dyn Method) -> Option<Rc<dyn Method>> {
        self.remove_method_named(method.name())
    }

    /// Remove the method registered under `name`. No-op if absent.
    pub fn remove_method_named(&self, name: &str) -> Option<Rc<dyn Method>> {
        let removed = self.methods.borrow_mut().remove(name);
        if removed.is_some() {
            tracing::trace!(method = %name, "remove method");
        }
        removed
    }

    pub fn find_method(&self, name: &str) -> Option<Rc<dyn Method>> {
        self.methods.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.borrow().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.borrow().is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.methods.borrow().keys().cloned().collect()
    }

    /// Array of every registered name followed by `system.multicall`.
    ///
    /// Multicall is handled by the connection layer, so it is advertised
    /// here without a registry entry. The result always has `len() + 1`
    /// elements.
    pub fn list_methods(&self) -> Value {
        let methods = self.methods.borrow();
        let mut names = Vec::with_capacity(methods.len() + 1);
        names.extend(methods.keys().map(|name| Value::String(name.clone())));
        names.push(Value::from(MULTICALL));
        Value::Array(names)
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            methods: Rc::downgrade(&self.methods),
        }
    }

    /// True if both handles refer to the same table.
    pub fn same_table(&self, other: &MethodRegistry) -> bool {
        Rc::ptr_eq(&self.methods, &other.methods)
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.borrow().keys()).finish()
    }
}

/// Non-owning registry handle held by methods that need to look back into
/// the table they are registered in.
#[derive(Clone, Default)]
pub struct WeakRegistry {
    methods: Weak<RefCell<MethodMap>>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<MethodRegistry> {
        self.methods.upgrade().map(|methods| MethodRegistry { methods })
    }
}

impl fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRegistry")
            .field("live", &(self.methods.strong_count() > 0))
            .finish()
    }
}
