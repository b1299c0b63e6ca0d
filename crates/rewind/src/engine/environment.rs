//! Layered name resolution.
//!
//! Innermost first: the scope-store ticket, then capability objects from
//! the last one supplied to the first, then the named-function table.
//! Copying an `Environment` does not touch reference counts; holders call
//! [`Environment::retain`] and [`Environment::release`] themselves.

use super::functions::FunctionTable;
use super::scope_store::{ScopeStore, Ticket};
use super::value::{ContainsScopes, HostMethod, Value};
use crate::Name;
use crate::capability::Capability;
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub struct Environment {
    pub capabilities: Rc<[Rc<dyn Capability>]>,
    pub scope: Option<Ticket>,
}

impl Environment {
    pub fn new(capabilities: Rc<[Rc<dyn Capability>]>, scope: Option<Ticket>) -> Self {
        Self {
            capabilities,
            scope,
        }
    }

    /// Resolve `name`, or `None` when no layer binds it. Values found in the
    /// scope store come back retained.
    pub fn resolve(
        &self,
        name: &Name,
        store: &mut ScopeStore,
        functions: &FunctionTable,
    ) -> Result<Option<Value>> {
        if let Some(scope) = self.scope {
            if let Some(value) = store.lookup(scope, name)? {
                return Ok(Some(value));
            }
        }
        if let Some(owner) = self.capability_for(name) {
            return Ok(Some(Value::Host(HostMethod {
                owner: owner.clone(),
                method: name.clone(),
            })));
        }
        if functions.contains(name) {
            return Ok(Some(Value::Named(name.clone())));
        }
        Ok(None)
    }

    pub fn lookup(
        &self,
        name: &Name,
        store: &mut ScopeStore,
        functions: &FunctionTable,
    ) -> Result<Value> {
        self.resolve(name, store, functions)?
            .ok_or_else(|| Error::runtime_unlocated(format!("`{name}` is not defined")))
    }

    /// Assign to an existing scope binding. Capability methods and named
    /// functions are immutable.
    pub fn set(
        &self,
        name: &Name,
        value: Value,
        store: &mut ScopeStore,
        functions: &FunctionTable,
    ) -> Result<()> {
        if let Some(scope) = self.scope {
            if store.set(scope, name, value)? {
                return Ok(());
            }
        }
        if self.capability_for(name).is_some() || functions.contains(name) {
            return Err(Error::runtime_unlocated(format!(
                "cannot assign to `{name}`: it is an immutable binding"
            )));
        }
        Err(Error::runtime_unlocated(format!(
            "cannot assign to `{name}`: it is not defined"
        )))
    }

    /// Bind `name` in the innermost scope.
    pub fn define(&self, name: Name, value: Value, store: &mut ScopeStore) -> Result<()> {
        let scope = self
            .scope
            .ok_or_else(|| Error::internal("environment has no scope layer to define into"))?;
        store.define(scope, name, value)
    }

    /// New environment whose scope is a child of this one holding
    /// `bindings`. The returned environment owns one count on the new scope.
    pub fn extend(
        &self,
        bindings: impl IntoIterator<Item = (Name, Value)>,
        store: &mut ScopeStore,
    ) -> Result<Environment> {
        let scope = match self.scope {
            Some(parent) => store.new_from_scope(parent, bindings)?,
            None => {
                let scope = store.new_scope();
                for (name, value) in bindings {
                    store.define(scope, name, value)?;
                }
                scope
            }
        };
        Ok(Self {
            capabilities: self.capabilities.clone(),
            scope: Some(scope),
        })
    }

    pub fn retain(&self, store: &mut ScopeStore) -> Result<()> {
        match self.scope {
            Some(scope) => store.incref(scope),
            None => Ok(()),
        }
    }

    pub fn release(&self, store: &mut ScopeStore) -> Result<()> {
        match self.scope {
            Some(scope) => store.decref(scope),
            None => Ok(()),
        }
    }

    fn capability_for(&self, name: &str) -> Option<&Rc<dyn Capability>> {
        self.capabilities
            .iter()
            .rev()
            .find(|capability| capability.has_method(name))
    }
}

impl ContainsScopes for Environment {
    fn scopes(&self) -> SmallVec<[Ticket; 2]> {
        self.scope.into_iter().collect()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<_> = self
            .capabilities
            .iter()
            .map(|capability| capability.label())
            .collect();
        f.debug_struct("Environment")
            .field("capabilities", &labels)
            .field("scope", &self.scope)
            .finish()
    }
}
