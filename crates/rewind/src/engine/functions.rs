use super::environment::Environment;
use super::scope_store::{ScopeStore, Ticket};
use crate::Name;
use crate::compiler::Bytecode;
use crate::error::Result;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// A function registered by `defn`.
#[derive(Debug, Clone)]
pub struct NamedFunction {
    pub name: Name,
    pub params: Rc<[Name]>,
    pub code: Bytecode,
    /// Body operand of the `defn` instruction that registered this entry.
    pub site: Bytecode,
    /// Environment the `defn` ran in; `None` once the table has been retired.
    pub env: Option<Environment>,
}

/// Patched body for a function name, applied whenever one of its `defn`
/// sites runs again.
#[derive(Debug, Clone)]
pub struct Revision {
    pub params: Rc<[Name]>,
    pub code: Bytecode,
    /// Body operands identifying the `defn` forms this revision replaces.
    /// Other forms reusing the name register their own body.
    pub sites: Rc<[Bytecode]>,
}

impl Revision {
    fn covers(&self, site: &Bytecode) -> bool {
        self.sites.iter().any(|known| Rc::ptr_eq(known, site))
    }
}

/// Named functions in registration order, plus hot-reload revisions.
///
/// Each entry owns one count on its environment's scope.
#[derive(Debug, Default)]
pub struct FunctionTable {
    pub(crate) entries: IndexMap<Name, NamedFunction>,
    pub(crate) revisions: FxHashMap<Name, Revision>,
}

impl FunctionTable {
    /// Register (or re-register) `name`. A patched revision wins over the
    /// compiled operand when it covers that operand.
    pub fn register(
        &mut self,
        name: Name,
        params: Rc<[Name]>,
        code: Bytecode,
        env: Environment,
        store: &mut ScopeStore,
    ) -> Result<()> {
        let site = code.clone();
        let (params, code) = match self.revisions.get(&name) {
            Some(revision) if revision.covers(&site) => {
                (revision.params.clone(), revision.code.clone())
            }
            _ => (params, code),
        };
        env.retain(store)?;
        let previous = self.entries.insert(
            name.clone(),
            NamedFunction {
                name,
                params,
                code,
                site,
                env: Some(env),
            },
        );
        if let Some(env) = previous.and_then(|previous| previous.env) {
            env.release(store)?;
        }
        Ok(())
    }

    /// Swap in a new body for the `defn` forms at `sites`. Takes effect at
    /// the next call through a placeholder.
    pub fn patch(
        &mut self,
        name: Name,
        params: Rc<[Name]>,
        code: Bytecode,
        sites: Rc<[Bytecode]>,
    ) {
        let revision = Revision {
            params,
            code,
            sites,
        };
        if let Some(entry) = self.entries.get_mut(&name) {
            if revision.covers(&entry.site) {
                entry.params = revision.params.clone();
                entry.code = revision.code.clone();
            }
        }
        self.revisions.insert(name, revision);
    }

    /// Release every entry's environment. Entries stay listed but can no
    /// longer be called.
    pub fn retire(&mut self, store: &mut ScopeStore) -> Result<()> {
        for entry in self.entries.values_mut() {
            if let Some(env) = entry.env.take() {
                env.release(store)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NamedFunction> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scopes held by live entries, used as collection roots.
    pub fn scopes(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.entries
            .values()
            .filter_map(|entry| entry.env.as_ref().and_then(|env| env.scope))
    }
}
