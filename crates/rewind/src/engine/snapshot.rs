//! Identity-memoized deep copy of machine state.
//!
//! Every managed kind clones field by field. Closures and lists are
//! remembered by the address of their shared allocation, so two references
//! to one closure in the original are two references to one closure in the
//! copy, and cyclic structures terminate. Bytecode, text and capability
//! objects are immutable from the VM's point of view and pass through
//! shared.

use super::environment::Environment;
use super::functions::{FunctionTable, NamedFunction};
use super::scope_store::{ScopeRecord, ScopeStore, Slot};
use super::value::{Closure, Value};
use super::vm::{Context, Machine};
use rustc_hash::FxHashMap;
use std::rc::Rc;

#[derive(Default)]
pub struct CloneMemo {
    closures: FxHashMap<usize, Rc<Closure>>,
    lists: FxHashMap<usize, Rc<[Value]>>,
}

impl CloneMemo {
    pub fn len(&self) -> usize {
        self.closures.len() + self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait DeepClone {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self;
}

impl DeepClone for Value {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        match self {
            Self::Closure(closure) => Self::Closure(closure.deep_clone(memo)),
            Self::List(items) => {
                let key = Rc::as_ptr(items).cast::<Value>() as usize;
                if let Some(copy) = memo.lists.get(&key) {
                    return Self::List(copy.clone());
                }
                let copy: Rc<[Value]> = items.iter().map(|item| item.deep_clone(memo)).collect();
                memo.lists.insert(key, copy.clone());
                Self::List(copy)
            }
            Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::Text(_)
            | Self::Named(_)
            | Self::Host(_)
            | Self::Params(_)
            | Self::Code(_) => self.clone(),
        }
    }
}

impl DeepClone for Rc<Closure> {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        let key = Rc::as_ptr(self) as usize;
        if let Some(copy) = memo.closures.get(&key) {
            return copy.clone();
        }
        let copy = Rc::new(Closure {
            params: self.params.clone(),
            code: self.code.clone(),
            env: self.env.deep_clone(memo),
        });
        memo.closures.insert(key, copy.clone());
        copy
    }
}

impl DeepClone for Environment {
    /// Tickets stay valid because the whole store is copied alongside.
    fn deep_clone(&self, _memo: &mut CloneMemo) -> Self {
        self.clone()
    }
}

impl DeepClone for Context {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        Self {
            pcs: self.pcs.clone(),
            frames: self.frames.clone(),
            environments: self
                .environments
                .iter()
                .map(|env| env.deep_clone(memo))
                .collect(),
            values: self.values.iter().map(|value| value.deep_clone(memo)).collect(),
            done: self.done,
        }
    }
}

impl DeepClone for NamedFunction {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        Self {
            name: self.name.clone(),
            params: self.params.clone(),
            code: self.code.clone(),
            site: self.site.clone(),
            env: self.env.as_ref().map(|env| env.deep_clone(memo)),
        }
    }
}

impl DeepClone for FunctionTable {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.deep_clone(memo)))
                .collect(),
            revisions: self.revisions.clone(),
        }
    }
}

impl DeepClone for ScopeStore {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|slot| Slot {
                generation: slot.generation,
                record: slot.record.as_ref().map(|record| ScopeRecord {
                    refcount: record.refcount,
                    bindings: record
                        .bindings
                        .iter()
                        .map(|(name, value)| (name.clone(), value.deep_clone(memo)))
                        .collect(),
                    parent: record.parent,
                }),
            })
            .collect();
        Self {
            slots,
            free_list: self.free_list.clone(),
            live: self.live,
        }
    }
}

impl DeepClone for Machine {
    fn deep_clone(&self, memo: &mut CloneMemo) -> Self {
        Self {
            context: self.context.deep_clone(memo),
            functions: self.functions.deep_clone(memo),
            store: self.store.deep_clone(memo),
        }
    }
}

impl Machine {
    /// Independent copy of the whole machine, sharing nothing mutable.
    pub fn snapshot(&self) -> Machine {
        self.deep_clone(&mut CloneMemo::default())
    }
}
