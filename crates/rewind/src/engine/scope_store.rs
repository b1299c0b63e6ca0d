//! Reference-counted scope records addressed by generational tickets.
//!
//! Environments never hold a scope directly, only a [`Ticket`], so copying
//! an environment into a snapshot is a copy of two integers. The price is
//! manual accounting: every place that keeps a ticket alive (environment
//! stack entry, child scope, closure stored in a binding or on the value
//! stack, named-function table entry) owns one count. A count reaching zero
//! deletes the record at once and releases whatever it referenced.
//!
//! Counting alone never frees a closure that is stored in its own defining
//! scope. [`ScopeStore::collect`] handles those cycles with a reachability
//! sweep from an explicit root set.

use super::value::{ContainsScopes, Value};
use crate::Name;
use crate::error::{Error, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Generational handle to a scope record. A ticket whose slot was freed and
/// reused is detected as stale instead of silently aliasing the new record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Clone)]
pub(crate) struct ScopeRecord {
    pub(crate) refcount: usize,
    pub(crate) bindings: FxHashMap<Name, Value>,
    pub(crate) parent: Option<Ticket>,
}

impl ScopeRecord {
    /// Tickets this record keeps alive: its parent and every scope held by a binding.
    fn references(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.parent
            .into_iter()
            .chain(self.bindings.values().flat_map(|value| value.scopes()))
    }
}

#[derive(Clone)]
pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) record: Option<ScopeRecord>,
}

#[derive(Default)]
pub struct ScopeStore {
    pub(crate) slots: Vec<Slot>,
    pub(crate) free_list: Vec<u32>,
    pub(crate) live: usize,
}

impl ScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty root scope with a count of one.
    pub fn new_scope(&mut self) -> Ticket {
        self.alloc(ScopeRecord {
            refcount: 1,
            bindings: FxHashMap::default(),
            parent: None,
        })
    }

    /// Child of `parent` holding `bindings`, with a count of one. The
    /// parent gains a count for the new child's link.
    pub fn new_from_scope(
        &mut self,
        parent: Ticket,
        bindings: impl IntoIterator<Item = (Name, Value)>,
    ) -> Result<Ticket> {
        self.incref(parent)?;
        let ticket = self.alloc(ScopeRecord {
            refcount: 1,
            bindings: FxHashMap::default(),
            parent: Some(parent),
        });
        for (name, value) in bindings {
            self.define(ticket, name, value)?;
        }
        Ok(ticket)
    }

    /// Bind `name` in this record only, replacing any local binding.
    pub fn define(&mut self, ticket: Ticket, name: Name, value: Value) -> Result<()> {
        // Retain before touching the record: the value may reference `ticket` itself.
        self.retain_value(&value)?;
        let displaced = self.record_mut(ticket)?.bindings.insert(name, value);
        if let Some(displaced) = displaced {
            self.release_value(&displaced)?;
        }
        Ok(())
    }

    /// Search this record and then its ancestors. The returned value is
    /// retained: the caller owns the new reference.
    pub fn lookup(&mut self, ticket: Ticket, name: &str) -> Result<Option<Value>> {
        let Some(owner) = self.owner_of(ticket, name)? else {
            return Ok(None);
        };
        let value = self.record(owner)?.bindings.get(name).cloned();
        if let Some(value) = &value {
            self.retain_value(value)?;
        }
        Ok(value)
    }

    /// Assign to the nearest record that already binds `name`. Returns
    /// `false` when no record on the chain does.
    pub fn set(&mut self, ticket: Ticket, name: &str, value: Value) -> Result<bool> {
        let Some(owner) = self.owner_of(ticket, name)? else {
            return Ok(false);
        };
        self.retain_value(&value)?;
        let record = self.record_mut(owner)?;
        let displaced = match record.bindings.get_mut(name) {
            Some(slot) => std::mem::replace(slot, value),
            None => return Err(Error::internal(format!("binding `{name}` vanished"))),
        };
        self.release_value(&displaced)?;
        Ok(true)
    }

    pub fn incref(&mut self, ticket: Ticket) -> Result<()> {
        self.record_mut(ticket)?.refcount += 1;
        Ok(())
    }

    /// Drop one count. Records reaching zero are deleted, which in turn
    /// releases their parent and every scope their bindings held.
    pub fn decref(&mut self, ticket: Ticket) -> Result<()> {
        let mut pending = vec![ticket];
        while let Some(ticket) = pending.pop() {
            let record = self.record_mut(ticket)?;
            if record.refcount == 0 {
                return Err(Error::internal(format!(
                    "scope {ticket:?} released below zero"
                )));
            }
            record.refcount -= 1;
            if record.refcount > 0 {
                continue;
            }
            let record = self.remove(ticket)?;
            pending.extend(record.references());
        }
        Ok(())
    }

    pub fn retain_value(&mut self, value: &Value) -> Result<()> {
        for ticket in value.scopes() {
            self.incref(ticket)?;
        }
        Ok(())
    }

    pub fn release_value(&mut self, value: &Value) -> Result<()> {
        for ticket in value.scopes() {
            self.decref(ticket)?;
        }
        Ok(())
    }

    /// Every ticket reachable from `roots` through parent links and scopes
    /// held by bound values.
    pub fn reachable_from(
        &self,
        roots: impl IntoIterator<Item = Ticket>,
    ) -> Result<FxHashSet<Ticket>> {
        let mut reachable = FxHashSet::default();
        let mut pending: Vec<Ticket> = roots.into_iter().collect();
        while let Some(ticket) = pending.pop() {
            if !reachable.insert(ticket) {
                continue;
            }
            pending.extend(self.record(ticket)?.references());
        }
        Ok(reachable)
    }

    /// Delete every record not reachable from `roots` and return how many
    /// were removed. References from deleted records into surviving ones
    /// are released afterwards, so survivors keep accurate counts.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Ticket>) -> Result<usize> {
        let reachable = self.reachable_from(roots)?;
        let unreachable: Vec<Ticket> = self
            .tickets()
            .filter(|ticket| !reachable.contains(ticket))
            .collect();
        let mut removed = Vec::with_capacity(unreachable.len());
        for ticket in &unreachable {
            removed.push(self.remove(*ticket)?);
        }
        for record in &removed {
            for ticket in record.references() {
                if self.contains(ticket) {
                    self.decref(ticket)?;
                }
            }
        }
        if !removed.is_empty() {
            log::debug!(
                "collected {} unreachable scopes, {} live",
                removed.len(),
                self.live
            );
        }
        Ok(removed.len())
    }

    pub fn contains(&self, ticket: Ticket) -> bool {
        self.slots
            .get(ticket.index as usize)
            .is_some_and(|slot| slot.generation == ticket.generation && slot.record.is_some())
    }

    pub fn refcount(&self, ticket: Ticket) -> Option<usize> {
        self.record(ticket).ok().map(|record| record.refcount)
    }

    pub fn parent(&self, ticket: Ticket) -> Result<Option<Ticket>> {
        Ok(self.record(ticket)?.parent)
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|_| Ticket {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    fn owner_of(&self, mut ticket: Ticket, name: &str) -> Result<Option<Ticket>> {
        loop {
            let record = self.record(ticket)?;
            if record.bindings.contains_key(name) {
                return Ok(Some(ticket));
            }
            match record.parent {
                Some(parent) => ticket = parent,
                None => return Ok(None),
            }
        }
    }

    fn alloc(&mut self, record: ScopeRecord) -> Ticket {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            Ticket {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            Ticket {
                index,
                generation: 0,
            }
        }
    }

    fn remove(&mut self, ticket: Ticket) -> Result<ScopeRecord> {
        let slot = self.slot_mut(ticket)?;
        let record = slot.record.take().ok_or_else(|| unknown(ticket))?;
        // Bump generation immediately so outstanding tickets become stale
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(ticket.index);
        self.live -= 1;
        Ok(record)
    }

    fn record(&self, ticket: Ticket) -> Result<&ScopeRecord> {
        self.slots
            .get(ticket.index as usize)
            .filter(|slot| slot.generation == ticket.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or_else(|| unknown(ticket))
    }

    fn record_mut(&mut self, ticket: Ticket) -> Result<&mut ScopeRecord> {
        self.slot_mut(ticket)?
            .record
            .as_mut()
            .ok_or_else(|| unknown(ticket))
    }

    fn slot_mut(&mut self, ticket: Ticket) -> Result<&mut Slot> {
        self.slots
            .get_mut(ticket.index as usize)
            .filter(|slot| slot.generation == ticket.generation)
            .ok_or_else(|| unknown(ticket))
    }
}

fn unknown(ticket: Ticket) -> Error {
    Error::internal(format!("unknown or stale scope ticket {ticket:?}"))
}

impl fmt::Debug for ScopeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for ticket in self.tickets() {
            if let Ok(record) = self.record(ticket) {
                let mut names: Vec<_> = record.bindings.keys().map(|name| &**name).collect();
                names.sort_unstable();
                map.entry(&ticket, &(record.refcount, record.parent, names));
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::environment::Environment;
    use crate::engine::value::Closure;
    use std::rc::Rc;

    fn closure_over(ticket: Ticket) -> Value {
        Value::Closure(Rc::new(Closure {
            params: Rc::from(Vec::<Name>::new()),
            code: Rc::from(Vec::new()),
            env: Environment::new(Rc::from(Vec::new()), Some(ticket)),
        }))
    }

    #[test]
    fn lookup_walks_parent_chain() {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        store.define(root, "x".into(), Value::from(1.0)).unwrap();
        let child = store
            .new_from_scope(root, [("y".into(), Value::from(2.0))])
            .unwrap();
        assert_eq!(store.lookup(child, "x").unwrap(), Some(Value::from(1.0)));
        assert_eq!(store.lookup(child, "y").unwrap(), Some(Value::from(2.0)));
        assert_eq!(store.lookup(root, "y").unwrap(), None);
        assert_eq!(store.refcount(root), Some(2));
    }

    #[test]
    fn set_mutates_owning_record() {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        store.define(root, "x".into(), Value::from(1.0)).unwrap();
        let child = store.new_from_scope(root, []).unwrap();
        assert!(store.set(child, "x", Value::from(5.0)).unwrap());
        assert_eq!(store.lookup(root, "x").unwrap(), Some(Value::from(5.0)));
        assert!(!store.set(child, "missing", Value::Null).unwrap());
    }

    #[test]
    fn decref_to_zero_cascades_to_parents() {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        let child = store.new_from_scope(root, []).unwrap();
        store.decref(root).unwrap();
        assert_eq!(store.live_count(), 2);
        store.decref(child).unwrap();
        assert_eq!(store.live_count(), 0);
        assert!(!store.contains(root));
    }

    #[test]
    fn stale_tickets_are_rejected() {
        let mut store = ScopeStore::new();
        let first = store.new_scope();
        store.decref(first).unwrap();
        let second = store.new_scope();
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        let error = store.decref(first).unwrap_err();
        assert!(error.is_fatal());
        assert!(store.lookup(first, "x").is_err());
    }

    #[test]
    fn displaced_closures_are_released() {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        let other = store.new_scope();
        store.define(root, "f".into(), closure_over(other)).unwrap();
        assert_eq!(store.refcount(other), Some(2));
        store.define(root, "f".into(), Value::Null).unwrap();
        assert_eq!(store.refcount(other), Some(1));
    }

    #[test]
    fn self_referencing_scope_needs_collection() {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        store.define(root, "loop".into(), closure_over(root)).unwrap();
        store.decref(root).unwrap();
        // the closure stored in `root` still holds it
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.collect([]).unwrap(), 1);
        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn collect_keeps_reachable_and_fixes_counts() {
        let mut store = ScopeStore::new();
        let kept = store.new_scope();
        let cyclic = store.new_from_scope(kept, []).unwrap();
        store.define(cyclic, "me".into(), closure_over(cyclic)).unwrap();
        store.decref(cyclic).unwrap();
        assert_eq!(store.refcount(kept), Some(2));

        assert_eq!(store.collect([kept]).unwrap(), 1);
        assert_eq!(store.refcount(kept), Some(1));
        assert_eq!(store.collect([kept]).unwrap(), 0);
    }

    #[test]
    fn collect_is_idempotent() {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        let a = store.new_scope();
        let b = store.new_from_scope(a, []).unwrap();
        store.define(a, "b".into(), closure_over(b)).unwrap();
        store.decref(b).unwrap();
        store.decref(a).unwrap();
        assert_eq!(store.collect([root]).unwrap(), 2);
        let tickets: Vec<_> = store.tickets().collect();
        assert_eq!(store.collect([root]).unwrap(), 0);
        assert_eq!(store.tickets().collect::<Vec<_>>(), tickets);
    }

    #[test]
    fn unknown_root_is_an_internal_error() {
        let store = ScopeStore::new();
        let bogus = Ticket {
            index: 7,
            generation: 0,
        };
        assert!(store.reachable_from([bogus]).unwrap_err().is_fatal());
    }
}
