//! Saved machine states: keyframes by step, the last checkpoint of every
//! named function, and results of non-deterministic host calls by step.

use crate::Name;
use crate::engine::{Context, Machine, Value};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Independent copy of a running program at a step boundary, including
/// whatever state its capabilities chose to save.
#[derive(Debug)]
pub struct Snapshot {
    pub(crate) step: u64,
    pub(crate) machine: Machine,
    pub(crate) capability_states: Vec<Option<serde_json::Value>>,
}

impl Snapshot {
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn context(&self) -> &Context {
        &self.machine.context
    }

    pub fn is_finished(&self) -> bool {
        self.machine.context.is_done()
    }

    pub fn result(&self) -> Option<&Value> {
        self.machine.context.result()
    }
}

#[derive(Debug, Default)]
pub struct History {
    keyframes: BTreeMap<u64, Snapshot>,
    checkpoints: FxHashMap<Name, Snapshot>,
    nondeterministic: BTreeMap<u64, Value>,
}

impl History {
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.checkpoints.clear();
        self.nondeterministic.clear();
    }

    pub fn has_keyframe(&self, step: u64) -> bool {
        self.keyframes.contains_key(&step)
    }

    /// Store a keyframe, evicting the oldest ones past `limit`. The step-0
    /// keyframe is never evicted: it is the only way back to the start.
    pub fn record_keyframe(&mut self, snapshot: Snapshot, limit: usize) {
        log::trace!("keyframe at step {}", snapshot.step);
        self.keyframes.insert(snapshot.step, snapshot);
        while self.keyframes.len() > limit.max(1) {
            let Some(oldest) = self.keyframes.keys().copied().find(|step| *step > 0) else {
                break;
            };
            self.keyframes.remove(&oldest);
        }
    }

    pub fn keyframe_at_or_before(&self, step: u64) -> Option<&Snapshot> {
        self.keyframes.range(..=step).next_back().map(|(_, snapshot)| snapshot)
    }

    pub fn keyframe_steps(&self) -> Vec<u64> {
        self.keyframes.keys().copied().collect()
    }

    /// Keep only the most recent invocation of each function.
    pub fn record_checkpoint(&mut self, name: Name, snapshot: Snapshot) {
        log::trace!("checkpoint for `{name}` at step {}", snapshot.step);
        self.checkpoints.insert(name, snapshot);
    }

    pub fn checkpoint(&self, name: &str) -> Option<&Snapshot> {
        self.checkpoints.get(name)
    }

    /// Among `names`, the function whose checkpoint is earliest in step time.
    /// Ties go to the name listed first.
    pub fn earliest_checkpoint<'a>(
        &self,
        names: impl IntoIterator<Item = &'a Name>,
    ) -> Option<(&'a Name, u64)> {
        names
            .into_iter()
            .filter_map(|name| Some((name, self.checkpoints.get(name)?.step)))
            .fold(None, |earliest, (name, step)| match earliest {
                Some((_, best)) if best <= step => earliest,
                _ => Some((name, step)),
            })
    }

    /// Forget every state recorded after `step`: it can no longer be reached.
    pub fn prune_after(&mut self, step: u64) {
        self.keyframes.retain(|recorded, _| *recorded <= step);
        self.checkpoints.retain(|_, snapshot| snapshot.step <= step);
        self.nondeterministic.retain(|recorded, _| *recorded <= step);
    }

    pub fn cached_result(&self, step: u64) -> Option<&Value> {
        self.nondeterministic.get(&step)
    }

    pub fn cache_result(&mut self, step: u64, value: Value) {
        self.nondeterministic.insert(step, value);
    }
}
