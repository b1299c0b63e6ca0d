//! Drives a program: stepping under a budget, keyframes for time travel,
//! per-function checkpoints, and the hot-reload policy.
//!
//! On every edit the runner decides between doing nothing, a full restart,
//! or rewinding to the earliest checkpoint of a changed named function and
//! replaying with the new bodies patched in.

use crate::Name;
use crate::capability::Capability;
use crate::compiler::{Bytecode, compile_definition, compile_program, definition_sites};
use crate::config::RunnerConfig;
use crate::engine::{Context, HostInvoker, HostMethod, Machine, ScopeStore, Value, vm};
use crate::error::{Error, Result};
use crate::parser::{
    Definitions, Form, diff_named_functions, find_named_functions, parse_program, strip_positions,
};
use rustc_hash::FxHashMap;
use std::rc::Rc;

mod history;
pub use history::{History, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The step budget ran out.
    Exhausted,
    /// The program called `(render)`.
    RenderRequested,
    Finished,
    /// A runtime error was reported through the error callback.
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetReport {
    pub steps: u64,
    pub stop: StopReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Same program, still running: nothing to do.
    Unchanged,
    /// All state discarded and the new program started from scratch.
    Restarted,
    /// Rewound to the last invocation of `function` and patched.
    Rewound { function: Name, step: u64 },
    /// Changed functions were never invoked; bodies swapped in place.
    Patched { functions: Vec<Name> },
}

struct Session {
    source: String,
    program: Form,
    definitions: Definitions,
    /// Body operands of the `defn` forms each definition describes, in the
    /// running code and in every body patched in since.
    sites: FxHashMap<Name, Vec<Bytecode>>,
    machine: Machine,
}

pub struct Runner {
    config: RunnerConfig,
    capabilities: Rc<[Rc<dyn Capability>]>,
    session: Option<Session>,
    history: History,
    step_count: u64,
    fault: Option<Error>,
}

/// Answers non-deterministic host calls from the per-step cache when the
/// step has run before, and records them when it has not.
struct ReplayInvoker<'a> {
    history: &'a mut History,
    step: u64,
}

impl HostInvoker for ReplayInvoker<'_> {
    fn invoke(&mut self, method: &HostMethod, args: &[Value]) -> anyhow::Result<Value> {
        if method.owner.is_deterministic() {
            return method.invoke(args);
        }
        if let Some(cached) = self.history.cached_result(self.step) {
            log::trace!("replaying cached `{}` at step {}", method.method, self.step);
            return Ok(cached.clone());
        }
        let value = method.invoke(args)?;
        self.history.cache_result(self.step, value.clone());
        Ok(value)
    }
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        let capabilities = config.capabilities.iter().cloned().collect();
        Self {
            config,
            capabilities,
            session: None,
            history: History::default(),
            step_count: 0,
            fault: None,
        }
    }

    /// Parse, compile and start `source`, discarding any previous program.
    /// Parse and compile errors leave the current program in place.
    pub fn load(&mut self, source: &str) -> Result<()> {
        let ast = parse_program(source)?;
        let definitions = find_named_functions(&ast)?;
        let code = compile_program(&ast)?;
        self.install(source, strip_positions(&ast), definitions, code);
        Ok(())
    }

    fn install(&mut self, source: &str, program: Form, definitions: Definitions, code: Bytecode) {
        log::debug!(
            "starting program: {} instructions, {} named functions",
            code.len(),
            definitions.len()
        );
        self.history.clear();
        self.step_count = 0;
        self.fault = None;
        self.config.render.take();
        let sites = definitions
            .values()
            .map(|definition| {
                let sites = definition_sites(&code, definition);
                (definition.name.clone(), sites)
            })
            .collect();
        self.session = Some(Session {
            source: source.to_string(),
            program,
            definitions,
            sites,
            machine: Machine::new(code, self.capabilities.clone()),
        });
        if let Ok(snapshot) = self.snapshot() {
            self.history
                .record_keyframe(snapshot, self.config.settings.keyframe_limit);
        }
    }

    /// Execute one instruction. Runtime errors fault the runner: later
    /// steps report the same error until it is cleared.
    pub fn step(&mut self) -> Result<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        let settings = &self.config.settings;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::runtime_unlocated("no program loaded"));
        };
        let machine = &mut session.machine;
        if machine.context.is_done() {
            return Err(Error::runtime_unlocated("program has already finished"));
        }

        if settings.record_checkpoints {
            if let Some(name) = machine.context.pending_named_call().cloned() {
                let snapshot = capture(self.step_count, machine, &self.capabilities);
                self.history.record_checkpoint(name, snapshot);
            }
        }

        let mut invoker = ReplayInvoker {
            history: &mut self.history,
            step: self.step_count,
        };
        if let Err(error) = vm::step(machine, &mut invoker) {
            self.fault = Some(error.clone());
            return Err(error);
        }
        self.step_count += 1;

        let outcome = if machine.context.is_done() {
            machine.finish().map(|collected| {
                log::info!(
                    "program finished after {} steps ({collected} scopes collected)",
                    self.step_count
                );
            })
        } else if settings.gc_interval > 0 && self.step_count % settings.gc_interval == 0 {
            machine.collect_garbage().map(drop)
        } else {
            Ok(())
        };
        if let Err(error) = outcome {
            self.fault = Some(error.clone());
            return Err(error);
        }

        if settings.keyframe_interval > 0
            && self.step_count % settings.keyframe_interval == 0
            && !self.history.has_keyframe(self.step_count)
        {
            let snapshot = capture(self.step_count, machine, &self.capabilities);
            self.history.record_keyframe(snapshot, settings.keyframe_limit);
        }
        Ok(())
    }

    /// Advance up to `budget` steps. Stops early when the program asks for a
    /// render or finishes. Runtime errors go to `on_error` and end the
    /// budget; internal errors are returned.
    pub fn run_budget(
        &mut self,
        budget: u64,
        mut on_error: impl FnMut(&Error),
    ) -> Result<BudgetReport> {
        if self.session.is_none() {
            return Err(Error::runtime_unlocated("no program loaded"));
        }
        let report =
            |steps: u64, stop: StopReason| -> Result<BudgetReport> { Ok(BudgetReport { steps, stop }) };
        if self.fault.is_some() {
            return report(0, StopReason::Faulted);
        }
        let mut steps = 0;
        while steps < budget {
            if self.is_finished() {
                return report(steps, StopReason::Finished);
            }
            match self.step() {
                Ok(()) => steps += 1,
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    log::warn!("step {} failed: {error}", self.step_count);
                    on_error(&error);
                    return report(steps, StopReason::Faulted);
                }
            }
            if self.config.render.take() {
                return report(steps, StopReason::RenderRequested);
            }
        }
        let stop = if self.is_finished() {
            StopReason::Finished
        } else {
            StopReason::Exhausted
        };
        report(steps, stop)
    }

    /// Step until the program finishes, failing after `limit` steps.
    pub fn run_to_completion(&mut self, limit: u64) -> Result<Value> {
        let mut steps = 0;
        while !self.is_finished() {
            if steps == limit {
                return Err(Error::runtime_unlocated(format!(
                    "program did not finish within {limit} steps"
                )));
            }
            self.step()?;
            self.config.render.take();
            steps += 1;
        }
        self.result()
            .cloned()
            .ok_or_else(|| Error::internal("finished program has no single result"))
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::runtime_unlocated("no program loaded"))?;
        Ok(capture(self.step_count, &session.machine, &self.capabilities))
    }

    /// Return to a saved state. The snapshot stays usable afterwards.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        let machine = snapshot.machine.snapshot();
        self.apply(machine, &snapshot.capability_states, snapshot.step)
    }

    fn apply(
        &mut self,
        machine: Machine,
        capability_states: &[Option<serde_json::Value>],
        step: u64,
    ) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::runtime_unlocated("no program loaded"))?;
        let failed = |capability: &Rc<dyn Capability>, error: anyhow::Error| {
            Error::runtime_unlocated(format!(
                "{} could not restore its state: {error:#}",
                capability.label()
            ))
        };
        let saved: Vec<_> = self
            .capabilities
            .iter()
            .zip(capability_states)
            .filter_map(|(capability, state)| Some((capability, state.as_ref()?)))
            .collect();
        // Nothing changes unless every capability accepts its state.
        for &(capability, state) in &saved {
            capability
                .check_state(state)
                .map_err(|error| failed(capability, error))?;
        }
        for (capability, state) in saved {
            capability
                .restore_state(state)
                .map_err(|error| failed(capability, error))?;
        }
        session.machine = machine;
        self.step_count = step;
        self.fault = None;
        self.config.render.take();
        Ok(())
    }

    /// Apply an edit while the program runs.
    ///
    /// 1. Same content and still running: nothing happens.
    /// 2. No named function changed: the edit is to top-level code, so
    ///    everything restarts.
    /// 3. Otherwise rewind to the earliest checkpoint among the changed
    ///    functions, patch every function with its fresh body, and drop
    ///    history recorded after that point. When none of the changed
    ///    functions has run yet, they are patched without rewinding.
    ///
    /// The new source is fully parsed and compiled first; a failure leaves
    /// the running program untouched.
    pub fn update(&mut self, source: &str) -> Result<UpdateOutcome> {
        let ast = parse_program(source)?;
        let program = strip_positions(&ast);
        let finished = self.is_finished();
        let Some(session) = self.session.as_mut() else {
            self.load(source)?;
            return Ok(UpdateOutcome::Restarted);
        };
        if program == session.program && !finished {
            session.source = source.to_string();
            return Ok(UpdateOutcome::Unchanged);
        }

        let definitions = find_named_functions(&ast)?;
        let code = compile_program(&ast)?;
        let fresh = definitions
            .values()
            .map(|definition| {
                let params: Rc<[Name]> = definition.params.iter().cloned().collect();
                Ok((definition.name.clone(), params, compile_definition(definition)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let changed = diff_named_functions(&session.definitions, &definitions);

        if changed.is_empty() {
            log::info!("top-level code changed, restarting");
            self.install(source, program, definitions, code);
            return Ok(UpdateOutcome::Restarted);
        }

        let mut sites = FxHashMap::default();
        for definition in definitions.values() {
            let mut known = match session.definitions.get(&definition.name) {
                Some(previous) if previous.depth == definition.depth => session
                    .sites
                    .get(&definition.name)
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            for (_, _, body) in &fresh {
                known.extend(definition_sites(body, definition));
            }
            sites.insert(definition.name.clone(), known);
        }

        let target = self
            .history
            .earliest_checkpoint(&changed)
            .map(|(name, step)| (name.clone(), step));
        let outcome = match target {
            Some((function, step)) => {
                let (machine, states) = match self.history.checkpoint(&function) {
                    Some(checkpoint) => (
                        checkpoint.machine.snapshot(),
                        checkpoint.capability_states.clone(),
                    ),
                    None => return Err(Error::internal("checkpoint vanished during update")),
                };
                self.apply(machine, &states, step)?;
                self.history.prune_after(step);
                log::info!("`{function}` changed, rewound to step {step}");
                UpdateOutcome::Rewound { function, step }
            }
            None => {
                self.fault = None;
                log::info!("patched {} functions that have not run yet", changed.len());
                UpdateOutcome::Patched { functions: changed }
            }
        };

        let Some(session) = self.session.as_mut() else {
            return Err(Error::internal("session vanished during update"));
        };
        for (name, params, code) in fresh {
            let covered = sites.get(&name).cloned().unwrap_or_default();
            session
                .machine
                .functions
                .patch(name, params, code, covered.into());
        }
        session.sites = sites;
        session.source = source.to_string();
        session.program = program;
        session.definitions = definitions;
        Ok(outcome)
    }

    /// Go back (or forward) to exactly `step`: restore the nearest keyframe
    /// at or before it and replay. Non-deterministic host results come from
    /// the cache, so the replay repeats what happened the first time.
    pub fn rewind_to(&mut self, step: u64) -> Result<()> {
        let keyframe = self.history.keyframe_at_or_before(step).ok_or_else(|| {
            Error::runtime_unlocated(format!("no keyframe at or before step {step}"))
        })?;
        let (machine, states, from) = (
            keyframe.machine.snapshot(),
            keyframe.capability_states.clone(),
            keyframe.step,
        );
        log::debug!("rewinding to step {step} from keyframe {from}");
        self.apply(machine, &states, from)?;
        while self.step_count < step && !self.is_finished() {
            self.step()?;
        }
        self.config.render.take();
        Ok(())
    }

    /// Undo the last step.
    pub fn step_back(&mut self) -> Result<()> {
        match self.step_count.checked_sub(1) {
            Some(previous) => self.rewind_to(previous),
            None => Err(Error::runtime_unlocated("already at the first step")),
        }
    }

    pub fn collect_garbage(&mut self) -> Result<usize> {
        match self.session.as_mut() {
            Some(session) => session.machine.collect_garbage(),
            None => Ok(0),
        }
    }

    pub fn has_result(&self) -> bool {
        self.result().is_some()
    }

    pub fn result(&self) -> Option<&Value> {
        self.context()?.result()
    }

    pub fn is_finished(&self) -> bool {
        self.context().is_some_and(Context::is_done)
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    pub fn source(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.source.as_str())
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn keyframe_steps(&self) -> Vec<u64> {
        self.history.keyframe_steps()
    }

    pub fn checkpoint_step(&self, name: &str) -> Option<u64> {
        self.history.checkpoint(name).map(Snapshot::step)
    }

    pub fn machine(&self) -> Option<&Machine> {
        self.session.as_ref().map(|session| &session.machine)
    }

    pub fn context(&self) -> Option<&Context> {
        self.machine().map(|machine| &machine.context)
    }

    pub fn scope_store(&self) -> Option<&ScopeStore> {
        self.machine().map(|machine| &machine.store)
    }

    pub fn live_scopes(&self) -> usize {
        self.scope_store().map_or(0, ScopeStore::live_count)
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

fn capture(step: u64, machine: &Machine, capabilities: &[Rc<dyn Capability>]) -> Snapshot {
    Snapshot {
        step,
        machine: machine.snapshot(),
        capability_states: capabilities
            .iter()
            .map(|capability| capability.save_state())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Console;
    use crate::config::Settings;

    fn runner(source: &str) -> Runner {
        let mut runner = Runner::default();
        runner.load(source).unwrap();
        runner
    }

    #[test]
    fn budget_stops_on_render() {
        let mut runner = runner("(render) (+ 1 2)");
        let report = runner.run_budget(100, |_| {}).unwrap();
        assert_eq!(report.stop, StopReason::RenderRequested);
        let report = runner.run_budget(100, |_| {}).unwrap();
        assert_eq!(report.stop, StopReason::Finished);
        assert_eq!(runner.result(), Some(&Value::from(3.0)));
    }

    #[test]
    fn runtime_errors_fault_until_reload() {
        let mut runner = runner("(undefined-thing)");
        let mut reported = Vec::new();
        let report = runner
            .run_budget(10, |error| reported.push(error.clone()))
            .unwrap();
        assert_eq!(report.stop, StopReason::Faulted);
        assert_eq!(reported.len(), 1);
        assert!(runner.fault().is_some());
        assert_eq!(runner.run_budget(10, |_| {}).unwrap().steps, 0);

        runner.load("1").unwrap();
        assert!(runner.fault().is_none());
    }

    #[test]
    fn exhausted_budget_reports_steps() {
        let mut runner = runner("(+ 1 (+ 2 3))");
        let report = runner.run_budget(2, |_| {}).unwrap();
        assert_eq!(
            report,
            BudgetReport {
                steps: 2,
                stop: StopReason::Exhausted
            }
        );
        assert_eq!(runner.step_count(), 2);
    }

    #[test]
    fn keyframes_follow_interval() {
        let mut config = RunnerConfig::new(Settings {
            keyframe_interval: 3,
            ..Settings::default()
        });
        config.settings.keyframe_limit = 100;
        let mut runner = Runner::new(config);
        runner.load("(+ 1 (+ 2 (+ 3 4)))").unwrap();
        runner.run_to_completion(100).unwrap();
        let steps = runner.keyframe_steps();
        assert_eq!(steps[0], 0);
        assert!(steps.iter().all(|step| step % 3 == 0));
        assert!(steps.len() > 1);
    }

    #[test]
    fn restore_undoes_console_output() {
        let console = Rc::new(Console::new());
        let config = RunnerConfig::default().with_capability(console.clone());
        let mut runner = Runner::new(config);
        runner.load("(print \"one\") (print \"two\")").unwrap();
        let start = runner.snapshot().unwrap();
        runner.run_to_completion(100).unwrap();
        assert_eq!(console.output(), "one\ntwo\n");
        runner.restore(&start).unwrap();
        assert_eq!(console.output(), "");
        assert_eq!(runner.step_count(), 0);
        assert!(!runner.is_finished());
    }

    /// Keeps state but refuses every saved copy of it.
    struct Picky;

    impl Capability for Picky {
        fn label(&self) -> &str {
            "picky"
        }

        fn has_method(&self, _name: &str) -> bool {
            false
        }

        fn invoke(&self, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
            anyhow::bail!("picky has no method `{method}`")
        }

        fn save_state(&self) -> Option<serde_json::Value> {
            Some(serde_json::Value::Null)
        }

        fn check_state(&self, _state: &serde_json::Value) -> anyhow::Result<()> {
            anyhow::bail!("never satisfied")
        }
    }

    #[test]
    fn rejected_state_leaves_every_capability_untouched() {
        let console = Rc::new(Console::new());
        let config = RunnerConfig::default()
            .with_capability(console.clone())
            .with_capability(Rc::new(Picky));
        let mut runner = Runner::new(config);
        runner.load("(print \"one\")").unwrap();
        let start = runner.snapshot().unwrap();
        runner.run_to_completion(100).unwrap();

        let error = runner.restore(&start).unwrap_err();
        assert!(error.message().contains("picky could not restore"));
        assert_eq!(console.output(), "one\n");
        assert!(runner.is_finished());
    }

    #[test]
    fn update_with_identical_source_is_a_no_op() {
        let mut runner = runner("(defn f (x) x) (f 1)");
        runner.step().unwrap();
        let outcome = runner.update("(defn f (x)\n  x)\n(f 1)").unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(runner.step_count(), 1);
    }

    #[test]
    fn broken_update_leaves_program_running() {
        let mut runner = runner("(defn f (x) x) (f 1)");
        runner.step().unwrap();
        assert!(runner.update("(defn f (x) x").is_err());
        assert_eq!(runner.run_to_completion(100).unwrap(), Value::from(1.0));
    }
}
