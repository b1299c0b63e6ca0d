//! Single-step bytecode VM.
//!
//! A [`Context`] is four parallel stacks (program counters, bytecode frames,
//! environments, values) and a completion flag. Nothing lives on the host
//! call stack between steps, so a paused program is exactly its `Machine`
//! and can be cloned, stored and resumed at any instruction.
//!
//! Each step either fully applies one instruction or fails before changing
//! anything observable.

use super::environment::Environment;
use super::functions::FunctionTable;
use super::scope_store::{ScopeStore, Ticket};
use super::value::{Closure, ContainsScopes, HostMethod, Value};
use crate::Name;
use crate::capability::Capability;
use crate::compiler::{Bytecode, Op};
use crate::error::{Error, Result};
use crate::parser::Span;
use std::rc::Rc;

/// Paused program state.
#[derive(Debug)]
pub struct Context {
    pub(crate) pcs: Vec<usize>,
    pub(crate) frames: Vec<Bytecode>,
    pub(crate) environments: Vec<Environment>,
    pub(crate) values: Vec<Value>,
    pub(crate) done: bool,
}

impl Context {
    /// Start `code` at its first instruction. `env` must already carry the
    /// count this frame owns.
    pub fn new(code: Bytecode, env: Environment) -> Self {
        Self {
            pcs: vec![0],
            frames: vec![code],
            environments: vec![env],
            values: Vec::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    /// Single value left by a finished program.
    pub fn result(&self) -> Option<&Value> {
        match (self.done, self.values.as_slice()) {
            (true, [value]) => Some(value),
            _ => None,
        }
    }

    /// Scopes referenced from the stacks.
    pub fn scopes(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.environments
            .iter()
            .flat_map(|env| env.scopes())
            .chain(self.values.iter().flat_map(|value| value.scopes()))
    }

    /// Origin of the instruction about to run.
    pub fn current_span(&self) -> Option<Span> {
        let code = self.frames.last()?;
        let pc = *self.pcs.last()?;
        code.get(pc).map(|instruction| instruction.origin)
    }

    /// Name of the named function the next instruction is about to call, if any.
    pub fn pending_named_call(&self) -> Option<&Name> {
        let code = self.frames.last()?;
        let pc = *self.pcs.last()?;
        let (Op::Call(argc) | Op::TailCall(argc)) = code.get(pc)?.op else {
            return None;
        };
        let callee = self.values.len().checked_sub(argc + 1)?;
        match &self.values[callee] {
            Value::Named(name) => Some(name),
            _ => None,
        }
    }
}

/// Everything a running program owns.
#[derive(Debug)]
pub struct Machine {
    pub context: Context,
    pub functions: FunctionTable,
    pub store: ScopeStore,
}

impl Machine {
    /// Fresh machine about to run `code` in an empty root scope.
    pub fn new(code: Bytecode, capabilities: Rc<[Rc<dyn Capability>]>) -> Self {
        let mut store = ScopeStore::new();
        let root = store.new_scope();
        let env = Environment::new(capabilities, Some(root));
        Self {
            context: Context::new(code, env),
            functions: FunctionTable::default(),
            store,
        }
    }

    /// Collection roots: every scope the stacks or the function table hold.
    pub fn roots(&self) -> Vec<Ticket> {
        self.context
            .scopes()
            .chain(self.functions.scopes())
            .collect()
    }

    pub fn collect_garbage(&mut self) -> Result<usize> {
        let roots = self.roots();
        self.store.collect(roots)
    }

    /// Tear down after completion: named functions release their scopes and
    /// anything not reachable from the result is collected.
    pub fn finish(&mut self) -> Result<usize> {
        self.functions.retire(&mut self.store)?;
        self.collect_garbage()
    }
}

/// Host side of capability calls. The runner wraps this to cache
/// non-deterministic results.
pub trait HostInvoker {
    fn invoke(&mut self, method: &HostMethod, args: &[Value]) -> anyhow::Result<Value>;
}

/// Calls capabilities directly.
pub struct DirectInvoker;

impl HostInvoker for DirectInvoker {
    fn invoke(&mut self, method: &HostMethod, args: &[Value]) -> anyhow::Result<Value> {
        method.invoke(args)
    }
}

enum Flow {
    Advance,
    Jump(usize),
    /// The instruction already positioned the program counters.
    Stay,
}

/// Execute exactly one instruction of the top frame.
pub fn step(machine: &mut Machine, host: &mut dyn HostInvoker) -> Result<()> {
    let Machine {
        context,
        functions,
        store,
    } = machine;
    if context.done {
        return Err(Error::runtime_unlocated("program has already finished"));
    }
    let (Some(code), Some(&pc)) = (context.frames.last(), context.pcs.last()) else {
        return Err(Error::internal("unfinished context has no frame"));
    };
    let code = code.clone();
    let instruction = code.get(pc).ok_or_else(|| {
        Error::internal(format!(
            "program counter {pc} ran past the end of a {}-instruction frame",
            code.len()
        ))
    })?;
    let origin = instruction.origin;
    log::trace!("depth {} pc {pc}: {}", context.frames.len(), instruction.op);
    let env = context
        .environments
        .last()
        .cloned()
        .ok_or_else(|| Error::internal("frame has no environment"))?;

    let flow = match &instruction.op {
        Op::LoadConstant(value) | Op::Push(value) => {
            store.retain_value(value)?;
            context.values.push(value.clone());
            Flow::Advance
        }
        Op::Pop => {
            let value = pop(context, origin)?;
            store.release_value(&value)?;
            Flow::Advance
        }
        Op::NameLookup(name) => {
            let value = env
                .lookup(name, store, functions)
                .map_err(|error| error.located(origin))?;
            context.values.push(value);
            Flow::Advance
        }
        Op::FunctionLookup(name) => {
            let value = env.resolve(name, store, functions)?.ok_or_else(|| {
                Error::runtime(format!("no function named `{name}`"), origin)
            })?;
            context.values.push(value);
            Flow::Advance
        }
        Op::StoreNew(name) => {
            let value = peek(context, origin)?.clone();
            env.define(name.clone(), value, store)?;
            Flow::Advance
        }
        Op::Store(name) => {
            let value = peek(context, origin)?.clone();
            env.set(name, value, store, functions)
                .map_err(|error| error.located(origin))?;
            Flow::Advance
        }
        Op::BuildFunction(name) => {
            build_function(context, functions, store, env, name.as_ref(), origin)?
        }
        Op::Call(argc) => call(context, functions, store, host, *argc, false, origin)?,
        Op::TailCall(argc) => call(context, functions, store, host, *argc, true, origin)?,
        Op::Jump(offset) => Flow::Jump(jump_target(pc, *offset)?),
        Op::JumpIfNot(offset) => {
            let target = jump_target(pc, *offset)?;
            let condition = pop(context, origin)?;
            store.release_value(&condition)?;
            if condition.is_truthy() {
                Flow::Advance
            } else {
                Flow::Jump(target)
            }
        }
        Op::Return => {
            context.pcs.pop();
            context.frames.pop();
            if let Some(env) = context.environments.pop() {
                env.release(store)?;
            }
            if context.frames.is_empty() {
                context.done = true;
                Flow::Stay
            } else {
                // resume the caller after its call instruction
                Flow::Advance
            }
        }
    };

    match flow {
        Flow::Advance => {
            if let Some(pc) = context.pcs.last_mut() {
                *pc += 1;
            }
        }
        Flow::Jump(target) => {
            if let Some(pc) = context.pcs.last_mut() {
                *pc = target;
            }
        }
        Flow::Stay => {}
    }
    Ok(())
}

/// Step until the program finishes and return its single result.
pub fn run_to_completion(machine: &mut Machine, host: &mut dyn HostInvoker) -> Result<Value> {
    while !machine.context.done {
        step(machine, host)?;
    }
    match machine.context.values.as_slice() {
        [value] => Ok(value.clone()),
        values => Err(Error::internal(format!(
            "finished program left {} values on the stack",
            values.len()
        ))),
    }
}

fn pop(context: &mut Context, origin: Span) -> Result<Value> {
    context
        .values
        .pop()
        .ok_or_else(|| Error::runtime("value stack underflow", origin))
}

fn peek(context: &Context, origin: Span) -> Result<&Value> {
    context
        .values
        .last()
        .ok_or_else(|| Error::runtime("value stack underflow", origin))
}

fn jump_target(pc: usize, offset: i32) -> Result<usize> {
    pc.checked_add_signed(offset as isize)
        .ok_or_else(|| Error::internal(format!("jump {offset:+} from {pc} leaves the frame")))
}

fn build_function(
    context: &mut Context,
    functions: &mut FunctionTable,
    store: &mut ScopeStore,
    env: Environment,
    name: Option<&Name>,
    origin: Span,
) -> Result<Flow> {
    let [.., Value::Params(params), Value::Code(code)] = context.values.as_slice() else {
        return Err(Error::internal(
            "`BuildFunction` expects parameters and code on the stack",
        ));
    };
    let (params, code) = (params.clone(), code.clone());
    context.values.truncate(context.values.len() - 2);
    let value = match name {
        Some(name) => {
            functions.register(name.clone(), params, code, env, store)?;
            Value::Named(name.clone())
        }
        None => Value::Closure(Rc::new(Closure { params, code, env })),
    };
    store
        .retain_value(&value)
        .map_err(|error| error.located(origin))?;
    context.values.push(value);
    Ok(Flow::Advance)
}

/// Shared by `Call` and `TailCall`. All checks run before the stacks change.
fn call(
    context: &mut Context,
    functions: &FunctionTable,
    store: &mut ScopeStore,
    host: &mut dyn HostInvoker,
    argc: usize,
    tail: bool,
    origin: Span,
) -> Result<Flow> {
    let callee_index = context
        .values
        .len()
        .checked_sub(argc + 1)
        .ok_or_else(|| Error::runtime("value stack underflow", origin))?;
    let callee = context.values[callee_index].clone();

    let (label, params, code, env) = match &callee {
        Value::Host(method) => {
            let result = host
                .invoke(method, &context.values[callee_index + 1..])
                .map_err(|error| Error::runtime(format!("{}: {error:#}", method.method), origin))?;
            store.retain_value(&result)?;
            for value in context.values.drain(callee_index..).collect::<Vec<_>>() {
                store.release_value(&value)?;
            }
            context.values.push(result);
            return Ok(Flow::Advance);
        }
        Value::Closure(closure) => (
            "lambda".to_string(),
            closure.params.clone(),
            closure.code.clone(),
            closure.env.clone(),
        ),
        Value::Named(name) => {
            let function = functions.get(name).ok_or_else(|| {
                Error::runtime(format!("no function named `{name}`"), origin)
            })?;
            let env = function.env.clone().ok_or_else(|| {
                Error::runtime(format!("function `{name}` is no longer available"), origin)
            })?;
            (
                format!("`{name}`"),
                function.params.clone(),
                function.code.clone(),
                env,
            )
        }
        other => {
            return Err(Error::runtime(
                format!("cannot call {} `{other:?}`", other.type_name()),
                origin,
            ));
        }
    };
    if params.len() != argc {
        return Err(Error::runtime(
            format!(
                "{label} expected {} argument{}, got {argc}",
                params.len(),
                if params.len() == 1 { "" } else { "s" },
            ),
            origin,
        ));
    }

    let args: Vec<Value> = context.values.drain(callee_index + 1..).collect();
    let callee_env = env.extend(params.iter().cloned().zip(args.iter().cloned()), store)?;
    for value in args.iter().chain([&callee]) {
        store.release_value(value)?;
    }
    context.values.truncate(callee_index);

    if tail {
        if let Some(finished) = context.environments.pop() {
            finished.release(store)?;
        }
        context.pcs.pop();
        context.frames.pop();
    }
    context.pcs.push(0);
    context.frames.push(code);
    context.environments.push(callee_env);
    Ok(Flow::Stay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Builtins;
    use crate::compiler::compile_program;
    use crate::parser::parse_program;

    fn machine(source: &str) -> Machine {
        let code = compile_program(&parse_program(source).unwrap()).unwrap();
        let capabilities: Vec<Rc<dyn Capability>> = vec![Rc::new(Builtins)];
        Machine::new(code, capabilities.into())
    }

    fn run(source: &str) -> Result<Value> {
        run_to_completion(&mut machine(source), &mut DirectInvoker)
    }

    #[test]
    fn adds_numbers() {
        assert_eq!(run("(+ 1 2)").unwrap(), Value::from(3.0));
    }

    #[test]
    fn lambda_call() {
        assert_eq!(
            run("(define foo (lambda (x) (+ x 1))) (foo 41)").unwrap(),
            Value::from(42.0)
        );
    }

    #[test]
    fn closures_capture_their_scope() {
        let source = "
            (define make-counter (lambda ()
              (define n 0)
              (lambda () (set! n (+ n 1)))))
            (define counter (make-counter))
            (counter)
            (counter)
            (counter)";
        assert_eq!(run(source).unwrap(), Value::from(3.0));
    }

    #[test]
    fn arity_mismatch_names_both_counts() {
        let error = run("(define f (lambda (a b) a)) (f 1)").unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Runtime);
        assert_eq!(error.message(), "lambda expected 2 arguments, got 1");
        assert!(error.span().is_some());
    }

    #[test]
    fn calling_a_number_fails() {
        let error = run("(1 2)").unwrap_err();
        assert!(error.message().contains("cannot call number"));
    }

    #[test]
    fn failed_step_leaves_context_untouched() {
        let mut machine = machine("(define f (lambda (a) a)) (f)");
        let mut failed = None;
        while !machine.context.done {
            let before = (machine.context.values.len(), machine.context.pcs.clone());
            if let Err(error) = step(&mut machine, &mut DirectInvoker) {
                assert_eq!(
                    (machine.context.values.len(), machine.context.pcs.clone()),
                    before
                );
                failed = Some(error);
                break;
            }
        }
        assert!(failed.is_some());
    }

    #[test]
    fn tail_calls_do_not_grow_the_frame_stack() {
        let mut machine = machine(
            "(define loop (lambda (n) (if (= n 0) \"done\" (loop (- n 1)))))
             (loop 10000)",
        );
        let mut deepest = 0;
        while !machine.context.done {
            step(&mut machine, &mut DirectInvoker).unwrap();
            deepest = deepest.max(machine.context.depth());
        }
        assert!(deepest < 5, "frame stack reached {deepest}");
        assert_eq!(machine.context.result(), Some(&Value::from("done")));
    }

    #[test]
    fn running_past_the_end_is_internal() {
        let code: Bytecode = Rc::from(Vec::new());
        let mut machine = Machine::new(code, Rc::from(Vec::new()));
        let error = step(&mut machine, &mut DirectInvoker).unwrap_err();
        assert!(error.is_fatal());
    }

    #[test]
    fn named_calls_resolve_at_call_time() {
        let mut machine = machine("(defn f () 1) (f)");
        while machine.context.pending_named_call().is_none() {
            step(&mut machine, &mut DirectInvoker).unwrap();
        }
        let patched = compile_program(&parse_program("2").unwrap()).unwrap();
        let site = machine.functions.get("f").unwrap().site.clone();
        machine
            .functions
            .patch("f".into(), Rc::from(Vec::new()), patched, Rc::from(vec![site]));
        assert_eq!(
            run_to_completion(&mut machine, &mut DirectInvoker).unwrap(),
            Value::from(2.0)
        );
    }

    #[test]
    fn finish_reclaims_every_scope() {
        let mut machine = machine("(define f (lambda (x) (+ x 1))) (defn g (y) (f y)) (g 1)");
        run_to_completion(&mut machine, &mut DirectInvoker).unwrap();
        machine.finish().unwrap();
        assert_eq!(machine.store.live_count(), 0);
    }
}
