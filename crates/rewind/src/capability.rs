//! Host objects callable from interpreted code.
//!
//! A capability exposes named methods. Looking one up yields a
//! [`HostMethod`](crate::engine::HostMethod) bound to its owner. Capabilities
//! that keep state can take part in snapshots through `save_state` and
//! `restore_state`; ones that answer differently for the same call (clocks,
//! input) report `is_deterministic() == false` so the runner caches their
//! results per step instead of asking again during replay.

use crate::engine::Value;
use anyhow::{Context as _, bail, ensure};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

pub trait Capability {
    /// Short name used in diagnostics.
    fn label(&self) -> &str;
    fn has_method(&self, name: &str) -> bool;
    fn invoke(&self, method: &str, args: &[Value]) -> anyhow::Result<Value>;

    fn save_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Reject a state `restore_state` could not apply, without changing
    /// anything. Runs for every capability before any of them restores.
    fn check_state(&self, _state: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn restore_state(&self, _state: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        true
    }
}

/// The builtin function table.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builtins;

impl Builtins {
    pub const METHODS: &'static [&'static str] = &[
        "+", "-", "*", "/", "mod", "=", "!=", "<", ">", "<=", ">=", "not", "list", "first",
        "rest", "count", "empty?", "str",
    ];
}

impl Capability for Builtins {
    fn label(&self) -> &str {
        "builtins"
    }

    fn has_method(&self, name: &str) -> bool {
        Self::METHODS.contains(&name)
    }

    fn invoke(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        match method {
            "+" if args.iter().any(|arg| matches!(arg, Value::Text(_))) => Ok(concat(args)),
            "+" => Ok(Value::Number(numbers(args)?.iter().sum())),
            "*" => Ok(Value::Number(numbers(args)?.iter().product())),
            "-" => match numbers(args)?.as_slice() {
                [] => bail!("expected at least 1 argument"),
                [only] => Ok(Value::Number(-only)),
                [first, rest @ ..] => Ok(Value::Number(rest.iter().fold(*first, |a, b| a - b))),
            },
            "/" => {
                let numbers = numbers(args)?;
                let [first, rest @ ..] = numbers.as_slice() else {
                    bail!("expected at least 1 argument");
                };
                ensure!(!rest.contains(&0.0), "division by zero");
                Ok(Value::Number(rest.iter().fold(*first, |a, b| a / b)))
            }
            "mod" => {
                let numbers = numbers(args)?;
                let [a, b] = numbers.as_slice() else {
                    bail!("expected 2 arguments, got {}", args.len());
                };
                ensure!(*b != 0.0, "division by zero");
                Ok(Value::Number(a % b))
            }
            "=" => Ok(Value::Bool(args.windows(2).all(|pair| pair[0] == pair[1]))),
            "!=" => {
                let [a, b] = args else {
                    bail!("expected 2 arguments, got {}", args.len());
                };
                Ok(Value::Bool(a != b))
            }
            "<" => compare(args, |ordering| ordering.is_lt()),
            ">" => compare(args, |ordering| ordering.is_gt()),
            "<=" => compare(args, |ordering| ordering.is_le()),
            ">=" => compare(args, |ordering| ordering.is_ge()),
            "not" => {
                let [value] = args else {
                    bail!("expected 1 argument, got {}", args.len());
                };
                Ok(Value::Bool(!value.is_truthy()))
            }
            "list" => Ok(Value::list(args.iter().cloned())),
            "first" => Ok(list_arg(args)?.first().cloned().unwrap_or(Value::Null)),
            "rest" => Ok(Value::list(list_arg(args)?.iter().skip(1).cloned())),
            "count" => match args {
                [Value::List(items)] => Ok(Value::Number(items.len() as f64)),
                [Value::Text(text)] => Ok(Value::Number(text.chars().count() as f64)),
                _ => bail!("expected a list or a string"),
            },
            "empty?" => match args {
                [Value::List(items)] => Ok(Value::Bool(items.is_empty())),
                [Value::Text(text)] => Ok(Value::Bool(text.is_empty())),
                _ => bail!("expected a list or a string"),
            },
            "str" => Ok(concat(args)),
            _ => bail!("unknown builtin `{method}`"),
        }
    }
}

fn numbers(args: &[Value]) -> anyhow::Result<Vec<f64>> {
    args.iter()
        .enumerate()
        .map(|(index, arg)| {
            arg.as_number().with_context(|| {
                format!("argument {} must be a number, got {}", index + 1, arg.type_name())
            })
        })
        .collect()
}

fn concat(args: &[Value]) -> Value {
    let text: String = args.iter().map(|arg| arg.to_string()).collect();
    Value::Text(text.into())
}

fn compare(args: &[Value], accept: fn(std::cmp::Ordering) -> bool) -> anyhow::Result<Value> {
    ensure!(args.len() >= 2, "expected at least 2 arguments, got {}", args.len());
    for pair in args.windows(2) {
        let ordering = match (&pair[0], &pair[1]) {
            (Value::Number(a), Value::Number(b)) => a
                .partial_cmp(b)
                .context("cannot compare NaN")?,
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => bail!("cannot compare {} with {}", a.type_name(), b.type_name()),
        };
        if !accept(ordering) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn list_arg(args: &[Value]) -> anyhow::Result<&[Value]> {
    match args {
        [Value::List(items)] => Ok(items),
        [other] => bail!("expected a list, got {}", other.type_name()),
        _ => bail!("expected 1 argument, got {}", args.len()),
    }
}

/// `print` and `log`: collect output, optionally echoing it to stdout.
/// Snapshots keep the whole buffer, so restoring works in both directions.
/// Restored lines are not echoed again.
#[derive(Debug, Default)]
pub struct Console {
    output: RefCell<String>,
    echo: bool,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echoing() -> Self {
        Self {
            output: RefCell::default(),
            echo: true,
        }
    }

    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }
}

impl Capability for Console {
    fn label(&self) -> &str {
        "console"
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "print" | "log")
    }

    fn invoke(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        let line = args
            .iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let line = match method {
            "print" => line,
            "log" => format!("[log] {line}"),
            _ => bail!("console has no method `{method}`"),
        };
        if self.echo {
            println!("{line}");
        }
        let mut output = self.output.borrow_mut();
        output.push_str(&line);
        output.push('\n');
        Ok(Value::Null)
    }

    fn save_state(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "output": *self.output.borrow() }))
    }

    fn check_state(&self, state: &serde_json::Value) -> anyhow::Result<()> {
        saved_output(state).map(drop)
    }

    fn restore_state(&self, state: &serde_json::Value) -> anyhow::Result<()> {
        let saved = saved_output(state)?;
        let mut output = self.output.borrow_mut();
        output.clear();
        output.push_str(saved);
        Ok(())
    }
}

fn saved_output(state: &serde_json::Value) -> anyhow::Result<&str> {
    state
        .get("output")
        .and_then(serde_json::Value::as_str)
        .context("console state is missing `output`")
}

/// Milliseconds since the clock was created, or a manually advanced
/// virtual time. Never deterministic.
#[derive(Debug)]
pub struct Clock {
    source: ClockSource,
}

#[derive(Debug)]
enum ClockSource {
    Real(Instant),
    Virtual(Cell<f64>),
}

impl Clock {
    pub fn new() -> Self {
        Self {
            source: ClockSource::Real(Instant::now()),
        }
    }

    /// Clock that only moves when [`Clock::advance`] is called.
    pub fn virtual_time() -> Self {
        Self {
            source: ClockSource::Virtual(Cell::new(0.0)),
        }
    }

    pub fn advance(&self, milliseconds: f64) {
        if let ClockSource::Virtual(now) = &self.source {
            now.set(now.get() + milliseconds);
        }
    }

    pub fn now_ms(&self) -> f64 {
        match &self.source {
            ClockSource::Real(start) => start.elapsed().as_secs_f64() * 1000.0,
            ClockSource::Virtual(now) => now.get(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Capability for Clock {
    fn label(&self) -> &str {
        "clock"
    }

    fn has_method(&self, name: &str) -> bool {
        name == "now"
    }

    fn invoke(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        ensure!(method == "now", "clock has no method `{method}`");
        ensure!(args.is_empty(), "`now` takes no arguments");
        Ok(Value::Number(self.now_ms()))
    }

    fn is_deterministic(&self) -> bool {
        false
    }
}

/// Flag a program raises with `(render)` to ask the host for a redraw
/// between logical ticks. Shared between the [`Frame`] capability and the
/// runner that consumes it.
#[derive(Debug, Clone, Default)]
pub struct RenderSignal(Rc<Cell<bool>>);

impl RenderSignal {
    pub fn request(&self) {
        self.0.set(true);
    }

    pub fn is_requested(&self) -> bool {
        self.0.get()
    }

    /// Read and clear the flag.
    pub fn take(&self) -> bool {
        self.0.replace(false)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    signal: RenderSignal,
}

impl Frame {
    pub fn new(signal: RenderSignal) -> Self {
        Self { signal }
    }
}

impl Capability for Frame {
    fn label(&self) -> &str {
        "frame"
    }

    fn has_method(&self, name: &str) -> bool {
        name == "render"
    }

    fn invoke(&self, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
        ensure!(method == "render", "frame has no method `{method}`");
        self.signal.request();
        Ok(Value::Null)
    }
}
