//! A small Lisp runtime for live coding.
//!
//! Source is parsed into a spanned tree, compiled to flat bytecode and run
//! one instruction at a time by a VM whose whole call stack lives in plain
//! data. That makes a running program cheap to pause, snapshot, rewind and
//! hot-patch; [`runner::Runner`] drives all of it.

pub mod capability;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod parser;
pub mod runner;

/// Interned-by-sharing identifier used for bindings and function names.
pub type Name = std::rc::Rc<str>;

pub use capability::{Builtins, Capability, Clock, Console, Frame, RenderSignal};
pub use config::{RunnerConfig, Settings};
pub use engine::{Machine, Value};
pub use error::{Error, ErrorKind, Result};
pub use runner::{BudgetReport, Runner, Snapshot, StopReason, UpdateOutcome};
