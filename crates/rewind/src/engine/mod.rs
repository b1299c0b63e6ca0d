//! Execution engine: values, the scope store, environments, the named-function
//! table, the single-step VM and identity-preserving snapshots.

pub mod environment;
pub mod functions;
pub mod scope_store;
pub mod snapshot;
pub mod value;
pub mod vm;

pub use environment::Environment;
pub use functions::{FunctionTable, NamedFunction};
pub use scope_store::{ScopeStore, Ticket};
pub use snapshot::{CloneMemo, DeepClone};
pub use value::{Closure, ContainsScopes, HostMethod, Value};
pub use vm::{Context, DirectInvoker, HostInvoker, Machine, run_to_completion, step};
