use super::environment::Environment;
use super::scope_store::Ticket;
use crate::Name;
use crate::capability::Capability;
use crate::compiler::Bytecode;
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(Rc<str>),
    List(Rc<[Value]>),
    /// Anonymous function built by `lambda`.
    Closure(Rc<Closure>),
    /// Stands in for a named function; resolved against the function table
    /// at call time so a patched body is picked up on the next call.
    Named(Name),
    /// Capability method bound to the object that owns it.
    Host(HostMethod),
    /// Compiler operand: parameter names for `BuildFunction`.
    Params(Rc<[Name]>),
    /// Compiler operand: function body for `BuildFunction`.
    Code(Bytecode),
}

pub struct Closure {
    pub params: Rc<[Name]>,
    pub code: Bytecode,
    pub env: Environment,
}

#[derive(Clone)]
pub struct HostMethod {
    pub owner: Rc<dyn Capability>,
    pub method: Name,
}

impl HostMethod {
    pub fn invoke(&self, args: &[Value]) -> anyhow::Result<Value> {
        self.owner.invoke(&self.method, args)
    }
}

impl Value {
    /// Only `null` and `false` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Null | Self::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "string",
            Self::List(_) => "list",
            Self::Closure(_) | Self::Named(_) | Self::Host(_) => "function",
            Self::Params(_) => "parameter list",
            Self::Code(_) => "code",
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Closure(_) | Self::Named(_) | Self::Host(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::Text(text.into())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(items.into_iter().collect())
    }
}

/// Anything that keeps scope records alive. The collector follows these
/// edges when computing reachability.
pub trait ContainsScopes {
    fn scopes(&self) -> SmallVec<[Ticket; 2]>;
}

impl ContainsScopes for Value {
    fn scopes(&self) -> SmallVec<[Ticket; 2]> {
        match self {
            Self::Closure(closure) => closure.env.scopes(),
            Self::List(items) => items.iter().flat_map(|item| item.scopes()).collect(),
            _ => SmallVec::new(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(a, b),
            (Self::Named(a), Self::Named(b)) => a == b,
            (Self::Host(a), Self::Host(b)) => {
                std::ptr::addr_eq(Rc::as_ptr(&a.owner), Rc::as_ptr(&b.owner))
                    && a.method == b.method
            }
            (Self::Params(a), Self::Params(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "{text}"),
            Self::List(items) => {
                write!(f, "(")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item:?}")?;
                }
                write!(f, ")")
            }
            Self::Closure(closure) => write!(f, "<lambda/{}>", closure.params.len()),
            Self::Named(name) => write!(f, "<function {name}>"),
            Self::Host(host) => write!(f, "<{} {}>", host.owner.label(), host.method),
            Self::Params(params) => write!(f, "({})", params.join(" ")),
            Self::Code(code) => write!(f, "<code: {} instructions>", code.len()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            other => write!(f, "{other}"),
        }
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Self::Number(number)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}
