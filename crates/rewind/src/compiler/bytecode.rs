use crate::Name;
use crate::engine::Value;
use crate::parser::Span;
use std::fmt;
use std::rc::Rc;

/// Immutable instruction array. Frames, closures and snapshots share it by
/// reference; hot reload swaps the reference and never edits instructions.
pub type Bytecode = Rc<[Instruction]>;

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    /// Span of the AST node this instruction was compiled from.
    pub origin: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Push a literal.
    LoadConstant(Value),
    /// Push a compiler operand (parameter list or function body).
    Push(Value),
    Pop,
    NameLookup(Name),
    /// Like `NameLookup`, for the head of an invocation.
    FunctionLookup(Name),
    /// Bind top of stack in the innermost scope, leaving it on the stack.
    StoreNew(Name),
    /// Assign top of stack to an existing binding, leaving it on the stack.
    Store(Name),
    /// Pop code and params; push a closure, or register a named function
    /// and push its placeholder.
    BuildFunction(Option<Name>),
    Call(usize),
    TailCall(usize),
    /// Offsets are relative to the jump instruction itself.
    Jump(i32),
    JumpIfNot(i32),
    Return,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadConstant(value) => write!(f, "load-constant {value:?}"),
            Self::Push(value) => write!(f, "push {value:?}"),
            Self::Pop => write!(f, "pop"),
            Self::NameLookup(name) => write!(f, "name-lookup {name}"),
            Self::FunctionLookup(name) => write!(f, "function-lookup {name}"),
            Self::StoreNew(name) => write!(f, "store-new {name}"),
            Self::Store(name) => write!(f, "store {name}"),
            Self::BuildFunction(Some(name)) => write!(f, "build-function {name}"),
            Self::BuildFunction(None) => write!(f, "build-function"),
            Self::Call(argc) => write!(f, "call {argc}"),
            Self::TailCall(argc) => write!(f, "tail-call {argc}"),
            Self::Jump(offset) => write!(f, "jump {offset:+}"),
            Self::JumpIfNot(offset) => write!(f, "jump-if-not {offset:+}"),
            Self::Return => write!(f, "return"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<28} ; {:?}", self.op.to_string(), self.origin)
    }
}

/// Human-readable listing, one instruction per line. Nested function bodies
/// are listed after their parent, indented.
pub fn disassemble(code: &[Instruction]) -> String {
    let mut listing = String::new();
    write_listing(code, 0, &mut listing);
    listing
}

fn write_listing(code: &[Instruction], indent: usize, listing: &mut String) {
    use std::fmt::Write;
    for (index, instruction) in code.iter().enumerate() {
        // Writing into a String cannot fail.
        let _ = writeln!(listing, "{:indent$}{index:>4}  {instruction}", "");
        if let Op::Push(Value::Code(body)) = &instruction.op {
            write_listing(body, indent + 6, listing);
        }
    }
}
