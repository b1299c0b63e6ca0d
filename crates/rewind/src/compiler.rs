//! Spanned tree → flat bytecode.
//!
//! Every special form is a match arm emitting a short instruction sequence.
//! Tail position is decided statically while walking a function body: the
//! last expression of the body, of a `begin`/`do`, and both branches of an
//! `if` inherit it, and an invocation found there becomes a `TailCall`.

use crate::Name;
use crate::engine::Value;
use crate::error::{Error, Result};
use crate::parser::{Definition, Expression, Node, Span};
use rustc_hash::FxHashSet;

mod bytecode;
pub use bytecode::{Bytecode, Instruction, Op, disassemble};

/// Identifiers the compiler gives meaning to; none of them can be rebound.
pub const SPECIAL_FORMS: &[&str] = &[
    "null", "true", "false", "define", "defn", "lambda", "if", "begin", "do", "set!",
];

/// Compile a whole program. Top-level code is never in tail position.
pub fn compile_program(ast: &Node) -> Result<Bytecode> {
    let mut compiler = Compiler::default();
    compiler.expression(ast, false)?;
    compiler.emit(Op::Return, ast.span);
    Ok(compiler.finish())
}

/// Compile the body of a named function, exactly as its `defn` form would.
pub fn compile_definition(definition: &Definition) -> Result<Bytecode> {
    function_body(definition.body(), definition.node.span)
}

/// Body operands of the `defn` instructions compiled from `definition`,
/// searched through `code` and every function body nested in it.
pub fn definition_sites(code: &Bytecode, definition: &Definition) -> Vec<Bytecode> {
    let mut sites = Vec::new();
    collect_sites(code, definition, &mut sites);
    sites
}

fn collect_sites(code: &[Instruction], definition: &Definition, sites: &mut Vec<Bytecode>) {
    for (index, instruction) in code.iter().enumerate() {
        let Op::Push(Value::Code(body)) = &instruction.op else {
            continue;
        };
        let registers_it = code.get(index + 1).is_some_and(|next| {
            matches!(&next.op, Op::BuildFunction(Some(name)) if *name == definition.name)
        });
        if registers_it && instruction.origin == definition.node.span {
            sites.push(body.clone());
        }
        collect_sites(body, definition, sites);
    }
}

fn function_body(body: &[Node], span: Span) -> Result<Bytecode> {
    let mut compiler = Compiler::default();
    compiler.sequence(body, span, true)?;
    compiler.emit(Op::Return, span);
    Ok(compiler.finish())
}

#[derive(Default)]
struct Compiler {
    code: Vec<Instruction>,
}

impl Compiler {
    fn finish(self) -> Bytecode {
        self.code.into()
    }

    fn emit(&mut self, op: Op, origin: Span) -> usize {
        self.code.push(Instruction { op, origin });
        self.code.len() - 1
    }

    /// Point the jump at `index` to the next instruction to be emitted.
    fn patch_jump(&mut self, index: usize) -> Result<()> {
        let target = self.code.len();
        let offset = i32::try_from(target - index)
            .map_err(|_| Error::internal("jump offset does not fit in 32 bits"))?;
        match &mut self.code[index].op {
            Op::Jump(slot) | Op::JumpIfNot(slot) => *slot = offset,
            other => return Err(Error::internal(format!("cannot patch `{other}` as a jump"))),
        }
        Ok(())
    }

    fn expression(&mut self, node: &Node, tail: bool) -> Result<()> {
        match &node.node {
            Expression::Number(number) => {
                self.emit(Op::LoadConstant(Value::Number(*number)), node.span);
            }
            Expression::Text(text) => {
                self.emit(Op::LoadConstant(Value::Text(text.clone())), node.span);
            }
            Expression::Identifier(name) => self.identifier(name, node.span)?,
            Expression::List(items) => self.form(node, items, tail)?,
        }
        Ok(())
    }

    fn identifier(&mut self, name: &Name, span: Span) -> Result<()> {
        let constant = match &**name {
            "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ if is_special(name) => {
                return Err(Error::compile(
                    format!("`{name}` is a special form and cannot be used as a value"),
                    span,
                ));
            }
            _ => {
                self.emit(Op::NameLookup(name.clone()), span);
                return Ok(());
            }
        };
        self.emit(Op::LoadConstant(constant), span);
        Ok(())
    }

    fn form(&mut self, node: &Node, items: &[Node], tail: bool) -> Result<()> {
        let span = node.span;
        let Some(head) = items.first() else {
            return Err(Error::compile("empty form `()` cannot be evaluated", span));
        };
        match head.identifier().map(|name| &**name) {
            Some("define") => self.assignment(items, span, "define", Op::StoreNew),
            Some("set!") => self.assignment(items, span, "set!", Op::Store),
            Some("lambda") => {
                let [_, params, body @ ..] = items else {
                    return Err(Error::compile("`lambda` needs a parameter list", span));
                };
                self.function(None, params, body, span)
            }
            Some("defn") => {
                let [_, name, params, body @ ..] = items else {
                    return Err(Error::compile(
                        "`defn` needs a name and a parameter list",
                        span,
                    ));
                };
                let name = binding_name(name, "defn")?;
                self.function(Some(name), params, body, span)
            }
            Some("if") => self.conditional(items, span, tail),
            Some("begin" | "do") => self.sequence(&items[1..], span, tail),
            Some(name) if is_special(name) => Err(Error::compile(
                format!("`{name}` cannot be called"),
                head.span,
            )),
            _ => self.invocation(head, &items[1..], span, tail),
        }
    }

    fn assignment(
        &mut self,
        items: &[Node],
        span: Span,
        keyword: &str,
        store: fn(Name) -> Op,
    ) -> Result<()> {
        let [_, name, value] = items else {
            return Err(Error::compile(
                format!("`{keyword}` needs a name and a value"),
                span,
            ));
        };
        let name = binding_name(name, keyword)?;
        self.expression(value, false)?;
        self.emit(store(name), span);
        Ok(())
    }

    fn function(
        &mut self,
        name: Option<Name>,
        params: &Node,
        body: &[Node],
        span: Span,
    ) -> Result<()> {
        let Some(params_list) = params.list() else {
            return Err(Error::compile("parameters must be a list", params.span));
        };
        let mut seen = FxHashSet::default();
        let mut names = Vec::with_capacity(params_list.len());
        for param in params_list {
            let param_name = binding_name(param, "parameter")?;
            if !seen.insert(param_name.clone()) {
                return Err(Error::compile(
                    format!("parameter `{param_name}` appears twice"),
                    param.span,
                ));
            }
            names.push(param_name);
        }
        let code = function_body(body, span)?;
        self.emit(Op::Push(Value::Params(names.into())), params.span);
        self.emit(Op::Push(Value::Code(code)), span);
        self.emit(Op::BuildFunction(name), span);
        Ok(())
    }

    fn conditional(&mut self, items: &[Node], span: Span, tail: bool) -> Result<()> {
        let (condition, then, otherwise) = match items {
            [_, condition, then] => (condition, then, None),
            [_, condition, then, otherwise] => (condition, then, Some(otherwise)),
            _ => {
                return Err(Error::compile(
                    "`if` takes a condition, a branch and an optional else branch",
                    span,
                ));
            }
        };
        self.expression(condition, false)?;
        let skip_then = self.emit(Op::JumpIfNot(0), span);
        self.expression(then, tail)?;
        let skip_else = self.emit(Op::Jump(0), span);
        self.patch_jump(skip_then)?;
        match otherwise {
            Some(otherwise) => self.expression(otherwise, tail)?,
            None => {
                self.emit(Op::LoadConstant(Value::Null), span);
            }
        }
        self.patch_jump(skip_else)
    }

    /// Evaluate forms in order keeping only the last value; empty yields `null`.
    fn sequence(&mut self, forms: &[Node], span: Span, tail: bool) -> Result<()> {
        let Some((last, init)) = forms.split_last() else {
            self.emit(Op::LoadConstant(Value::Null), span);
            return Ok(());
        };
        for form in init {
            self.expression(form, false)?;
            self.emit(Op::Pop, form.span);
        }
        self.expression(last, tail)
    }

    fn invocation(&mut self, head: &Node, args: &[Node], span: Span, tail: bool) -> Result<()> {
        match head.identifier() {
            Some(name) => {
                self.emit(Op::FunctionLookup(name.clone()), head.span);
            }
            None => self.expression(head, false)?,
        }
        for arg in args {
            self.expression(arg, false)?;
        }
        let op = if tail {
            Op::TailCall(args.len())
        } else {
            Op::Call(args.len())
        };
        self.emit(op, span);
        Ok(())
    }
}

fn is_special(name: &str) -> bool {
    SPECIAL_FORMS.contains(&name)
}

fn binding_name(node: &Node, role: &str) -> Result<Name> {
    match node.identifier() {
        Some(name) if is_special(name) => Err(Error::compile(
            format!("`{name}` is a special form and cannot be bound"),
            node.span,
        )),
        Some(name) => Ok(name.clone()),
        None => Err(Error::compile(
            format!("{role} name must be an identifier"),
            node.span,
        )),
    }
}
