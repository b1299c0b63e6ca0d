//! Direct tree-walk evaluation, no bytecode involved.
//!
//! This is the reference semantics the compiler and VM are checked against.
//! It recurses on the host stack, keeps scopes in plain `Rc<RefCell<..>>`
//! chains, and does not support `defn`: named functions only exist inside
//! a runner.

use crate::Name;
use crate::capability::Capability;
use crate::compiler::SPECIAL_FORMS;
use crate::engine::{HostMethod, Value};
use crate::error::{Error, Result};
use crate::parser::{Expression, Node, Span};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Nested interpreted calls allowed before evaluation gives up.
pub const MAX_CALL_DEPTH: usize = 512;

/// Evaluate a program tree. Functions may not escape as the final result.
pub fn evaluate(ast: &Node, capabilities: &[Rc<dyn Capability>]) -> Result<Value> {
    let mut evaluator = Evaluator {
        capabilities,
        depth: 0,
    };
    let scope = Rc::new(RefCell::new(Bindings::default()));
    match evaluator.eval(ast, &scope)? {
        Datum::Value(value) => Ok(value),
        Datum::Lambda(_) => Err(Error::runtime(
            "tree-walk evaluation produced a function",
            ast.span,
        )),
    }
}

#[derive(Clone)]
enum Datum {
    Value(Value),
    Lambda(Rc<Lambda>),
}

struct Lambda {
    params: Vec<Name>,
    body: Vec<Node>,
    scope: Scope,
}

type Scope = Rc<RefCell<Bindings>>;

#[derive(Default)]
struct Bindings {
    values: FxHashMap<Name, Datum>,
    parent: Option<Scope>,
}

fn owner_of(scope: &Scope, name: &str) -> Option<Scope> {
    let mut current = scope.clone();
    loop {
        if current.borrow().values.contains_key(name) {
            return Some(current);
        }
        let parent = current.borrow().parent.clone()?;
        current = parent;
    }
}

struct Evaluator<'a> {
    capabilities: &'a [Rc<dyn Capability>],
    depth: usize,
}

impl Evaluator<'_> {
    fn eval(&mut self, node: &Node, scope: &Scope) -> Result<Datum> {
        match &node.node {
            Expression::Number(number) => Ok(Datum::Value(Value::Number(*number))),
            Expression::Text(text) => Ok(Datum::Value(Value::Text(text.clone()))),
            Expression::Identifier(name) => self.identifier(name, node.span, scope),
            Expression::List(items) => self.form(node, items, scope),
        }
    }

    fn identifier(&self, name: &Name, span: Span, scope: &Scope) -> Result<Datum> {
        match &**name {
            "null" => return Ok(Datum::Value(Value::Null)),
            "true" => return Ok(Datum::Value(Value::Bool(true))),
            "false" => return Ok(Datum::Value(Value::Bool(false))),
            _ if SPECIAL_FORMS.contains(&&**name) => {
                return Err(Error::compile(
                    format!("`{name}` is a special form and cannot be used as a value"),
                    span,
                ));
            }
            _ => {}
        }
        if let Some(owner) = owner_of(scope, name) {
            if let Some(datum) = owner.borrow().values.get(name) {
                return Ok(datum.clone());
            }
        }
        self.capability_for(name)
            .map(|owner| {
                Datum::Value(Value::Host(HostMethod {
                    owner: owner.clone(),
                    method: name.clone(),
                }))
            })
            .ok_or_else(|| Error::runtime(format!("`{name}` is not defined"), span))
    }

    fn capability_for(&self, name: &str) -> Option<&Rc<dyn Capability>> {
        self.capabilities
            .iter()
            .rev()
            .find(|capability| capability.has_method(name))
    }

    fn form(&mut self, node: &Node, items: &[Node], scope: &Scope) -> Result<Datum> {
        let span = node.span;
        let Some(head) = items.first() else {
            return Err(Error::compile("empty form `()` cannot be evaluated", span));
        };
        match head.identifier().map(|name| &**name) {
            Some("define") | Some("set!") => {
                let [keyword, name, value] = items else {
                    return Err(Error::compile("assignment needs a name and a value", span));
                };
                let Some(name) = name.identifier() else {
                    return Err(Error::compile("name must be an identifier", name.span));
                };
                let datum = self.eval(value, scope)?;
                if keyword.identifier().is_some_and(|keyword| &**keyword == "define") {
                    scope.borrow_mut().values.insert(name.clone(), datum.clone());
                } else {
                    let Some(owner) = owner_of(scope, name) else {
                        let reason = if self.capability_for(name).is_some() {
                            "it is an immutable binding"
                        } else {
                            "it is not defined"
                        };
                        return Err(Error::runtime(
                            format!("cannot assign to `{name}`: {reason}"),
                            span,
                        ));
                    };
                    owner.borrow_mut().values.insert(name.clone(), datum.clone());
                }
                Ok(datum)
            }
            Some("lambda") => {
                let [_, params, body @ ..] = items else {
                    return Err(Error::compile("`lambda` needs a parameter list", span));
                };
                let params = params
                    .list()
                    .and_then(|params| {
                        params
                            .iter()
                            .map(|param| param.identifier().cloned())
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or_else(|| Error::compile("parameters must be identifiers", params.span))?;
                Ok(Datum::Lambda(Rc::new(Lambda {
                    params,
                    body: body.to_vec(),
                    scope: scope.clone(),
                })))
            }
            Some("defn") => Err(Error::compile(
                "named functions are not supported by the tree-walk evaluator",
                span,
            )),
            Some("if") => {
                let (condition, then, otherwise) = match items {
                    [_, condition, then] => (condition, then, None),
                    [_, condition, then, otherwise] => (condition, then, Some(otherwise)),
                    _ => return Err(Error::compile("malformed `if`", span)),
                };
                let truthy = match self.eval(condition, scope)? {
                    Datum::Value(value) => value.is_truthy(),
                    Datum::Lambda(_) => true,
                };
                match (truthy, otherwise) {
                    (true, _) => self.eval(then, scope),
                    (false, Some(otherwise)) => self.eval(otherwise, scope),
                    (false, None) => Ok(Datum::Value(Value::Null)),
                }
            }
            Some("begin" | "do") => self.sequence(&items[1..], scope),
            _ => self.invocation(head, &items[1..], span, scope),
        }
    }

    fn sequence(&mut self, forms: &[Node], scope: &Scope) -> Result<Datum> {
        let mut last = Datum::Value(Value::Null);
        for form in forms {
            last = self.eval(form, scope)?;
        }
        Ok(last)
    }

    fn invocation(
        &mut self,
        head: &Node,
        args: &[Node],
        span: Span,
        scope: &Scope,
    ) -> Result<Datum> {
        let callee = self.eval(head, scope)?;
        let args = args
            .iter()
            .map(|arg| self.eval(arg, scope))
            .collect::<Result<Vec<_>>>()?;
        match callee {
            Datum::Value(Value::Host(method)) => {
                let args = args
                    .into_iter()
                    .map(|arg| match arg {
                        Datum::Value(value) => Ok(value),
                        Datum::Lambda(_) => Err(Error::runtime(
                            "functions cannot be passed to host methods here",
                            span,
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                method
                    .invoke(&args)
                    .map(Datum::Value)
                    .map_err(|error| {
                        Error::runtime(format!("{}: {error:#}", method.method), span)
                    })
            }
            Datum::Lambda(lambda) => {
                if lambda.params.len() != args.len() {
                    return Err(Error::runtime(
                        format!(
                            "lambda expected {} argument{}, got {}",
                            lambda.params.len(),
                            if lambda.params.len() == 1 { "" } else { "s" },
                            args.len()
                        ),
                        span,
                    ));
                }
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(Error::runtime("call depth exceeded", span));
                }
                let call_scope = Rc::new(RefCell::new(Bindings {
                    values: lambda.params.iter().cloned().zip(args).collect(),
                    parent: Some(lambda.scope.clone()),
                }));
                self.depth += 1;
                let result = self.sequence(&lambda.body, &call_scope);
                self.depth -= 1;
                result
            }
            Datum::Value(other) => Err(Error::runtime(
                format!("cannot call {} `{other:?}`", other.type_name()),
                span,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Builtins;
    use crate::parser::parse_program;

    fn eval(source: &str) -> Result<Value> {
        let capabilities: Vec<Rc<dyn Capability>> = vec![Rc::new(Builtins)];
        evaluate(&parse_program(source).unwrap(), &capabilities)
    }

    #[test]
    fn evaluates_closures_and_assignment() {
        let source = "
            (define total 0)
            (define add (lambda (n) (set! total (+ total n))))
            (add 2)
            (add 3)
            total";
        assert_eq!(eval(source).unwrap(), Value::from(5.0));
    }

    #[test]
    fn rejects_named_functions() {
        assert_eq!(
            eval("(defn f () 1)").unwrap_err().kind(),
            crate::ErrorKind::Compile
        );
    }

    #[test]
    fn arity_errors_match_the_vm_wording() {
        let error = eval("((lambda (a b) a) 1)").unwrap_err();
        assert_eq!(error.message(), "lambda expected 2 arguments, got 1");
    }
}
