//! End-to-end programs through load → run → result.

use rewind::{ErrorKind, Runner, Value};

fn run(source: &str) -> rewind::Result<Value> {
    let mut runner = Runner::default();
    runner.load(source)?;
    runner.run_to_completion(1_000_000)
}

#[test]
fn adds_with_builtin_plus() {
    assert_eq!(run("(+ 1 2)").unwrap(), Value::from(3.0));
}

#[test]
fn defined_lambda_is_callable() {
    assert_eq!(
        run("(define foo (lambda (x) (+ x 1))) (foo 41)").unwrap(),
        Value::from(42.0)
    );
}

#[test]
fn recursive_defn_leaves_no_live_scopes() {
    let mut runner = Runner::default();
    runner
        .load("(defn foo (x) (if (= x 0) \"done\" (foo (- x 1)))) (foo 10)")
        .unwrap();
    let result = runner.run_to_completion(10_000).unwrap();
    assert_eq!(result, Value::from("done"));
    assert_eq!(runner.live_scopes(), 0);
}

#[test]
fn unmatched_paren_is_a_parse_error() {
    let mut runner = Runner::default();
    let error = runner.load("(+ 1 2").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Parse);
    assert_eq!(error.message(), "forgot to close something");
    assert!(runner.context().is_none(), "nothing should have been compiled");
}

#[test]
fn arity_mismatch_reports_expected_and_actual() {
    let mut runner = Runner::default();
    runner.load("(defn pair (a b) (list a b)) (pair 1)").unwrap();
    let mut errors = Vec::new();
    runner
        .run_budget(1_000, |error| errors.push(error.clone()))
        .unwrap();
    let [error] = errors.as_slice() else {
        panic!("expected one error, got {errors:?}");
    };
    assert_eq!(error.kind(), ErrorKind::Runtime);
    assert!(error.message().contains("expected 2 arguments"), "{error}");
    assert!(error.message().contains("got 1"), "{error}");
    let span = error.span().expect("runtime errors carry the call site");
    assert_eq!(span.column, 30);
}

#[test]
fn mutual_recursion_through_named_functions() {
    let source = "
        (defn even? (n) (if (= n 0) true (odd? (- n 1))))
        (defn odd? (n) (if (= n 0) false (even? (- n 1))))
        (list (even? 10) (odd? 7) (even? 3))";
    assert_eq!(
        run(source).unwrap(),
        Value::list([Value::Bool(true), Value::Bool(true), Value::Bool(false)])
    );
}

#[test]
fn set_reaches_enclosing_scope() {
    let source = "
        (define count 0)
        (defn bump (by) (set! count (+ count by)))
        (bump 2)
        (bump 5)
        count";
    assert_eq!(run(source).unwrap(), Value::from(7.0));
}

#[test]
fn assigning_a_builtin_is_rejected() {
    let error = run("(set! + 1)").unwrap_err();
    assert!(error.message().contains("immutable"));
}

#[test]
fn string_building() {
    assert_eq!(
        run("(str \"total: \" (+ 40 2))").unwrap(),
        Value::from("total: 42")
    );
}

#[test]
fn empty_program_is_null() {
    assert_eq!(run("; nothing here\n").unwrap(), Value::Null);
}
