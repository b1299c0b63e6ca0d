//! Editing a running program: rewinding to checkpoints, patching, restarts.

use rewind::{Name, Runner, RunnerConfig, Settings, UpdateOutcome, Value};

const COUNTDOWNS: &str = "
(defn a (n) (if (= n 0) 0 (a (- n 1))))
(defn b (n) (if (= n 0) 0 (b (- n 1))))
(list (a 3) (b 3) (a 1))";

fn runner() -> Runner {
    Runner::new(RunnerConfig::new(Settings {
        keyframe_interval: 5,
        ..Settings::default()
    }))
}

fn numbers(values: &[f64]) -> Value {
    Value::list(values.iter().copied().map(Value::from))
}

/// Only changed functions compete for the rewind point: editing `b` alone
/// resumes from `b`'s own last call even though `a` was called earlier.
#[test]
fn editing_one_function_rewinds_to_its_last_call() {
    let mut runner = runner();
    runner.load(COUNTDOWNS).unwrap();
    assert_eq!(runner.run_to_completion(10_000).unwrap(), numbers(&[0.0, 0.0, 0.0]));
    let b_checkpoint = runner.checkpoint_step("b").unwrap();
    let a_checkpoint = runner.checkpoint_step("a").unwrap();
    assert!(a_checkpoint > b_checkpoint, "`(a 1)` runs after `(b 3)`");

    let outcome = runner
        .update(&COUNTDOWNS.replace("(defn b (n) (if (= n 0) 0", "(defn b (n) (if (= n 0) 100"))
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Rewound {
            function: Name::from("b"),
            step: b_checkpoint
        }
    );
    assert_eq!(runner.step_count(), b_checkpoint);
    assert!(!runner.is_finished());
    // a's checkpoint lies in the discarded future
    assert_eq!(runner.checkpoint_step("a"), None);
    let keyframes = runner.keyframe_steps();
    assert!(keyframes.starts_with(&[0, 5]), "{keyframes:?}");
    assert!(keyframes.iter().all(|step| *step <= b_checkpoint));

    assert_eq!(
        runner.run_to_completion(10_000).unwrap(),
        numbers(&[0.0, 100.0, 0.0])
    );
}

#[test]
fn editing_several_functions_picks_the_earliest_checkpoint() {
    let source = "
        (defn a (n) (if (= n 0) 0 (a (- n 1))))
        (defn b (n) (if (= n 0) 0 (b (- n 1))))
        (list (a 5) (b 5))";
    let mut runner = runner();
    runner.load(source).unwrap();
    runner.run_to_completion(10_000).unwrap();
    let a_checkpoint = runner.checkpoint_step("a").unwrap();

    let edited = source
        .replace("(defn a (n) (if (= n 0) 0", "(defn a (n) (if (= n 0) 10")
        .replace("(defn b (n) (if (= n 0) 0", "(defn b (n) (if (= n 0) 100");
    let outcome = runner.update(&edited).unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Rewound {
            function: Name::from("a"),
            step: a_checkpoint
        }
    );
    assert_eq!(runner.checkpoint_step("b"), None);
    assert_eq!(
        runner.run_to_completion(10_000).unwrap(),
        numbers(&[10.0, 100.0])
    );
}

#[test]
fn unchanged_functions_keep_their_earlier_checkpoints() {
    let source = "
        (defn c (n) n)
        (defn a (n) (+ n 1))
        (defn b (n) (* n 2))
        (list (c 1) (a 1) (b 1))";
    let mut runner = runner();
    runner.load(source).unwrap();
    runner.run_to_completion(10_000).unwrap();
    let c_checkpoint = runner.checkpoint_step("c").unwrap();
    let a_checkpoint = runner.checkpoint_step("a").unwrap();
    assert!(c_checkpoint < a_checkpoint);

    let edited = source
        .replace("(+ n 1)", "(+ n 10)")
        .replace("(* n 2)", "(* n 4)");
    assert_eq!(
        runner.update(&edited).unwrap(),
        UpdateOutcome::Rewound {
            function: Name::from("a"),
            step: a_checkpoint
        }
    );
    assert_eq!(runner.checkpoint_step("c"), Some(c_checkpoint));
    assert_eq!(runner.checkpoint_step("b"), None);
    assert_eq!(
        runner.run_to_completion(10_000).unwrap(),
        numbers(&[1.0, 11.0, 4.0])
    );
}

#[test]
fn reusing_a_name_at_the_same_depth_fails_to_load() {
    let mut runner = runner();
    let error = runner
        .load(
            "(defn a () (defn h () 1) (h))
             (defn b () (defn h () 2) (h))
             (list (a) (b))",
        )
        .unwrap_err();
    assert_eq!(error.kind(), rewind::ErrorKind::Parse);
    assert!(error.message().contains("defined twice"));
}

#[test]
fn patches_leave_deeper_same_name_functions_alone() {
    let source = "
        (defn c () 0)
        (defn h () 1)
        (defn b () (defn h () 2) (h))
        (list (c) (h) (b) (h))";
    let mut runner = runner();
    runner.load(source).unwrap();
    while runner.checkpoint_step("c").is_none() {
        runner.step().unwrap();
    }

    let outcome = runner
        .update(&source.replace("(defn c () 0)", "(defn c () 5)"))
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Rewound { ref function, .. } if &**function == "c"));
    // b's inner `h` keeps its own body; the outer one is replaced from then on
    assert_eq!(
        runner.run_to_completion(10_000).unwrap(),
        numbers(&[5.0, 1.0, 2.0, 2.0])
    );
}

#[test]
fn functions_not_yet_called_are_patched_in_place() {
    let source = "
        (defn a (n) n)
        (defn later (n) (* n 2))
        (later (a 5))";
    let mut runner = runner();
    runner.load(source).unwrap();
    while runner.checkpoint_step("a").is_none() {
        runner.step().unwrap();
    }
    let step = runner.step_count();

    let outcome = runner
        .update(&source.replace("(* n 2)", "(* n 3)"))
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Patched {
            functions: vec![Name::from("later")]
        }
    );
    assert_eq!(runner.step_count(), step);
    assert_eq!(runner.run_to_completion(10_000).unwrap(), Value::from(15.0));
}

#[test]
fn fixing_a_faulted_function_resumes_from_its_call() {
    let source = "(defn scale (x) (* x \"ten\")) (list 1 (scale 2))";
    let mut runner = runner();
    runner.load(source).unwrap();
    let mut errors = Vec::new();
    runner
        .run_budget(1_000, |error| errors.push(error.clone()))
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert!(runner.fault().is_some());

    let outcome = runner.update(&source.replace("\"ten\"", "10")).unwrap();
    assert!(matches!(outcome, UpdateOutcome::Rewound { ref function, .. } if &**function == "scale"));
    assert!(runner.fault().is_none());
    assert_eq!(
        runner.run_to_completion(10_000).unwrap(),
        numbers(&[1.0, 20.0])
    );
}

#[test]
fn top_level_edits_restart_from_scratch() {
    let mut runner = runner();
    runner.load(COUNTDOWNS).unwrap();
    runner.run_budget(12, |_| {}).unwrap();

    let outcome = runner
        .update(&COUNTDOWNS.replace("(a 1))", "(a 2))"))
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Restarted);
    assert_eq!(runner.step_count(), 0);
    assert_eq!(runner.keyframe_steps(), vec![0]);
    assert_eq!(runner.checkpoint_step("a"), None);
    assert_eq!(
        runner.run_to_completion(10_000).unwrap(),
        numbers(&[0.0, 0.0, 0.0])
    );
}

#[test]
fn whitespace_and_comment_edits_change_nothing() {
    let mut runner = runner();
    runner.load(COUNTDOWNS).unwrap();
    runner.run_budget(7, |_| {}).unwrap();

    let reformatted = format!("; countdowns\n{}\n\n", COUNTDOWNS.replace(' ', "  "));
    assert_eq!(runner.update(&reformatted).unwrap(), UpdateOutcome::Unchanged);
    assert_eq!(runner.step_count(), 7);
    assert_eq!(runner.source(), Some(reformatted.as_str()));
}

#[test]
fn unchanged_source_after_finishing_restarts() {
    let mut runner = runner();
    runner.load("(+ 1 2)").unwrap();
    runner.run_to_completion(100).unwrap();
    assert_eq!(runner.update("(+ 1 2)").unwrap(), UpdateOutcome::Restarted);
    assert!(!runner.is_finished());
    assert_eq!(runner.run_to_completion(100).unwrap(), Value::from(3.0));
}
