//! Exercise verification: compare a submission's behavior against the
//! reference solution across fixed, example and generated test cases.

use std::rc::Rc;

use anyhow::Context;
use rand::Rng;

use super::{CheckOutcome, ExerciseDef, StepContext, WrongSolution};
use crate::exercises::{
    check_result, compile_submission, generate_for_type, invoke, CallSpec, Callable,
    CompiledSubmission, SubmissionError, INVALID_EXAMPLE_VALUES,
};
use crate::lang::ast::{find_function, FuncDef};
use crate::lang::{Program, Value};
use crate::worker::protocol::SourceTag;

/// How many random test cases supplement the fixed ones.
const GENERATED_CASES: usize = 10;

/// A reference (or wrong) solution made callable.
pub enum SolutionCallable {
    Body(CompiledSubmission),
    Function(Rc<FuncDef>),
}

impl SolutionCallable {
    fn as_callable(&self) -> Callable<'_> {
        match self {
            SolutionCallable::Body(submission) => Callable::Body(submission),
            SolutionCallable::Function(def) => Callable::Function(def),
        }
    }
}

impl ExerciseDef {
    /// The reference solution as a callable.
    pub fn solution_callable(&self) -> anyhow::Result<SolutionCallable> {
        solution_callable_for(
            self,
            &self.solution_program,
            &self.solution_source,
        )
    }

    /// The reference solution's function definition (function exercises).
    pub fn solution_function(&self) -> Option<&FuncDef> {
        let name = self.function_name.as_deref()?;
        find_function(&self.solution_program.body, name)
    }
}

fn solution_callable_for(
    def: &ExerciseDef,
    program: &Program,
    source: &str,
) -> anyhow::Result<SolutionCallable> {
    match &def.function_name {
        Some(name) => {
            let func = find_function(&program.body, name)
                .with_context(|| format!("solution does not define `{}`", name))?;
            Ok(SolutionCallable::Function(Rc::new(func.clone())))
        }
        None => Ok(SolutionCallable::Body(CompiledSubmission {
            source: source.to_string(),
            param_names: def.param_names.clone(),
            example_values: Vec::new(),
            body: program.body.clone(),
        })),
    }
}

pub fn check_exercise(def: &ExerciseDef, ctx: &StepContext) -> anyhow::Result<CheckOutcome> {
    if ctx.source == SourceTag::Shell {
        return Ok(CheckOutcome::fail_silent());
    }

    match &def.function_name {
        Some(name) => check_function_exercise(def, name, ctx),
        None => check_body_exercise(def, ctx),
    }
}

fn check_function_exercise(
    def: &ExerciseDef,
    name: &str,
    ctx: &StepContext,
) -> anyhow::Result<CheckOutcome> {
    let func = match ctx.namespace.get(name) {
        None => {
            return Ok(CheckOutcome::fail(format!(
                "{} `{}`.",
                super::MUST_DEFINE_FUNCTION,
                name
            )));
        }
        Some(Value::Func(func)) => func.clone(),
        Some(_) => {
            return Ok(CheckOutcome::fail(format!(
                "`{}` {}",
                name,
                super::NOT_A_FUNCTION
            )));
        }
    };

    let needed = def
        .solution_function()
        .context("function exercise has no solution function")?;
    if func.params != needed.params {
        return Ok(CheckOutcome::fail(format!(
            "The signature should be `def {}({})`, not `def {}({})`.",
            name,
            needed.params.join(", "),
            name,
            func.params.join(", ")
        )));
    }

    let solution = def.solution_callable()?;
    verify(def, &solution, Callable::Function(&func), None, ctx)
}

fn check_body_exercise(def: &ExerciseDef, ctx: &StepContext) -> anyhow::Result<CheckOutcome> {
    let submission = match compile_submission(ctx.input, &def.param_names) {
        Ok(submission) => submission,
        // The run already surfaced the syntax error.
        Err(SubmissionError::Syntax(_)) => return Ok(CheckOutcome::fail_silent()),
        Err(SubmissionError::MalformedSubmission(message)) => {
            return Ok(CheckOutcome::fail(message));
        }
        Err(SubmissionError::InvalidExampleValues(message)) => {
            return Ok(CheckOutcome::fail(message));
        }
    };

    let solution = def.solution_callable()?;
    let example = submission.example_values.clone();
    verify(
        def,
        &solution,
        Callable::Body(&submission),
        Some(&example),
        ctx,
    )
}

/// Run the submission against example values, fixed cases and generated
/// cases, with the reference solution's outputs as the oracle.
fn verify(
    def: &ExerciseDef,
    solution: &SolutionCallable,
    submission: Callable,
    example_values: Option<&[(String, Value)]>,
    ctx: &StepContext,
) -> anyhow::Result<CheckOutcome> {
    let solution_spec = solution_spec(def);
    let submission_spec = submission_spec(def, ctx);

    let mut cases = fixed_cases(def);

    if let Some(example) = example_values {
        let already_tested = cases.iter().any(|(inputs, _)| inputs == example);
        if !already_tested {
            // The learner's own example values become the first test, so
            // the failure they see first involves values they chose.
            match invoke(solution.as_callable(), example, &solution_spec) {
                Ok(expected) => cases.insert(0, (example.to_vec(), expected)),
                Err(_) => return Ok(CheckOutcome::fail(INVALID_EXAMPLE_VALUES)),
            }
        }
    }

    let mut rng = rand::thread_rng();
    for _ in 0..GENERATED_CASES {
        let inputs = generate_inputs(def, &mut rng);
        let expected = invoke(solution.as_callable(), &inputs, &solution_spec)
            .map_err(|err| {
                anyhow::anyhow!(
                    "reference solution failed on generated inputs {:?}: {}",
                    inputs
                        .iter()
                        .map(|(n, v)| format!("{}={}", n, v.repr()))
                        .collect::<Vec<_>>(),
                    err
                )
            })?;
        cases.push((inputs, expected));
    }

    let mut passed_tests = Vec::new();
    for (inputs, expected) in &cases {
        let outcome = check_result(submission, inputs, expected, &submission_spec);
        if outcome.passed {
            passed_tests.push(outcome.message);
        } else {
            return Ok(CheckOutcome {
                passed: false,
                message: Some(outcome.message),
                passed_tests,
            });
        }
    }

    Ok(CheckOutcome::pass(passed_tests))
}

/// Catalog-load self-check: the reference solution must pass its own
/// declared fixed test cases.
pub fn self_check(def: &ExerciseDef) -> anyhow::Result<()> {
    let solution = def.solution_callable()?;
    let spec = solution_spec(def);
    for (inputs, expected) in fixed_cases(def) {
        let outcome = check_result(solution.as_callable(), &inputs, &expected, &spec);
        if !outcome.passed {
            anyhow::bail!(
                "reference solution fails its own test case:\n{}",
                outcome.message
            );
        }
    }
    Ok(())
}

/// Catalog-load self-check for post-success message steps: a wrong
/// solution flagged `after_success` must itself pass the fixed tests
/// (otherwise it could never match a passing submission).
pub fn wrong_solution_self_check(
    def: &ExerciseDef,
    wrong: &WrongSolution,
) -> anyhow::Result<()> {
    let callable = solution_callable_for(def, &wrong.program, &wrong.source)?;
    let spec = CallSpec {
        source: &wrong.source,
        capture_stdout: def.captures_stdout,
        stdin_input: &def.stdin_input,
        base_globals: None,
        limits: Default::default(),
    };
    for (inputs, expected) in fixed_cases(def) {
        let outcome = check_result(callable.as_callable(), &inputs, &expected, &spec);
        if !outcome.passed {
            anyhow::bail!(
                "after-success wrong solution fails the fixed tests:\n{}",
                outcome.message
            );
        }
    }
    Ok(())
}

/// Does the submission behave like this wrong solution? Compared across
/// the same case families the real verification uses, with the wrong
/// solution's outputs as the oracle.
pub fn submission_matches_wrong(
    def: &ExerciseDef,
    wrong: &WrongSolution,
    ctx: &StepContext,
) -> anyhow::Result<bool> {
    let wrong_solution = solution_callable_for(def, &wrong.program, &wrong.source)?;
    let wrong_spec = CallSpec {
        source: &wrong.source,
        capture_stdout: def.captures_stdout,
        stdin_input: &def.stdin_input,
        base_globals: None,
        limits: Default::default(),
    };
    let submission_spec = submission_spec(def, ctx);

    // Resolve the submission the same way the real check did; if it does
    // not resolve, it cannot match anything.
    let compiled;
    let func;
    let (submission, example_values): (Callable, Option<Vec<(String, Value)>>) =
        match &def.function_name {
            Some(name) => match ctx.namespace.get(name) {
                Some(Value::Func(f)) => {
                    func = f.clone();
                    (Callable::Function(&func), None)
                }
                _ => return Ok(false),
            },
            None => match compile_submission(ctx.input, &def.param_names) {
                Ok(submission) => {
                    compiled = submission;
                    let example = compiled.example_values.clone();
                    (Callable::Body(&compiled), Some(example))
                }
                Err(_) => return Ok(false),
            },
        };

    let mut cases: Vec<Vec<(String, Value)>> =
        fixed_cases(def).into_iter().map(|(inputs, _)| inputs).collect();
    if let Some(example) = example_values {
        if !cases.contains(&example) {
            cases.insert(0, example);
        }
    }
    let mut rng = rand::thread_rng();
    for _ in 0..GENERATED_CASES {
        cases.push(generate_inputs(def, &mut rng));
    }

    for inputs in &cases {
        let wrong_observed = observed(wrong_solution.as_callable(), inputs, &wrong_spec);
        let submission_observed = observed(submission, inputs, &submission_spec);
        if wrong_observed != submission_observed {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Cleaned observable of a call; errors render as their display line so
/// identically-failing behaviors still compare equal.
fn observed(callable: Callable, inputs: &[(String, Value)], spec: &CallSpec) -> String {
    match invoke(callable, inputs, spec) {
        Ok(value) => crate::exercises::clean_result(&value),
        Err(err) => crate::exercises::clean_result(&Value::Str(err.to_string())),
    }
}

fn fixed_cases(def: &ExerciseDef) -> Vec<(Vec<(String, Value)>, Value)> {
    def.tests
        .iter()
        .map(|tc| {
            let inputs = tc
                .inputs
                .iter()
                .map(|(name, literal)| (name.clone(), literal.to_value()))
                .collect();
            (inputs, tc.expected.to_value())
        })
        .collect()
}

fn generate_inputs(def: &ExerciseDef, rng: &mut impl Rng) -> Vec<(String, Value)> {
    def.param_names
        .iter()
        .zip(&def.param_types)
        .map(|(name, ty)| (name.clone(), generate_for_type(rng, ty)))
        .collect()
}

fn solution_spec(def: &ExerciseDef) -> CallSpec<'_> {
    let mut spec = CallSpec::new(&def.solution_source);
    spec.capture_stdout = def.captures_stdout;
    spec.stdin_input = &def.stdin_input;
    spec
}

fn submission_spec<'a>(def: &'a ExerciseDef, ctx: &'a StepContext) -> CallSpec<'a> {
    CallSpec {
        source: ctx.input,
        capture_stdout: def.captures_stdout,
        stdin_input: &def.stdin_input,
        base_globals: Some(ctx.namespace),
        limits: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::exercises::{CaptureIo, CODE_SHOULD_START_LIKE};
    use crate::lang::{parse_program, ExecLimits, Interp, Namespace};
    use crate::lint::DefaultLinter;
    use crate::steps::StepDef;

    fn step(page: &str, name: &str) -> &'static StepDef {
        catalog::init_default().unwrap();
        catalog::get_step(page, name).unwrap()
    }

    /// Execute a program and return the resulting session namespace,
    /// the way the worker does before grading. Runtime errors are fine;
    /// the worker would have reported them as a traceback and graded
    /// anyway.
    fn run_program(source: &str) -> Namespace {
        let mut io = CaptureIo::new(&[]);
        let program = parse_program(source).unwrap();
        let mut interp = Interp::new(source, &mut io, ExecLimits::default());
        let _ = interp.run(&program, false);
        std::mem::take(&mut interp.globals)
    }

    fn grade(page: &str, name: &str, input: &str) -> crate::steps::StepResult {
        let namespace = run_program(input);
        let ctx = StepContext {
            input,
            output: "",
            source: SourceTag::Editor,
            namespace: &namespace,
        };
        step(page, name)
            .check_with_messages(&ctx, &DefaultLinter)
            .unwrap()
    }

    #[test]
    fn test_correct_sum_submission_passes() {
        let result = grade(
            "for_loops",
            "sum_of_items",
            "items = [1, 2, 3]\ntotal = 0\nfor x in items:\n    total += x\nprint(total)",
        );
        assert!(result.passed, "messages: {:?}", result.messages);
        // Example case + 3 fixed cases + 10 generated (the example
        // duplicates a fixed case here, so it is not re-added).
        assert_eq!(result.passed_tests.len(), 13);
    }

    #[test]
    fn test_missing_leading_assignment_is_malformed() {
        let result = grade("for_loops", "sum_of_items", "total = 0\nprint(total)");
        assert!(!result.passed);
        assert!(result.messages[0].contains(CODE_SHOULD_START_LIKE));
        assert!(result.messages[0].contains("items = ..."));
    }

    #[test]
    fn test_wrong_output_gets_comparison_block() {
        let result = grade(
            "for_loops",
            "sum_of_items",
            "items = [1, 2, 3]\ntotal = 0\nfor x in items:\n    total += x\nprint(total + 1)",
        );
        assert!(!result.passed);
        let message = &result.messages[0];
        assert!(message.contains("your code outputs"));
        assert!(message.contains("when it should output"));
    }

    #[test]
    fn test_print_inside_loop_matches_message_step() {
        let result = grade(
            "for_loops",
            "sum_of_items",
            "items = [1, 2, 3]\ntotal = 0\nfor x in items:\n    total += x\n    print(total)",
        );
        assert!(!result.passed);
        assert!(result.messages[0].contains("inside the loop"));
    }

    #[test]
    fn test_last_index_submission_gets_message_step_hint() {
        let input = "def find_index(items, target):\n    result = None\n    for i in range(len(items)):\n        if items[i] == target:\n            result = i\n    return result";
        let result = grade("for_loops", "first_index", input);
        assert!(!result.passed);
        assert!(result.messages[0].contains("last"));
    }

    #[test]
    fn test_correct_first_index_passes() {
        let input = "def find_index(items, target):\n    for i in range(len(items)):\n        if items[i] == target:\n            return i\n    return None";
        let result = grade("for_loops", "first_index", input);
        assert!(result.passed, "messages: {:?}", result.messages);
    }

    #[test]
    fn test_missing_function_definition() {
        let result = grade("for_loops", "first_index", "x = 1");
        assert!(!result.passed);
        assert!(result.messages[0].contains("must define a function"));
        assert!(result.messages[0].contains("find_index"));
    }

    #[test]
    fn test_wrong_signature() {
        let input = "def find_index(items):\n    return 0";
        let result = grade("for_loops", "first_index", input);
        assert!(!result.passed);
        assert!(result.messages[0].contains("signature should be"));
        assert!(result.messages[0].contains("items, target"));
    }

    #[test]
    fn test_name_bound_to_non_function() {
        let result = grade("for_loops", "first_index", "find_index = 3");
        assert!(!result.passed);
        assert!(result.messages[0].contains("is not a function"));
    }

    #[test]
    fn test_working_but_disallowed_concatenation() {
        // Functionally correct, but builds the result with `+` instead
        // of the join method.
        let input = "words = ['a', 'b']\nresult = ''\nfirst = True\nfor w in words:\n    if first:\n        result = w\n        first = False\n    else:\n        result = result + ', ' + w\nprint(result)";
        let result = grade("strings", "join_with_commas", input);
        assert!(!result.passed);
        assert!(result.messages[0].contains("you must not use `+`"));
    }

    #[test]
    fn test_join_solution_passes() {
        let input = "words = ['a', 'b']\nprint(', '.join(words))";
        let result = grade("strings", "join_with_commas", input);
        assert!(result.passed, "messages: {:?}", result.messages);
    }

    #[test]
    fn test_shell_input_never_passes_exercise() {
        let namespace = Namespace::new();
        let ctx = StepContext {
            input: "print(items)",
            output: "",
            source: SourceTag::Shell,
            namespace: &namespace,
        };
        let result = step("for_loops", "sum_of_items")
            .check_with_messages(&ctx, &DefaultLinter)
            .unwrap();
        assert!(!result.passed);
        assert!(result.messages.is_empty());
    }

    #[test]
    fn test_invalid_example_values_message() {
        let result = grade(
            "for_loops",
            "sum_of_items",
            "items = [1, 'two', 3]\ntotal = 0\nfor x in items:\n    total += x\nprint(total)",
        );
        assert!(!result.passed);
        assert!(result.messages[0].contains("invalid"));
    }

    #[test]
    fn test_stdin_exercise_passes() {
        let input = "name = input()\nage = input()\nprint('Hello ' + name)\nprint('You are ' + age)";
        // The program blocks on input when run live; grading itself uses
        // the scripted stdin, so an empty namespace suffices here.
        let namespace = Namespace::new();
        let ctx = StepContext {
            input,
            output: "",
            source: SourceTag::Editor,
            namespace: &namespace,
        };
        let result = step("user_input", "greet_age")
            .check_with_messages(&ctx, &DefaultLinter)
            .unwrap();
        assert!(result.passed, "messages: {:?}", result.messages);
    }

    #[test]
    fn test_failure_feedback_includes_lint_section() {
        let result = grade(
            "for_loops",
            "sum_of_items",
            "items = [1, 2, 3]\ntotal = 0\nunused = 99\nfor x in items:\n    total += x\nprint(total - 1)",
        );
        assert!(!result.passed);
        assert!(result.lint.iter().any(|m| m.contains("unused")));
    }
}
