//! Exercise machinery: random test-input generation, submission
//! compilation and result comparison.
//!
//! This module turns a learner's raw source text into something callable,
//! runs callables against test inputs under capture, and canonicalizes
//! results for comparison and display. It does not know about steps,
//! message steps or catalogs; the `steps` module orchestrates those.

use std::rc::Rc;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::lang::ast::FuncDef;
use crate::lang::interp::{Io, OutStream, ReadError};
use crate::lang::{
    parse_program, ExecLimits, Interp, Namespace, RunError, Stmt, SyntaxError, Value,
};

pub const BLANK_RESULT: &str = "(no output)";
pub const CODE_SHOULD_START_LIKE: &str = "Your code should start like this:";
pub const GIVEN_VALUES_INTRO: &str = "Given these values:";
pub const YOUR_CODE_OUTPUTS: &str = "your code outputs:";
pub const YOUR_CODE_OUTPUTS_ALONE: &str = "Your code outputs:";
pub const WHEN_IT_SHOULD_OUTPUT: &str = "when it should output:";
pub const INVALID_EXAMPLE_VALUES: &str =
    "The values of your example variables are invalid, please use values similar to the original example.";
pub const NO_MORE_TEST_INPUTS: &str =
    "No more test inputs - the program should have finished by now";

/// Declared semantic type of an exercise parameter, used to synthesize
/// random test inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Text,
    Int,
    Bool,
    ListOf(Box<ParamType>),
    MapOf(Box<ParamType>, Box<ParamType>),
}

impl ParamType {
    /// Parse a type spec like `int`, `text`, `list[int]` or
    /// `map[text, int]`.
    pub fn parse(spec: &str) -> anyhow::Result<ParamType> {
        let spec = spec.trim();
        if let Some(inner) = strip_brackets(spec, "list") {
            return Ok(ParamType::ListOf(Box::new(ParamType::parse(inner)?)));
        }
        if let Some(inner) = strip_brackets(spec, "map") {
            let (key, value) = split_top_level(inner)
                .ok_or_else(|| anyhow::anyhow!("map type needs two parameters: {}", spec))?;
            return Ok(ParamType::MapOf(
                Box::new(ParamType::parse(key)?),
                Box::new(ParamType::parse(value)?),
            ));
        }
        match spec {
            "text" | "str" => Ok(ParamType::Text),
            "int" => Ok(ParamType::Int),
            "bool" => Ok(ParamType::Bool),
            other => anyhow::bail!("unknown parameter type: {}", other),
        }
    }
}

fn strip_brackets<'a>(spec: &'a str, name: &str) -> Option<&'a str> {
    spec.strip_prefix(name)?
        .trim_start()
        .strip_prefix('[')?
        .strip_suffix(']')
}

/// Split `a, b` on the first comma not nested in brackets.
fn split_top_level(spec: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in spec.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return Some((&spec[..i], &spec[i + 1..])),
            _ => {}
        }
    }
    None
}

/// Produce a random value of the given type.
pub fn generate_for_type(rng: &mut impl Rng, ty: &ParamType) -> Value {
    match ty {
        ParamType::Text => Value::Str(generate_string(rng)),
        ParamType::Int => Value::Int(rng.gen_range(0..100)),
        ParamType::Bool => Value::Bool(rng.gen_bool(0.5)),
        ParamType::ListOf(inner) => {
            let len = rng.gen_range(5..11);
            Value::list((0..len).map(|_| generate_for_type(rng, inner)).collect())
        }
        ParamType::MapOf(key_ty, value_ty) => {
            let len = rng.gen_range(3..7);
            let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(len);
            let mut attempts = 0;
            while pairs.len() < len && attempts < len * 20 {
                attempts += 1;
                let key = generate_for_type(rng, key_ty);
                if pairs.iter().any(|(k, _)| *k == key) {
                    continue;
                }
                let value = generate_for_type(rng, value_ty);
                pairs.push((key, value));
            }
            Value::map(pairs)
        }
    }
}

fn generate_string(rng: &mut impl Rng) -> String {
    const LETTERS: &[u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let len = rng.gen_range(5..11);
    LETTERS
        .choose_multiple(rng, len)
        .map(|b| *b as char)
        .collect()
}

/// Why a submission could not be compiled into a callable.
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    #[error("{0}")]
    Syntax(#[from] SyntaxError),
    /// The text does not open with the required parameter assignments.
    /// The message embeds the expected opening lines.
    #[error("{0}")]
    MalformedSubmission(String),
    /// The leading assignments themselves crash when evaluated.
    #[error("{0}")]
    InvalidExampleValues(String),
}

/// A learner submission split into its example-value assignments and a
/// re-runnable body.
#[derive(Debug, Clone)]
pub struct CompiledSubmission {
    pub source: String,
    pub param_names: Vec<String>,
    pub example_values: Vec<(String, Value)>,
    pub body: Vec<Stmt>,
}

/// Compile a submission: the first `param_names.len()` statements must be
/// assignments to exactly those names, in order. The remaining statements
/// become the callable body, re-executed on every invocation with
/// caller-supplied parameter bindings.
pub fn compile_submission(
    source: &str,
    param_names: &[String],
) -> Result<CompiledSubmission, SubmissionError> {
    let program = parse_program(source)?;

    let opening_ok = program.body.len() >= param_names.len()
        && program
            .body
            .iter()
            .zip(param_names)
            .all(|(stmt, name)| match stmt {
                Stmt::Assign {
                    target: crate::lang::ast::Target::Name(target),
                    ..
                } => target == name,
                _ => false,
            });
    if !opening_ok {
        let template: Vec<String> = param_names
            .iter()
            .map(|name| format!("    {} = ...", name))
            .collect();
        return Err(SubmissionError::MalformedSubmission(format!(
            "{}\n\n{}",
            CODE_SHOULD_START_LIKE,
            template.join("\n")
        )));
    }

    let assignments = &program.body[..param_names.len()];
    let mut io = CaptureIo::new(&[]);
    let mut interp = Interp::new(source, &mut io, ExecLimits::default());
    interp
        .run_stmts(assignments, false)
        .map_err(|_| SubmissionError::InvalidExampleValues(INVALID_EXAMPLE_VALUES.to_string()))?;

    let example_values = param_names
        .iter()
        .map(|name| {
            let value = interp
                .globals
                .get(name)
                .cloned()
                .unwrap_or(Value::None);
            (name.clone(), value)
        })
        .collect();

    Ok(CompiledSubmission {
        source: source.to_string(),
        param_names: param_names.to_vec(),
        example_values,
        body: program.body[param_names.len()..].to_vec(),
    })
}

/// Something the comparator can run against one input set.
#[derive(Clone, Copy)]
pub enum Callable<'a> {
    /// A compiled submission body; the observable is always its captured
    /// output.
    Body(&'a CompiledSubmission),
    /// A function definition (reference solution, wrong solution, or a
    /// learner-defined function).
    Function(&'a Rc<FuncDef>),
}

/// How to invoke a callable.
pub struct CallSpec<'a> {
    /// Source text the callable came from, for traceback rendering.
    pub source: &'a str,
    /// Capture printed output as the observable instead of the return
    /// value. Ignored for `Callable::Body`, which always captures.
    pub capture_stdout: bool,
    /// Scripted lines served to `input()`, echoed as `<input: ...>`.
    pub stdin_input: &'a [String],
    /// Globals visible to a `Callable::Function` (deep-copied per call).
    pub base_globals: Option<&'a Namespace>,
    pub limits: ExecLimits,
}

impl<'a> CallSpec<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            capture_stdout: true,
            stdin_input: &[],
            base_globals: None,
            limits: ExecLimits::default(),
        }
    }
}

/// Io that captures all output and serves scripted input lines.
pub struct CaptureIo {
    pub output: String,
    stdin: Vec<String>,
    cursor: usize,
}

impl CaptureIo {
    pub fn new(stdin_input: &[String]) -> Self {
        Self {
            output: String::new(),
            stdin: stdin_input.to_vec(),
            cursor: 0,
        }
    }
}

impl Io for CaptureIo {
    fn write(&mut self, stream: OutStream, text: &str) {
        if stream != OutStream::Input {
            self.output.push_str(text);
        }
    }

    fn read_line(&mut self) -> Result<String, ReadError> {
        if self.cursor < self.stdin.len() {
            let line = self.stdin[self.cursor].clone();
            self.cursor += 1;
            self.output.push_str(&format!("<input: {}>\n", line));
            Ok(line)
        } else {
            Err(ReadError::Exhausted(NO_MORE_TEST_INPUTS.to_string()))
        }
    }
}

/// Run a callable against one input set. Inputs are deep-copied before
/// use, so two invocations never observe each other's mutations.
pub fn invoke(
    callable: Callable,
    inputs: &[(String, Value)],
    spec: &CallSpec,
) -> Result<Value, RunError> {
    let mut io = CaptureIo::new(spec.stdin_input);
    match callable {
        Callable::Body(submission) => {
            let mut interp = Interp::new(&submission.source, &mut io, spec.limits.clone());
            for name in &submission.param_names {
                if let Some((_, value)) = inputs.iter().find(|(input, _)| input == name) {
                    interp.globals.insert(name.clone(), value.deep_copy());
                }
            }
            interp.run_stmts(&submission.body, false)?;
            Ok(Value::Str(io.output))
        }
        Callable::Function(def) => {
            let mut interp = Interp::new(spec.source, &mut io, spec.limits.clone());
            if let Some(base) = spec.base_globals {
                interp.globals = deep_copy_namespace(base);
            }
            // The function must be able to call itself.
            interp
                .globals
                .entry(def.name.clone())
                .or_insert_with(|| Value::Func(Rc::clone(def)));
            let mut args = Vec::with_capacity(def.params.len());
            for param in &def.params {
                let value = inputs
                    .iter()
                    .find(|(name, _)| name == param)
                    .map(|(_, value)| value.deep_copy())
                    .ok_or_else(|| {
                        RunError::new(
                            crate::lang::ErrorKind::Type,
                            format!("{}() missing argument: '{}'", def.name, param),
                            def.span,
                        )
                    })?;
                args.push(value);
            }
            let result = interp.call_function(def, args, def.span)?;
            if spec.capture_stdout {
                Ok(Value::Str(io.output))
            } else {
                Ok(result)
            }
        }
    }
}

pub fn deep_copy_namespace(ns: &Namespace) -> Namespace {
    ns.iter()
        .map(|(name, value)| (name.clone(), value.deep_copy()))
        .collect()
}

/// Canonical comparable/displayable form of a result: `repr` for
/// non-strings, per-line trailing whitespace trimmed, an explicit
/// placeholder for emptiness, indented four spaces.
pub fn clean_result(result: &Value) -> String {
    let text = match result {
        Value::Str(s) => s.clone(),
        other => other.repr(),
    };
    let trimmed: Vec<&str> = text.trim_end().lines().map(str::trim_end).collect();
    let joined = trimmed.join("\n");
    let body = if joined.is_empty() {
        BLANK_RESULT.to_string()
    } else {
        joined
    };
    indent(&body)
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("    {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn inputs_string(inputs: &[(String, Value)]) -> String {
    inputs
        .iter()
        .map(|(name, value)| format!("{} = {}", name, value.repr()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn indented_inputs_string(inputs: &[(String, Value)]) -> String {
    indent(&inputs_string(inputs))
}

/// Outcome of running a callable against one test case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub passed: bool,
    pub message: String,
}

/// Run and compare: a runtime error in the callable becomes its display
/// line as the observed result, so grading always continues.
pub fn check_result(
    callable: Callable,
    inputs: &[(String, Value)],
    expected: &Value,
    spec: &CallSpec,
) -> TestOutcome {
    let observed = match invoke(callable, inputs, spec) {
        Ok(value) => clean_result(&value),
        Err(err) => clean_result(&Value::Str(err.to_string())),
    };
    let expected = clean_result(expected);

    let intro = if inputs.is_empty() {
        YOUR_CODE_OUTPUTS_ALONE.to_string()
    } else {
        format!(
            "{}\n\n{}\n\n{}",
            GIVEN_VALUES_INTRO,
            indented_inputs_string(inputs),
            YOUR_CODE_OUTPUTS
        )
    };

    if observed != expected {
        TestOutcome {
            passed: false,
            message: format!(
                "{}\n\n{}\n\n{}\n\n{}",
                intro, observed, WHEN_IT_SHOULD_OUTPUT, expected
            ),
        }
    } else {
        TestOutcome {
            passed: true,
            message: format!("{}\n\n{}", intro, observed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_param_type_parse() {
        assert_eq!(ParamType::parse("int").unwrap(), ParamType::Int);
        assert_eq!(
            ParamType::parse("list[int]").unwrap(),
            ParamType::ListOf(Box::new(ParamType::Int))
        );
        assert_eq!(
            ParamType::parse("map[text, list[int]]").unwrap(),
            ParamType::MapOf(
                Box::new(ParamType::Text),
                Box::new(ParamType::ListOf(Box::new(ParamType::Int)))
            )
        );
        assert!(ParamType::parse("float").is_err());
    }

    #[test]
    fn test_generate_for_type_shapes() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            match generate_for_type(&mut rng, &ParamType::Int) {
                Value::Int(n) => assert!((0..100).contains(&n)),
                other => panic!("expected int, got {:?}", other),
            }
        }
        match generate_for_type(&mut rng, &ParamType::Text) {
            Value::Str(s) => assert!((5..11).contains(&s.chars().count())),
            other => panic!("expected str, got {:?}", other),
        }
        match generate_for_type(
            &mut rng,
            &ParamType::ListOf(Box::new(ParamType::Bool)),
        ) {
            Value::List(items) => {
                let items = items.borrow();
                assert!((5..11).contains(&items.len()));
                assert!(items.iter().all(|v| matches!(v, Value::Bool(_))));
            }
            other => panic!("expected list, got {:?}", other),
        }
        match generate_for_type(
            &mut rng,
            &ParamType::MapOf(Box::new(ParamType::Text), Box::new(ParamType::Int)),
        ) {
            Value::Map(items) => {
                let items = items.borrow();
                assert!((3..7).contains(&items.len()));
                // Keys are distinct.
                for (i, (k, _)) in items.iter().enumerate() {
                    assert!(!items[i + 1..].iter().any(|(other, _)| other == k));
                }
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_submission_splits_example_values() {
        let source = "items = [1, 2, 3]\ntotal = 0\nfor x in items:\n    total += x\nprint(total)";
        let compiled = compile_submission(source, &names(&["items"])).unwrap();
        assert_eq!(compiled.example_values.len(), 1);
        assert_eq!(compiled.example_values[0].0, "items");
        assert_eq!(compiled.example_values[0].1.repr(), "[1, 2, 3]");
        assert_eq!(compiled.body.len(), 3);
    }

    #[test]
    fn test_compile_submission_malformed() {
        let err = compile_submission("total = 0\nprint(total)", &names(&["items"])).unwrap_err();
        match err {
            SubmissionError::MalformedSubmission(message) => {
                assert!(message.contains(CODE_SHOULD_START_LIKE));
                assert!(message.contains("items = ..."));
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_submission_invalid_example_values() {
        let err = compile_submission("items = undefined_thing\nprint(items)", &names(&["items"]))
            .unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidExampleValues(_)));
    }

    #[test]
    fn test_invoke_body_captures_output() {
        let source = "items = [1, 2]\nprint(sum(items))";
        let compiled = compile_submission(source, &names(&["items"])).unwrap();
        let spec = CallSpec::new(source);
        let inputs = vec![("items".to_string(), Value::list(vec![Value::Int(4), Value::Int(5)]))];
        let result = invoke(Callable::Body(&compiled), &inputs, &spec).unwrap();
        assert_eq!(result, Value::str("9\n"));
    }

    #[test]
    fn test_invoke_is_idempotent() {
        let source = "items = [1]\nitems.append(10)\nprint(len(items))";
        let compiled = compile_submission(source, &names(&["items"])).unwrap();
        let spec = CallSpec::new(source);
        let inputs = vec![("items".to_string(), Value::list(vec![Value::Int(1)]))];
        // The body mutates its input; deep copies keep calls independent.
        let first = invoke(Callable::Body(&compiled), &inputs, &spec).unwrap();
        let second = invoke(Callable::Body(&compiled), &inputs, &spec).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Value::str("2\n"));
    }

    #[test]
    fn test_compiling_twice_is_idempotent() {
        let source = "items = [2, 3]\nprint(sum(items) * 2)";
        let inputs = vec![("items".to_string(), Value::list(vec![Value::Int(1), Value::Int(2)]))];
        let spec = CallSpec::new(source);
        let a = compile_submission(source, &names(&["items"])).unwrap();
        let b = compile_submission(source, &names(&["items"])).unwrap();
        assert_eq!(
            invoke(Callable::Body(&a), &inputs, &spec).unwrap(),
            invoke(Callable::Body(&b), &inputs, &spec).unwrap()
        );
    }

    #[test]
    fn test_clean_result() {
        assert_eq!(clean_result(&Value::str("a  \nb\n\n")), "    a\n    b");
        assert_eq!(clean_result(&Value::str("")), format!("    {}", BLANK_RESULT));
        assert_eq!(clean_result(&Value::Int(7)), "    7");
    }

    #[test]
    fn test_check_result_mismatch_message() {
        let source = "items = [1]\nprint(sum(items) + 1)";
        let compiled = compile_submission(source, &names(&["items"])).unwrap();
        let spec = CallSpec::new(source);
        let inputs = vec![("items".to_string(), Value::list(vec![Value::Int(1), Value::Int(2)]))];
        let outcome = check_result(
            Callable::Body(&compiled),
            &inputs,
            &Value::str("3"),
            &spec,
        );
        assert!(!outcome.passed);
        assert!(outcome.message.contains(GIVEN_VALUES_INTRO));
        assert!(outcome.message.contains("items = [1, 2]"));
        assert!(outcome.message.contains("    4"));
        assert!(outcome.message.contains(WHEN_IT_SHOULD_OUTPUT));
        assert!(outcome.message.contains("    3"));
    }

    #[test]
    fn test_check_result_error_becomes_output() {
        let source = "items = [1]\nprint(items[10])";
        let compiled = compile_submission(source, &names(&["items"])).unwrap();
        let spec = CallSpec::new(source);
        let inputs = vec![("items".to_string(), Value::list(vec![Value::Int(1)]))];
        let outcome = check_result(
            Callable::Body(&compiled),
            &inputs,
            &Value::str("1"),
            &spec,
        );
        assert!(!outcome.passed);
        assert!(outcome.message.contains("IndexError"));
    }

    #[test]
    fn test_scripted_stdin_is_echoed_and_bounded() {
        let source = "name = input()\nprint('Hi ' + name)";
        let program_inputs: Vec<String> = vec!["Ada".to_string()];
        let compiled = compile_submission(source, &[]).unwrap();
        let mut spec = CallSpec::new(source);
        spec.stdin_input = &program_inputs;
        let result = invoke(Callable::Body(&compiled), &[], &spec).unwrap();
        assert_eq!(result, Value::str("<input: Ada>\nHi Ada\n"));

        // A second read with no script left fails the run, not the engine.
        let source2 = "a = input()\nb = input()\nprint(a + b)";
        let compiled2 = compile_submission(source2, &[]).unwrap();
        let mut spec2 = CallSpec::new(source2);
        spec2.stdin_input = &program_inputs;
        let err = invoke(Callable::Body(&compiled2), &[], &spec2).unwrap_err();
        assert!(err.to_string().contains(NO_MORE_TEST_INPUTS));
    }
}
