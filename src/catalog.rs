//! Course catalog: pages and their steps, loaded once from TOML.
//!
//! The catalog is produced by the (external) authoring layer; this module
//! treats it as an opaque contract and validates it at load time: every
//! reference solution must pass its own fixed test cases, and every
//! post-success wrong solution must too.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::exercises::ParamType;
use crate::lang::ast::{contains_return, find_function};
use crate::lang::{parse_program, Literal, Stmt};
use crate::steps::disallowed::NodePattern;
use crate::steps::{
    exercise, Disallowed, ExerciseDef, MessageCheck, MessageStep, StepDef, StepKind, TestCase,
    VerbatimDef, WrongSolution,
};
use crate::worker::protocol::SourceTag;

/// Built-in course shipped with the engine.
const DEFAULT_COURSE: &str = include_str!("../files/course.toml");

#[derive(Debug)]
pub struct Catalog {
    pages: HashMap<String, Page>,
    slugs: Vec<String>,
}

#[derive(Debug)]
pub struct Page {
    pub slug: String,
    pub title: String,
    pub steps: Vec<StepDef>,
}

impl Page {
    pub fn get_step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|step| step.name == name)
    }
}

static CATALOG: OnceLock<Catalog> = OnceLock::new();

/// Initialize from the `COURSE_CONFIG` path if set, otherwise from the
/// embedded default course.
pub fn init_from_env() -> Result<()> {
    match std::env::var("COURSE_CONFIG") {
        Ok(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read course config {}", path))?;
            init_catalog(&content)
        }
        Err(_) => init_catalog(DEFAULT_COURSE),
    }
}

/// Initialize from the embedded course; fine to call more than once
/// (used by tests sharing one process).
pub fn init_default() -> Result<()> {
    if CATALOG.get().is_some() {
        return Ok(());
    }
    let catalog = build_catalog(DEFAULT_COURSE)?;
    let _ = CATALOG.set(catalog);
    Ok(())
}

pub fn init_catalog(content: &str) -> Result<()> {
    let catalog = build_catalog(content)?;
    CATALOG
        .set(catalog)
        .map_err(|_| anyhow::anyhow!("course catalog already initialized"))?;
    Ok(())
}

pub fn get_step(page_slug: &str, step_name: &str) -> Option<&'static StepDef> {
    CATALOG.get()?.pages.get(page_slug)?.get_step(step_name)
}

pub fn page_slugs() -> Vec<String> {
    CATALOG
        .get()
        .map(|catalog| catalog.slugs.clone())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RawCourse {
    #[serde(default)]
    pages: Vec<RawPage>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    slug: String,
    title: String,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    kind: String,
    /// Verbatim steps: the program to reproduce.
    program: Option<String>,
    /// Exercise steps: the reference solution.
    solution: Option<String>,
    /// Ordered `[name, type]` pairs.
    #[serde(default)]
    params: Vec<(String, String)>,
    #[serde(default)]
    tests: Vec<RawTest>,
    #[serde(default)]
    stdin_input: Vec<String>,
    #[serde(default)]
    hints: Vec<String>,
    expected_source: Option<String>,
    #[serde(default)]
    disallowed: Vec<RawDisallowed>,
    #[serde(default)]
    message_steps: Vec<RawMessageStep>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    inputs: toml::value::Table,
    expected: toml::Value,
}

#[derive(Debug, Deserialize)]
struct RawDisallowed {
    pattern: String,
    #[serde(default)]
    max_count: u32,
    label: Option<String>,
    message: Option<String>,
    #[serde(default)]
    function_only: bool,
}

#[derive(Debug, Deserialize)]
struct RawMessageStep {
    text: String,
    #[serde(default)]
    after_success: bool,
    /// Behavior match against this wrong solution.
    solution: Option<String>,
    /// Or an exact program match.
    program: Option<String>,
}

fn build_catalog(content: &str) -> Result<Catalog> {
    let raw: RawCourse = toml::from_str(content).context("invalid course TOML")?;
    let mut pages = HashMap::new();
    let mut slugs = Vec::new();
    for raw_page in raw.pages {
        let mut steps = Vec::new();
        for raw_step in &raw_page.steps {
            let step = build_step(raw_step).with_context(|| {
                format!("invalid step {}/{}", raw_page.slug, raw_step.name)
            })?;
            steps.push(step);
        }
        let page = Page {
            slug: raw_page.slug,
            title: raw_page.title,
            steps,
        };
        debug!(
            "Loaded page {} ({}) with {} steps",
            page.slug,
            page.title,
            page.steps.len()
        );
        slugs.push(page.slug.clone());
        pages.insert(page.slug.clone(), page);
    }
    Ok(Catalog { pages, slugs })
}

fn build_step(raw: &RawStep) -> Result<StepDef> {
    let kind = match raw.kind.as_str() {
        "exercise" => StepKind::Exercise(build_exercise(raw)?),
        "verbatim" => {
            let source = raw
                .program
                .as_ref()
                .context("verbatim step needs a program")?;
            let program = parse_program(source)
                .map_err(|err| anyhow::anyhow!("program does not parse: {}", err))?;
            StepKind::Verbatim(VerbatimDef {
                program_source: source.clone(),
                program,
            })
        }
        "final" => StepKind::Final,
        other => bail!("unknown step kind: {}", other),
    };

    let expected_source = raw
        .expected_source
        .as_deref()
        .map(parse_source_tag)
        .transpose()?;

    let disallowed = raw
        .disallowed
        .iter()
        .map(build_disallowed)
        .collect::<Result<Vec<_>>>()?;

    let message_steps = raw
        .message_steps
        .iter()
        .map(build_message_step)
        .collect::<Result<Vec<_>>>()?;

    let step = StepDef {
        name: raw.name.clone(),
        kind,
        hints: raw.hints.clone(),
        expected_source,
        disallowed,
        message_steps,
    };
    validate_step(&step)?;
    Ok(step)
}

fn build_exercise(raw: &RawStep) -> Result<ExerciseDef> {
    let solution_source = raw
        .solution
        .as_ref()
        .context("exercise step needs a solution")?
        .clone();
    let solution_program = parse_program(&solution_source)
        .map_err(|err| anyhow::anyhow!("solution does not parse: {}", err))?;

    let mut param_names = Vec::new();
    let mut param_types = Vec::new();
    for (name, spec) in &raw.params {
        param_names.push(name.clone());
        param_types.push(ParamType::parse(spec)?);
    }

    // A solution that is exactly one function definition makes this a
    // function exercise: the learner must define that function.
    let function_name = match solution_program.body.as_slice() {
        [Stmt::FuncDef(def)] => Some(def.name.clone()),
        _ => None,
    };
    if let Some(name) = &function_name {
        let func = find_function(&solution_program.body, name)
            .context("function exercise solution is missing its function")?;
        if func.params != param_names {
            bail!(
                "declared params {:?} do not match solution signature {:?}",
                param_names,
                func.params
            );
        }
    }

    let captures_stdout = match &function_name {
        Some(name) => {
            let func = find_function(&solution_program.body, name)
                .context("function exercise solution is missing its function")?;
            !contains_return(&func.body)
        }
        None => true,
    };

    let tests = raw
        .tests
        .iter()
        .map(|raw_test| build_test_case(raw_test, &param_names))
        .collect::<Result<Vec<_>>>()?;

    Ok(ExerciseDef {
        param_names,
        param_types,
        solution_source,
        solution_program,
        function_name,
        captures_stdout,
        tests,
        stdin_input: raw.stdin_input.clone(),
    })
}

fn build_test_case(raw: &RawTest, param_names: &[String]) -> Result<TestCase> {
    let mut inputs = Vec::with_capacity(param_names.len());
    for name in param_names {
        let value = raw
            .inputs
            .get(name)
            .with_context(|| format!("test case is missing input `{}`", name))?;
        inputs.push((name.clone(), literal_from_toml(value)?));
    }
    for key in raw.inputs.keys() {
        if !param_names.iter().any(|name| name == key) {
            bail!("test case has unknown input `{}`", key);
        }
    }
    Ok(TestCase {
        inputs,
        expected: literal_from_toml(&raw.expected)?,
    })
}

fn build_disallowed(raw: &RawDisallowed) -> Result<Disallowed> {
    let pattern = NodePattern::parse(&raw.pattern)?;
    let message = match (&raw.message, &raw.label) {
        (Some(message), _) => message.clone(),
        (None, Some(label)) => Disallowed::default_message(label, raw.max_count),
        (None, None) => bail!("disallowed rule needs a message or a label"),
    };
    Ok(Disallowed {
        pattern,
        max_count: raw.max_count,
        message,
        function_only: raw.function_only,
        predicate: None,
    })
}

fn build_message_step(raw: &RawMessageStep) -> Result<MessageStep> {
    let check = match (&raw.solution, &raw.program) {
        (Some(solution), None) => MessageCheck::WrongSolution(WrongSolution {
            source: solution.clone(),
            program: parse_program(solution)
                .map_err(|err| anyhow::anyhow!("wrong solution does not parse: {}", err))?,
        }),
        (None, Some(program)) => MessageCheck::ProgramMatch(
            parse_program(program)
                .map_err(|err| anyhow::anyhow!("message program does not parse: {}", err))?,
        ),
        _ => bail!("message step needs exactly one of solution or program"),
    };
    Ok(MessageStep {
        text: raw.text.clone(),
        after_success: raw.after_success,
        check,
    })
}

/// Load-time QA, mirroring what the authoring layer promises: reference
/// solutions are self-consistent and post-success wrong solutions really
/// do pass.
fn validate_step(step: &StepDef) -> Result<()> {
    if let StepKind::Exercise(def) = &step.kind {
        if def.tests.is_empty() {
            bail!("exercise step has no test cases");
        }
        exercise::self_check(def)?;
        for message_step in &step.message_steps {
            if let MessageCheck::WrongSolution(wrong) = &message_step.check {
                if message_step.after_success {
                    exercise::wrong_solution_self_check(def, wrong)?;
                }
            }
        }
    } else {
        for message_step in &step.message_steps {
            if matches!(message_step.check, MessageCheck::WrongSolution(_)) {
                bail!("wrong-solution message steps require an exercise step");
            }
        }
        if !step.disallowed.is_empty() {
            if let StepKind::Final = step.kind {
                bail!("final steps cannot have disallowed rules");
            }
        }
    }
    Ok(())
}

fn parse_source_tag(spec: &str) -> Result<SourceTag> {
    match spec {
        "shell" => Ok(SourceTag::Shell),
        "editor" => Ok(SourceTag::Editor),
        "statement_trace" => Ok(SourceTag::StatementTrace),
        "expression_trace" => Ok(SourceTag::ExpressionTrace),
        "visualizer" => Ok(SourceTag::Visualizer),
        other => bail!("unknown source tag: {}", other),
    }
}

fn literal_from_toml(value: &toml::Value) -> Result<Literal> {
    match value {
        toml::Value::String(s) => Ok(Literal::Str(s.clone())),
        toml::Value::Integer(n) => Ok(Literal::Int(*n)),
        toml::Value::Boolean(b) => Ok(Literal::Bool(*b)),
        toml::Value::Array(items) => Ok(Literal::List(
            items
                .iter()
                .map(literal_from_toml)
                .collect::<Result<Vec<_>>>()?,
        )),
        toml::Value::Table(table) => {
            let mut pairs = Vec::with_capacity(table.len());
            for (key, value) in table {
                pairs.push((Literal::Str(key.clone()), literal_from_toml(value)?));
            }
            Ok(Literal::Map(pairs))
        }
        other => bail!("unsupported value in test case: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_course_loads_and_self_checks() {
        // Exercised on every load: references pass their own tests.
        let catalog = build_catalog(DEFAULT_COURSE).unwrap();
        assert!(catalog.pages.contains_key("for_loops"));
        assert!(catalog.pages.contains_key("the_shell"));
        let page = &catalog.pages["for_loops"];
        assert!(page.get_step("sum_of_items").is_some());
    }

    #[test]
    fn test_lookup_after_init() {
        init_default().unwrap();
        assert!(get_step("for_loops", "sum_of_items").is_some());
        assert!(get_step("for_loops", "no_such_step").is_none());
        assert!(get_step("no_such_page", "x").is_none());
        assert!(!page_slugs().is_empty());
    }

    #[test]
    fn test_inconsistent_reference_solution_rejected() {
        let course = r#"
[[pages]]
slug = "p"
title = "P"

[[pages.steps]]
name = "bad"
kind = "exercise"
params = [["items", "list[int]"]]
solution = """
print(sum(items))
"""

[[pages.steps.tests]]
inputs = { items = [1, 2] }
expected = "999"
"#;
        let err = build_catalog(course).unwrap_err();
        assert!(format!("{:#}", err).contains("fails its own test"));
    }

    #[test]
    fn test_unknown_pattern_rejected() {
        let course = r#"
[[pages]]
slug = "p"
title = "P"

[[pages.steps]]
name = "s"
kind = "verbatim"
program = "print(1)"

[[pages.steps.disallowed]]
pattern = "lambda"
label = "`lambda`"
"#;
        assert!(build_catalog(course).is_err());
    }

    #[test]
    fn test_literal_from_toml_nested() {
        let value: toml::Value = toml::from_str("x = [[1, 2], [3]]")
            .map(|table: toml::value::Table| table["x"].clone())
            .unwrap();
        let literal = literal_from_toml(&value).unwrap();
        assert_eq!(literal.repr(), "[[1, 2], [3]]");
    }
}
