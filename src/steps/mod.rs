//! Step model and grading orchestration.
//!
//! A step is one gradable checkpoint of a lesson, modeled as a closed set
//! of tagged variants: exercise steps (behavior must match a reference
//! solution), verbatim steps (the expected program must be reproduced)
//! and final-text steps (never graded). Each step carries an ordered list
//! of message steps (anticipated wrong submissions with tailored
//! feedback), disallowed-construct rules and an optional required input
//! source.
//!
//! The steps module does NOT:
//! - Execute anything interactively (the worker already ran the code)
//! - Load catalogs from disk (that's `catalog`)

pub mod disallowed;
pub mod exercise;
pub mod verbatim;

use crate::exercises::ParamType;
use crate::lang::{Literal, Namespace, Program};
use crate::lint::Linter;
use crate::worker::protocol::SourceTag;

pub use disallowed::Disallowed;

pub const MUST_DEFINE_FUNCTION: &str = "You must define a function named";
pub const NOT_A_FUNCTION: &str = "is not a function.";
pub const INCORRECT_MODE: &str = "You ran the code in the wrong way.";
pub const CASE_SENSITIVE: &str =
    "Code is case sensitive! Check your capitalization carefully.";
pub const STRING_SPACES_DIFFER: &str =
    "Your code is almost correct, but the strings have different spaces. Check the spaces inside your strings carefully.";

/// A single gradable checkpoint.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub name: String,
    pub kind: StepKind,
    pub hints: Vec<String>,
    pub expected_source: Option<SourceTag>,
    pub disallowed: Vec<Disallowed>,
    /// Ordered; declaration order is the matching priority order.
    pub message_steps: Vec<MessageStep>,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Exercise(ExerciseDef),
    Verbatim(VerbatimDef),
    /// Closing text of a page; submissions against it never pass.
    Final,
}

#[derive(Debug, Clone)]
pub struct ExerciseDef {
    pub param_names: Vec<String>,
    pub param_types: Vec<ParamType>,
    pub solution_source: String,
    pub solution_program: Program,
    /// For function exercises, the function the learner must define.
    pub function_name: Option<String>,
    /// Whether the observable is captured output (no `return` in the
    /// reference solution) or the return value.
    pub captures_stdout: bool,
    pub tests: Vec<TestCase>,
    /// Scripted lines served to `input()` during grading runs.
    pub stdin_input: Vec<String>,
}

/// One fixed test vector. Inputs and expected result are stored in plain
/// literal form; every use converts them to fresh runtime values, which
/// is what makes reuse-by-reference impossible.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub inputs: Vec<(String, Literal)>,
    pub expected: Literal,
}

#[derive(Debug, Clone)]
pub struct VerbatimDef {
    pub program_source: String,
    pub program: Program,
}

/// An anticipated submission with tailored feedback. Pre-success message
/// steps replace a generic failure; post-success ones catch
/// technically-correct-but-disallowed or suboptimal answers.
#[derive(Debug, Clone)]
pub struct MessageStep {
    pub text: String,
    pub after_success: bool,
    pub check: MessageCheck,
}

#[derive(Debug, Clone)]
pub enum MessageCheck {
    /// The message step's own canonical wrong solution; it matches when
    /// the submission's behavior agrees with it across the test cases.
    WrongSolution(WrongSolution),
    /// Matches when the submission's syntax tree equals this program.
    ProgramMatch(Program),
}

#[derive(Debug, Clone)]
pub struct WrongSolution {
    pub source: String,
    pub program: Program,
}

/// Everything a check needs about one grading attempt.
pub struct StepContext<'a> {
    /// The learner's submitted text.
    pub input: &'a str,
    /// Output captured while the worker ran the submission.
    pub output: &'a str,
    pub source: SourceTag,
    /// The live interpreter session namespace after the run.
    pub namespace: &'a Namespace,
}

/// Raw outcome of a step's own check, before message steps and
/// disallowed rules are applied.
#[derive(Debug, Clone, Default)]
pub struct CheckOutcome {
    pub passed: bool,
    pub message: Option<String>,
    pub passed_tests: Vec<String>,
}

impl CheckOutcome {
    pub fn fail_silent() -> Self {
        Self::default()
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            passed_tests: Vec::new(),
        }
    }

    pub fn pass(passed_tests: Vec<String>) -> Self {
        Self {
            passed: true,
            message: None,
            passed_tests,
        }
    }
}

/// Final grading result for one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub passed: bool,
    pub messages: Vec<String>,
    pub passed_tests: Vec<String>,
    pub lint: Vec<String>,
}

impl StepDef {
    /// The step's own functional check, without message-step or
    /// disallowed-rule handling.
    pub fn clean_check(&self, ctx: &StepContext) -> anyhow::Result<CheckOutcome> {
        match &self.kind {
            StepKind::Exercise(def) => exercise::check_exercise(def, ctx),
            StepKind::Verbatim(def) => Ok(verbatim::check_verbatim(def, ctx)),
            StepKind::Final => Ok(CheckOutcome::fail_silent()),
        }
    }

    /// Full grading pipeline: functional check, then message steps
    /// (matched against the preliminary outcome via their
    /// `after_success` flag, first match wins), then disallowed rules
    /// and the expected-source constraint, then lint messages on
    /// failure. Lint never changes pass/fail.
    pub fn check_with_messages(
        &self,
        ctx: &StepContext,
        linter: &dyn Linter,
    ) -> anyhow::Result<StepResult> {
        let outcome = self.clean_check(ctx)?;

        for message_step in &self.message_steps {
            if outcome.passed == message_step.after_success
                && message_step.matches(self, ctx)?
            {
                return Ok(StepResult {
                    passed: false,
                    messages: vec![message_step.text.clone()],
                    passed_tests: outcome.passed_tests,
                    lint: Vec::new(),
                });
            }
        }

        if outcome.passed {
            for rule in &self.disallowed {
                if rule.count(self, ctx) > rule.max_count as usize {
                    return Ok(StepResult {
                        passed: false,
                        messages: vec![rule.message.clone()],
                        passed_tests: outcome.passed_tests,
                        lint: Vec::new(),
                    });
                }
            }

            if let Some(expected) = self.expected_source {
                if expected != ctx.source {
                    return Ok(StepResult {
                        passed: false,
                        messages: vec![format!(
                            "{} {}",
                            INCORRECT_MODE,
                            expected_source_term(expected)
                        )],
                        passed_tests: outcome.passed_tests,
                        lint: Vec::new(),
                    });
                }
            }

            return Ok(StepResult {
                passed: true,
                messages: Vec::new(),
                passed_tests: outcome.passed_tests,
                lint: Vec::new(),
            });
        }

        let mut messages = Vec::new();
        if let Some(message) = outcome.message {
            messages.push(message);
        }
        let lint = if ctx.source != SourceTag::Shell {
            match crate::lang::parse_program(ctx.input) {
                Ok(program) => linter.lint(&program),
                Err(_) => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(StepResult {
            passed: false,
            messages,
            passed_tests: outcome.passed_tests,
            lint,
        })
    }
}

impl MessageStep {
    fn matches(&self, step: &StepDef, ctx: &StepContext) -> anyhow::Result<bool> {
        match &self.check {
            MessageCheck::ProgramMatch(program) => {
                Ok(verbatim::program_matches(ctx.input, program))
            }
            MessageCheck::WrongSolution(wrong) => match &step.kind {
                StepKind::Exercise(def) => exercise::submission_matches_wrong(def, wrong, ctx),
                _ => Ok(false),
            },
        }
    }
}

fn expected_source_term(source: SourceTag) -> &'static str {
    match source {
        SourceTag::Shell => "Type your code directly in the shell after `>>>` and press Enter.",
        SourceTag::Editor => "Write your code in the editor and click Run.",
        SourceTag::StatementTrace => "Run your code with the statement debugger.",
        SourceTag::ExpressionTrace => "Run your code with the expression inspector.",
        SourceTag::Visualizer => "Run your code with the visualizer.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::lint::DefaultLinter;

    fn check(page: &str, name: &str, input: &str, source: SourceTag) -> StepResult {
        catalog::init_default().unwrap();
        let namespace = Namespace::new();
        let ctx = StepContext {
            input,
            output: "",
            source,
            namespace: &namespace,
        };
        catalog::get_step(page, name)
            .unwrap()
            .check_with_messages(&ctx, &DefaultLinter)
            .unwrap()
    }

    #[test]
    fn test_verbatim_step_in_required_source_passes() {
        let result = check("the_shell", "addition", "1 + 2", SourceTag::Shell);
        assert!(result.passed);
    }

    #[test]
    fn test_wrong_source_gets_incorrect_mode_message() {
        let result = check("the_shell", "addition", "1 + 2", SourceTag::Editor);
        assert!(!result.passed);
        assert!(result.messages[0].contains(INCORRECT_MODE));
        assert!(result.messages[0].contains("shell"));
    }

    #[test]
    fn test_final_step_never_passes() {
        catalog::init_default().unwrap();
        let namespace = Namespace::new();
        let ctx = StepContext {
            input: "anything",
            output: "",
            source: SourceTag::Editor,
            namespace: &namespace,
        };
        let result = catalog::get_step("the_shell", "final_text")
            .unwrap()
            .check_with_messages(&ctx, &DefaultLinter)
            .unwrap();
        assert!(!result.passed);
        assert!(result.messages.is_empty());
        assert!(result.lint.is_empty());
    }

    #[test]
    fn test_steps_carry_hints() {
        catalog::init_default().unwrap();
        let step = catalog::get_step("for_loops", "sum_of_items").unwrap();
        assert!(!step.hints.is_empty());
    }
}
