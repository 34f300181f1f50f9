//! Worker role: a synchronous child process that owns one interpreter
//! session and executes tasks for a single learner.
//!
//! The worker reads newline-delimited JSON requests from stdin and emits
//! events on stdout (see `protocol`). A blocked `input()` call emits an
//! `input_request` event and then blocks only on the next stdin line, so
//! interactive programs never deadlock and a cancel sentinel can unwind
//! them. Learner errors of every kind become events; the process itself
//! survives and stays reusable for the next task.

pub mod protocol;

use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use tracing::warn;

use crate::catalog;
use crate::friendly;
use crate::lang::interp::{Io, OutStream, ReadError};
use crate::lang::trace::{ExpressionTracer, StatementTracer};
use crate::lang::{parse_program, ErrorKind, ExecLimits, Interp, Namespace};
use crate::lint::DefaultLinter;
use crate::steps::StepContext;
use protocol::{StreamTag, TaskOutcome, TaskSpec, TracebackPayload, WorkerEvent, WorkerRequest};

/// Resource limits applied to a worker process before it accepts tasks.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// CPU seconds for the whole process (rlimit).
    pub cpu_limit_secs: u64,
    /// Address-space cap in MB (rlimit).
    pub memory_limit_mb: u64,
    /// Interpreter limits per task.
    pub limits: ExecLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cpu_limit_secs: 60,
            memory_limit_mb: 512,
            limits: ExecLimits::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_u64("WORKER_CPU_LIMIT_SECS") {
            config.cpu_limit_secs = value;
        }
        if let Some(value) = env_u64("WORKER_MEMORY_LIMIT_MB") {
            config.memory_limit_mb = value;
        }
        if let Some(value) = env_u64("WORKER_FUEL") {
            config.limits.fuel = value;
        }
        if let Some(value) = env_u64("WORKER_MAX_RECURSION") {
            config.limits.max_depth = value as usize;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

/// Entry point for the `--worker` role.
pub fn worker_main() -> Result<()> {
    // Protocol events own stdout; diagnostics go to stderr where the
    // session manager logs them.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = WorkerConfig::from_env();
    apply_resource_limits(&config);
    catalog::init_from_env()?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    worker_loop(stdin.lock(), stdout.lock(), &config)
}

/// Bound runaway learner code at the OS level. Failures are logged, not
/// fatal: the interpreter's own fuel and recursion limits still apply.
fn apply_resource_limits(config: &WorkerConfig) {
    use nix::sys::resource::{setrlimit, Resource};

    let cpu = config.cpu_limit_secs;
    if let Err(err) = setrlimit(Resource::RLIMIT_CPU, cpu, cpu) {
        warn!("Failed to set CPU limit: {}", err);
    }
    let memory_bytes = config.memory_limit_mb * 1024 * 1024;
    if let Err(err) = setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes) {
        warn!("Failed to set memory limit: {}", err);
    }
}

/// The worker's request loop. Generic over reader/writer so tests can
/// drive it with in-memory buffers.
pub fn worker_loop<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    config: &WorkerConfig,
) -> Result<()> {
    let mut globals = Namespace::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            // Parent closed the request channel; shut down quietly.
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<WorkerRequest>(line.trim()) {
            Ok(request) => request,
            Err(err) => {
                emit(
                    &mut writer,
                    &WorkerEvent::InternalError {
                        details: format!("bad request: {}", err),
                    },
                );
                continue;
            }
        };
        match request {
            WorkerRequest::Task(task) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    run_task(&task, &mut globals, &mut reader, &mut writer, config)
                }));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!("Task failed internally: {:#}", err);
                        emit(
                            &mut writer,
                            &WorkerEvent::InternalError {
                                details: format!("{:#}", err),
                            },
                        );
                    }
                    Err(_) => {
                        emit(
                            &mut writer,
                            &WorkerEvent::InternalError {
                                details: "worker panicked while running a task".to_string(),
                            },
                        );
                    }
                }
            }
            WorkerRequest::Input { .. } | WorkerRequest::Cancel => {
                warn!("Ignoring {:?} outside of a task", request);
            }
        }
    }
}

/// Io implementation that streams output as events and services `input()`
/// through the request channel.
struct WorkerIo<'a, R: BufRead, W: Write> {
    reader: &'a mut R,
    writer: &'a mut W,
    /// Output accumulated for grading; input echoes excluded.
    output: String,
}

impl<'a, R: BufRead, W: Write> WorkerIo<'a, R, W> {
    fn new(reader: &'a mut R, writer: &'a mut W) -> Self {
        Self {
            reader,
            writer,
            output: String::new(),
        }
    }

    fn emit(&mut self, event: &WorkerEvent) {
        emit(self.writer, event);
    }

    fn emit_output(&mut self, stream: StreamTag, text: &str, traceback: Option<TracebackPayload>) {
        if stream != StreamTag::Input {
            self.output.push_str(text);
        }
        self.emit(&WorkerEvent::Output {
            stream,
            text: text.to_string(),
            traceback,
        });
    }
}

impl<R: BufRead, W: Write> Io for WorkerIo<'_, R, W> {
    fn write(&mut self, stream: OutStream, text: &str) {
        if text.is_empty() {
            return;
        }
        let tag = match stream {
            OutStream::Stdout => StreamTag::Stdout,
            OutStream::Input => StreamTag::Input,
        };
        self.emit_output(tag, text, None);
    }

    fn read_line(&mut self) -> Result<String, ReadError> {
        self.emit(&WorkerEvent::InputRequest);
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) | Err(_) => return Err(ReadError::Interrupted),
                Ok(_) => {}
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerRequest>(line.trim()) {
                Ok(WorkerRequest::Input { text }) => {
                    self.emit_output(StreamTag::Input, &format!("{}\n", text), None);
                    return Ok(text);
                }
                // Anything else while blocked means the run is over.
                Ok(_) => return Err(ReadError::Interrupted),
                Err(err) => {
                    warn!("Bad request while awaiting input: {}", err);
                    return Err(ReadError::Interrupted);
                }
            }
        }
    }
}

fn run_task<R: BufRead, W: Write>(
    task: &TaskSpec,
    globals: &mut Namespace,
    reader: &mut R,
    writer: &mut W,
    config: &WorkerConfig,
) -> Result<()> {
    if task.source.is_program() {
        globals.clear();
    }

    let mut io = WorkerIo::new(reader, writer);
    let mut interrupted = false;

    let mut stmt_tracer = match task.source {
        protocol::SourceTag::StatementTrace => Some(StatementTracer::new()),
        _ => None,
    };
    let mut expr_tracer = match task.source {
        protocol::SourceTag::ExpressionTrace => Some(ExpressionTracer::new(&task.code)),
        _ => None,
    };

    match parse_program(&task.code) {
        Err(err) => {
            let text = friendly::format_syntax_error(&task.code, &err);
            io.emit_output(StreamTag::Traceback, &text, None);
        }
        Ok(program) => {
            let mut interp = Interp::new(&task.code, &mut io, config.limits.clone());
            interp.globals = std::mem::take(globals);
            if let Some(tracer) = stmt_tracer.as_mut() {
                interp.set_tracer(tracer);
            } else if let Some(tracer) = expr_tracer.as_mut() {
                interp.set_tracer(tracer);
            }
            let echo = task.source == protocol::SourceTag::Shell;
            let run_result = interp.run(&program, echo);
            *globals = std::mem::take(&mut interp.globals);
            drop(interp);

            match run_result {
                Ok(()) => {}
                Err(err) if err.kind == ErrorKind::Interrupted => {
                    interrupted = true;
                }
                Err(err) => {
                    let mut text = err.traceback_text();
                    let known: Vec<String> = globals.keys().cloned().collect();
                    if let Some(hint) = friendly::explain_error(&err, &known) {
                        text.push('\n');
                        text.push_str(&hint);
                        text.push('\n');
                    }
                    io.emit_output(
                        StreamTag::Traceback,
                        &text,
                        Some(TracebackPayload::from_error(&err)),
                    );
                }
            }
        }
    }

    let trace = stmt_tracer
        .map(|tracer| tracer.payload())
        .or_else(|| expr_tracer.map(|tracer| tracer.payload()));

    let outcome = if interrupted {
        TaskOutcome {
            output: io.output.clone(),
            interrupted: true,
            ..TaskOutcome::default()
        }
    } else {
        grade(task, &io.output, globals, trace)?
    };
    io.emit(&WorkerEvent::Completed(outcome));
    Ok(())
}

/// Grade the finished run against its step definition.
fn grade(
    task: &TaskSpec,
    output: &str,
    globals: &Namespace,
    trace: Option<serde_json::Value>,
) -> Result<TaskOutcome> {
    let step = catalog::get_step(&task.page_slug, &task.step_name).ok_or_else(|| {
        anyhow::anyhow!("unknown step {}/{}", task.page_slug, task.step_name)
    })?;

    let ctx = StepContext {
        input: &task.code,
        output,
        source: task.source,
        namespace: globals,
    };
    let result = step.check_with_messages(&ctx, &DefaultLinter)?;

    Ok(TaskOutcome {
        passed: result.passed,
        messages: result.messages,
        passed_tests: result.passed_tests,
        lint: result.lint,
        output: ctx.output.to_string(),
        trace,
        interrupted: false,
    })
}

/// Write one event as a JSON line. Write failures mean the parent went
/// away; the run keeps going and the manager handles the dead pipe.
fn emit<W: Write>(writer: &mut W, event: &WorkerEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = writeln!(writer, "{}", json);
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use std::io::Cursor;

    fn ensure_catalog() {
        catalog::init_default().expect("default course must load");
    }

    fn request_line(request: &WorkerRequest) -> String {
        format!("{}\n", serde_json::to_string(request).unwrap())
    }

    fn task(code: &str, source: protocol::SourceTag) -> WorkerRequest {
        WorkerRequest::Task(TaskSpec {
            code: code.to_string(),
            source,
            page_slug: "for_loops".to_string(),
            step_name: "sum_of_items".to_string(),
        })
    }

    fn drive(requests: &[WorkerRequest]) -> Vec<WorkerEvent> {
        ensure_catalog();
        let input: String = requests.iter().map(request_line).collect();
        let mut output = Vec::new();
        worker_loop(
            Cursor::new(input),
            &mut output,
            &WorkerConfig::default(),
        )
        .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_event_ordering_across_input_cycle() {
        // print A, block on input, print B: events must be exactly
        // output(A), input_request, input echo, output(B), completed.
        let events = drive(&[
            task(
                "print('A')\nname = input()\nprint('B')",
                protocol::SourceTag::Editor,
            ),
            WorkerRequest::Input {
                text: "x".to_string(),
            },
        ]);
        let kinds: Vec<String> = events
            .iter()
            .map(|event| match event {
                WorkerEvent::Output { stream, text, .. } => {
                    format!("output:{:?}:{}", stream, text.trim_end())
                }
                WorkerEvent::InputRequest => "input_request".to_string(),
                WorkerEvent::Completed(_) => "completed".to_string(),
                WorkerEvent::InternalError { .. } => "internal_error".to_string(),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "output:Stdout:A",
                "input_request",
                "output:Input:x",
                "output:Stdout:B",
                "completed",
            ]
        );
    }

    #[test]
    fn test_cancel_interrupts_blocked_input() {
        let events = drive(&[
            task("input()", protocol::SourceTag::Editor),
            WorkerRequest::Cancel,
        ]);
        let last = events.last().unwrap();
        match last {
            WorkerEvent::Completed(outcome) => {
                assert!(outcome.interrupted);
                assert!(!outcome.passed);
            }
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[test]
    fn test_correct_submission_passes() {
        let events = drive(&[task(
            "items = [1, 2, 3]\ntotal = 0\nfor x in items:\n    total += x\nprint(total)",
            protocol::SourceTag::Editor,
        )]);
        match events.last().unwrap() {
            WorkerEvent::Completed(outcome) => {
                assert!(outcome.passed, "messages: {:?}", outcome.messages);
                assert!(!outcome.passed_tests.is_empty());
            }
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_submission_gets_template_message() {
        let events = drive(&[task(
            "total = 0\nprint(total)",
            protocol::SourceTag::Editor,
        )]);
        match events.last().unwrap() {
            WorkerEvent::Completed(outcome) => {
                assert!(!outcome.passed);
                assert!(outcome.messages[0].contains("items = ..."));
            }
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[test]
    fn test_runtime_error_becomes_traceback_event_and_worker_survives() {
        let events = drive(&[
            task("print(undefined_name)", protocol::SourceTag::Editor),
            task("print('still alive')", protocol::SourceTag::Editor),
        ]);
        let tracebacks: Vec<_> = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    WorkerEvent::Output {
                        stream: StreamTag::Traceback,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(tracebacks.len(), 1);
        match tracebacks[0] {
            WorkerEvent::Output { text, traceback, .. } => {
                assert!(text.contains("NameError"));
                assert!(traceback.is_some());
            }
            _ => unreachable!(),
        }
        // Both tasks completed.
        let completions = events
            .iter()
            .filter(|event| matches!(event, WorkerEvent::Completed(_)))
            .count();
        assert_eq!(completions, 2);
    }

    #[test]
    fn test_syntax_error_becomes_traceback_event() {
        let events = drive(&[task("print(", protocol::SourceTag::Editor)]);
        let has_syntax_traceback = events.iter().any(|event| {
            matches!(
                event,
                WorkerEvent::Output {
                    stream: StreamTag::Traceback,
                    text,
                    ..
                } if text.contains("SyntaxError")
            )
        });
        assert!(has_syntax_traceback);
        assert!(matches!(events.last(), Some(WorkerEvent::Completed(_))));
    }

    #[test]
    fn test_shell_keeps_namespace_and_program_resets_it() {
        let shell_task = |code: &str| {
            WorkerRequest::Task(TaskSpec {
                code: code.to_string(),
                source: protocol::SourceTag::Shell,
                page_slug: "the_shell".to_string(),
                step_name: "addition".to_string(),
            })
        };
        let events = drive(&[shell_task("x = 5"), shell_task("x + 1")]);
        // The second shell entry sees x and echoes the value.
        let echoed = events.iter().any(|event| {
            matches!(
                event,
                WorkerEvent::Output { stream: StreamTag::Stdout, text, .. } if text.trim() == "6"
            )
        });
        assert!(echoed);

        // A program run resets the namespace.
        let events = drive(&[
            shell_task("y = 1"),
            task("items = [1]\nprint(y)", protocol::SourceTag::Editor),
        ]);
        let name_error = events.iter().any(|event| {
            matches!(
                event,
                WorkerEvent::Output { stream: StreamTag::Traceback, text, .. }
                    if text.contains("NameError") && text.contains("'y'")
            )
        });
        assert!(name_error);
    }

    #[test]
    fn test_statement_trace_mode_ships_payload() {
        let events = drive(&[WorkerRequest::Task(TaskSpec {
            code: "items = [1, 2, 3]\ntotal = 0\nfor x in items:\n    total += x\nprint(total)"
                .to_string(),
            source: protocol::SourceTag::StatementTrace,
            page_slug: "for_loops".to_string(),
            step_name: "sum_of_items".to_string(),
        })]);
        match events.last().unwrap() {
            WorkerEvent::Completed(outcome) => {
                let trace = outcome.trace.as_ref().expect("trace payload");
                assert_eq!(trace["mode"], "statement");
                assert!(trace["records"].as_array().unwrap().len() > 3);
            }
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[test]
    fn test_two_input_cycles_resolve_in_order_and_pass() {
        let events = drive(&[
            WorkerRequest::Task(TaskSpec {
                code: "name = input()\nage = input()\nprint('Hello ' + name)\nprint('You are ' + age)"
                    .to_string(),
                source: protocol::SourceTag::Editor,
                page_slug: "user_input".to_string(),
                step_name: "greet_age".to_string(),
            }),
            WorkerRequest::Input {
                text: "Alice".to_string(),
            },
            WorkerRequest::Input {
                text: "30".to_string(),
            },
        ]);
        let input_requests = events
            .iter()
            .filter(|event| matches!(event, WorkerEvent::InputRequest))
            .count();
        assert_eq!(input_requests, 2);
        match events.last().unwrap() {
            WorkerEvent::Completed(outcome) => {
                assert!(outcome.passed, "messages: {:?}", outcome.messages);
                assert!(outcome.output.contains("Hello Alice"));
                assert!(outcome.output.contains("You are 30"));
            }
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[test]
    fn test_did_you_mean_enrichment() {
        let events = drive(&[task(
            "items = [1]\ntotl = 0\nprint(totl + itemz)",
            protocol::SourceTag::Editor,
        )]);
        let hint = events.iter().any(|event| {
            matches!(
                event,
                WorkerEvent::Output { stream: StreamTag::Traceback, text, .. }
                    if text.contains("Did you mean `items`?")
            )
        });
        assert!(hint);
    }
}
