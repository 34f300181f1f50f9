//! Wire protocol between the session manager and a worker process.
//!
//! Newline-delimited JSON: requests flow to the worker on stdin, events
//! come back on stdout. Events for a task are emitted in execution order
//! and a task always ends with `completed` or `internal_error`.

use serde::{Deserialize, Serialize};

use crate::lang::interp::FrameInfo;
use crate::lang::RunError;

/// Where a submission came from; selects execution mode and whether the
/// text is a single shell line or a whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Shell,
    Editor,
    StatementTrace,
    ExpressionTrace,
    Visualizer,
}

impl SourceTag {
    /// Program sources reset the session namespace; the shell keeps it.
    pub fn is_program(self) -> bool {
        !matches!(self, SourceTag::Shell)
    }
}

/// One unit of work for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub code: String,
    pub source: SourceTag,
    pub page_slug: String,
    pub step_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    Task(TaskSpec),
    /// A line for a blocked `input()` call.
    Input { text: String },
    /// Abort sentinel: the blocked read unwinds instead of receiving
    /// further text.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Stdout,
    Stderr,
    /// Echo of a consumed input line (excluded from graded output).
    Input,
    Traceback,
}

/// Structured traceback shipped alongside the rendered text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracebackPayload {
    pub error: String,
    /// Line where the error itself was raised.
    pub line: u32,
    pub frames: Vec<FramePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    pub function: String,
    pub line: u32,
    pub source_line: String,
    pub variables: Vec<(String, String)>,
}

impl TracebackPayload {
    pub fn from_error(err: &RunError) -> Self {
        Self {
            error: err.to_string(),
            line: err.span.line,
            frames: err
                .frames
                .iter()
                .rev()
                .map(|frame: &FrameInfo| FramePayload {
                    function: frame.function.clone(),
                    line: frame.line,
                    source_line: frame.source_line.clone(),
                    variables: frame.locals.clone(),
                })
                .collect(),
        }
    }
}

/// Terminal summary of one task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub passed: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub passed_tests: Vec<String>,
    #[serde(default)]
    pub lint: Vec<String>,
    /// Captured output of the run (input echoes excluded).
    #[serde(default)]
    pub output: String,
    /// Visualizer payload from a tracing mode, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
    /// The run was aborted by a cancel sentinel.
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Output {
        stream: StreamTag,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<TracebackPayload>,
    },
    /// Execution is blocked waiting for a line of input.
    InputRequest,
    Completed(TaskOutcome),
    InternalError {
        details: String,
    },
}

impl WorkerEvent {
    /// Terminal events end a submission's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::InputRequest
                | WorkerEvent::Completed(_)
                | WorkerEvent::InternalError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let request = WorkerRequest::Task(TaskSpec {
            code: "print(1)".to_string(),
            source: SourceTag::Editor,
            page_slug: "intro".to_string(),
            step_name: "first".to_string(),
        });
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"kind\":\"task\""));
        assert!(json.contains("\"source\":\"editor\""));
        let back: WorkerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_event_round_trip() {
        let event = WorkerEvent::Output {
            stream: StreamTag::Stdout,
            text: "hello\n".to_string(),
            traceback: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"output\""));
        assert!(!json.contains("traceback"));
        let back: WorkerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_terminal_events() {
        assert!(WorkerEvent::InputRequest.is_terminal());
        assert!(WorkerEvent::Completed(TaskOutcome::default()).is_terminal());
        assert!(WorkerEvent::InternalError {
            details: "x".to_string()
        }
        .is_terminal());
        assert!(!WorkerEvent::Output {
            stream: StreamTag::Stdout,
            text: String::new(),
            traceback: None,
        }
        .is_terminal());
    }
}
