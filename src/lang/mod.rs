//! The taught mini-language
//!
//! A small, indentation-structured language in which all learner
//! submissions, reference solutions and anticipated wrong solutions are
//! written. This module provides:
//! - `lexer`/`parser`: source text to AST with line/column spans
//! - `value`: runtime values plus the plain `Literal` form used by the
//!   course catalog
//! - `interp`: a tree-walking interpreter with pluggable I/O, recursion
//!   and fuel limits, and structured tracebacks
//! - `trace`: per-statement and per-expression tracing hooks
//!
//! The language module does NOT:
//! - Know about steps, exercises or grading
//! - Talk to processes or channels (I/O goes through the `Io` trait)
//!
//! Division (`/` and `//`) is integer division; there is no float type.

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod trace;
pub mod value;

pub use ast::{BinOp, Expr, Program, Span, Stmt};
pub use interp::{ErrorKind, ExecLimits, Interp, Io, Namespace, OutStream, ReadError, RunError};
pub use value::{Literal, Value};

use thiserror::Error;

/// A parse-time error with source position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SyntaxError: {message} (line {line})")]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            message: message.into(),
            line,
            col,
        }
    }
}

/// Parse source text into a program.
pub fn parse_program(source: &str) -> Result<Program, SyntaxError> {
    let tokens = lexer::tokenize(source)?;
    parser::parse(&tokens)
}

/// Names callable without being defined by the learner.
pub const BUILTIN_NAMES: &[&str] = &[
    "print",
    "input",
    "len",
    "range",
    "str",
    "int",
    "sum",
    "assert_equal",
];
