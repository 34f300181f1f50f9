//! Execution tracing hooks.
//!
//! The interpreter reports statement entries and evaluated sub-expression
//! values through the [`Tracer`] trait; the two built-in tracers collect
//! those reports into payloads the worker ships with its completion event
//! for step-through visualization.

use serde::Serialize;

use super::ast::Span;

pub trait Tracer {
    /// Called before a statement executes, with the current variable
    /// bindings of the active namespace (sorted by name).
    fn on_statement(&mut self, line: u32, locals: &[(String, String)]);

    /// Called after a non-literal expression evaluates, with its value in
    /// `repr` form.
    fn on_expression(&mut self, span: Span, value: &str);
}

/// Per-statement variable-state log.
#[derive(Debug, Default)]
pub struct StatementTracer {
    records: Vec<StatementRecord>,
}

#[derive(Debug, Serialize)]
struct StatementRecord {
    line: u32,
    vars: Vec<(String, String)>,
}

impl StatementTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "statement",
            "records": serde_json::to_value(&self.records).unwrap_or_default(),
        })
    }

    #[cfg(test)]
    pub fn lines(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.line).collect()
    }
}

impl Tracer for StatementTracer {
    fn on_statement(&mut self, line: u32, locals: &[(String, String)]) {
        self.records.push(StatementRecord {
            line,
            vars: locals.to_vec(),
        });
    }

    fn on_expression(&mut self, _span: Span, _value: &str) {}
}

/// Deep expression trace: every evaluated sub-expression with its source
/// position, a short source excerpt and the resulting value.
#[derive(Debug)]
pub struct ExpressionTracer {
    lines: Vec<String>,
    records: Vec<ExpressionRecord>,
}

#[derive(Debug, Serialize)]
struct ExpressionRecord {
    line: u32,
    col: u32,
    excerpt: String,
    value: String,
}

impl ExpressionTracer {
    pub fn new(source: &str) -> Self {
        Self {
            lines: source.split('\n').map(str::to_string).collect(),
            records: Vec::new(),
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": "expression",
            "records": serde_json::to_value(&self.records).unwrap_or_default(),
        })
    }

    fn excerpt(&self, span: Span) -> String {
        let line = match self.lines.get(span.line.saturating_sub(1) as usize) {
            Some(line) => line,
            None => return String::new(),
        };
        let rest: String = line
            .chars()
            .skip(span.col.saturating_sub(1) as usize)
            .take(40)
            .collect();
        rest.trim_end().to_string()
    }
}

impl Tracer for ExpressionTracer {
    fn on_statement(&mut self, _line: u32, _locals: &[(String, String)]) {}

    fn on_expression(&mut self, span: Span, value: &str) {
        let excerpt = self.excerpt(span);
        self.records.push(ExpressionRecord {
            line: span.line,
            col: span.col,
            excerpt,
            value: value.to_string(),
        });
    }
}
