//! Disallowed-construct rules: syntax-tree patterns a working submission
//! is still not allowed to use. Applied only after functional
//! correctness, so the feedback can acknowledge the working solution.

use super::{StepContext, StepDef, StepKind};
use crate::lang::ast::{self, Expr, NodeRef, Stmt};
use crate::lang::{parse_program, BinOp};

/// A syntax pattern to count occurrences of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePattern {
    For,
    While,
    If,
    Def,
    Subscript,
    StrLiteral,
    ListDisplay,
    MapDisplay,
    /// A binary (or augmented-assignment) use of an operator.
    Op(BinOp),
    /// A call of a named function.
    CallName(String),
    /// A call of a named method.
    MethodName(String),
}

impl NodePattern {
    /// Parse a pattern spec: `for`, `while`, `if`, `def`, `subscript`,
    /// `str`, `list`, `map`, `binop:+`, `call:sum`, `method:join`.
    pub fn parse(spec: &str) -> anyhow::Result<NodePattern> {
        if let Some(op) = spec.strip_prefix("binop:") {
            let op = match op {
                "+" => BinOp::Add,
                "-" => BinOp::Sub,
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                "//" => BinOp::FloorDiv,
                "%" => BinOp::Mod,
                other => anyhow::bail!("unknown operator in pattern: {}", other),
            };
            return Ok(NodePattern::Op(op));
        }
        if let Some(name) = spec.strip_prefix("call:") {
            return Ok(NodePattern::CallName(name.to_string()));
        }
        if let Some(name) = spec.strip_prefix("method:") {
            return Ok(NodePattern::MethodName(name.to_string()));
        }
        match spec {
            "for" => Ok(NodePattern::For),
            "while" => Ok(NodePattern::While),
            "if" => Ok(NodePattern::If),
            "def" => Ok(NodePattern::Def),
            "subscript" => Ok(NodePattern::Subscript),
            "str" => Ok(NodePattern::StrLiteral),
            "list" => Ok(NodePattern::ListDisplay),
            "map" => Ok(NodePattern::MapDisplay),
            other => anyhow::bail!("unknown disallowed pattern: {}", other),
        }
    }

    pub fn matches(&self, node: NodeRef) -> bool {
        match (self, node) {
            (NodePattern::For, NodeRef::Stmt(Stmt::For { .. })) => true,
            (NodePattern::While, NodeRef::Stmt(Stmt::While { .. })) => true,
            (NodePattern::If, NodeRef::Stmt(Stmt::If { .. })) => true,
            (NodePattern::Def, NodeRef::Stmt(Stmt::FuncDef(_))) => true,
            (NodePattern::Subscript, NodeRef::Expr(Expr::Subscript { .. })) => true,
            (NodePattern::StrLiteral, NodeRef::Expr(Expr::Str { .. })) => true,
            (NodePattern::ListDisplay, NodeRef::Expr(Expr::List { .. })) => true,
            (NodePattern::MapDisplay, NodeRef::Expr(Expr::Map { .. })) => true,
            (NodePattern::Op(op), NodeRef::Expr(Expr::BinOp { op: node_op, .. })) => {
                op == node_op
            }
            (NodePattern::Op(op), NodeRef::Stmt(Stmt::AugAssign { op: node_op, .. })) => {
                op == node_op
            }
            (NodePattern::CallName(name), NodeRef::Expr(Expr::Call { func, .. })) => {
                matches!(&**func, Expr::Name { id, .. } if id == name)
            }
            (NodePattern::MethodName(name), NodeRef::Expr(Expr::Call { func, .. })) => {
                matches!(&**func, Expr::Attribute { attr, .. } if attr == name)
            }
            _ => false,
        }
    }
}

/// A configured rule: pattern, allowance, feedback, and scope.
#[derive(Debug, Clone)]
pub struct Disallowed {
    pub pattern: NodePattern,
    /// Occurrences above this count fail the step (0 = banned outright).
    pub max_count: u32,
    pub message: String,
    /// Restrict the count to the body of the exercise's required
    /// function.
    pub function_only: bool,
    /// Extra filter on matched nodes.
    pub predicate: Option<fn(NodeRef) -> bool>,
}

impl Disallowed {
    pub fn new(pattern: NodePattern, max_count: u32, message: impl Into<String>) -> Self {
        Self {
            pattern,
            max_count,
            message: message.into(),
            function_only: false,
            predicate: None,
        }
    }

    /// Default feedback synthesized from a short label like "`+`".
    pub fn default_message(label: &str, max_count: u32) -> String {
        if max_count > 0 {
            format!(
                "Well done, this solution is correct! However, it violates a requirement: \
you must not use {} more than {} times.",
                label, max_count
            )
        } else {
            format!(
                "Well done, this solution is correct! However, it violates a requirement: \
you must not use {}.",
                label
            )
        }
    }

    /// Count matching nodes in the submission (or in the body of the
    /// exercise's required function when scoped).
    pub fn count(&self, step: &StepDef, ctx: &StepContext) -> usize {
        let program = match parse_program(ctx.input) {
            Ok(program) => program,
            Err(_) => return 0,
        };
        let nodes = if self.function_only {
            let function_name = match &step.kind {
                StepKind::Exercise(def) => def.function_name.as_deref(),
                _ => None,
            };
            match function_name.and_then(|name| ast::find_function(&program.body, name)) {
                Some(func) => ast::walk(&func.body),
                None => return 0,
            }
        } else {
            ast::walk(&program.body)
        };
        nodes
            .into_iter()
            .filter(|node| self.pattern.matches(*node))
            .filter(|node| self.predicate.map_or(true, |pred| pred(*node)))
            .count()
    }
}
